//! Worker session accounting.
//!
//! Workers are untrusted and anonymous. On first contact a worker gets a
//! session id that it presents on every later request; the ledger tracks how
//! many tasks it viewed and finished and decides when it is done.
//!
//! # Components
//!
//! - [`SessionLedger`]: creates sessions, counts progress, issues verdicts
//! - [`UserSession`]: the stored progress record
//! - [`Completion`]: two-state result of a completion check
//!
//! # Completion Flow
//!
//! 1. The request layer calls [`SessionLedger::check_finished`] before
//!    handing out a task
//! 2. While in progress the call counts as a viewed task
//! 3. Once the quota is met (or the check is forced) the worker gets a
//!    [`Verdict`] with a callback URL

pub mod ledger;
pub mod session;

pub use ledger::SessionLedger;
pub use session::{Completion, SessionContext, UserSession, Verdict};
