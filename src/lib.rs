pub mod config;
pub mod dashboard;
pub mod error;
pub mod ingest;
pub mod keyspace;
pub mod lease;
pub mod mapper;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod source;
pub mod store;
pub mod worker;

pub use error::{PoolError, Result};
pub use node::{Dispatcher, NextTask, Task};
