pub mod assigner;
pub mod queue;
pub mod row;

pub use assigner::RowAssigner;
pub use queue::RowQueue;
pub use row::{Column, Row, Selection};
