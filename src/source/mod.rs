//! Data source interface.
//!
//! A data source owns the actual annotation data. The engine only needs to
//! enumerate rows with their columns, fetch one value, and know which columns
//! a row must have to be dispatched.

pub mod memory;

pub use memory::MemorySource;

use std::collections::BTreeSet;
use std::future::Future;

use tokio_stream::Stream;

use crate::error::Result;
use crate::scheduler::{Column, Row};

/// A row together with the columns the source holds for it.
pub type RowColumns = (Row, BTreeSet<Column>);

pub trait DataSource: Send + Sync + 'static {
    /// Lazily enumerates every row and its columns.
    fn rows(&self) -> impl Stream<Item = Result<RowColumns>> + Send + '_;

    /// Columns of a single row.
    fn columns(&self, row: &Row) -> impl Future<Output = Result<BTreeSet<Column>>> + Send;

    /// Raw value of one (row, column) pair.
    fn value(&self, row: &Row, column: &Column) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Columns a row must have to be dispatched.
    fn required_columns(&self) -> BTreeSet<Column>;
}
