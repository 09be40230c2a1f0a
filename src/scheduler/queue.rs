use std::sync::Arc;

use crate::error::Result;
use crate::keyspace::Keyspace;
use crate::scheduler::row::Row;
use crate::store::{KvStore, Op};

/// Demand-ordered registry of the rows available for dispatch.
///
/// Rows live in the `rows` sorted set, scored by demand: the number of
/// outstanding requests for the row. Higher demand is dispatched first.
#[derive(Debug)]
pub struct RowQueue<S> {
    store: Arc<S>,
    keyspace: Keyspace,
}

impl<S: KvStore> RowQueue<S> {
    pub fn new(store: Arc<S>, keyspace: Keyspace) -> Self {
        Self { store, keyspace }
    }

    /// Write inserting `row` or resetting its demand to `priority`.
    pub fn add_row_op(&self, row: &Row, priority: i64) -> Op {
        Op::ZAdd {
            key: self.keyspace.rows(),
            member: row.0.clone(),
            score: priority as f64,
        }
    }

    /// Inserts `row` immediately, outside of any ingestion.
    pub async fn add_row(&self, row: &Row, priority: i64) -> Result<()> {
        self.store.apply(vec![self.add_row_op(row, priority)]).await
    }

    /// Write lowering the demand of `row` by one.
    pub fn dispatched_op(&self, row: &str) -> Op {
        Op::ZIncr {
            key: self.keyspace.rows(),
            member: row.to_string(),
            by: -1.0,
        }
    }

    /// The `count` highest-demand rows.
    pub async fn top(&self, count: usize) -> Result<Vec<Row>> {
        Ok(self
            .store
            .zrevrange(&self.keyspace.rows(), count)
            .await?
            .into_iter()
            .map(Row)
            .collect())
    }

    /// Current demand of `row`, or `None` if it is not queued.
    pub async fn demand(&self, row: &Row) -> Result<Option<i64>> {
        Ok(self
            .store
            .zscore(&self.keyspace.rows(), row.as_str())
            .await?
            .map(|score| score as i64))
    }

    /// Writes deleting the queue and every worker's seen set, including
    /// seen sets created after the ops are built.
    pub fn clear_ops(&self) -> Vec<Op> {
        vec![
            Op::Del {
                key: self.keyspace.rows(),
            },
            Op::DelPrefix {
                prefix: self.keyspace.seen_prefix(),
            },
        ]
    }
}
