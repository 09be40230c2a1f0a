use std::sync::Arc;

use crate::error::Result;
use crate::keyspace::Keyspace;
use crate::scheduler::queue::RowQueue;
use crate::scheduler::row::{Row, Selection};
use crate::store::{Guard, KvStore, Op, Transaction};

/// Hands rows to workers, never the same row twice to one worker.
///
/// Selection probes the top `num` rows by demand, starting at one and
/// doubling after every probe that only finds seen rows, up to the job's
/// task quota. Claiming a row adds it to the worker's seen set and lowers its
/// demand in one guarded transaction: no observer sees one without the other,
/// two concurrent selections for the same worker cannot both claim it, and a
/// row dropped by a concurrent reset is skipped rather than re-created.
#[derive(Debug)]
pub struct RowAssigner<S> {
    store: Arc<S>,
    keyspace: Keyspace,
    queue: RowQueue<S>,
    window_cap: usize,
}

impl<S: KvStore> RowAssigner<S> {
    pub fn new(store: Arc<S>, keyspace: Keyspace, window_cap: usize) -> Self {
        Self {
            queue: RowQueue::new(store.clone(), keyspace.clone()),
            store,
            keyspace,
            window_cap: window_cap.max(1),
        }
    }

    /// Selects the highest-demand row `worker` has not seen yet.
    ///
    /// Store errors propagate unchanged; nothing is retried here.
    pub async fn select_row(&self, worker: &str) -> Result<Selection> {
        let seen_key = self.keyspace.seen(worker);
        let mut num = 1usize;

        loop {
            for row in self.queue.top(num).await? {
                if self.store.sismember(&seen_key, row.as_str()).await? {
                    continue;
                }
                if self.claim(&seen_key, &row).await? {
                    tracing::debug!(worker, row = %row, window = num, "Row assigned");
                    return Ok(Selection::Assigned(row));
                }
                // Claimed concurrently for this worker, or removed by a reset.
            }

            if num >= self.window_cap {
                tracing::debug!(worker, window = num, "No unseen row in window");
                return Ok(Selection::Exhausted);
            }
            num = (num * 2).min(self.window_cap);
        }
    }

    async fn claim(&self, seen_key: &str, row: &Row) -> Result<bool> {
        let txn = Transaction::new(vec![
            Op::SAdd {
                key: seen_key.to_string(),
                member: row.0.clone(),
            },
            self.queue.dispatched_op(row.as_str()),
        ])
        .guard(Guard::NotMember {
            key: seen_key.to_string(),
            member: row.0.clone(),
        })
        .guard(Guard::Scored {
            key: self.keyspace.rows(),
            member: row.0.clone(),
        });
        self.store.commit(txn).await
    }

    /// Whether `worker` has already been handed `row`.
    pub async fn has_seen(&self, worker: &str, row: &Row) -> Result<bool> {
        self.store
            .sismember(&self.keyspace.seen(worker), row.as_str())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn setup(rows: &[(&str, i64)], cap: usize) -> RowAssigner<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let keyspace = Keyspace::new("test");
        let queue = RowQueue::new(store.clone(), keyspace.clone());
        for (row, priority) in rows {
            queue.add_row(&Row::from(*row), *priority).await.unwrap();
        }
        RowAssigner::new(store, keyspace, cap)
    }

    #[tokio::test]
    async fn highest_demand_first_then_exhausted() {
        let assigner = setup(&[("A", 5), ("B", 2), ("C", 1)], 3).await;

        let mut got = Vec::new();
        for _ in 0..3 {
            match assigner.select_row("u1").await.unwrap() {
                Selection::Assigned(row) => got.push(row.0),
                Selection::Exhausted => panic!("exhausted early"),
            }
        }
        assert_eq!(got, vec!["A", "B", "C"]);
        assert_eq!(
            assigner.select_row("u1").await.unwrap(),
            Selection::Exhausted
        );
    }

    #[tokio::test]
    async fn dispatch_lowers_demand_and_marks_seen() {
        let assigner = setup(&[("A", 5)], 3).await;

        assigner.select_row("u1").await.unwrap();

        assert_eq!(assigner.queue.demand(&Row::from("A")).await.unwrap(), Some(4));
        assert!(assigner.has_seen("u1", &Row::from("A")).await.unwrap());
        assert!(!assigner.has_seen("u2", &Row::from("A")).await.unwrap());
    }

    #[tokio::test]
    async fn window_widens_past_seen_rows() {
        let assigner = setup(&[("a", 5), ("b", 4), ("c", 3), ("d", 2), ("e", 1)], 4).await;

        assert_eq!(
            assigner.select_row("u1").await.unwrap(),
            Selection::Assigned(Row::from("a"))
        );
        // a and b now tie at 4; equal scores sort by member descending.
        assert_eq!(
            assigner.select_row("u1").await.unwrap(),
            Selection::Assigned(Row::from("b"))
        );
        // a (4) is seen, b and c tie at 3 and c sorts first.
        assert_eq!(
            assigner.select_row("u1").await.unwrap(),
            Selection::Assigned(Row::from("c"))
        );
    }

    #[tokio::test]
    async fn window_is_capped_by_quota() {
        let assigner = setup(&[("a", 5), ("b", 3), ("c", 1)], 1).await;

        assert_eq!(
            assigner.select_row("u1").await.unwrap(),
            Selection::Assigned(Row::from("a"))
        );
        // a still has the highest demand and the window never grows past one.
        assert_eq!(
            assigner.select_row("u1").await.unwrap(),
            Selection::Exhausted
        );
        // Other workers are unaffected.
        assert_eq!(
            assigner.select_row("u2").await.unwrap(),
            Selection::Assigned(Row::from("a"))
        );
    }

    #[tokio::test]
    async fn empty_queue_is_exhausted() {
        let assigner = setup(&[], 4).await;
        assert_eq!(
            assigner.select_row("u1").await.unwrap(),
            Selection::Exhausted
        );
    }
}
