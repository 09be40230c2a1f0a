//! Rebuilding the work pool from the data source.
//!
//! Ingestion runs exclusively under the data lock. Nothing is written until
//! release: the clearing of the old pool, every row insertion and every data
//! key registration are buffered in the lease and become visible as one
//! atomic commit, or not at all if the lease was lost.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::lease::{DataLock, Lease};
use crate::mapper::{KeyMapper, PathCode};
use crate::scheduler::{Column, Row, RowQueue};
use crate::source::DataSource;
use crate::store::KvStore;

/// Outcome of an ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub rows_added: usize,
    /// Rows missing one of the required columns.
    pub rows_skipped: usize,
    pub keys_registered: usize,
    pub elapsed: Duration,
}

pub struct Ingestor<S, D> {
    source: Arc<D>,
    lock: DataLock<S>,
    queue: RowQueue<S>,
    mapper: KeyMapper<S>,
}

impl<S: KvStore, D: DataSource> Ingestor<S, D> {
    pub fn new(source: Arc<D>, lock: DataLock<S>, queue: RowQueue<S>, mapper: KeyMapper<S>) -> Self {
        Self {
            source,
            lock,
            queue,
            mapper,
        }
    }

    /// Replaces the whole pool with the current contents of the data source.
    ///
    /// Seen sets are dropped with the rows; sessions survive.
    pub async fn reset(&self, cancel: &CancellationToken) -> Result<IngestReport> {
        let mut lease = self.lock.acquire(cancel).await?;
        let started = lease.acquired_at();

        match self.rebuild(&mut lease).await {
            Ok(mut report) => {
                self.lock.release(lease).await?;
                report.elapsed = started.elapsed();
                tracing::info!(
                    rows_added = report.rows_added,
                    rows_skipped = report.rows_skipped,
                    keys_registered = report.keys_registered,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Reset complete"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(error = %e, "Reset failed, nothing committed");
                self.lock.abandon(lease).await?;
                Err(e)
            }
        }
    }

    async fn rebuild(&self, lease: &mut Lease) -> Result<IngestReport> {
        lease.extend_buffer(self.queue.clear_ops());
        lease.extend_buffer(self.mapper.clear_ops());
        tracing::debug!(deletes = lease.buffered(), "Buffered pool clear");

        let required = self.source.required_columns();
        let mut report = IngestReport::default();
        let mut ingested: HashSet<Row> = HashSet::new();

        let rows = self.source.rows();
        tokio::pin!(rows);
        while let Some(item) = rows.next().await {
            let (row, columns) = item?;
            self.lock.extend_if_due(lease).await?;

            if !ingested.insert(row.clone()) {
                tracing::warn!(row = %row, "Data source yielded row twice, ignoring repeat");
                continue;
            }
            self.buffer_row(lease, &row, &columns, &required, 0, &mut report);
        }

        Ok(report)
    }

    /// Adds or refreshes one row without a full reset.
    ///
    /// The row's previous data keys, if any, are replaced.
    pub async fn add_row(
        &self,
        row: &Row,
        priority: i64,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let mut lease = self.lock.acquire(cancel).await?;

        match self.buffer_single(&mut lease, row, priority).await {
            Ok(report) => {
                self.lock.release(lease).await?;
                tracing::info!(row = %row, priority, added = report.rows_added, "Row ingested");
                Ok(report)
            }
            Err(e) => {
                tracing::error!(row = %row, error = %e, "Row ingestion failed, nothing committed");
                self.lock.abandon(lease).await?;
                Err(e)
            }
        }
    }

    async fn buffer_single(&self, lease: &mut Lease, row: &Row, priority: i64) -> Result<IngestReport> {
        let columns = self.source.columns(row).await?;
        let required = self.source.required_columns();
        let mut report = IngestReport::default();

        if required.is_subset(&columns) {
            for column in &columns {
                if let Some(old) = self.mapper.lookup(&PathCode::encode(row, column)).await? {
                    lease.push(self.mapper.unregister_op(&old));
                }
            }
        }
        self.buffer_row(lease, row, &columns, &required, priority, &mut report);

        report.elapsed = lease.acquired_at().elapsed();
        Ok(report)
    }

    fn buffer_row(
        &self,
        lease: &mut Lease,
        row: &Row,
        columns: &BTreeSet<Column>,
        required: &BTreeSet<Column>,
        priority: i64,
        report: &mut IngestReport,
    ) {
        if !required.is_subset(columns) {
            tracing::debug!(row = %row, "Row lacks required columns, skipping");
            report.rows_skipped += 1;
            return;
        }

        lease.push(self.queue.add_row_op(row, priority));
        for column in columns {
            let (_key, ops) = self.mapper.register(&PathCode::encode(row, column));
            lease.extend_buffer(ops);
            report.keys_registered += 1;
        }
        report.rows_added += 1;
    }
}
