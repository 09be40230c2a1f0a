use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::JobConfig;
use crate::error::{PoolError, Result};
use crate::ingest::{IngestReport, Ingestor};
use crate::keyspace::Keyspace;
use crate::lease::DataLock;
use crate::mapper::{urlsafe_token, DataKey, KeyMapper};
use crate::scheduler::{Column, Row, RowAssigner, RowQueue, Selection};
use crate::source::DataSource;
use crate::store::KvStore;
use crate::worker::{Completion, SessionContext, SessionLedger, UserSession, Verdict};

/// A dispatched row with the data keys of its columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    #[serde(skip)]
    pub row: Row,
    pub keys: BTreeMap<Column, DataKey>,
}

/// Answer to a worker asking for work.
#[derive(Debug, Clone, PartialEq)]
pub enum NextTask {
    Assigned(Task),
    /// Nothing left this worker has not seen.
    Exhausted,
    /// The worker is done; no further tasks are handed out.
    Finished(Verdict),
}

/// One annotation job served from a shared store.
///
/// The dispatcher holds no mutable state: any number of dispatchers, in one
/// process or many, can serve the same job concurrently as long as they share
/// the store and the configuration. Only ingestion takes the data lock;
/// dispatching, progress accounting and key resolution run lock-free.
pub struct Dispatcher<S, D> {
    config: JobConfig,
    admin_secret: String,
    source: Arc<D>,
    queue: RowQueue<S>,
    mapper: KeyMapper<S>,
    assigner: RowAssigner<S>,
    ledger: SessionLedger<S>,
    ingestor: Ingestor<S, D>,
}

impl<S: KvStore, D: DataSource> Dispatcher<S, D> {
    pub fn new(config: JobConfig, store: Arc<S>, source: Arc<D>) -> Self {
        let keyspace = Keyspace::new(&config.task_key);
        let admin_secret = config.admin_secret.clone().unwrap_or_else(urlsafe_token);

        let ingestor = Ingestor::new(
            source.clone(),
            DataLock::new(store.clone(), &keyspace, config.lease.clone()),
            RowQueue::new(store.clone(), keyspace.clone()),
            KeyMapper::new(store.clone(), keyspace.clone()),
        );

        tracing::info!(
            job = %config.task_key,
            mode = %config.mode,
            num_tasks = config.num_tasks,
            "Dispatcher ready"
        );
        tracing::info!("Users URL:  /admin/{admin_secret}/users");
        tracing::info!("Responses URL:  /admin/{admin_secret}/responses");

        Self {
            queue: RowQueue::new(store.clone(), keyspace.clone()),
            mapper: KeyMapper::new(store.clone(), keyspace.clone()),
            assigner: RowAssigner::new(store.clone(), keyspace.clone(), config.num_tasks),
            ledger: SessionLedger::new(
                store,
                keyspace,
                config.mode,
                config.num_tasks as u64,
                config.track_correct,
            ),
            ingestor,
            source,
            admin_secret,
            config,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn admin_secret(&self) -> &str {
        &self.admin_secret
    }

    pub fn queue(&self) -> &RowQueue<S> {
        &self.queue
    }

    pub async fn new_session(&self, context: &SessionContext) -> Result<String> {
        self.ledger.create_session(context).await
    }

    /// Raw row selection, without progress accounting.
    pub async fn select_row(&self, worker: &str) -> Result<Selection> {
        self.assigner.select_row(worker).await
    }

    /// Hands `worker` its next task.
    ///
    /// Checks completion first; the check itself counts the view, so no
    /// separate dispatch is recorded.
    pub async fn next_task(&self, worker: &str) -> Result<NextTask> {
        if let Completion::Finished(verdict) = self.ledger.check_finished(worker, false).await? {
            return Ok(NextTask::Finished(verdict));
        }

        match self.assigner.select_row(worker).await? {
            Selection::Exhausted => {
                tracing::info!(user = %worker, "No rows left for worker");
                Ok(NextTask::Exhausted)
            }
            Selection::Assigned(row) => {
                let keys = self.task_keys(&row).await?;
                Ok(NextTask::Assigned(Task { row, keys }))
            }
        }
    }

    async fn task_keys(&self, row: &Row) -> Result<BTreeMap<Column, DataKey>> {
        let mut keys = BTreeMap::new();
        for column in self.source.columns(row).await? {
            match self.mapper.key_for(row, &column).await {
                Ok(key) => {
                    keys.insert(column, key);
                }
                // A concurrent reset may have replaced the row's keys.
                Err(PoolError::NotFound(_)) => {
                    tracing::debug!(row = %row, column = %column, "Data key vanished");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(keys)
    }

    pub async fn record_dispatch(&self, worker: &str) -> Result<()> {
        self.ledger.record_dispatch(worker).await
    }

    pub async fn submit_result(
        &self,
        worker: &str,
        correct: bool,
        payload: Option<&serde_json::Value>,
    ) -> Result<()> {
        if let Some(payload) = payload {
            self.ledger.record_response(worker, payload).await?;
        }
        self.ledger.record_result(worker, correct).await
    }

    pub async fn completion(&self, worker: &str, force: bool) -> Result<Completion> {
        self.ledger.check_finished(worker, force).await
    }

    pub async fn session(&self, worker: &str) -> Result<UserSession> {
        self.ledger.get(worker).await
    }

    /// Fetches the data behind a data key.
    pub async fn resolve(&self, key: &str) -> Result<Vec<u8>> {
        let (row, column) = self.mapper.resolve(key).await?;
        self.source.value(&row, &column).await
    }

    fn authorize(&self, secret: &str) -> Result<()> {
        if secret == self.admin_secret {
            Ok(())
        } else {
            tracing::warn!("Admin request with invalid secret");
            Err(PoolError::Unauthorized)
        }
    }

    pub async fn list_sessions(&self, secret: &str) -> Result<BTreeMap<String, UserSession>> {
        self.authorize(secret)?;
        self.ledger.list().await
    }

    pub async fn list_responses(
        &self,
        secret: &str,
    ) -> Result<BTreeMap<String, Vec<serde_json::Value>>> {
        self.authorize(secret)?;
        self.ledger.list_responses().await
    }

    pub async fn flush_sessions(&self, secret: &str) -> Result<usize> {
        self.authorize(secret)?;
        self.ledger.flush().await
    }

    /// Rebuilds the work pool from the data source under the data lock.
    pub async fn reset(&self, cancel: &CancellationToken) -> Result<IngestReport> {
        self.ingestor.reset(cancel).await
    }

    /// Adds or refreshes one row under the data lock.
    pub async fn add_row(
        &self,
        row: &Row,
        priority: i64,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        self.ingestor.add_row(row, priority, cancel).await
    }
}
