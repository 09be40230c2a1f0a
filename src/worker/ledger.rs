use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use url::Url;

use crate::config::Mode;
use crate::error::{PoolError, Result};
use crate::keyspace::Keyspace;
use crate::mapper::urlsafe_token;
use crate::store::{Guard, KvStore, Op, Transaction};
use crate::worker::session::{
    Completion, SessionContext, UserSession, Verdict, END_TIME, TASKS_CORRECT, TASKS_FINISHED,
    TASKS_VIEWED,
};

const DEFAULT_SUBMIT_HOST: &str = "http://www.mturk.com";
const DEFAULT_ASSIGNMENT_ID: &str = "NoId";
const STANDALONE_DONE_URL: &str = "data:,Done%20annotating";

/// Per-worker progress accounting.
///
/// Counters are only ever changed with atomic hash increments, so concurrent
/// requests for the same worker never lose updates. Every write after
/// creation is guarded on the session still existing, so a concurrent flush
/// cannot leave a half-written record behind.
#[derive(Debug)]
pub struct SessionLedger<S> {
    store: Arc<S>,
    keyspace: Keyspace,
    mode: Mode,
    quota: u64,
    track_correct: bool,
}

impl<S: KvStore> SessionLedger<S> {
    pub fn new(
        store: Arc<S>,
        keyspace: Keyspace,
        mode: Mode,
        quota: u64,
        track_correct: bool,
    ) -> Self {
        Self {
            store,
            keyspace,
            mode,
            quota,
            track_correct,
        }
    }

    /// Starts a session and returns its id.
    ///
    /// The id is a random bearer capability: whoever holds it acts as the
    /// worker.
    pub async fn create_session(&self, context: &SessionContext) -> Result<String> {
        let id = urlsafe_token();
        let session = UserSession::new(id.clone(), context, self.track_correct);

        self.store
            .apply(vec![Op::HSet {
                key: self.keyspace.user(&id),
                fields: session.to_fields(),
            }])
            .await?;

        tracing::info!(
            user = %id,
            remote_addr = ?context.remote_addr,
            "Session created"
        );
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<UserSession> {
        let fields = self.store.hgetall(&self.keyspace.user(id)).await?;
        if fields.is_empty() {
            return Err(PoolError::NotFound(format!("user {id}")));
        }
        UserSession::from_fields(id, fields)
    }

    /// Applies `ops` atomically if the session exists.
    async fn update(&self, id: &str, ops: Vec<Op>) -> Result<()> {
        let txn = Transaction::new(ops).guard(Guard::Exists {
            key: self.keyspace.user(id),
        });
        if !self.store.commit(txn).await? {
            return Err(PoolError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    fn incr(&self, id: &str, field: &str) -> Op {
        Op::HIncr {
            key: self.keyspace.user(id),
            field: field.to_string(),
            by: 1,
        }
    }

    pub async fn record_dispatch(&self, id: &str) -> Result<()> {
        self.update(id, vec![self.incr(id, TASKS_VIEWED)]).await
    }

    pub async fn record_result(&self, id: &str, correct: bool) -> Result<()> {
        let mut ops = vec![self.incr(id, TASKS_FINISHED)];
        if correct {
            ops.push(self.incr(id, TASKS_CORRECT));
        }
        self.update(id, ops).await?;

        tracing::debug!(user = %id, correct, "Result recorded");
        Ok(())
    }

    /// Stores a submitted result payload for later export.
    pub async fn record_response(&self, id: &str, payload: &serde_json::Value) -> Result<()> {
        let op = Op::HSet {
            key: self.keyspace.responses(id),
            fields: vec![(urlsafe_token(), serde_json::to_string(payload)?)],
        };
        self.update(id, vec![op]).await
    }

    /// Every stored response payload of a worker, in no particular order.
    pub async fn responses(&self, id: &str) -> Result<Vec<serde_json::Value>> {
        self.store
            .hgetall(&self.keyspace.responses(id))
            .await?
            .into_values()
            .map(|raw| serde_json::from_str(&raw).map_err(PoolError::from))
            .collect()
    }

    /// Decides whether the worker is done.
    ///
    /// A worker is finished once `tasks_finished` reaches the quota (only in
    /// modes that finish automatically) or when `force` is set. Finishing
    /// stamps `end_time` the first time; later calls keep that stamp. A call
    /// that does not finish counts as one more viewed task.
    pub async fn check_finished(&self, id: &str, force: bool) -> Result<Completion> {
        let session = self.get(id).await?;

        let reached_quota = self.mode.auto_finishes() && session.tasks_finished >= self.quota;
        if !(reached_quota || force) {
            self.update(id, vec![self.incr(id, TASKS_VIEWED)]).await?;
            return Ok(Completion::InProgress);
        }

        let end_time = match session.end_time {
            Some(end) => end,
            None => {
                let now = Utc::now();
                let op = Op::HSet {
                    key: self.keyspace.user(id),
                    fields: vec![(END_TIME.to_string(), now.to_rfc3339())],
                };
                self.update(id, vec![op]).await?;
                tracing::info!(
                    user = %id,
                    tasks_finished = session.tasks_finished,
                    forced = force,
                    "Session finished"
                );
                now
            }
        };

        let tasks_viewed = session.tasks_viewed.max(session.tasks_finished);
        let pct_finished = ratio(session.tasks_finished, tasks_viewed);
        let pct_correct = session
            .tasks_correct
            .map(|correct| ratio(correct, session.tasks_finished));
        let time_taken = (end_time - session.start_time).num_milliseconds() as f64 / 1000.0;

        let mut verdict = Verdict {
            tasks_finished: session.tasks_finished,
            tasks_viewed,
            pct_finished,
            pct_correct,
            time_taken,
            submit_url: String::new(),
        };
        verdict.submit_url = self.submit_url(&session, &verdict)?;
        Ok(Completion::Finished(verdict))
    }

    fn submit_url(&self, session: &UserSession, verdict: &Verdict) -> Result<String> {
        match self.mode {
            Mode::Standalone => Ok(STANDALONE_DONE_URL.to_string()),
            Mode::Amt => {
                let host = session
                    .params
                    .get("turkSubmitTo")
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_SUBMIT_HOST);
                let mut url = match external_submit_url(host) {
                    Some(url) => url,
                    None => {
                        tracing::warn!(user = %session.id, host, "Unusable turkSubmitTo, using default");
                        external_submit_url(DEFAULT_SUBMIT_HOST).ok_or_else(|| {
                            PoolError::Integrity("default submit host is not a URL".to_string())
                        })?
                    }
                };

                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair(
                        "assignmentId",
                        session
                            .params
                            .get("assignmentId")
                            .map(String::as_str)
                            .unwrap_or(DEFAULT_ASSIGNMENT_ID),
                    );
                    query.append_pair("pct_finished", &verdict.pct_finished.to_string());
                    query.append_pair("tasks_finished", &verdict.tasks_finished.to_string());
                    query.append_pair("tasks_viewed", &verdict.tasks_viewed.to_string());
                    query.append_pair("time_taken", &verdict.time_taken.to_string());
                    if let Some(pct_correct) = verdict.pct_correct {
                        query.append_pair("pct_correct", &pct_correct.to_string());
                    }
                }
                Ok(url.to_string())
            }
        }
    }

    /// Every session of the job, keyed by id.
    pub async fn list(&self) -> Result<BTreeMap<String, UserSession>> {
        let prefix = self.keyspace.user_prefix();
        let mut sessions = BTreeMap::new();
        for key in self.store.keys(&prefix).await? {
            let id = &key[prefix.len()..];
            let fields = self.store.hgetall(&key).await?;
            // Flushed between listing and reading.
            if fields.is_empty() {
                continue;
            }
            sessions.insert(id.to_string(), UserSession::from_fields(id, fields)?);
        }
        Ok(sessions)
    }

    /// Every stored response, keyed by session id.
    pub async fn list_responses(&self) -> Result<BTreeMap<String, Vec<serde_json::Value>>> {
        let prefix = self.keyspace.responses_prefix();
        let mut all = BTreeMap::new();
        for key in self.store.keys(&prefix).await? {
            let id = key[prefix.len()..].to_string();
            let responses = self.responses(&id).await?;
            all.insert(id, responses);
        }
        Ok(all)
    }

    /// Deletes every session and response. Returns the number of keys removed.
    pub async fn flush(&self) -> Result<usize> {
        let mut ops = Vec::new();
        for prefix in [self.keyspace.user_prefix(), self.keyspace.responses_prefix()] {
            for key in self.store.keys(&prefix).await? {
                ops.push(Op::Del { key });
            }
        }
        let removed = ops.len();
        self.store.apply(ops).await?;
        tracing::warn!(removed, "Sessions flushed");
        Ok(removed)
    }
}

fn external_submit_url(host: &str) -> Option<Url> {
    let url = Url::parse(&format!("{}/mturk/externalSubmit", host.trim_end_matches('/'))).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;

    /// Deletes one key right before the first commit reaches the store, as a
    /// flush from another process would.
    struct FlushBeforeCommit {
        inner: MemoryStore,
        victim: String,
        fired: AtomicBool,
    }

    impl KvStore for FlushBeforeCommit {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            self.inner.set_nx_ex(key, value, ttl).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.expire(key, ttl).await
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.keys(prefix).await
        }

        async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
            self.inner.hgetall(key).await
        }

        async fn zrevrange(&self, key: &str, count: usize) -> Result<Vec<String>> {
            self.inner.zrevrange(key, count).await
        }

        async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
            self.inner.zscore(key, member).await
        }

        async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
            self.inner.sismember(key, member).await
        }

        async fn commit(&self, txn: Transaction) -> Result<bool> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.inner
                    .apply(vec![Op::Del {
                        key: self.victim.clone(),
                    }])
                    .await?;
            }
            self.inner.commit(txn).await
        }
    }

    fn ledger(mode: Mode, quota: u64, track_correct: bool) -> SessionLedger<MemoryStore> {
        SessionLedger::new(
            Arc::new(MemoryStore::new()),
            Keyspace::new("test"),
            mode,
            quota,
            track_correct,
        )
    }

    #[tokio::test]
    async fn in_progress_counts_views() {
        let ledger = ledger(Mode::Amt, 2, false);
        let id = ledger.create_session(&SessionContext::default()).await.unwrap();

        for expected in 1..=3 {
            assert_eq!(
                ledger.check_finished(&id, false).await.unwrap(),
                Completion::InProgress
            );
            assert_eq!(ledger.get(&id).await.unwrap().tasks_viewed, expected);
        }
    }

    #[tokio::test]
    async fn finishes_at_quota_and_keeps_end_time() {
        let ledger = ledger(Mode::Amt, 2, false);
        let id = ledger.create_session(&SessionContext::default()).await.unwrap();

        ledger.record_dispatch(&id).await.unwrap();
        ledger.record_result(&id, false).await.unwrap();
        assert!(!ledger.check_finished(&id, false).await.unwrap().is_finished());

        ledger.record_result(&id, false).await.unwrap();
        let first = ledger.check_finished(&id, false).await.unwrap();
        let verdict = first.verdict().unwrap();
        assert_eq!(verdict.tasks_finished, 2);
        assert_eq!(verdict.tasks_viewed, 2);
        assert_eq!(verdict.pct_finished, 1.0);

        let end_time = ledger.get(&id).await.unwrap().end_time.unwrap();
        let again = ledger.check_finished(&id, false).await.unwrap();
        assert!(again.is_finished());
        assert_eq!(ledger.get(&id).await.unwrap().end_time, Some(end_time));
    }

    #[tokio::test]
    async fn standalone_only_finishes_when_forced() {
        let ledger = ledger(Mode::Standalone, 1, false);
        let id = ledger.create_session(&SessionContext::default()).await.unwrap();
        ledger.record_result(&id, false).await.unwrap();
        ledger.record_result(&id, false).await.unwrap();

        assert_eq!(
            ledger.check_finished(&id, false).await.unwrap(),
            Completion::InProgress
        );
        let done = ledger.check_finished(&id, true).await.unwrap();
        assert_eq!(done.verdict().unwrap().submit_url, STANDALONE_DONE_URL);
    }

    #[tokio::test]
    async fn amt_submit_url_carries_progress() {
        let ledger = ledger(Mode::Amt, 10, true);
        let ctx = SessionContext::new(
            Some("127.0.0.1".to_string()),
            "assignmentId=ASSIGN1&turkSubmitTo=https%3A%2F%2Fworkersandbox.mturk.com",
        );
        let id = ledger.create_session(&ctx).await.unwrap();
        ledger.record_result(&id, true).await.unwrap();
        ledger.record_result(&id, false).await.unwrap();

        let verdict = ledger
            .check_finished(&id, true)
            .await
            .unwrap()
            .verdict()
            .cloned()
            .unwrap();

        assert!(verdict
            .submit_url
            .starts_with("https://workersandbox.mturk.com/mturk/externalSubmit?"));
        assert!(verdict.submit_url.contains("assignmentId=ASSIGN1"));
        assert!(verdict.submit_url.contains("tasks_finished=2"));
        assert!(verdict.submit_url.contains("pct_correct=0.5"));
        assert_eq!(verdict.pct_correct, Some(0.5));
    }

    #[tokio::test]
    async fn missing_submit_host_uses_default() {
        let ledger = ledger(Mode::Amt, 10, false);
        let ctx = SessionContext::new(None, "turkSubmitTo=javascript%3Aalert(1)");
        let id = ledger.create_session(&ctx).await.unwrap();

        let verdict = ledger.check_finished(&id, true).await.unwrap();
        let url = &verdict.verdict().unwrap().submit_url;
        assert!(url.starts_with("http://www.mturk.com/mturk/externalSubmit?assignmentId=NoId"));
        assert!(verdict.verdict().unwrap().pct_correct.is_none());
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let ledger = ledger(Mode::Amt, 1, false);
        assert!(matches!(
            ledger.check_finished("ghost", false).await,
            Err(PoolError::NotFound(_))
        ));
        assert!(matches!(
            ledger.record_result("ghost", true).await,
            Err(PoolError::NotFound(_))
        ));
        // No phantom record was created.
        assert!(ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn responses_list_and_flush() {
        let ledger = ledger(Mode::Standalone, 1, false);
        let a = ledger.create_session(&SessionContext::default()).await.unwrap();
        let b = ledger.create_session(&SessionContext::default()).await.unwrap();
        ledger
            .record_response(&a, &serde_json::json!({"label": "cat"}))
            .await
            .unwrap();

        assert_eq!(ledger.list().await.unwrap().len(), 2);
        let responses = ledger.list_responses().await.unwrap();
        assert_eq!(responses.get(&a).unwrap()[0]["label"], "cat");
        assert!(!responses.contains_key(&b));

        assert_eq!(ledger.flush().await.unwrap(), 3);
        assert!(ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn flush_racing_a_result_leaves_no_partial_session() {
        let store = MemoryStore::new();
        let keyspace = Keyspace::new("test");
        let id = SessionLedger::new(
            Arc::new(store.clone()),
            keyspace.clone(),
            Mode::Amt,
            1,
            false,
        )
        .create_session(&SessionContext::default())
        .await
        .unwrap();

        let racing = SessionLedger::new(
            Arc::new(FlushBeforeCommit {
                inner: store.clone(),
                victim: keyspace.user(&id),
                fired: AtomicBool::new(false),
            }),
            keyspace.clone(),
            Mode::Amt,
            1,
            false,
        );

        assert!(matches!(
            racing.record_result(&id, true).await,
            Err(PoolError::NotFound(_))
        ));
        assert!(store.hgetall(&keyspace.user(&id)).await.unwrap().is_empty());
        assert!(racing.list().await.unwrap().is_empty());
    }
}
