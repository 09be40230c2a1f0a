//! Shared key-value store the whole engine runs on.
//!
//! The engine keeps no state of its own between calls: rows, data keys, the
//! data lock and worker sessions all live in a [`KvStore`]. The data model is
//! Redis-shaped (strings with expiry, hashes, sorted sets and sets).
//! [`RedisStore`] backs it with a Redis server shared by every process of a
//! job; [`MemoryStore`] is the in-process implementation used by tests and
//! single-process runs.
//!
//! Multi-key atomicity is expressed with a [`Transaction`]: a list of
//! [`Guard`]s checked and a list of [`Op`]s applied as one unit.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;

/// A single write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Set { key: String, value: String },
    Del { key: String },
    /// Deletes every key starting with `prefix` that exists when the
    /// transaction is applied.
    DelPrefix { prefix: String },
    HSet { key: String, fields: Vec<(String, String)> },
    HIncr { key: String, field: String, by: i64 },
    ZAdd { key: String, member: String, score: f64 },
    ZIncr { key: String, member: String, by: f64 },
    SAdd { key: String, member: String },
}

/// A precondition of a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "guard", rename_all = "snake_case")]
pub enum Guard {
    /// `key` exists and has not expired.
    Exists { key: String },
    /// The string at `key` exists, has not expired and equals `value`.
    Equals { key: String, value: String },
    /// `member` is not in the set at `key`.
    NotMember { key: String, member: String },
    /// `member` has a score in the sorted set at `key`.
    Scored { key: String, member: String },
}

/// Writes applied atomically if and only if every guard holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transaction {
    pub guards: Vec<Guard>,
    pub ops: Vec<Op>,
}

impl Transaction {
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            guards: Vec::new(),
            ops,
        }
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn op(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }
}

/// Storage backend shared by every process serving a job.
///
/// Implementations must be safe to call concurrently and must apply a
/// [`Transaction`] atomically with respect to every other call.
pub trait KvStore: Send + Sync + 'static {
    /// Returns the string at `key`, or `None` if absent or expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Sets `key` to `value` with a lifetime of `ttl` only if the key does
    /// not exist. Returns whether the key was set.
    fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Resets the lifetime of `key`. Returns false if the key does not exist.
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    /// Returns every live key starting with `prefix`.
    fn keys(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Returns all fields of the hash at `key`; empty if absent.
    fn hgetall(&self, key: &str) -> impl Future<Output = Result<HashMap<String, String>>> + Send;

    /// Returns up to `count` members of the sorted set at `key`, highest
    /// score first. Equal scores are ordered by member, descending.
    fn zrevrange(&self, key: &str, count: usize)
        -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Returns the score of `member` in the sorted set at `key`.
    fn zscore(&self, key: &str, member: &str) -> impl Future<Output = Result<Option<f64>>> + Send;

    /// Returns whether `member` is in the set at `key`.
    fn sismember(&self, key: &str, member: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Applies the transaction. Returns false, writing nothing, if any guard
    /// failed.
    fn commit(&self, txn: Transaction) -> impl Future<Output = Result<bool>> + Send;

    /// Applies `ops` atomically without guards.
    fn apply(&self, ops: Vec<Op>) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.commit(Transaction::new(ops)).await?;
            Ok(())
        }
    }
}
