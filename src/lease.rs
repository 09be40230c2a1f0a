//! Distributed data lock.
//!
//! The lock is a lease, not a mutex: the `data_lock` key expires after the
//! configured TTL and a holder can lose it without noticing. Holders therefore
//! never write directly. Every write is buffered in the [`Lease`] and only
//! committed by [`DataLock::release`], in one transaction guarded on the lock
//! key still holding the lease token. A stale holder resuming after expiry
//! either commits nothing or commits while provably still the holder, and its
//! buffer can never interleave with a newer holder's.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LeaseConfig;
use crate::error::{PoolError, Result};
use crate::keyspace::Keyspace;
use crate::mapper::urlsafe_token;
use crate::store::{Guard, KvStore, Op, Transaction};

/// Proof of a successful [`DataLock::acquire`] plus the writes buffered
/// under it.
#[derive(Debug)]
pub struct Lease {
    token: String,
    acquired_at: Instant,
    last_extended: Instant,
    buffer: Vec<Op>,
}

impl Lease {
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Buffers a write until release.
    pub fn push(&mut self, op: Op) {
        self.buffer.push(op);
    }

    pub fn extend_buffer(&mut self, ops: impl IntoIterator<Item = Op>) {
        self.buffer.extend(ops);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[derive(Debug)]
pub struct DataLock<S> {
    store: Arc<S>,
    key: String,
    job: String,
    config: LeaseConfig,
}

impl<S: KvStore> DataLock<S> {
    pub fn new(store: Arc<S>, keyspace: &Keyspace, config: LeaseConfig) -> Self {
        Self {
            store,
            key: keyspace.data_lock(),
            job: keyspace.prefix().trim_end_matches(':').to_string(),
            config,
        }
    }

    /// Waits until the lock is free and takes it with a fresh token.
    ///
    /// Retries every `retry_interval` with no upper bound; callers needing a
    /// deadline cancel `cancel`, which ends the wait with
    /// [`PoolError::Cancelled`].
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Lease> {
        let token = urlsafe_token();
        let mut attempts = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
            if self
                .store
                .set_nx_ex(&self.key, &token, self.config.ttl)
                .await?
            {
                break;
            }

            attempts += 1;
            tracing::debug!(job = %self.job, attempts, "Data lock held elsewhere, waiting");
            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_interval) => {}
                _ = cancel.cancelled() => {
                    tracing::info!(job = %self.job, attempts, "Data lock wait cancelled");
                    return Err(PoolError::Cancelled);
                }
            }
        }

        tracing::info!(job = %self.job, "Data lock acquired");
        let now = Instant::now();
        Ok(Lease {
            token,
            acquired_at: now,
            last_extended: now,
            buffer: Vec::new(),
        })
    }

    /// Refreshes the lock TTL. Unconditional: it does not check ownership.
    pub async fn extend(&self, lease: &mut Lease) -> Result<()> {
        self.store.expire(&self.key, self.config.ttl).await?;
        lease.last_extended = Instant::now();
        Ok(())
    }

    /// Refreshes the TTL once half of it has passed since the last refresh.
    pub async fn extend_if_due(&self, lease: &mut Lease) -> Result<bool> {
        if lease.last_extended.elapsed() * 2 < self.config.ttl {
            return Ok(false);
        }
        tracing::debug!(job = %self.job, "Extending data lock");
        self.extend(lease).await?;
        Ok(true)
    }

    /// Whether the stored lock value still equals the lease token.
    pub async fn still_held(&self, lease: &Lease) -> Result<bool> {
        Ok(self.store.get(&self.key).await?.as_deref() == Some(lease.token.as_str()))
    }

    /// Commits the buffered writes and frees the lock.
    ///
    /// If the lease was lost the buffer is discarded and
    /// [`PoolError::LockLost`] is returned; nothing is retried.
    pub async fn release(&self, mut lease: Lease) -> Result<()> {
        self.extend(&mut lease).await?;

        if !self.still_held(&lease).await? {
            return Err(self.lost(lease.buffer.len()));
        }

        let buffered = lease.buffer.len();
        let mut txn = Transaction::new(std::mem::take(&mut lease.buffer)).guard(Guard::Equals {
            key: self.key.clone(),
            value: lease.token.clone(),
        });
        txn.ops.push(Op::Del {
            key: self.key.clone(),
        });

        if !self.store.commit(txn).await? {
            return Err(self.lost(buffered));
        }

        tracing::info!(
            job = %self.job,
            writes = buffered,
            held_ms = lease.acquired_at.elapsed().as_millis() as u64,
            "Data lock released"
        );
        Ok(())
    }

    /// Frees the lock without committing anything, if still held.
    ///
    /// Used when the holder fails part way; the buffer is dropped.
    pub async fn abandon(&self, lease: Lease) -> Result<()> {
        let txn = Transaction::new(vec![Op::Del {
            key: self.key.clone(),
        }])
        .guard(Guard::Equals {
            key: self.key.clone(),
            value: lease.token.clone(),
        });
        let freed = self.store.commit(txn).await?;
        tracing::warn!(
            job = %self.job,
            discarded = lease.buffer.len(),
            freed,
            "Data lock abandoned"
        );
        Ok(())
    }

    fn lost(&self, discarded: usize) -> PoolError {
        tracing::warn!(
            job = %self.job,
            discarded,
            "Could not release data lock, lease lost; buffered writes discarded"
        );
        PoolError::LockLost(self.job.clone())
    }
}
