use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{PoolError, Result};
use crate::store::{Guard, KvStore, Op, Transaction};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, f64>),
    Set(HashSet<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::ZSet(_) => "zset",
            Value::Set(_) => "set",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Inner state of [`MemoryStore`]
#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
}

impl Inner {
    fn live(&self, key: &str) -> Option<&Entry> {
        let now = Instant::now();
        self.entries.get(key).filter(|e| e.is_live(now))
    }

    fn guard_holds(&self, guard: &Guard) -> Result<bool> {
        match guard {
            Guard::Exists { key } => Ok(self.live(key).is_some()),
            Guard::Equals { key, value } => Ok(match self.live(key).map(|e| &e.value) {
                Some(Value::Str(current)) => current == value,
                Some(other) => return Err(wrong_type(key, "string", other)),
                None => false,
            }),
            Guard::NotMember { key, member } => Ok(match self.live(key).map(|e| &e.value) {
                Some(Value::Set(set)) => !set.contains(member),
                Some(other) => return Err(wrong_type(key, "set", other)),
                None => true,
            }),
            Guard::Scored { key, member } => Ok(match self.live(key).map(|e| &e.value) {
                Some(Value::ZSet(zset)) => zset.contains_key(member),
                Some(other) => return Err(wrong_type(key, "zset", other)),
                None => false,
            }),
        }
    }
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> PoolError {
    PoolError::Store(format!(
        "WRONGTYPE key {key} holds a {}, expected a {expected}",
        found.kind()
    ))
}

/// The single key an op writes, `None` for prefix deletes.
fn op_key(op: &Op) -> Option<&str> {
    match op {
        Op::Set { key, .. }
        | Op::Del { key }
        | Op::HSet { key, .. }
        | Op::HIncr { key, .. }
        | Op::ZAdd { key, .. }
        | Op::ZIncr { key, .. }
        | Op::SAdd { key, .. } => Some(key),
        Op::DelPrefix { .. } => None,
    }
}

/// Applies one op to the staged copy of the touched keys.
fn apply_op(staged: &mut HashMap<String, Option<Entry>>, op: Op) -> Result<()> {
    let key = match &op {
        Op::DelPrefix { prefix } => {
            for (key, slot) in staged.iter_mut() {
                if key.starts_with(prefix.as_str()) {
                    *slot = None;
                }
            }
            return Ok(());
        }
        op => op_key(op).unwrap_or_default().to_string(),
    };
    let slot = staged.entry(key.clone()).or_insert(None);

    match op {
        Op::DelPrefix { .. } => {}
        Op::Set { value, .. } => {
            *slot = Some(Entry::new(Value::Str(value)));
        }
        Op::Del { .. } => {
            *slot = None;
        }
        Op::HSet { fields, .. } => {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
            match &mut entry.value {
                Value::Hash(hash) => hash.extend(fields),
                other => return Err(wrong_type(&key, "hash", other)),
            }
        }
        Op::HIncr { field, by, .. } => {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
            match &mut entry.value {
                Value::Hash(hash) => {
                    let current = match hash.get(&field) {
                        Some(raw) => raw.parse::<i64>().map_err(|_| {
                            PoolError::Store(format!("hash field {key}.{field} is not an integer"))
                        })?,
                        None => 0,
                    };
                    hash.insert(field, (current + by).to_string());
                }
                other => return Err(wrong_type(&key, "hash", other)),
            }
        }
        Op::ZAdd { member, score, .. } => {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::ZSet(HashMap::new())));
            match &mut entry.value {
                Value::ZSet(zset) => {
                    zset.insert(member, score);
                }
                other => return Err(wrong_type(&key, "zset", other)),
            }
        }
        Op::ZIncr { member, by, .. } => {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::ZSet(HashMap::new())));
            match &mut entry.value {
                Value::ZSet(zset) => {
                    *zset.entry(member).or_insert(0.0) += by;
                }
                other => return Err(wrong_type(&key, "zset", other)),
            }
        }
        Op::SAdd { member, .. } => {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::Set(HashSet::new())));
            match &mut entry.value {
                Value::Set(set) => {
                    set.insert(member);
                }
                other => return Err(wrong_type(&key, "set", other)),
            }
        }
    }

    Ok(())
}

/// In-memory [`KvStore`].
///
/// Clones share the same data, so one store can be handed to several
/// dispatchers to simulate processes sharing a Redis instance. Expired keys
/// are treated as absent on every access and dropped on the next write.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        inner.entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;

        match inner.live(key).map(|e| &e.value) {
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(other) => Err(wrong_type(key, "string", other)),
            None => Ok(None),
        }
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        match inner.entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        let now = Instant::now();

        let mut keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let inner = self.inner.lock().await;

        match inner.live(key).map(|e| &e.value) {
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(other) => Err(wrong_type(key, "hash", other)),
            None => Ok(HashMap::new()),
        }
    }

    async fn zrevrange(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;

        let zset = match inner.live(key).map(|e| &e.value) {
            Some(Value::ZSet(zset)) => zset,
            Some(other) => return Err(wrong_type(key, "zset", other)),
            None => return Ok(Vec::new()),
        };

        let mut members: Vec<(&String, f64)> = zset.iter().map(|(m, s)| (m, *s)).collect();
        members.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.0.cmp(a.0))
        });
        Ok(members
            .into_iter()
            .take(count)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let inner = self.inner.lock().await;

        match inner.live(key).map(|e| &e.value) {
            Some(Value::ZSet(zset)) => Ok(zset.get(member).copied()),
            Some(other) => Err(wrong_type(key, "zset", other)),
            None => Ok(None),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let inner = self.inner.lock().await;

        match inner.live(key).map(|e| &e.value) {
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(other) => Err(wrong_type(key, "set", other)),
            None => Ok(false),
        }
    }

    async fn commit(&self, txn: Transaction) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        for guard in &txn.guards {
            if !inner.guard_holds(guard)? {
                return Ok(false);
            }
        }

        // Stage every touched key so a failing op leaves the store untouched.
        let mut staged: HashMap<String, Option<Entry>> = HashMap::new();
        for op in &txn.ops {
            match op {
                Op::DelPrefix { prefix } => {
                    let now = Instant::now();
                    for (key, entry) in &inner.entries {
                        if key.starts_with(prefix.as_str()) && entry.is_live(now) {
                            staged.entry(key.clone()).or_insert_with(|| Some(entry.clone()));
                        }
                    }
                }
                op => {
                    if let Some(key) = op_key(op) {
                        if !staged.contains_key(key) {
                            staged.insert(key.to_string(), inner.live(key).cloned());
                        }
                    }
                }
            }
        }
        for op in txn.ops {
            apply_op(&mut staged, op)?;
        }

        for (key, entry) in staged {
            match entry {
                Some(entry) => {
                    inner.entries.insert(key, entry);
                }
                None => {
                    inner.entries.remove(&key);
                }
            }
        }
        Ok(true)
    }
}
