//! Opaque data keys.
//!
//! Clients never see row or column identifiers. Every (row, column) pair is
//! encoded into a deterministic [`PathCode`] and paired with a random
//! [`DataKey`]; the store holds both directions (`key:<key> -> path` and
//! `path:<path> -> key`). The two directions always agree; a one-sided entry
//! means the store lost integrity and is reported as
//! [`PoolError::Integrity`], never as a missing key.

use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::keyspace::Keyspace;
use crate::scheduler::{Column, Row};
use crate::store::{KvStore, Op};

/// Fresh random token: 16 random bytes as 22 URL-safe base64 characters.
///
/// Used for data keys, lock tokens, session ids and admin secrets.
pub fn urlsafe_token() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

/// Reversible encoding of a (row, column) pair: `base64(row) base64(column)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathCode(String);

impl PathCode {
    pub fn encode(row: &Row, column: &Column) -> Self {
        Self(format!(
            "{} {}",
            STANDARD.encode(row.as_str()),
            STANDARD.encode(column.as_str())
        ))
    }

    pub fn decode(&self) -> Result<(Row, Column)> {
        let (row, column) = self
            .0
            .split_once(' ')
            .ok_or_else(|| PoolError::Integrity(format!("malformed path code {:?}", self.0)))?;
        Ok((Row(decode_part(row)?), Column(decode_part(column)?)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn decode_part(part: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(part)
        .map_err(|e| PoolError::Integrity(format!("undecodable path code part {part:?}: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| PoolError::Integrity(format!("path code part {part:?} is not UTF-8: {e}")))
}

/// Random token handed to clients in place of a (row, column) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataKey(pub String);

impl DataKey {
    pub fn generate() -> Self {
        Self(urlsafe_token())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bidirectional map between data keys and path codes.
#[derive(Debug)]
pub struct KeyMapper<S> {
    store: Arc<S>,
    keyspace: Keyspace,
}

impl<S: KvStore> KeyMapper<S> {
    pub fn new(store: Arc<S>, keyspace: Keyspace) -> Self {
        Self { store, keyspace }
    }

    /// Generates a fresh key for `path` and returns the writes persisting
    /// both directions. The caller buffers them with the row's insertion.
    pub fn register(&self, path: &PathCode) -> (DataKey, Vec<Op>) {
        let key = DataKey::generate();
        let ops = vec![
            Op::Set {
                key: self.keyspace.path(path.as_str()),
                value: key.0.clone(),
            },
            Op::Set {
                key: self.keyspace.data_key(key.as_str()),
                value: path.0.clone(),
            },
        ];
        (key, ops)
    }

    /// Write dropping the forward entry of a key about to be replaced.
    pub fn unregister_op(&self, key: &DataKey) -> Op {
        Op::Del {
            key: self.keyspace.data_key(key.as_str()),
        }
    }

    /// Resolves a data key back to its (row, column) pair.
    pub async fn resolve(&self, key: &str) -> Result<(Row, Column)> {
        let path = self
            .store
            .get(&self.keyspace.data_key(key))
            .await?
            .map(PathCode)
            .ok_or_else(|| PoolError::NotFound(format!("data key {key}")))?;

        match self.store.get(&self.keyspace.path(path.as_str())).await? {
            Some(back) if back == key => path.decode(),
            other => Err(PoolError::Integrity(format!(
                "data key {key} maps to {:?} but the path maps back to {other:?}",
                path.as_str()
            ))),
        }
    }

    /// Current key of a path, if registered.
    pub async fn lookup(&self, path: &PathCode) -> Result<Option<DataKey>> {
        Ok(self
            .store
            .get(&self.keyspace.path(path.as_str()))
            .await?
            .map(DataKey))
    }

    /// Key of a (row, column) pair.
    pub async fn key_for(&self, row: &Row, column: &Column) -> Result<DataKey> {
        self.lookup(&PathCode::encode(row, column))
            .await?
            .ok_or_else(|| PoolError::NotFound(format!("no data key for {row}/{column}")))
    }

    /// Writes deleting both namespaces.
    pub fn clear_ops(&self) -> Vec<Op> {
        [self.keyspace.data_key_prefix(), self.keyspace.path_prefix()]
            .into_iter()
            .map(|prefix| Op::DelPrefix { prefix })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn mapper() -> KeyMapper<MemoryStore> {
        KeyMapper::new(Arc::new(MemoryStore::new()), Keyspace::new("test"))
    }

    #[test]
    fn encode_is_deterministic_and_reversible() {
        let row = Row::from("frames/0001 with space.jpg");
        let column = Column::from("image");

        let a = PathCode::encode(&row, &column);
        let b = PathCode::encode(&row, &column);
        assert_eq!(a, b);
        assert_eq!(a.decode().unwrap(), (row, column));
    }

    #[test]
    fn malformed_path_code_is_an_integrity_error() {
        let bad = PathCode("no-separator".to_string());
        assert!(matches!(bad.decode(), Err(PoolError::Integrity(_))));

        let bad = PathCode("!!! ???".to_string());
        assert!(matches!(bad.decode(), Err(PoolError::Integrity(_))));
    }

    #[test]
    fn tokens_are_urlsafe_and_fresh() {
        let a = urlsafe_token();
        let b = urlsafe_token();
        assert_eq!(a.len(), 22);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn register_then_resolve_round_trips() {
        let mapper = mapper();
        let row = Row::from("r1");
        let column = Column::from("image");
        let path = PathCode::encode(&row, &column);

        let (key, ops) = mapper.register(&path);
        mapper.store.apply(ops).await.unwrap();

        assert_eq!(mapper.resolve(key.as_str()).await.unwrap(), (row.clone(), column.clone()));
        assert_eq!(mapper.key_for(&row, &column).await.unwrap(), key);
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let mapper = mapper();
        assert!(matches!(
            mapper.resolve("nope").await,
            Err(PoolError::NotFound(_))
        ));
        assert!(matches!(
            mapper.key_for(&Row::from("r"), &Column::from("c")).await,
            Err(PoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn one_sided_mapping_is_an_integrity_error() {
        let mapper = mapper();
        let path = PathCode::encode(&Row::from("r1"), &Column::from("c"));
        let (key, ops) = mapper.register(&path);
        mapper.store.apply(ops).await.unwrap();

        mapper
            .store
            .apply(vec![Op::Del {
                key: mapper.keyspace.path(path.as_str()),
            }])
            .await
            .unwrap();

        assert!(matches!(
            mapper.resolve(key.as_str()).await,
            Err(PoolError::Integrity(_))
        ));
    }
}
