// src/kv.rs

//! Versioned key-value storage behind the lease coordinator.
//!
//! Every value carries a monotonically increasing revision, and the only
//! mutation primitives are create-if-absent and compare-and-swap against a
//! revision read earlier. That is enough to build leader election and lease
//! accounting without any instance trusting its own clock more than the
//! store's ordering.
//!
//! Two backends: an in-process map for tests and single-instance runs, and
//! Redis for real deployments. The Redis swap runs as a Lua script so the
//! revision check and the write are one atomic step.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, AsyncIter, Script};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed stored value under {key}")]
    Corrupt { key: String },
}

/// A value plus the revision it was read at. Revisions start at 1 and grow
/// by one per successful swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub revision: u64,
    pub value: String,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, KvError>;

    /// Creates the key at revision 1. Returns whether this call created it.
    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, KvError>;

    /// Replaces the value only when the stored revision still equals
    /// `expected`. Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        expected: u64,
    ) -> Result<bool, KvError>;

    /// All keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Versioned>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, KvError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Versioned {
                revision: 1,
                value: value.to_string(),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        expected: u64,
    ) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.revision == expected => {
                entry.revision += 1;
                entry.value = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// Revision check and write must be one atomic step on the server.
static CAS_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local cur = redis.call('GET', KEYS[1])
        if not cur then return 0 end
        local sep = string.find(cur, '\n', 1, true)
        if not sep then return 0 end
        local rev = tonumber(string.sub(cur, 1, sep - 1))
        if rev ~= tonumber(ARGV[1]) then return 0 end
        redis.call('SET', KEYS[1], (rev + 1) .. '\n' .. ARGV[2])
        return 1
        "#,
    )
});

/// Values are stored as `"{revision}\n{value}"`; the value itself is JSON in
/// practice and never starts with a digit-newline prefix of its own.
pub struct RedisKvStore {
    connection: ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

fn decode(key: &str, raw: String) -> Result<Versioned, KvError> {
    let (revision, value) = raw.split_once('\n').ok_or_else(|| KvError::Corrupt {
        key: key.to_string(),
    })?;
    let revision = revision.parse().map_err(|_| KvError::Corrupt {
        key: key.to_string(),
    })?;
    Ok(Versioned {
        revision,
        value: value.to_string(),
    })
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, KvError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        raw.map(|raw| decode(key, raw)).transpose()
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(format!("1\n{value}"))
            .arg("NX")
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        expected: u64,
    ) -> Result<bool, KvError> {
        let mut connection = self.connection.clone();
        let swapped: i64 = CAS_SCRIPT
            .key(key)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut connection)
            .await?;
        Ok(swapped == 1)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut connection = self.connection.clone();
        let mut matches: AsyncIter<String> = connection.scan_match(format!("{prefix}*")).await?;
        let mut keys = Vec::new();
        while let Some(key) = matches.next_item().await {
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }
}
