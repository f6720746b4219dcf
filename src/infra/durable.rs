//! Durable evaluation store
//!
//! Written only by the gateway (initial record) and the store writer;
//! every other component reads only. Updates go through an optimistic
//! compare-and-swap on the record version so concurrent writers cannot
//! silently overwrite each other.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;

use crate::error::{EvalError, EvalResult};
use crate::evaluation::{EvalId, Evaluation};

/// Durable store contract
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert the initial record; fails if the id already exists
    async fn insert(&self, eval: &Evaluation) -> EvalResult<()>;

    /// Fetch a record by id
    async fn get(&self, id: &EvalId) -> EvalResult<Option<Evaluation>>;

    /// Replace the record iff its stored version equals
    /// `expected_version`; the written record carries
    /// `expected_version + 1`. Returns false on a version miss.
    async fn update_if_version(
        &self,
        eval: &Evaluation,
        expected_version: u64,
    ) -> EvalResult<bool>;

    /// All known evaluation ids
    async fn list_ids(&self) -> EvalResult<Vec<EvalId>>;
}

/// In-memory durable store for tests and single-process deployments
#[derive(Default)]
pub struct MemoryDurableStore {
    records: DashMap<String, Evaluation>,
}

impl MemoryDurableStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn insert(&self, eval: &Evaluation) -> EvalResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(eval.id.to_string()) {
            Entry::Occupied(_) => Err(EvalError::AlreadyExists(eval.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(eval.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &EvalId) -> EvalResult<Option<Evaluation>> {
        Ok(self.records.get(id.as_str()).map(|r| r.clone()))
    }

    async fn update_if_version(
        &self,
        eval: &Evaluation,
        expected_version: u64,
    ) -> EvalResult<bool> {
        let Some(mut entry) = self.records.get_mut(eval.id.as_str()) else {
            return Ok(false);
        };
        if entry.version != expected_version {
            return Ok(false);
        }
        let mut next = eval.clone();
        next.version = expected_version + 1;
        *entry = next;
        Ok(true)
    }

    async fn list_ids(&self) -> EvalResult<Vec<EvalId>> {
        self.records
            .iter()
            .map(|r| EvalId::parse_str(r.key()))
            .collect()
    }
}

/// Sled-backed durable store
///
/// Records live under `eval:{id}` as JSON; version checks ride on
/// sled's `compare_and_swap`.
pub struct SledDurableStore {
    db: sled::Db,
}

impl SledDurableStore {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> EvalResult<Self> {
        let db = sled::open(path)
            .map_err(|e| EvalError::Storage(format!("Failed to open database: {}", e)))?;
        Ok(Self { db })
    }

    fn key(id: &EvalId) -> String {
        format!("eval:{}", id)
    }

    fn decode(bytes: &[u8]) -> EvalResult<Evaluation> {
        serde_json::from_slice(bytes)
            .map_err(|e| EvalError::Storage(format!("Deserialization error: {}", e)))
    }
}

#[async_trait]
impl DurableStore for SledDurableStore {
    async fn insert(&self, eval: &Evaluation) -> EvalResult<()> {
        let key = Self::key(&eval.id);
        let value = serde_json::to_vec(eval)?;
        let outcome = self
            .db
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(value))
            .map_err(|e| EvalError::Storage(format!("Database error: {}", e)))?;
        match outcome {
            Ok(()) => Ok(()),
            Err(_) => Err(EvalError::AlreadyExists(eval.id.to_string())),
        }
    }

    async fn get(&self, id: &EvalId) -> EvalResult<Option<Evaluation>> {
        let key = Self::key(id);
        match self
            .db
            .get(key.as_bytes())
            .map_err(|e| EvalError::Storage(format!("Database error: {}", e)))?
        {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update_if_version(
        &self,
        eval: &Evaluation,
        expected_version: u64,
    ) -> EvalResult<bool> {
        let key = Self::key(&eval.id);
        let current = match self
            .db
            .get(key.as_bytes())
            .map_err(|e| EvalError::Storage(format!("Database error: {}", e)))?
        {
            Some(bytes) => bytes,
            None => return Ok(false),
        };
        if Self::decode(&current)?.version != expected_version {
            return Ok(false);
        }

        let mut next = eval.clone();
        next.version = expected_version + 1;
        let value = serde_json::to_vec(&next)?;
        let outcome = self
            .db
            .compare_and_swap(key.as_bytes(), Some(&current), Some(value))
            .map_err(|e| EvalError::Storage(format!("Database error: {}", e)))?;
        Ok(outcome.is_ok())
    }

    async fn list_ids(&self) -> EvalResult<Vec<EvalId>> {
        let mut ids = Vec::new();
        for item in self.db.scan_prefix(b"eval:") {
            let (key, _) =
                item.map_err(|e| EvalError::Storage(format!("Database error: {}", e)))?;
            let key = String::from_utf8_lossy(&key);
            if let Some(id) = key.strip_prefix("eval:") {
                ids.push(EvalId::parse_str(id)?);
            }
        }
        Ok(ids)
    }
}
