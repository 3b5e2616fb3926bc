//! Pluggable persistence for in-flight requests.
//!
//! The broker mirrors persisted requests on enqueue and re-assignment and
//! deletes them on final reply, timeout, or abandoned worker loss. The
//! default store is process-local; durable implementations must keep the
//! rid as primary key and support atomic delete.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::request::Request;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by persistence backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend failure: {0}")]
    Backend(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A serializable snapshot of a request record, keyed by rid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub rid: Vec<u8>,
    pub service: String,
    pub client: Vec<u8>,
    pub attempts: u32,
    pub rejects: Vec<Vec<u8>>,
    pub hash: Option<String>,
    pub timeout: i64,
    pub retry: bool,
    pub cache: Option<i64>,
    pub ts: u64,
    pub worker: Option<Vec<u8>>,
    pub payload: Vec<Vec<u8>>,
}

impl From<&Request> for RequestRecord {
    fn from(req: &Request) -> Self {
        Self {
            rid: req.rid.to_vec(),
            service: req.service.clone(),
            client: req.client.to_vec(),
            attempts: req.attempts,
            rejects: req.rejects.iter().map(|r| r.to_vec()).collect(),
            hash: req.hash.clone(),
            timeout: req.timeout,
            retry: req.retry,
            cache: req.cache,
            ts: req.ts,
            worker: req.worker.as_ref().map(|w| w.to_vec()),
            payload: req.payload.iter().map(|p| p.to_vec()).collect(),
        }
    }
}

impl From<RequestRecord> for Request {
    fn from(rec: RequestRecord) -> Self {
        Self {
            rid: Bytes::from(rec.rid),
            service: rec.service,
            client: Bytes::from(rec.client),
            attempts: rec.attempts,
            rejects: rec.rejects.into_iter().map(Bytes::from).collect(),
            hash: rec.hash,
            timeout: rec.timeout,
            retry: rec.retry,
            persist: true,
            cache: rec.cache,
            ts: rec.ts,
            worker: None,
            payload: rec.payload.into_iter().map(Bytes::from).collect(),
        }
    }
}

/// Persistence controller capability: `{rset, rdel, rget, rgetall}`.
#[async_trait]
pub trait RequestStore: Send {
    /// Upsert a request by rid.
    async fn rset(&mut self, record: RequestRecord) -> Result<()>;

    /// Delete a request by rid.
    async fn rdel(&mut self, rid: &[u8]) -> Result<()>;

    /// Fetch a request by rid.
    async fn rget(&self, rid: &[u8]) -> Result<Option<RequestRecord>>;

    /// All persisted requests; consumed once at broker startup to
    /// repopulate queues.
    async fn rgetall(&self) -> Result<Vec<RequestRecord>>;
}

/// Default volatile store: a process-local map.
#[derive(Default)]
pub struct MemoryRequestStore {
    records: HashMap<Vec<u8>, RequestRecord>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn rset(&mut self, record: RequestRecord) -> Result<()> {
        self.records.insert(record.rid.clone(), record);
        Ok(())
    }

    async fn rdel(&mut self, rid: &[u8]) -> Result<()> {
        self.records.remove(rid);
        Ok(())
    }

    async fn rget(&self, rid: &[u8]) -> Result<Option<RequestRecord>> {
        Ok(self.records.get(rid).cloned())
    }

    async fn rgetall(&self) -> Result<Vec<RequestRecord>> {
        Ok(self.records.values().cloned().collect())
    }
}
