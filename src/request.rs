//! Request records and client/worker option parsing.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Deserializer};

/// Default client timeout when opts carry none (ms).
pub const DEFAULT_TIMEOUT_MS: i64 = 60_000;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A client request travelling through the broker.
///
/// A request lives in exactly one place at a time: queued in its service's
/// FIFO, assigned to a worker (and then present in the request table), or
/// gone. Records hold peer/worker identities, never references, so the
/// broker's tables stay cycle-free.
#[derive(Debug, Clone)]
pub struct Request {
    /// Client-supplied request id, unique while in flight.
    pub rid: Bytes,
    /// Target service name (concrete, or a wildcard query).
    pub service: String,
    /// Transport identity of the submitting client.
    pub client: Bytes,
    /// Dispatch attempts so far. Incremented at dispatch, not at rejection.
    pub attempts: u32,
    /// Workers that have rejected this request.
    pub rejects: HashSet<Bytes>,
    /// Cache fingerprint, present iff the broker cache is enabled.
    pub hash: Option<String>,
    /// Wall-clock deadline offset in ms, or -1 for none.
    pub timeout: i64,
    /// Requeue on worker loss.
    pub retry: bool,
    /// Mirror this record into the persistence controller.
    pub persist: bool,
    /// Client-requested reply cache TTL (ms).
    pub cache: Option<i64>,
    /// Submission timestamp (epoch ms).
    pub ts: u64,
    /// Currently assigned worker, if any.
    pub worker: Option<Bytes>,
    /// Original frame fragments (body + opts) replayed on dispatch.
    pub payload: Vec<Bytes>,
}

impl Request {
    pub fn new(rid: Bytes, service: String, client: Bytes, opts: &RequestOpts) -> Self {
        Self {
            rid,
            service,
            client,
            attempts: 0,
            rejects: HashSet::new(),
            hash: None,
            timeout: opts.timeout,
            retry: opts.retry,
            persist: opts.persist,
            cache: opts.cache,
            ts: now_ms(),
            worker: None,
            payload: Vec::new(),
        }
    }

    /// True once the deadline has passed. Requests with a negative timeout
    /// never expire.
    pub fn expired(&self, now: u64) -> bool {
        self.timeout >= 0 && now > self.ts.saturating_add(self.timeout as u64)
    }
}

/// Client-controlled request options, parsed from the trailing JSON frame.
///
/// Malformed JSON falls back to defaults; a bad opts frame never fails the
/// request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestOpts {
    /// Expiry in ms; negative disables the deadline.
    pub timeout: i64,
    /// Requeue on worker loss. Accepts a JSON bool or integer.
    #[serde(deserialize_with = "bool_or_int")]
    pub retry: bool,
    /// Mirror the request into the persistence controller.
    pub persist: bool,
    /// Reply cache TTL in ms.
    pub cache: Option<i64>,
}

impl Default for RequestOpts {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT_MS,
            retry: false,
            persist: false,
            cache: None,
        }
    }
}

impl RequestOpts {
    pub fn parse(raw: &[u8]) -> Self {
        if raw.is_empty() {
            return Self::default();
        }
        serde_json::from_slice(raw).unwrap_or_default()
    }
}

/// Worker-controlled reply options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplyOpts {
    /// TTL in ms for caching this reply under the request fingerprint.
    pub cache: Option<i64>,
}

impl ReplyOpts {
    pub fn parse(raw: &[u8]) -> Self {
        if raw.is_empty() {
            return Self::default();
        }
        serde_json::from_slice(raw).unwrap_or_default()
    }
}

/// Worker heartbeat options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerOpts {
    /// Maximum simultaneous assignments; -1 means unbounded.
    pub concurrency: Option<i64>,
}

impl WorkerOpts {
    pub fn parse(raw: &[u8]) -> Self {
        if raw.is_empty() {
            return Self::default();
        }
        serde_json::from_slice(raw).unwrap_or_default()
    }
}

/// The `retry` field historically arrived as either a bool or an integer;
/// both coerce to a bool (non-zero means true).
fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}
