//! Worker and service registries plus the in-flight request table.
//!
//! All three are plain id-keyed maps owned exclusively by the broker task.
//! Records refer to each other by identity (worker id, service name, rid),
//! never by reference.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use crate::request::Request;

/// Initial liveness credit; one unit is consumed per silent heartbeat
/// interval.
pub const LIVENESS: i32 = 3;

/// Default per-worker concurrency limit.
pub const DEFAULT_CONCURRENCY: i64 = 100;

/// A registered worker.
#[derive(Debug)]
pub struct Worker {
    pub id: Bytes,
    /// The single service name this worker registered for.
    pub service: String,
    /// Remaining missed-heartbeat credit, in [-1, LIVENESS].
    pub liveness: i32,
    /// Currently assigned request ids, in assignment order.
    pub rids: Vec<Bytes>,
    /// Maximum simultaneous assignments; -1 means unbounded.
    pub concurrency: i64,
}

impl Worker {
    pub fn new(id: Bytes, service: String) -> Self {
        Self {
            id,
            service,
            liveness: LIVENESS,
            rids: Vec::new(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Whether another request may be assigned right now.
    pub fn has_capacity(&self) -> bool {
        self.concurrency < 0 || (self.rids.len() as i64) < self.concurrency
    }

    /// Drop an assignment if present.
    pub fn unassign(&mut self, rid: &Bytes) {
        self.rids.retain(|r| r != rid);
    }
}

/// A named service: its registered worker pool and pending request queue.
#[derive(Debug, Default)]
pub struct Service {
    /// Worker ids registered for this exact name, in registration order.
    pub workers: Vec<Bytes>,
    /// FIFO of pending requests.
    pub queue: VecDeque<Request>,
}

/// A service name ending in `*` is a prefix pattern; returns the literal
/// prefix when so.
pub fn wildcard_prefix(name: &str) -> Option<&str> {
    name.strip_suffix('*')
}

/// Service records keyed by name. Lazily created on first reference, never
/// destroyed during a broker lifetime.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Service>,
}

impl ServiceRegistry {
    pub fn ensure(&mut self, name: &str) -> &mut Service {
        self.services.entry(name.to_string()).or_default()
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Service> {
        self.services.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Service)> {
        self.services.iter()
    }

    /// Total queued requests across all services.
    pub fn queued(&self) -> usize {
        self.services.values().map(|s| s.queue.len()).sum()
    }
}

/// Worker records keyed by transport identity.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<Bytes, Worker>,
}

impl WorkerRegistry {
    pub fn insert(&mut self, worker: Worker) {
        self.workers.insert(worker.id.clone(), worker);
    }

    pub fn remove(&mut self, id: &Bytes) -> Option<Worker> {
        self.workers.remove(id)
    }

    pub fn get(&self, id: &Bytes) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &Bytes) -> Option<&mut Worker> {
        self.workers.get_mut(id)
    }

    pub fn contains(&self, id: &Bytes) -> bool {
        self.workers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Snapshot of all worker ids, for sweeps that mutate the registry.
    pub fn ids(&self) -> Vec<Bytes> {
        self.workers.keys().cloned().collect()
    }
}

/// Requests currently assigned to a worker, keyed by rid.
///
/// Queued requests live in their service queue; a rid appears here exactly
/// while some worker's `rids` contains it.
#[derive(Debug, Default)]
pub struct RequestTable {
    requests: HashMap<Bytes, Request>,
}

impl RequestTable {
    pub fn insert(&mut self, req: Request) {
        self.requests.insert(req.rid.clone(), req);
    }

    pub fn remove(&mut self, rid: &Bytes) -> Option<Request> {
        self.requests.remove(rid)
    }

    pub fn get(&self, rid: &Bytes) -> Option<&Request> {
        self.requests.get(rid)
    }

    pub fn contains(&self, rid: &Bytes) -> bool {
        self.requests.contains_key(rid)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
