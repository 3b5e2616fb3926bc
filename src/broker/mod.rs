//! The broker: a single task owning every registry, fed by inbound frame
//! envelopes and a heartbeat ticker.
//!
//! Handlers run to completion; no two interleave. Dispatch re-entries
//! requested mid-handler are queued and drained between handler
//! invocations, after pending I/O, so retry storms never starve the inbound
//! path.

mod dispatch;


use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::{fingerprint, MemoryCache, ResponseCache};
use crate::config::{BrokerConfig, DispatchMode};
use crate::proto::{self, Command, Inbound, Origin};
use crate::registry::{RequestTable, ServiceRegistry, Worker, WorkerRegistry, LIVENESS};
use crate::request::{Request, RequestOpts, ReplyOpts, WorkerOpts};
use crate::store::{MemoryRequestStore, RequestRecord, RequestStore};
use crate::transport::{Envelope, FrameRx, FrameTx};

/// Capacity of the observability event channel.
const EVENT_CAPACITY: usize = 64;

/// Out-of-band broker notifications for observers.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// An unexpected condition the broker absorbed rather than propagated.
    Error { message: String },
    /// A worker was purged after exhausting its liveness credit.
    WorkerExpired { service: String },
}

/// Service-oriented request broker.
///
/// Owns the worker/service registries, the in-flight request table, the
/// response cache, and the persistence controller. All mutation happens on
/// the task driving [`Broker::run`].
pub struct Broker {
    config: BrokerConfig,
    services: ServiceRegistry,
    workers: WorkerRegistry,
    requests: RequestTable,
    cache: Option<Box<dyn ResponseCache>>,
    store: Box<dyn RequestStore>,
    outbound: FrameTx,
    events: broadcast::Sender<BrokerEvent>,
    /// Services awaiting a deferred dispatch re-entry, deduplicated.
    redispatch: VecDeque<String>,
    last_sweep: Instant,
}

impl Broker {
    /// Create a broker that sends outbound frames on `outbound`.
    ///
    /// The response cache is enabled when the config says so; the
    /// persistence controller defaults to the in-memory store.
    pub fn new(config: BrokerConfig, outbound: FrameTx) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cache: Option<Box<dyn ResponseCache>> = if config.cache {
            Some(Box::new(MemoryCache::new()))
        } else {
            None
        };
        Self {
            config,
            services: ServiceRegistry::default(),
            workers: WorkerRegistry::default(),
            requests: RequestTable::default(),
            cache,
            store: Box::new(MemoryRequestStore::new()),
            outbound,
            events,
            redispatch: VecDeque::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Substitute the persistence controller.
    pub fn with_store(mut self, store: Box<dyn RequestStore>) -> Self {
        self.store = store;
        self
    }

    /// Substitute the response cache (and enable caching).
    pub fn with_cache(mut self, cache: Box<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Subscribe to out-of-band broker events.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Drive the broker until the inbound channel closes.
    ///
    /// Repopulates queues from the persistence controller, then loops over
    /// inbound envelopes, heartbeat ticks, and deferred dispatch re-entries.
    pub async fn run(mut self, mut inbound: FrameRx) {
        self.restore().await;

        let mut ticker = interval(Duration::from_millis(self.config.heartbeat.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            heartbeat = self.config.heartbeat,
            dmode = ?self.config.dmode,
            cache = self.cache.is_some(),
            "Broker started"
        );

        loop {
            tokio::select! {
                biased;

                maybe = inbound.recv() => match maybe {
                    Some(env) => {
                        self.handle_envelope(env).await;
                        self.workers_check().await;
                    }
                    None => {
                        info!("Inbound channel closed, stopping broker");
                        break;
                    }
                },

                _ = ticker.tick() => {
                    self.workers_check().await;
                },

                _ = std::future::ready(()), if !self.redispatch.is_empty() => {
                    if let Some(service) = self.redispatch.pop_front() {
                        self.dispatch(&service, DispatchMode::Rand).await;
                    }
                },
            }
        }
    }

    /// Classify one inbound envelope and drive the matching state machine.
    async fn handle_envelope(&mut self, env: Envelope) {
        let peer = env.peer;
        let classified = match proto::classify(&env.frames) {
            Ok(classified) => classified,
            Err(e) => {
                if self.workers.contains(&peer) {
                    debug!(worker = %hex::encode(&peer), error = %e, "Protocol violation");
                    self.delete_worker(&peer, true).await;
                } else {
                    debug!(peer = %hex::encode(&peer), error = %e, "Unparseable frames, ignoring");
                }
                return;
            }
        };

        match classified {
            (Origin::Client, msg) => match msg {
                Inbound::ClientRequest {
                    service,
                    rid,
                    body,
                    opts,
                } => self.on_client_request(peer, service, rid, body, opts).await,
                Inbound::ClientHeartbeat { rid } => self.on_client_heartbeat(&rid),
                _ => {}
            },
            (Origin::Worker, msg) => {
                let ready = matches!(msg, Inbound::WorkerReady { .. });
                if !ready && !self.workers.contains(&peer) {
                    // Workers must handshake before anything else.
                    debug!(peer = %hex::encode(&peer), "Frame from unknown worker");
                    self.send(peer, proto::disconnect_frames());
                    return;
                }
                if let Some(worker) = self.workers.get_mut(&peer) {
                    worker.liveness = LIVENESS;
                }
                match msg {
                    Inbound::WorkerReady { service } => {
                        self.on_worker_ready(peer, service).await;
                    }
                    Inbound::WorkerReply {
                        partial,
                        rid,
                        payload,
                        opts,
                        ..
                    } => {
                        self.on_worker_reply(peer, partial, rid, payload, opts)
                            .await;
                    }
                    Inbound::WorkerReject { rid, .. } => {
                        self.on_worker_reject(peer, rid).await;
                    }
                    Inbound::WorkerHeartbeat { opts } => self.on_worker_heartbeat(&peer, &opts),
                    Inbound::WorkerDisconnect => self.delete_worker(&peer, false).await,
                    _ => {}
                }
            }
        }
    }

    async fn on_client_request(
        &mut self,
        client: Bytes,
        service: String,
        rid: Bytes,
        body: Bytes,
        opts_raw: Bytes,
    ) {
        let opts = RequestOpts::parse(&opts_raw);
        let mut req = Request::new(rid, service.clone(), client, &opts);
        if self.cache.is_some() {
            req.hash = Some(fingerprint(&service, &body));
        }
        req.payload = vec![body, opts_raw];

        debug!(
            service = %service,
            rid = %hex::encode(&req.rid),
            timeout = req.timeout,
            retry = req.retry,
            "Client request"
        );

        if req.persist {
            self.persist_set(&req).await;
        }
        self.services.ensure(&service).queue.push_back(req);
        self.dispatch(&service, self.config.dmode).await;
    }

    /// A client's liveness signal for an in-flight request: forwarded to the
    /// assigned worker carrying the original client identity.
    fn on_client_heartbeat(&mut self, rid: &Bytes) {
        let Some(req) = self.requests.get(rid) else {
            return;
        };
        let Some(worker) = req.worker.clone() else {
            return;
        };
        let frames = proto::heartbeat_forward_frames(&req.client);
        self.send(worker, frames);
    }

    async fn on_worker_ready(&mut self, worker_id: Bytes, service: String) {
        if self.workers.contains(&worker_id) || service.is_empty() {
            debug!(
                worker = %hex::encode(&worker_id),
                "Duplicate READY or empty service"
            );
            self.delete_worker(&worker_id, true).await;
            return;
        }

        info!(
            worker = %hex::encode(&worker_id),
            service = %service,
            "Worker registered"
        );
        self.workers
            .insert(Worker::new(worker_id.clone(), service.clone()));
        self.services.ensure(&service).workers.push(worker_id);
        self.dispatch(&service, self.config.dmode).await;
    }

    async fn on_worker_reply(
        &mut self,
        worker_id: Bytes,
        partial: bool,
        rid: Bytes,
        payload: Bytes,
        opts_raw: Bytes,
    ) {
        let assigned = self
            .workers
            .get(&worker_id)
            .map(|w| w.rids.contains(&rid))
            .unwrap_or(false);
        if !assigned {
            debug!(
                worker = %hex::encode(&worker_id),
                rid = %hex::encode(&rid),
                "Reply for unassigned rid"
            );
            self.delete_worker(&worker_id, true).await;
            return;
        }

        if partial {
            if let Some(req) = self.requests.get(&rid) {
                let client = req.client.clone();
                self.send(
                    client,
                    proto::client_reply_frames(Command::ReplyPartial, &rid, &[payload]),
                );
            }
            return;
        }

        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.unassign(&rid);
        }
        let Some(req) = self.requests.remove(&rid) else {
            return;
        };

        self.send(
            req.client.clone(),
            proto::client_reply_frames(Command::Reply, &rid, &[payload.clone()]),
        );

        if req.persist {
            self.persist_del(&rid).await;
        }

        let reply_opts = ReplyOpts::parse(&opts_raw);
        if let (Some(hash), Some(ttl)) = (req.hash.as_deref(), reply_opts.cache.or(req.cache)) {
            if let Some(cache) = self.cache.as_mut() {
                cache.set(hash, vec![payload], ttl).await;
            }
        }

        // The worker freed a slot; drain its service queue.
        if let Some(service) = self.workers.get(&worker_id).map(|w| w.service.clone()) {
            self.dispatch(&service, self.config.dmode).await;
        }
    }

    async fn on_worker_reject(&mut self, worker_id: Bytes, rid: Bytes) {
        let assigned = self
            .workers
            .get(&worker_id)
            .map(|w| w.rids.contains(&rid))
            .unwrap_or(false);
        if !assigned {
            debug!(
                worker = %hex::encode(&worker_id),
                rid = %hex::encode(&rid),
                "Reject for unassigned rid"
            );
            self.delete_worker(&worker_id, true).await;
            return;
        }

        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.unassign(&rid);
        }
        let Some(mut req) = self.requests.remove(&rid) else {
            return;
        };

        debug!(
            worker = %hex::encode(&worker_id),
            rid = %hex::encode(&rid),
            attempts = req.attempts,
            "Request rejected"
        );

        req.rejects.insert(worker_id);
        req.worker = None;
        let service = req.service.clone();
        self.services.ensure(&service).queue.push_back(req);
        // Rand avoids immediately re-selecting the rejecting worker under
        // load-based selection.
        self.dispatch(&service, DispatchMode::Rand).await;
    }

    fn on_worker_heartbeat(&mut self, worker_id: &Bytes, opts_raw: &Bytes) {
        let opts = WorkerOpts::parse(opts_raw);
        if let Some(concurrency) = opts.concurrency {
            if let Some(worker) = self.workers.get_mut(worker_id) {
                worker.concurrency = concurrency;
            }
        }
    }

    /// Remove a worker. `rude` sends an explicit DISCONNECT first. In-flight
    /// requests are requeued when their `retry` flag is set, otherwise
    /// dropped (and erased from persistence).
    async fn delete_worker(&mut self, worker_id: &Bytes, rude: bool) {
        if rude {
            self.send(worker_id.clone(), proto::disconnect_frames());
        }
        let Some(worker) = self.workers.remove(worker_id) else {
            return;
        };
        if let Some(service) = self.services.get_mut(&worker.service) {
            service.workers.retain(|w| w != worker_id);
        }

        info!(
            worker = %hex::encode(worker_id),
            service = %worker.service,
            rude,
            inflight = worker.rids.len(),
            "Worker removed"
        );

        let mut requeued: Vec<String> = Vec::new();
        for rid in worker.rids {
            let Some(mut req) = self.requests.remove(&rid) else {
                continue;
            };
            req.worker = None;
            if !worker.service.is_empty() && req.retry {
                let service = req.service.clone();
                self.services.ensure(&service).queue.push_back(req);
                if !requeued.contains(&service) {
                    requeued.push(service);
                }
            } else {
                if req.persist {
                    self.persist_del(&rid).await;
                }
                debug!(rid = %hex::encode(&rid), "Dropping in-flight request");
            }
        }

        for service in requeued {
            self.dispatch(&service, self.config.dmode).await;
        }
    }

    /// Liveness sweep, self-rate-limited to once per heartbeat interval.
    /// Called from the ticker and after every inbound frame.
    async fn workers_check(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < Duration::from_millis(self.config.heartbeat) {
            return;
        }
        self.last_sweep = now;
        self.sweep_workers().await;
    }

    /// Decrement every worker's liveness; purge the expired, heartbeat the
    /// rest.
    async fn sweep_workers(&mut self) {
        for id in self.workers.ids() {
            let expired = match self.workers.get_mut(&id) {
                Some(worker) => {
                    worker.liveness -= 1;
                    worker.liveness < 0
                }
                None => continue,
            };
            if expired {
                let service = self
                    .workers
                    .get(&id)
                    .map(|w| w.service.clone())
                    .unwrap_or_default();
                info!(worker = %hex::encode(&id), service = %service, "Worker liveness expired");
                self.emit(BrokerEvent::WorkerExpired { service });
                self.delete_worker(&id, true).await;
            } else {
                self.send(id, proto::heartbeat_frames());
            }
        }
    }

    /// Repopulate queues from the persistence controller. Runs once, at
    /// startup.
    async fn restore(&mut self) {
        let records = match self.store.rgetall().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted requests");
                self.emit_error(format!("persistence rgetall failed: {}", e));
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        info!(count = records.len(), "Restoring persisted requests");
        let mut services: Vec<String> = Vec::new();
        for record in records {
            let req = Request::from(record);
            let service = req.service.clone();
            self.services.ensure(&service).queue.push_back(req);
            if !services.contains(&service) {
                services.push(service);
            }
        }
        for service in services {
            self.dispatch(&service, self.config.dmode).await;
        }
    }

    /// Send frames to a peer. A closed transport is not an error; frames for
    /// absent peers are silently dropped downstream.
    fn send(&self, peer: Bytes, frames: Vec<Bytes>) {
        if self.outbound.send(Envelope::new(peer, frames)).is_err() {
            debug!("Transport closed, dropping outbound frames");
        }
    }

    async fn persist_set(&mut self, req: &Request) {
        if let Err(e) = self.store.rset(RequestRecord::from(req)).await {
            warn!(error = %e, rid = %hex::encode(&req.rid), "Persistence rset failed");
            self.emit_error(format!("persistence rset failed: {}", e));
        }
    }

    async fn persist_del(&mut self, rid: &Bytes) {
        if let Err(e) = self.store.rdel(rid).await {
            warn!(error = %e, rid = %hex::encode(rid), "Persistence rdel failed");
            self.emit_error(format!("persistence rdel failed: {}", e));
        }
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, message: String) {
        self.emit(BrokerEvent::Error { message });
    }
}
