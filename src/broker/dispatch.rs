//! Worker selection and the dispatch loop.
//!
//! `select` pairs a service queue with an eligible worker: the service's
//! own pool first, then the wildcard complement in either direction (a
//! wildcard pool serving matching concrete queues, or a concrete queue
//! served by a matching wildcard pool). The dispatch loop drains pairings
//! until selection yields nothing, validating each request as it goes.

use std::collections::HashSet;

use bytes::Bytes;
use rand::Rng;
use tracing::debug;

use super::Broker;
use crate::config::DispatchMode;
use crate::proto::{self, Command};
use crate::registry::wildcard_prefix;
use crate::request::{now_ms, Request};

/// Outcome of validating a popped request against its chosen worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Assign to the worker.
    Deliver,
    /// Deadline passed; drop permanently.
    Expired,
    /// The chosen worker already rejected it and the retry ceiling is
    /// reached; requeue and re-enter with `rand`.
    Rejected,
}

pub(crate) fn validate(req: &Request, worker: &Bytes, rattempts: u32, now: u64) -> Verdict {
    if req.expired(now) {
        return Verdict::Expired;
    }
    if req.rejects.contains(worker) && req.attempts >= rattempts {
        return Verdict::Rejected;
    }
    Verdict::Deliver
}

/// A (queue, worker) pairing chosen by `select`. The queue's service name
/// may differ from the worker's registration when a wildcard matched.
struct Selection {
    service: String,
    worker: Bytes,
}

impl Broker {
    /// Drain as many (request, worker) pairings for `name` as selection
    /// allows. Requests that hit the reject ceiling are pushed back and a
    /// single deferred re-entry with mode `rand` is scheduled.
    pub(crate) async fn dispatch(&mut self, name: &str, mode: DispatchMode) {
        let mut deferred = false;
        loop {
            let Some(sel) = self.select(name, mode) else {
                break;
            };
            let Some(mut req) = self
                .services
                .get_mut(&sel.service)
                .and_then(|s| s.queue.pop_front())
            else {
                break;
            };
            req.attempts += 1;

            match validate(&req, &sel.worker, self.config.rattempts, now_ms()) {
                Verdict::Deliver => self.assign(sel.worker, req).await,
                Verdict::Expired => {
                    debug!(
                        rid = %hex::encode(&req.rid),
                        service = %req.service,
                        "Request expired, dropping"
                    );
                    if req.persist {
                        self.persist_del(&req.rid).await;
                    }
                }
                Verdict::Rejected => {
                    if let Some(service) = self.services.get_mut(&sel.service) {
                        service.queue.push_back(req);
                    }
                    deferred = true;
                    break;
                }
            }
        }

        if deferred && !self.redispatch.iter().any(|s| s == name) {
            self.redispatch.push_back(name.to_string());
        }
    }

    /// Pair `name` with a worker per the selection policy, or yield nothing.
    fn select(&self, name: &str, mode: DispatchMode) -> Option<Selection> {
        // Own pool and own queue: no cross-service routing.
        if let Some(service) = self.services.get(name) {
            if !service.workers.is_empty() && !service.queue.is_empty() {
                let exclude = service.queue.front().map(|r| &r.rejects);
                let worker = self.pick_worker(&service.workers, mode, exclude)?;
                return Some(Selection {
                    service: name.to_string(),
                    worker,
                });
            }
        }

        if let Some(prefix) = wildcard_prefix(name) {
            // Wildcard pool looking for a matching queue elsewhere.
            let pool = self.services.get(name)?;
            if pool.workers.is_empty() {
                return None;
            }
            for (other_name, other) in self.services.iter() {
                if other_name != name
                    && !other.queue.is_empty()
                    && other_name.starts_with(prefix)
                {
                    let exclude = other.queue.front().map(|r| &r.rejects);
                    if let Some(worker) = self.pick_worker(&pool.workers, mode, exclude) {
                        return Some(Selection {
                            service: other_name.clone(),
                            worker,
                        });
                    }
                }
            }
            None
        } else {
            // Concrete queue looking for a matching wildcard pool.
            let service = self.services.get(name)?;
            if service.queue.is_empty() {
                return None;
            }
            let exclude = service.queue.front().map(|r| &r.rejects);
            for (pattern, candidate) in self.services.iter() {
                let Some(prefix) = wildcard_prefix(pattern) else {
                    continue;
                };
                if candidate.workers.is_empty() || !name.starts_with(prefix) {
                    continue;
                }
                if let Some(worker) = self.pick_worker(&candidate.workers, mode, exclude) {
                    return Some(Selection {
                        service: name.to_string(),
                        worker,
                    });
                }
            }
            None
        }
    }

    /// Choose a worker from a pool.
    ///
    /// Workers at their concurrency limit are ineligible. Workers in the
    /// head request's reject set are avoided while any other eligible
    /// worker remains, so a rejected request makes progress to a different
    /// worker whenever one exists.
    fn pick_worker(
        &self,
        pool: &[Bytes],
        mode: DispatchMode,
        exclude: Option<&HashSet<Bytes>>,
    ) -> Option<Bytes> {
        let mut eligible: Vec<&Bytes> = pool
            .iter()
            .filter(|id| self.workers.get(id).is_some_and(|w| w.has_capacity()))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        if let Some(rejects) = exclude {
            if !rejects.is_empty() {
                let fresh: Vec<&Bytes> = eligible
                    .iter()
                    .copied()
                    .filter(|id| !rejects.contains(*id))
                    .collect();
                if !fresh.is_empty() {
                    eligible = fresh;
                }
            }
        }

        match mode {
            DispatchMode::Load => {
                eligible.sort_by_key(|id| {
                    self.workers.get(id).map(|w| w.rids.len()).unwrap_or(usize::MAX)
                });
                eligible.first().map(|id| (*id).clone())
            }
            DispatchMode::Rand => {
                let idx = rand::thread_rng().gen_range(0..eligible.len());
                Some(eligible[idx].clone())
            }
        }
    }

    /// Hand a request to a worker, unless the response cache can answer it
    /// outright.
    async fn assign(&mut self, worker_id: Bytes, mut req: Request) {
        if let Some(hash) = req.hash.clone() {
            let hit = match self.cache.as_mut() {
                Some(cache) => cache.get(&hash).await,
                None => None,
            };
            if let Some(payload) = hit {
                debug!(
                    rid = %hex::encode(&req.rid),
                    service = %req.service,
                    "Cache hit, answering without a worker"
                );
                self.send(
                    req.client.clone(),
                    proto::client_reply_frames(Command::Reply, &req.rid, &payload),
                );
                if req.persist {
                    self.persist_del(&req.rid).await;
                }
                return;
            }
        }

        req.worker = Some(worker_id.clone());
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.rids.push(req.rid.clone());
        }
        if req.persist {
            self.persist_set(&req).await;
        }

        debug!(
            rid = %hex::encode(&req.rid),
            worker = %hex::encode(&worker_id),
            service = %req.service,
            attempt = req.attempts,
            "Dispatching request"
        );

        let frames = proto::dispatch_frames(&req.client, &req.service, &req.payload);
        self.requests.insert(req);
        self.send(worker_id, frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestOpts;

    fn req(timeout: i64) -> Request {
        let opts = RequestOpts {
            timeout,
            ..Default::default()
        };
        Request::new(
            Bytes::from_static(b"r1"),
            "svc".into(),
            Bytes::from_static(b"c1"),
            &opts,
        )
    }

    #[test]
    fn test_validate_delivers_fresh_request() {
        let request = req(60_000);
        let worker = Bytes::from_static(b"w1");
        assert_eq!(
            validate(&request, &worker, 5, request.ts),
            Verdict::Deliver
        );
    }

    #[test]
    fn test_validate_expired() {
        let request = req(100);
        let worker = Bytes::from_static(b"w1");
        assert_eq!(
            validate(&request, &worker, 5, request.ts + 101),
            Verdict::Expired
        );
    }

    #[test]
    fn test_validate_negative_timeout_never_expires() {
        let request = req(-1);
        let worker = Bytes::from_static(b"w1");
        assert_eq!(
            validate(&request, &worker, 5, request.ts + u64::MAX / 2),
            Verdict::Deliver
        );
    }

    #[test]
    fn test_validate_reject_ceiling() {
        let worker = Bytes::from_static(b"w1");
        let mut request = req(60_000);
        request.rejects.insert(worker.clone());

        request.attempts = 4;
        assert_eq!(validate(&request, &worker, 5, request.ts), Verdict::Deliver);

        request.attempts = 5;
        assert_eq!(
            validate(&request, &worker, 5, request.ts),
            Verdict::Rejected
        );
    }

    #[test]
    fn test_validate_reject_ceiling_other_worker_unaffected() {
        let mut request = req(60_000);
        request.rejects.insert(Bytes::from_static(b"w1"));
        request.attempts = 10;
        assert_eq!(
            validate(&request, &Bytes::from_static(b"w2"), 5, request.ts),
            Verdict::Deliver
        );
    }
}
