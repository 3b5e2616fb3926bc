//! Domo — service-oriented request broker.
//!
//! Clients submit named-service requests; workers register to serve
//! specific services; the broker queues, dispatches, tracks, retries, and
//! caches requests while monitoring worker liveness via heartbeats.
//!
//! The broker core is transport-agnostic: it speaks ordered multipart
//! frame envelopes over a channel pair. A router-style TCP adapter is
//! provided for the `domod` binary; embedders can wire the broker to any
//! identity-stamping socket.

pub mod bootstrap;
pub mod broker;
pub mod cache;
pub mod config;
pub mod proto;
pub mod registry;
pub mod request;
pub mod store;
pub mod transport;

// Re-export the common surface for library usage
pub use broker::{Broker, BrokerEvent};
pub use cache::{MemoryCache, ResponseCache};
pub use config::{BrokerConfig, Config, DispatchMode};
pub use store::{MemoryRequestStore, RequestRecord, RequestStore};
pub use transport::{frame_channel, Envelope, TcpRouter};
