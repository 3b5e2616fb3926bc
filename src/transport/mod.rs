//! Frame-channel transport abstraction.
//!
//! The broker core is transport-agnostic: it consumes inbound [`Envelope`]s
//! from an mpsc receiver and emits outbound ones on an mpsc sender. A
//! router-style socket reduces to exactly this pair — identity-stamped,
//! ordered multipart messages per peer. The TCP adapter in [`tcp`] is one
//! such socket; tests drive the broker over bare channels.

pub mod tcp;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

pub use tcp::TcpRouter;

/// One multipart message to or from a single peer.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Transport identity of the peer.
    pub peer: Bytes,
    /// Ordered message parts.
    pub frames: Vec<Bytes>,
}

impl Envelope {
    pub fn new(peer: Bytes, frames: Vec<Bytes>) -> Self {
        Self { peer, frames }
    }
}

/// Sending half of a frame channel.
pub type FrameTx = mpsc::UnboundedSender<Envelope>;

/// Receiving half of a frame channel.
pub type FrameRx = mpsc::UnboundedReceiver<Envelope>;

/// Create a frame channel pair.
pub fn frame_channel() -> (FrameTx, FrameRx) {
    mpsc::unbounded_channel()
}

/// TCP listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7400,
        }
    }
}

impl TcpConfig {
    /// Get the socket address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
