//! Router-style TCP adapter.
//!
//! Accepts connections, assigns each peer an opaque identity, and bridges
//! length-prefixed multipart messages to and from the broker's frame
//! channels. Outbound envelopes for peers that have gone away are dropped
//! silently.
//!
//! Wire framing per message: a big-endian u32 part count, then for each
//! part a big-endian u32 length and the raw bytes. Part counts and part
//! sizes are bounded; a peer exceeding them is disconnected.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Envelope, FrameRx, FrameTx, TcpConfig};

/// Maximum parts per message.
pub const MAX_PARTS: u32 = 64;

/// Maximum bytes per part.
pub const MAX_PART_LEN: u32 = 16 * 1024 * 1024;

type PeerMap = Arc<RwLock<HashMap<Bytes, mpsc::UnboundedSender<Vec<Bytes>>>>>;

/// TCP listener that speaks the broker's frame-channel contract.
pub struct TcpRouter {
    listener: TcpListener,
    inbound: FrameTx,
    outbound: FrameRx,
    peers: PeerMap,
}

impl TcpRouter {
    /// Bind the listener. Inbound messages are stamped with a per-connection
    /// identity and forwarded to `inbound`; envelopes received on `outbound`
    /// are routed back to the matching connection.
    pub async fn bind(config: &TcpConfig, inbound: FrameTx, outbound: FrameRx) -> io::Result<Self> {
        let listener = TcpListener::bind(config.addr()).await?;
        info!(address = %listener.local_addr()?, transport = "tcp", "Router listening");
        Ok(Self {
            listener,
            inbound,
            outbound,
            peers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// The bound address (useful when the configured port is 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections and shuttle frames until the outbound channel
    /// closes.
    pub async fn run(self) {
        let Self {
            listener,
            inbound,
            mut outbound,
            peers,
        } = self;

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        spawn_peer(&inbound, &peers, stream, addr).await;
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                maybe = outbound.recv() => match maybe {
                    Some(env) => route(&peers, env).await,
                    None => {
                        info!("Outbound channel closed, stopping router");
                        break;
                    }
                },
            }
        }
    }
}

async fn route(peers: &PeerMap, env: Envelope) {
    let peers = peers.read().await;
    match peers.get(&env.peer) {
        Some(tx) => {
            if tx.send(env.frames).is_err() {
                debug!(peer = %hex::encode(&env.peer), "Peer writer gone, dropping frames");
            }
        }
        None => debug!(peer = %hex::encode(&env.peer), "No such peer, dropping frames"),
    }
}

async fn spawn_peer(inbound: &FrameTx, peers: &PeerMap, stream: TcpStream, addr: SocketAddr) {
    let identity = Bytes::copy_from_slice(Uuid::new_v4().as_bytes());
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    peers.write().await.insert(identity.clone(), tx);
    debug!(peer = %hex::encode(&identity), address = %addr, "Peer connected");

    tokio::spawn(write_loop(writer, rx));
    tokio::spawn(read_loop(
        reader,
        identity,
        inbound.clone(),
        Arc::clone(peers),
    ));
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<Bytes>>) {
    while let Some(frames) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &frames).await {
            debug!(error = %e, "Peer write failed");
            break;
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, identity: Bytes, inbound: FrameTx, peers: PeerMap) {
    loop {
        match read_message(&mut reader).await {
            Ok(Some(frames)) => {
                if inbound
                    .send(Envelope::new(identity.clone(), frames))
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %hex::encode(&identity), error = %e, "Peer read failed");
                break;
            }
        }
    }
    peers.write().await.remove(&identity);
    debug!(peer = %hex::encode(&identity), "Peer disconnected");
}

/// Read one multipart message. `Ok(None)` on clean EOF at a message
/// boundary.
pub(crate) async fn read_message<R>(reader: &mut R) -> io::Result<Option<Vec<Bytes>>>
where
    R: AsyncReadExt + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let parts = u32::from_be_bytes(header);
    if parts > MAX_PARTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message has {} parts, limit is {}", parts, MAX_PARTS),
        ));
    }

    let mut frames = Vec::with_capacity(parts as usize);
    for _ in 0..parts {
        let len = reader.read_u32().await?;
        if len > MAX_PART_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("part of {} bytes exceeds limit {}", len, MAX_PART_LEN),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await?;
        frames.push(Bytes::from(buf));
    }
    Ok(Some(frames))
}

/// Write one multipart message.
pub(crate) async fn write_message<W>(writer: &mut W, frames: &[Bytes]) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_u32(frames.len() as u32).await?;
    for frame in frames {
        writer.write_u32(frame.len() as u32).await?;
        writer.write_all(frame).await?;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame_channel;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_message_codec_round_trip() {
        let frames = vec![b("one"), Bytes::new(), b("three")];
        let mut wire = Vec::new();
        write_message(&mut wire, &frames).await.unwrap();

        let mut cursor = io::Cursor::new(wire);
        let decoded = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded, frames);
        assert!(read_message(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_part_count_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_PARTS + 1).to_be_bytes());
        let mut cursor = io::Cursor::new(wire);
        assert!(read_message(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_router_round_trip() {
        let config = TcpConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let (inbound_tx, mut inbound_rx) = frame_channel();
        let (outbound_tx, outbound_rx) = frame_channel();
        let router = TcpRouter::bind(&config, inbound_tx, outbound_rx)
            .await
            .unwrap();
        let addr = router.local_addr().unwrap();
        tokio::spawn(router.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &[b("hello"), b("world")])
            .await
            .unwrap();

        let env = inbound_rx.recv().await.unwrap();
        assert_eq!(env.frames, vec![b("hello"), b("world")]);

        outbound_tx
            .send(Envelope::new(env.peer, vec![b("pong")]))
            .unwrap();
        let reply = read_message(&mut stream).await.unwrap().unwrap();
        assert_eq!(reply, vec![b("pong")]);
    }

    #[tokio::test]
    async fn test_router_drops_frames_for_unknown_peer() {
        let config = TcpConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let (inbound_tx, _inbound_rx) = frame_channel();
        let (outbound_tx, outbound_rx) = frame_channel();
        let router = TcpRouter::bind(&config, inbound_tx, outbound_rx)
            .await
            .unwrap();
        tokio::spawn(router.run());

        // No connection with this identity exists; the send must not error.
        outbound_tx
            .send(Envelope::new(b("ghost"), vec![b("data")]))
            .unwrap();
    }
}
