//! Wire protocol: tags, command bytes, frame classification and builders.
//!
//! Every message is a multipart frame sequence. The transport strips the
//! sender identity and hands the broker an ordered frame vector beginning
//! with a protocol tag (client or worker) and a command byte. Outbound
//! builders produce the frame vectors the broker sends back; the transport
//! prepends routing by peer identity.

use bytes::Bytes;
use thiserror::Error;

/// Protocol tag announcing a client peer.
pub const CLIENT: &[u8] = b"\x01MDPC01";

/// Protocol tag announcing a worker peer.
pub const WORKER: &[u8] = b"\x02MDPW01";

/// Result type for frame classification.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors raised while classifying an inbound frame sequence.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty frame sequence")]
    Empty,

    #[error("unknown protocol tag ({0} bytes)")]
    UnknownTag(usize),

    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),

    #[error("command {command:?} not valid for {origin}")]
    UnexpectedCommand { origin: &'static str, command: Command },

    #[error("{command:?} frame truncated: need {need} parts, got {got}")]
    Truncated {
        command: Command,
        need: usize,
        got: usize,
    },

    #[error("service name is not valid UTF-8")]
    BadServiceName,
}

/// Command byte carried as the second frame of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Ready = 0x01,
    Request = 0x02,
    Reply = 0x03,
    ReplyPartial = 0x04,
    ReplyReject = 0x05,
    Disconnect = 0x06,
    Heartbeat = 0x07,
}

impl Command {
    /// Parse a command from its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Ready),
            0x02 => Some(Self::Request),
            0x03 => Some(Self::Reply),
            0x04 => Some(Self::ReplyPartial),
            0x05 => Some(Self::ReplyReject),
            0x06 => Some(Self::Disconnect),
            0x07 => Some(Self::Heartbeat),
            _ => None,
        }
    }

    /// The single-byte frame for this command.
    pub fn frame(self) -> Bytes {
        Bytes::copy_from_slice(&[self as u8])
    }
}

/// An inbound message, classified by (tag, command).
///
/// The sender identity is carried by the transport envelope, not repeated
/// here.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// `[CLIENT, W_REQUEST, service, rid, body, opts_json]`
    ClientRequest {
        service: String,
        rid: Bytes,
        body: Bytes,
        opts: Bytes,
    },
    /// `[CLIENT, W_HEARTBEAT, rid]` — liveness interest in an in-flight rid.
    ClientHeartbeat { rid: Bytes },
    /// `[WORKER, W_READY, service]`
    WorkerReady { service: String },
    /// `[WORKER, W_REPLY | W_REPLY_PARTIAL, client, "", rid, payload, opts_json]`
    WorkerReply {
        partial: bool,
        client: Bytes,
        rid: Bytes,
        payload: Bytes,
        opts: Bytes,
    },
    /// `[WORKER, W_REPLY_REJECT, client, "", rid]`
    WorkerReject { client: Bytes, rid: Bytes },
    /// `[WORKER, W_HEARTBEAT, opts_json?]`
    WorkerHeartbeat { opts: Bytes },
    /// `[WORKER, W_DISCONNECT]`
    WorkerDisconnect,
}

/// Which tag a classified message arrived under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Worker,
}

/// Classify an inbound frame sequence into a typed message.
pub fn classify(frames: &[Bytes]) -> Result<(Origin, Inbound)> {
    let tag = frames.first().ok_or(CodecError::Empty)?;
    let origin = if tag.as_ref() == CLIENT {
        Origin::Client
    } else if tag.as_ref() == WORKER {
        Origin::Worker
    } else {
        return Err(CodecError::UnknownTag(tag.len()));
    };

    let cmd_frame = frames.get(1).ok_or(CodecError::Empty)?;
    let byte = *cmd_frame.first().ok_or(CodecError::Empty)?;
    let command = Command::from_byte(byte).ok_or(CodecError::UnknownCommand(byte))?;

    let part = |idx: usize, need: usize| -> Result<Bytes> {
        frames.get(idx).cloned().ok_or(CodecError::Truncated {
            command,
            need,
            got: frames.len(),
        })
    };

    let msg = match (origin, command) {
        (Origin::Client, Command::Request) => Inbound::ClientRequest {
            service: utf8_service(&part(2, 4)?)?,
            rid: part(3, 4)?,
            body: frames.get(4).cloned().unwrap_or_default(),
            opts: frames.get(5).cloned().unwrap_or_default(),
        },
        (Origin::Client, Command::Heartbeat) => Inbound::ClientHeartbeat { rid: part(2, 3)? },
        (Origin::Worker, Command::Ready) => Inbound::WorkerReady {
            service: utf8_service(&frames.get(2).cloned().unwrap_or_default())?,
        },
        (Origin::Worker, Command::Reply | Command::ReplyPartial) => Inbound::WorkerReply {
            partial: command == Command::ReplyPartial,
            client: part(2, 5)?,
            rid: part(4, 5)?,
            payload: frames.get(5).cloned().unwrap_or_default(),
            opts: frames.get(6).cloned().unwrap_or_default(),
        },
        (Origin::Worker, Command::ReplyReject) => Inbound::WorkerReject {
            client: part(2, 5)?,
            rid: part(4, 5)?,
        },
        (Origin::Worker, Command::Heartbeat) => Inbound::WorkerHeartbeat {
            opts: frames.get(2).cloned().unwrap_or_default(),
        },
        (Origin::Worker, Command::Disconnect) => Inbound::WorkerDisconnect,
        (Origin::Client, command) => {
            return Err(CodecError::UnexpectedCommand {
                origin: "client",
                command,
            })
        }
        (Origin::Worker, command) => {
            return Err(CodecError::UnexpectedCommand {
                origin: "worker",
                command,
            })
        }
    };

    Ok((origin, msg))
}

fn utf8_service(frame: &Bytes) -> Result<String> {
    std::str::from_utf8(frame)
        .map(str::to_owned)
        .map_err(|_| CodecError::BadServiceName)
}

/// `[WORKER, W_REQUEST, client, service, "", ...payload]` — dispatch to a
/// worker, carrying the requesting client's identity and the concrete
/// service name (which may differ from a wildcard worker's registration).
pub fn dispatch_frames(client: &Bytes, service: &str, payload: &[Bytes]) -> Vec<Bytes> {
    let mut frames = vec![
        Bytes::from_static(WORKER),
        Command::Request.frame(),
        client.clone(),
        Bytes::copy_from_slice(service.as_bytes()),
        Bytes::new(),
    ];
    frames.extend(payload.iter().cloned());
    frames
}

/// `[CLIENT, W_REPLY | W_REPLY_PARTIAL, "", rid, ...payload]` — reply to a
/// client.
pub fn client_reply_frames(command: Command, rid: &Bytes, payload: &[Bytes]) -> Vec<Bytes> {
    let mut frames = vec![
        Bytes::from_static(CLIENT),
        command.frame(),
        Bytes::new(),
        rid.clone(),
    ];
    frames.extend(payload.iter().cloned());
    frames
}

/// `[WORKER, W_HEARTBEAT]` — server heartbeat to a worker.
pub fn heartbeat_frames() -> Vec<Bytes> {
    vec![Bytes::from_static(WORKER), Command::Heartbeat.frame()]
}

/// `[WORKER, W_HEARTBEAT, client]` — a client's liveness signal forwarded to
/// the worker holding its request.
pub fn heartbeat_forward_frames(client: &Bytes) -> Vec<Bytes> {
    vec![
        Bytes::from_static(WORKER),
        Command::Heartbeat.frame(),
        client.clone(),
    ]
}

/// `[WORKER, W_DISCONNECT]` — broker-initiated disconnect.
pub fn disconnect_frames() -> Vec<Bytes> {
    vec![Bytes::from_static(WORKER), Command::Disconnect.frame()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_classify_client_request() {
        let frames = vec![
            Bytes::from_static(CLIENT),
            Command::Request.frame(),
            b("echo"),
            b("rid-1"),
            b("hi"),
            b("{}"),
        ];
        let (origin, msg) = classify(&frames).unwrap();
        assert_eq!(origin, Origin::Client);
        match msg {
            Inbound::ClientRequest {
                service, rid, body, ..
            } => {
                assert_eq!(service, "echo");
                assert_eq!(rid, b("rid-1"));
                assert_eq!(body, b("hi"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_classify_request_without_body_or_opts() {
        let frames = vec![
            Bytes::from_static(CLIENT),
            Command::Request.frame(),
            b("echo"),
            b("rid-1"),
        ];
        let (_, msg) = classify(&frames).unwrap();
        match msg {
            Inbound::ClientRequest { body, opts, .. } => {
                assert!(body.is_empty());
                assert!(opts.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_classify_worker_reply() {
        let frames = vec![
            Bytes::from_static(WORKER),
            Command::Reply.frame(),
            b("client-a"),
            Bytes::new(),
            b("rid-7"),
            b("pong"),
            b("{}"),
        ];
        let (origin, msg) = classify(&frames).unwrap();
        assert_eq!(origin, Origin::Worker);
        match msg {
            Inbound::WorkerReply {
                partial,
                client,
                rid,
                payload,
                ..
            } => {
                assert!(!partial);
                assert_eq!(client, b("client-a"));
                assert_eq!(rid, b("rid-7"));
                assert_eq!(payload, b("pong"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_classify_unknown_tag() {
        let frames = vec![b("bogus"), Command::Ready.frame()];
        assert!(matches!(classify(&frames), Err(CodecError::UnknownTag(_))));
    }

    #[test]
    fn test_classify_unknown_command() {
        let frames = vec![Bytes::from_static(WORKER), Bytes::copy_from_slice(&[0x7f])];
        assert!(matches!(
            classify(&frames),
            Err(CodecError::UnknownCommand(0x7f))
        ));
    }

    #[test]
    fn test_classify_client_ready_is_unexpected() {
        let frames = vec![Bytes::from_static(CLIENT), Command::Ready.frame(), b("svc")];
        assert!(matches!(
            classify(&frames),
            Err(CodecError::UnexpectedCommand { .. })
        ));
    }

    #[test]
    fn test_classify_truncated_reply() {
        let frames = vec![
            Bytes::from_static(WORKER),
            Command::Reply.frame(),
            b("client-a"),
        ];
        assert!(matches!(
            classify(&frames),
            Err(CodecError::Truncated { need: 5, .. })
        ));
    }

    #[test]
    fn test_dispatch_frames_layout() {
        let frames = dispatch_frames(&b("client-a"), "audio.transcode", &[b("data"), b("{}")]);
        assert_eq!(frames[0], Bytes::from_static(WORKER));
        assert_eq!(frames[1], Command::Request.frame());
        assert_eq!(frames[2], b("client-a"));
        assert_eq!(frames[3], b("audio.transcode"));
        assert!(frames[4].is_empty());
        assert_eq!(&frames[5..], &[b("data"), b("{}")]);
    }

    #[test]
    fn test_client_reply_frames_layout() {
        let frames = client_reply_frames(Command::Reply, &b("rid-1"), &[b("out")]);
        assert_eq!(frames[0], Bytes::from_static(CLIENT));
        assert_eq!(frames[1], Command::Reply.frame());
        assert!(frames[2].is_empty());
        assert_eq!(frames[3], b("rid-1"));
        assert_eq!(frames[4], b("out"));
    }

    #[test]
    fn test_command_byte_round_trip() {
        for byte in 0x01..=0x07u8 {
            let cmd = Command::from_byte(byte).unwrap();
            assert_eq!(cmd as u8, byte);
        }
        assert!(Command::from_byte(0x00).is_none());
        assert!(Command::from_byte(0x08).is_none());
    }
}
