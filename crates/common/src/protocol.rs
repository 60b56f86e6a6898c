//! Framed tunnel protocol spoken between the hub and fleet nodes.
//!
//! Every frame on the tunnel stream is a big-endian `u32` length prefix
//! followed by a JSON object tagged with a `type` field.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Header carrying the node identity on the tunnel CONNECT request.
pub const NODE_ID_HEADER: &str = "x-fleet-node-id";

/// Header carrying the shared fleet secret when the hub requires one.
pub const NODE_SECRET_HEADER: &str = "x-fleet-node-secret";

/// Frame size limit applied when the hub is not configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Longest node identifier accepted on the CONNECT request.
pub const MAX_NODE_ID_LEN: usize = 128;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Messages exchanged over a node tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelFrame {
    /// First frame sent by a node after the CONNECT stream opens.
    ClientHello {
        /// Agent build running on the node.
        agent_version: String,
        /// Hostname reported by the node, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
        /// How often the node intends to send heartbeats.
        heartbeat_interval_secs: u64,
    },
    /// Hub acknowledgement of a `client_hello`.
    ServerHello {
        /// Identifier of this link generation.
        link_id: Uuid,
        /// Silence after which the hub drops the link.
        heartbeat_timeout_secs: u64,
    },
    /// Liveness probe sent by the node.
    Heartbeat {
        /// RFC 3339 timestamp taken by the node.
        sent_at: String,
    },
    /// Hub answer to a heartbeat.
    HeartbeatAck {
        /// RFC 3339 timestamp taken by the hub.
        received_at: String,
    },
    /// Request dispatched by the hub to the node.
    Call {
        /// Correlation id the node must echo in its reply.
        call_id: u64,
        /// Operation and arguments.
        payload: CallPayload,
    },
    /// Node answer to a `call`.
    Reply {
        /// Correlation id of the call being answered.
        call_id: u64,
        /// Whether the node handled the call successfully.
        success: bool,
        /// Result data on success.
        #[serde(default)]
        data: Value,
        /// Error text on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Out-of-band completion for a previously accepted async job.
    Completion {
        /// Task the completion belongs to.
        task_id: i64,
        /// Whether the job succeeded.
        success: bool,
        /// Job output on success.
        #[serde(default)]
        result: Value,
        /// Error text on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Request to bind the node to the user that issued `token`.
    Bind {
        /// One-time bind token.
        token: String,
    },
    /// Hub answer to a `bind` request.
    BindResult {
        /// Whether the node is now bound.
        success: bool,
        /// Owner after a successful bind.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<i64>,
        /// Reason for a rejected bind.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl TunnelFrame {
    /// Wire name of the frame, used for logging and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelFrame::ClientHello { .. } => "client_hello",
            TunnelFrame::ServerHello { .. } => "server_hello",
            TunnelFrame::Heartbeat { .. } => "heartbeat",
            TunnelFrame::HeartbeatAck { .. } => "heartbeat_ack",
            TunnelFrame::Call { .. } => "call",
            TunnelFrame::Reply { .. } => "reply",
            TunnelFrame::Completion { .. } => "completion",
            TunnelFrame::Bind { .. } => "bind",
            TunnelFrame::BindResult { .. } => "bind_result",
        }
    }
}

/// Operation carried by a `call` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    /// Symbolic operation name understood by the node.
    pub action: String,
    /// Operation arguments.
    #[serde(default)]
    pub data: Value,
    /// Set for async jobs; the node echoes it in its `completion`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
}

/// Fatal framing errors. The stream cannot be resynchronised after one.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A frame announced a length above the configured limit.
    #[error("frame of {len} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Announced payload length.
        len: usize,
        /// Configured limit.
        limit: usize,
    },
    /// A frame could not be serialised.
    #[error("serialize tunnel frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of pulling one complete frame off the buffer.
#[derive(Debug)]
pub enum Decoded {
    /// A well-formed frame.
    Frame(TunnelFrame),
    /// Correctly delimited bytes that are not a valid frame. The bytes were
    /// consumed and the stream stays usable.
    Malformed(serde_json::Error),
}

/// Serialise `frame` with its length prefix.
pub fn encode_frame(frame: &TunnelFrame) -> Result<Bytes, FrameError> {
    let payload = serde_json::to_vec(frame)?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Take the next complete frame out of `buffer`.
///
/// Returns `Ok(None)` until enough bytes have arrived. An oversized length
/// prefix is rejected before its payload is buffered.
pub fn try_decode_frame(
    buffer: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Decoded>, FrameError> {
    if buffer.len() < LENGTH_PREFIX_BYTES {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len > max_frame_bytes {
        return Err(FrameError::TooLarge {
            len,
            limit: max_frame_bytes,
        });
    }
    if buffer.len() < LENGTH_PREFIX_BYTES + len {
        return Ok(None);
    }

    buffer.advance(LENGTH_PREFIX_BYTES);
    let payload = buffer.split_to(len);
    Ok(Some(match serde_json::from_slice(&payload) {
        Ok(frame) => Decoded::Frame(frame),
        Err(err) => Decoded::Malformed(err),
    }))
}

/// Whether `node_id` is acceptable as a node identity.
pub fn is_valid_node_id(node_id: &str) -> bool {
    !node_id.is_empty()
        && node_id.len() <= MAX_NODE_ID_LEN
        && node_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_frame(payload: &[u8]) -> BytesMut {
        let mut buffer = BytesMut::new();
        buffer.put_u32(payload.len() as u32);
        buffer.extend_from_slice(payload);
        buffer
    }

    #[test]
    fn frames_use_snake_case_type_tags() {
        let frame = TunnelFrame::Call {
            call_id: 7,
            payload: CallPayload {
                action: "reboot".into(),
                data: json!({"delay": 5}),
                task_id: None,
            },
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(
            value,
            json!({"type": "call", "call_id": 7, "payload": {"action": "reboot", "data": {"delay": 5}}})
        );

        let reply: TunnelFrame =
            serde_json::from_value(json!({"type": "reply", "call_id": 7, "success": true}))
                .expect("reply without data");
        assert_eq!(
            reply,
            TunnelFrame::Reply {
                call_id: 7,
                success: true,
                data: Value::Null,
                error: None,
            }
        );
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let encoded = encode_frame(&TunnelFrame::Heartbeat {
            sent_at: "2025-01-01T00:00:00Z".into(),
        })
        .expect("encode");

        let mut buffer = BytesMut::from(&encoded[..2]);
        assert!(try_decode_frame(&mut buffer, 1024).expect("short").is_none());

        let mut buffer = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(try_decode_frame(&mut buffer, 1024).expect("partial").is_none());
        assert_eq!(buffer.len(), encoded.len() - 1);
    }

    #[test]
    fn decode_leaves_trailing_bytes_for_next_frame() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(
            &encode_frame(&TunnelFrame::Bind {
                token: "abc".into(),
            })
            .expect("encode"),
        );
        buffer.extend_from_slice(b"\x00\x00");

        let decoded = try_decode_frame(&mut buffer, 1024).expect("decode");
        assert!(matches!(
            decoded,
            Some(Decoded::Frame(TunnelFrame::Bind { ref token })) if token == "abc"
        ));
        assert_eq!(&buffer[..], b"\x00\x00");
    }

    #[test]
    fn malformed_payload_is_consumed_without_error() {
        let mut buffer = raw_frame(b"{not json");
        buffer.extend_from_slice(
            &encode_frame(&TunnelFrame::HeartbeatAck {
                received_at: "now".into(),
            })
            .expect("encode"),
        );

        let first = try_decode_frame(&mut buffer, 1024).expect("decode");
        assert!(matches!(first, Some(Decoded::Malformed(_))));
        let second = try_decode_frame(&mut buffer, 1024).expect("decode");
        assert!(matches!(
            second,
            Some(Decoded::Frame(TunnelFrame::HeartbeatAck { .. }))
        ));
    }

    #[test]
    fn unknown_frame_type_is_malformed() {
        let mut buffer = raw_frame(br#"{"type":"teleport"}"#);
        let decoded = try_decode_frame(&mut buffer, 1024).expect("decode");
        assert!(matches!(decoded, Some(Decoded::Malformed(_))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected_from_prefix_alone() {
        let mut buffer = BytesMut::new();
        buffer.put_u32(4096);
        let err = try_decode_frame(&mut buffer, 1024).expect_err("too large");
        assert!(matches!(
            err,
            FrameError::TooLarge {
                len: 4096,
                limit: 1024
            }
        ));
    }

    #[test]
    fn node_id_validation() {
        assert!(is_valid_node_id("edge-01.eu:a_b"));
        assert!(!is_valid_node_id(""));
        assert!(!is_valid_node_id("has space"));
        assert!(!is_valid_node_id(&"x".repeat(MAX_NODE_ID_LEN + 1)));
    }
}
