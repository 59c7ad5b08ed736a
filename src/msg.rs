//! Wire messages and their JSON codec.
//!
//! Every message is a JSON object with a `type` discriminator (an uppercase
//! tag), a message `uuid` and a `payload` object. Clients send the read
//! kinds (CALL, PUB, SUB, UNSB, AUTH), the gateway sends the write kinds
//! (OK, ERR, RES, EVNT). EXP is synthesized client-side when a call's
//! deadline lapses without a result and never appears on the wire.

use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::Error;

/// ERR code reported when a broker or transport fault aborts a dispatch.
pub const CODE_SERVER_ERROR: i32 = 500;
/// ERR code reported when a call or result queue is at capacity.
pub const CODE_CAPACITY_EXCEEDED: i32 = 509;
/// ERR code reported when an outgoing message exceeded the write limit.
/// The value is arbitrary, there is no HTTP-like code for this case.
pub const CODE_WRITE_LIMIT_EXCEEDED: i32 = 550;

/// The message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Call,
    Pub,
    Sub,
    Unsb,
    Auth,
    Ok,
    Err,
    Res,
    Evnt,
    Exp,
}

impl Kind {
    /// The wire tag of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Call => "CALL",
            Kind::Pub => "PUB",
            Kind::Sub => "SUB",
            Kind::Unsb => "UNSB",
            Kind::Auth => "AUTH",
            Kind::Ok => "OK",
            Kind::Err => "ERR",
            Kind::Res => "RES",
            Kind::Evnt => "EVNT",
            Kind::Exp => "EXP",
        }
    }

    /// Kinds sent by clients to the gateway.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Kind::Call | Kind::Pub | Kind::Sub | Kind::Unsb | Kind::Auth
        )
    }

    /// Kinds sent by the gateway to clients.
    pub fn is_write(&self) -> bool {
        matches!(self, Kind::Ok | Kind::Err | Kind::Res | Kind::Evnt)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a client CALL request. The caller connection UUID is
/// attached on ingest, see [`CallPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Logical name of the RPC endpoint.
    pub uri: String,
    /// Call expiration budget in milliseconds, 0 means the broker default.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub args: Value,
}

/// A call request as queued in the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    /// UUID of the caller connection, where the result must be routed.
    pub conn_uuid: Uuid,
    /// UUID of the CALL message, identifying the call itself.
    pub msg_uuid: Uuid,
    pub uri: String,
    #[serde(default)]
    pub args: Value,
}

/// A call result as stored in the broker and delivered in a RES message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResPayload {
    pub call_uuid: Uuid,
    pub caller_uuid: Uuid,
    pub uri: String,
    #[serde(default)]
    pub args: Value,
}

/// Payload of a PUB message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubPayload {
    pub channel: String,
    #[serde(default)]
    pub args: Value,
}

/// Payload of SUB and UNSB messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubPayload {
    pub channel: String,
    /// When true, `channel` is a glob pattern.
    #[serde(default)]
    pub pattern: bool,
}

/// Payload of an OK message, acknowledging a client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OkPayload {
    pub for_uuid: Uuid,
}

/// Payload of an ERR message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrPayload {
    pub for_uuid: Uuid,
    pub code: i32,
    pub message: String,
}

/// Payload of an EVNT message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvntPayload {
    pub channel: String,
    /// The matching pattern, when the event was delivered through a
    /// pattern subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub args: Value,
}

/// Payload of the reserved AUTH message. The shape is not specified yet,
/// the raw arguments are kept as-is for the server's auth hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    #[serde(default)]
    pub args: Value,
}

/// Payload of the client-side synthetic EXP notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpPayload {
    pub call_uuid: Uuid,
    pub uri: String,
    #[serde(default)]
    pub args: Value,
}

/// A juggler message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Msg {
    #[serde(rename = "CALL")]
    Call { uuid: Uuid, payload: CallRequest },
    #[serde(rename = "PUB")]
    Pub { uuid: Uuid, payload: PubPayload },
    #[serde(rename = "SUB")]
    Sub { uuid: Uuid, payload: SubPayload },
    #[serde(rename = "UNSB")]
    Unsb { uuid: Uuid, payload: SubPayload },
    #[serde(rename = "AUTH")]
    Auth { uuid: Uuid, payload: AuthPayload },
    #[serde(rename = "OK")]
    Ok { uuid: Uuid, payload: OkPayload },
    #[serde(rename = "ERR")]
    Err { uuid: Uuid, payload: ErrPayload },
    #[serde(rename = "RES")]
    Res { uuid: Uuid, payload: ResPayload },
    #[serde(rename = "EVNT")]
    Evnt { uuid: Uuid, payload: EvntPayload },
    #[serde(rename = "EXP")]
    Exp { uuid: Uuid, payload: ExpPayload },
}

impl Msg {
    /// The message UUID.
    pub fn uuid(&self) -> Uuid {
        match self {
            Msg::Call { uuid, .. }
            | Msg::Pub { uuid, .. }
            | Msg::Sub { uuid, .. }
            | Msg::Unsb { uuid, .. }
            | Msg::Auth { uuid, .. }
            | Msg::Ok { uuid, .. }
            | Msg::Err { uuid, .. }
            | Msg::Res { uuid, .. }
            | Msg::Evnt { uuid, .. }
            | Msg::Exp { uuid, .. } => *uuid,
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Msg::Call { .. } => Kind::Call,
            Msg::Pub { .. } => Kind::Pub,
            Msg::Sub { .. } => Kind::Sub,
            Msg::Unsb { .. } => Kind::Unsb,
            Msg::Auth { .. } => Kind::Auth,
            Msg::Ok { .. } => Kind::Ok,
            Msg::Err { .. } => Kind::Err,
            Msg::Res { .. } => Kind::Res,
            Msg::Evnt { .. } => Kind::Evnt,
            Msg::Exp { .. } => Kind::Exp,
        }
    }

    /// Creates a CALL for `uri` with a fresh message UUID.
    pub fn call(uri: impl Into<String>, args: Value, timeout: Duration) -> Msg {
        Msg::Call {
            uuid: Uuid::new_v4(),
            payload: CallRequest {
                uri: uri.into(),
                timeout: timeout.as_millis() as u64,
                args,
            },
        }
    }

    /// Creates a PUB on `channel`.
    pub fn publish(channel: impl Into<String>, args: Value) -> Msg {
        Msg::Pub {
            uuid: Uuid::new_v4(),
            payload: PubPayload {
                channel: channel.into(),
                args,
            },
        }
    }

    /// Creates a SUB for `channel`, treated as a glob when `pattern`.
    pub fn sub(channel: impl Into<String>, pattern: bool) -> Msg {
        Msg::Sub {
            uuid: Uuid::new_v4(),
            payload: SubPayload {
                channel: channel.into(),
                pattern,
            },
        }
    }

    /// Creates an UNSB for `channel`.
    pub fn unsb(channel: impl Into<String>, pattern: bool) -> Msg {
        Msg::Unsb {
            uuid: Uuid::new_v4(),
            payload: SubPayload {
                channel: channel.into(),
                pattern,
            },
        }
    }

    /// Creates an AUTH message. The kind is reserved, the server treats it
    /// as a no-op unless an auth hook is installed.
    pub fn auth(args: Value) -> Msg {
        Msg::Auth {
            uuid: Uuid::new_v4(),
            payload: AuthPayload { args },
        }
    }

    /// Creates an OK acknowledging the message identified by `for_uuid`.
    pub fn ok_for(for_uuid: Uuid) -> Msg {
        Msg::Ok {
            uuid: Uuid::new_v4(),
            payload: OkPayload { for_uuid },
        }
    }

    /// Creates an ERR about the message identified by `for_uuid`.
    pub fn err_for(for_uuid: Uuid, code: i32, message: impl Into<String>) -> Msg {
        Msg::Err {
            uuid: Uuid::new_v4(),
            payload: ErrPayload {
                for_uuid,
                code,
                message: message.into(),
            },
        }
    }

    /// Creates a RES carrying a call result.
    pub fn res(payload: ResPayload) -> Msg {
        Msg::Res {
            uuid: Uuid::new_v4(),
            payload,
        }
    }

    /// Creates an EVNT carrying a pub/sub event.
    pub fn evnt(payload: EvntPayload) -> Msg {
        Msg::Evnt {
            uuid: Uuid::new_v4(),
            payload,
        }
    }

    /// Creates the client-side EXP notification for an expired call.
    pub fn exp(call_uuid: Uuid, uri: impl Into<String>, args: Value) -> Msg {
        Msg::Exp {
            uuid: Uuid::new_v4(),
            payload: ExpPayload {
                call_uuid,
                uri: uri.into(),
                args,
            },
        }
    }
}

// The wire envelope, decoded before dispatching on the type tag. The
// payload stays raw until the tag identifies its shape.
#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    uuid: Option<Uuid>,
    #[serde(borrow)]
    payload: Option<&'a RawValue>,
}

/// Decodes a wire frame into a message. Unknown `type` tags fail with
/// [`Error::UnknownMsgType`]; EXP is not a wire kind and is rejected too.
pub fn decode(frame: &[u8]) -> Result<Msg, Error> {
    let env: Envelope<'_> = serde_json::from_slice(frame)?;
    let uuid = env.uuid.unwrap_or_else(Uuid::nil);
    let payload = env.payload.map_or("{}", RawValue::get);

    let msg = match env.kind.as_str() {
        "CALL" => Msg::Call {
            uuid,
            payload: serde_json::from_str(payload)?,
        },
        "PUB" => Msg::Pub {
            uuid,
            payload: serde_json::from_str(payload)?,
        },
        "SUB" => Msg::Sub {
            uuid,
            payload: serde_json::from_str(payload)?,
        },
        "UNSB" => Msg::Unsb {
            uuid,
            payload: serde_json::from_str(payload)?,
        },
        "AUTH" => Msg::Auth {
            uuid,
            payload: serde_json::from_str(payload)?,
        },
        "OK" => Msg::Ok {
            uuid,
            payload: serde_json::from_str(payload)?,
        },
        "ERR" => Msg::Err {
            uuid,
            payload: serde_json::from_str(payload)?,
        },
        "RES" => Msg::Res {
            uuid,
            payload: serde_json::from_str(payload)?,
        },
        "EVNT" => Msg::Evnt {
            uuid,
            payload: serde_json::from_str(payload)?,
        },
        other => return Err(Error::UnknownMsgType(other.to_owned())),
    };
    Ok(msg)
}

/// Decodes a frame received by the gateway, accepting read kinds only.
pub fn decode_request(frame: &[u8]) -> Result<Msg, Error> {
    let m = decode(frame)?;
    if !m.kind().is_read() {
        return Err(Error::UnexpectedMsgKind(m.kind()));
    }
    Ok(m)
}

/// Decodes a frame received by a client, accepting write kinds only.
pub fn decode_response(frame: &[u8]) -> Result<Msg, Error> {
    let m = decode(frame)?;
    if !m.kind().is_write() {
        return Err(Error::UnexpectedMsgKind(m.kind()));
    }
    Ok(m)
}

// Writes below this limit are never capped, so an ERR frame about an
// oversized message can always be sent.
const MIN_WRITE_LIMIT: usize = 4096;

struct LimitedWriter<W> {
    w: W,
    left: i64,
}

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.left -= buf.len() as i64;
        if self.left < 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write limit exceeded",
            ));
        }
        self.w.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

/// Encodes a message to a single frame, bounded by `limit` bytes when
/// nonzero. An oversized message fails with [`Error::WriteLimitExceeded`]
/// and yields no frame at all, truncated frames are never produced.
pub fn encode_frame(m: &Msg, limit: usize) -> Result<Bytes, Error> {
    let mut buf = Vec::with_capacity(256);
    if limit > 0 {
        let mut lw = LimitedWriter {
            w: &mut buf,
            left: limit.max(MIN_WRITE_LIMIT) as i64,
        };
        serde_json::to_writer(&mut lw, m).map_err(|e| {
            if e.io_error_kind() == Some(io::ErrorKind::WriteZero) {
                Error::WriteLimitExceeded
            } else {
                Error::Json(e)
            }
        })?;
    } else {
        serde_json::to_writer(&mut buf, m)?;
    }
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire_msgs() -> Vec<Msg> {
        vec![
            Msg::call("echo", json!("hi"), Duration::from_millis(1000)),
            Msg::publish("events", json!({"n": 42})),
            Msg::sub("events", false),
            Msg::unsb("events.*", true),
            Msg::auth(json!({"token": "t0"})),
            Msg::ok_for(Uuid::new_v4()),
            Msg::err_for(Uuid::new_v4(), CODE_SERVER_ERROR, "broker down"),
            Msg::res(ResPayload {
                call_uuid: Uuid::new_v4(),
                caller_uuid: Uuid::new_v4(),
                uri: "echo".into(),
                args: json!("hi"),
            }),
            Msg::evnt(EvntPayload {
                channel: "events".into(),
                pattern: Some("events.*".into()),
                args: json!(42),
            }),
        ]
    }

    #[test]
    fn roundtrip_all_kinds() {
        for m in wire_msgs() {
            let frame = encode_frame(&m, 0).unwrap();
            let back = decode(&frame).unwrap();
            assert_eq!(back, m, "kind {}", m.kind());
        }
    }

    #[test]
    fn unknown_type_is_a_distinct_error() {
        let frame = br#"{"type":"NOPE","uuid":"6dd6bdfc-5284-4b0d-a0ba-e2c3b5452aaf","payload":{}}"#;
        match decode(frame) {
            Err(Error::UnknownMsgType(t)) => assert_eq!(t, "NOPE"),
            other => panic!("expected UnknownMsgType, got {other:?}"),
        }
    }

    #[test]
    fn exp_is_not_a_wire_kind() {
        let m = Msg::exp(Uuid::new_v4(), "echo", json!(null));
        let frame = encode_frame(&m, 0).unwrap();
        assert!(matches!(decode(&frame), Err(Error::UnknownMsgType(_))));
    }

    #[test]
    fn request_direction_is_enforced() {
        let ok = encode_frame(&Msg::ok_for(Uuid::new_v4()), 0).unwrap();
        assert!(matches!(
            decode_request(&ok),
            Err(Error::UnexpectedMsgKind(Kind::Ok))
        ));
        let call = encode_frame(&Msg::call("a", json!(1), Duration::ZERO), 0).unwrap();
        assert!(decode_request(&call).is_ok());
        assert!(matches!(
            decode_response(&call),
            Err(Error::UnexpectedMsgKind(Kind::Call))
        ));
    }

    #[test]
    fn call_without_uuid_gets_nil() {
        let frame = br#"{"type":"CALL","payload":{"uri":"echo","timeout":50,"args":"x"}}"#;
        let m = decode_request(frame).unwrap();
        assert!(m.uuid().is_nil());
        match m {
            Msg::Call { payload, .. } => {
                assert_eq!(payload.uri, "echo");
                assert_eq!(payload.timeout, 50);
            }
            other => panic!("expected CALL, got {other:?}"),
        }
    }

    #[test]
    fn write_limit_drops_the_whole_frame() {
        let big = "x".repeat(2 * MIN_WRITE_LIMIT);
        let m = Msg::publish("c", json!(big));
        match encode_frame(&m, 1) {
            Err(Error::WriteLimitExceeded) => {}
            other => panic!("expected WriteLimitExceeded, got {other:?}"),
        }
        // under the floor the limit is not enforced
        assert!(encode_frame(&Msg::ok_for(Uuid::new_v4()), 1).is_ok());
    }
}
