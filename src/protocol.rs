//! Maxwell Wire Protocol
//!
//! Single responsibility: the message model and its MessagePack encoding.
//!
//! # Wire Format
//!
//! Every frame is a MessagePack envelope naming the message kind explicitly,
//! so decoding never relies on the shape of the body:
//!
//! ```text
//! {
//!     "type": "req_req",     // MsgKind wire name
//!     "data": <binary>,      // message body, named-field MessagePack
//! }
//! ```
//!
//! Every body carries `ref`, the correlation id echoed by the reply.

use rmpv::Value;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;
use thiserror::Error;

use crate::error::ConnectionError;
use crate::truncated;

/// Substring of an error reply's `desc` marking a retryable routing failure
pub const ROUTE_NOT_FOUND_MARKER: &str = "frontend_not_found";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("{0}")]
    Encode(String),

    #[error("{0}")]
    Decode(String),
}

impl From<CodecError> for ConnectionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encode(reason) => ConnectionError::Encode(reason),
            CodecError::Decode(reason) => ConnectionError::Decode(reason),
        }
    }
}

/// Explicit message discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    PingReq,
    PingRep,
    ReqReq,
    ReqRep,
    ErrorRep,
    Error2Rep,
}

impl MsgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgKind::PingReq => "ping_req",
            MsgKind::PingRep => "ping_rep",
            MsgKind::ReqReq => "req_req",
            MsgKind::ReqRep => "req_rep",
            MsgKind::ErrorRep => "error_rep",
            MsgKind::Error2Rep => "error2_rep",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "ping_req" => Some(MsgKind::PingReq),
            "ping_rep" => Some(MsgKind::PingRep),
            "req_req" => Some(MsgKind::ReqReq),
            "req_rep" => Some(MsgKind::ReqRep),
            "error_rep" => Some(MsgKind::ErrorRep),
            "error2_rep" => Some(MsgKind::Error2Rep),
            _ => None,
        }
    }
}

impl std::fmt::Display for MsgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heartbeat request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingReq {
    #[serde(rename = "ref")]
    pub ref_id: u32,
}

/// Heartbeat reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingRep {
    #[serde(rename = "ref")]
    pub ref_id: u32,
}

/// Request routed by path to a backend service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReqReq {
    pub path: String,
    pub payload: String,
    pub header: BTreeMap<String, String>,
    #[serde(rename = "ref")]
    pub ref_id: u32,
}

impl ReqReq {
    pub fn new(path: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }
}

/// Successful reply to a `ReqReq`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReqRep {
    pub payload: String,
    pub header: BTreeMap<String, String>,
    #[serde(rename = "ref")]
    pub ref_id: u32,
}

/// Error reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorRep {
    pub code: i32,
    pub desc: String,
    #[serde(rename = "ref")]
    pub ref_id: u32,
}

/// Error reply from the second-generation routing layer; same shape as `ErrorRep`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Error2Rep {
    pub code: i32,
    pub desc: String,
    #[serde(rename = "ref")]
    pub ref_id: u32,
}

/// A protocol message. Serializes as its bare body (used for summaries).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProtocolMsg {
    PingReq(PingReq),
    PingRep(PingRep),
    ReqReq(ReqReq),
    ReqRep(ReqRep),
    ErrorRep(ErrorRep),
    Error2Rep(Error2Rep),
}

impl ProtocolMsg {
    pub fn ping() -> Self {
        ProtocolMsg::PingReq(PingReq::default())
    }

    pub fn kind(&self) -> MsgKind {
        match self {
            ProtocolMsg::PingReq(_) => MsgKind::PingReq,
            ProtocolMsg::PingRep(_) => MsgKind::PingRep,
            ProtocolMsg::ReqReq(_) => MsgKind::ReqReq,
            ProtocolMsg::ReqRep(_) => MsgKind::ReqRep,
            ProtocolMsg::ErrorRep(_) => MsgKind::ErrorRep,
            ProtocolMsg::Error2Rep(_) => MsgKind::Error2Rep,
        }
    }

    pub fn ref_id(&self) -> u32 {
        match self {
            ProtocolMsg::PingReq(m) => m.ref_id,
            ProtocolMsg::PingRep(m) => m.ref_id,
            ProtocolMsg::ReqReq(m) => m.ref_id,
            ProtocolMsg::ReqRep(m) => m.ref_id,
            ProtocolMsg::ErrorRep(m) => m.ref_id,
            ProtocolMsg::Error2Rep(m) => m.ref_id,
        }
    }

    pub fn set_ref(&mut self, ref_id: u32) {
        match self {
            ProtocolMsg::PingReq(m) => m.ref_id = ref_id,
            ProtocolMsg::PingRep(m) => m.ref_id = ref_id,
            ProtocolMsg::ReqReq(m) => m.ref_id = ref_id,
            ProtocolMsg::ReqRep(m) => m.ref_id = ref_id,
            ProtocolMsg::ErrorRep(m) => m.ref_id = ref_id,
            ProtocolMsg::Error2Rep(m) => m.ref_id = ref_id,
        }
    }

    /// `(code, desc)` for error-class replies
    pub fn error(&self) -> Option<(i32, &str)> {
        match self {
            ProtocolMsg::ErrorRep(m) => Some((m.code, m.desc.as_str())),
            ProtocolMsg::Error2Rep(m) => Some((m.code, m.desc.as_str())),
            _ => None,
        }
    }

    /// True for an error reply reporting that no frontend could route the request
    pub fn is_route_not_found(&self) -> bool {
        self.error()
            .map(|(_, desc)| desc.contains(ROUTE_NOT_FOUND_MARKER))
            .unwrap_or(false)
    }

    /// Compact JSON of the body, truncated to 100 characters
    pub fn summary(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => truncated(&json),
            Err(_) => format!("[{}]", self.kind()),
        }
    }
}

/// Encodes messages to frames and decodes frames to messages.
pub trait Codec: Send + Sync {
    fn encode(&self, msg: &ProtocolMsg) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, frame: &[u8]) -> Result<ProtocolMsg, CodecError>;
}

/// MessagePack envelope codec
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn encode(&self, msg: &ProtocolMsg) -> Result<Vec<u8>, CodecError> {
        use rmpv::encode::write_value;

        let body = match msg {
            ProtocolMsg::PingReq(m) => rmp_serde::to_vec_named(m),
            ProtocolMsg::PingRep(m) => rmp_serde::to_vec_named(m),
            ProtocolMsg::ReqReq(m) => rmp_serde::to_vec_named(m),
            ProtocolMsg::ReqRep(m) => rmp_serde::to_vec_named(m),
            ProtocolMsg::ErrorRep(m) => rmp_serde::to_vec_named(m),
            ProtocolMsg::Error2Rep(m) => rmp_serde::to_vec_named(m),
        }
        .map_err(|e| CodecError::Encode(format!("Failed to encode {} body: {}", msg.kind(), e)))?;

        let envelope = Value::Map(vec![
            (Value::String("type".into()), Value::String(msg.kind().as_str().into())),
            (Value::String("data".into()), Value::Binary(body)),
        ]);

        let mut bytes = Vec::new();
        write_value(&mut bytes, &envelope)
            .map_err(|e| CodecError::Encode(format!("Failed to encode envelope: {}", e)))?;

        Ok(bytes)
    }

    fn decode(&self, frame: &[u8]) -> Result<ProtocolMsg, CodecError> {
        use rmpv::decode::read_value;

        let mut cursor = Cursor::new(frame);
        let value = read_value(&mut cursor)
            .map_err(|e| CodecError::Decode(format!("Failed to read envelope: {}", e)))?;

        let map = value
            .as_map()
            .ok_or_else(|| CodecError::Decode("Envelope is not a map".into()))?;

        let kind_name = map
            .iter()
            .find(|(k, _)| k.as_str() == Some("type"))
            .and_then(|(_, v)| v.as_str())
            .ok_or_else(|| CodecError::Decode("Envelope missing 'type' field".into()))?;

        let kind = MsgKind::from_wire(kind_name)
            .ok_or_else(|| CodecError::Decode(format!("Unknown msg type: {}", kind_name)))?;

        let body = map
            .iter()
            .find(|(k, _)| k.as_str() == Some("data"))
            .and_then(|(_, v)| v.as_slice())
            .ok_or_else(|| CodecError::Decode("Envelope missing 'data' field".into()))?;

        let msg = match kind {
            MsgKind::PingReq => ProtocolMsg::PingReq(decode_body(kind, body)?),
            MsgKind::PingRep => ProtocolMsg::PingRep(decode_body(kind, body)?),
            MsgKind::ReqReq => ProtocolMsg::ReqReq(decode_body(kind, body)?),
            MsgKind::ReqRep => ProtocolMsg::ReqRep(decode_body(kind, body)?),
            MsgKind::ErrorRep => ProtocolMsg::ErrorRep(decode_body(kind, body)?),
            MsgKind::Error2Rep => ProtocolMsg::Error2Rep(decode_body(kind, body)?),
        };

        Ok(msg)
    }
}

fn decode_body<T: DeserializeOwned>(kind: MsgKind, body: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(body)
        .map_err(|e| CodecError::Decode(format!("Failed to decode {} body: {}", kind, e)))
}
