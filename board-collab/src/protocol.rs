//! Binary protocol between nodes and the store hub.
//!
//! Every WebSocket binary frame carries one bincode-encoded message:
//! ```text
//! node ──► hub   HubRequest { id, op }
//! hub  ──► node  HubFrame::Reply { id, result }
//!                HubFrame::Message { channel, payload }   (pub/sub delivery)
//! ```
//!
//! Request ids are chosen by the client and echoed in the reply, so several
//! requests can be in flight on one connection.

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Operations understood by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HubOp {
    Ping,
    Get { key: String },
    Set { key: String, value: String, ttl_ms: Option<u64> },
    Delete { key: String },
    Push { key: String, item: String },
    PushAll { key: String, items: Vec<String> },
    GetAll { key: String },
    Publish { channel: String, message: String },
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubRequest {
    pub id: u64,
    pub op: HubOp,
}

/// Successful results, one shape per operation family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HubReply {
    Pong,
    Done,
    Value(Option<String>),
    Deleted(bool),
    Len(usize),
    Items(Vec<String>),
    Receivers(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HubFrame {
    Reply {
        id: u64,
        /// `Err` carries the hub-side error text.
        result: Result<HubReply, String>,
    },
    Message {
        channel: String,
        payload: String,
    },
}

impl HubRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl HubFrame {
    pub fn reply(id: u64, result: Result<HubReply, StoreError>) -> Self {
        HubFrame::Reply {
            id,
            result: result.map_err(|e| e.to_string()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<ProtocolError> for StoreError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed => StoreError::Unavailable,
            other => StoreError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = HubRequest {
            id: 42,
            op: HubOp::Set {
                key: "board:b:readonly".into(),
                value: "mirror".into(),
                ttl_ms: Some(5_000),
            },
        };
        let decoded = HubRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_error_reply_carries_text() {
        let frame = HubFrame::reply(7, Err(StoreError::WrongType("k".into())));
        match HubFrame::decode(&frame.encode().unwrap()).unwrap() {
            HubFrame::Reply { id, result } => {
                assert_eq!(id, 7);
                assert!(result.unwrap_err().contains("wrong kind"));
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(HubFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_connection_closed_maps_to_unavailable() {
        let err: StoreError = ProtocolError::ConnectionClosed.into();
        assert!(err.is_connectivity());
        let err: StoreError = ProtocolError::Deserialization("x".into()).into();
        assert!(!err.is_connectivity());
    }
}
