//! Binary hub protocol: invoke/complete calls plus server pushes.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────────┬──────────┐
//! │ msg_type │ invocation_id │ payload  │
//! │ 1 byte   │ varint        │ variable │
//! └──────────┴───────────────┴──────────┘
//! ```
//!
//! - `Invocation` → payload is an [`Invocation`], id picked by the client
//! - `Completion` → payload is a [`Completion`], id echoes the invocation
//! - `Push`       → payload is the full ordered item list (`ReceiveUpdate`)
//! - `Ping`/`Pong` → empty payload, id 0

use serde::{Deserialize, Serialize};

use crate::item::{Item, ItemId};

/// Message types for the hub protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client → server method call
    Invocation = 1,
    /// Server → client result of one invocation
    Completion = 2,
    /// Server → client unsolicited list update
    Push = 3,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Hub methods callable by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Invocation {
    GetAllItems,
    AddItem { name: String, quantity: String },
    CheckItem { id: ItemId },
    UncheckItem { id: ItemId },
    UpdateItem { id: ItemId, name: String, quantity: String },
    DeleteItem { id: ItemId },
    DeleteAllCheckedItems,
    ReorderItems { ordered_ids: Vec<ItemId> },
}

impl Invocation {
    /// Method name as exposed on the hub surface.
    pub fn method(&self) -> &'static str {
        match self {
            Self::GetAllItems => "GetAllItems",
            Self::AddItem { .. } => "AddItem",
            Self::CheckItem { .. } => "CheckItem",
            Self::UncheckItem { .. } => "UncheckItem",
            Self::UpdateItem { .. } => "UpdateItem",
            Self::DeleteItem { .. } => "DeleteItem",
            Self::DeleteAllCheckedItems => "DeleteAllCheckedItems",
            Self::ReorderItems { .. } => "ReorderItems",
        }
    }

    /// Whether a successful call changes the list (and so triggers a push).
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::GetAllItems)
    }
}

/// Successful return value of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationResult {
    Items(Vec<Item>),
    Item(Item),
    Unit,
}

/// Stable, machine-readable error code carried by a failed completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    InvalidInput,
    OperationFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidInput => "INVALID_INPUT",
            Self::OperationFailed => "OPERATION_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Business error returned to the caller of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubError {
    pub code: ErrorCode,
    pub message: String,
}

impl HubError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HubError {}

/// Completion payload: the call's value or its business error.
pub type Completion = Result<InvocationResult, HubError>;

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubMessage {
    pub msg_type: MessageType,
    /// Per-connection call sequence number (0 for pushes and heartbeats)
    pub invocation_id: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl HubMessage {
    /// Create an invocation frame.
    pub fn invocation(invocation_id: u64, call: &Invocation) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Invocation,
            invocation_id,
            payload: encode_payload(call)?,
        })
    }

    /// Create a completion frame answering `invocation_id`.
    pub fn completion(invocation_id: u64, completion: &Completion) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Completion,
            invocation_id,
            payload: encode_payload(completion)?,
        })
    }

    /// Create a `ReceiveUpdate` push carrying the whole list.
    pub fn push(items: &[Item]) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Push,
            invocation_id: 0,
            payload: encode_payload(&items)?,
        })
    }

    /// Create a ping message.
    pub fn ping() -> Self {
        Self {
            msg_type: MessageType::Ping,
            invocation_id: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong() -> Self {
        Self {
            msg_type: MessageType::Pong,
            invocation_id: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Parse invocation payload.
    pub fn as_invocation(&self) -> Result<Invocation, ProtocolError> {
        self.expect_type(MessageType::Invocation)?;
        decode_payload(&self.payload)
    }

    /// Parse completion payload.
    pub fn as_completion(&self) -> Result<Completion, ProtocolError> {
        self.expect_type(MessageType::Completion)?;
        decode_payload(&self.payload)
    }

    /// Parse push payload.
    pub fn as_push(&self) -> Result<Vec<Item>, ProtocolError> {
        self.expect_type(MessageType::Push)?;
        decode_payload(&self.payload)
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    /// Handshake refused because the token was missing, invalid or expired
    Unauthorized,
    ConnectionFailed(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_roundtrip() {
        let call = Invocation::UpdateItem {
            id: 12,
            name: "Oat milk".into(),
            quantity: "2 cartons".into(),
        };
        let msg = HubMessage::invocation(41, &call).unwrap();
        let decoded = HubMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Invocation);
        assert_eq!(decoded.invocation_id, 41);
        assert_eq!(decoded.as_invocation().unwrap(), call);
    }

    #[test]
    fn test_completion_carries_error_code() {
        let completion: Completion = Err(HubError::new(ErrorCode::NotFound, "item 9 not found"));
        let msg = HubMessage::completion(3, &completion).unwrap();
        let decoded = HubMessage::decode(&msg.encode().unwrap()).unwrap();

        let err = decoded.as_completion().unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.to_string(), "NOT_FOUND: item 9 not found");
    }

    #[test]
    fn test_push_preserves_order() {
        let items = vec![Item::new(2, "Bread", "2", 1), Item::new(1, "Milk", "1L", 2)];
        let msg = HubMessage::push(&items).unwrap();
        let decoded = HubMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.invocation_id, 0);
        assert_eq!(decoded.as_push().unwrap(), items);
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = HubMessage::ping();
        assert_eq!(msg.as_push(), Err(ProtocolError::InvalidMessageType));
        assert!(msg.as_invocation().is_err());
        assert!(msg.as_completion().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(HubMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_error_code_strings() {
        assert_eq!(ErrorCode::NotFound.as_str(), "NOT_FOUND");
        assert_eq!(ErrorCode::InvalidInput.as_str(), "INVALID_INPUT");
        assert_eq!(ErrorCode::OperationFailed.as_str(), "OPERATION_FAILED");
    }

    #[test]
    fn test_only_get_all_items_is_read_only() {
        assert!(!Invocation::GetAllItems.is_mutation());
        assert!(Invocation::DeleteAllCheckedItems.is_mutation());
        assert!(Invocation::ReorderItems { ordered_ids: vec![1] }.is_mutation());
        assert_eq!(Invocation::CheckItem { id: 1 }.method(), "CheckItem");
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Invocation as u8, 1);
        assert_eq!(MessageType::Completion as u8, 2);
        assert_eq!(MessageType::Push as u8, 3);
        assert_eq!(MessageType::Ping as u8, 7);
        assert_eq!(MessageType::Pong as u8, 8);
    }
}
