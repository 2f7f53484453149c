//! # basket-sync: real-time shared shopping list
//!
//! One server-authoritative list, many clients. Every accepted mutation is
//! followed by a push of the whole ordered list to every session.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐     WebSocket       ┌─────────────────┐
//! │ ClientSyncStore   │ ◄─────────────────► │ SyncServer      │
//! │ (per client)      │  invoke / complete  │ (central)       │
//! └─────────┬─────────┘   + list pushes     └────────┬────────┘
//!           │                                        │
//!           ▼                                        ▼
//! ┌───────────────────┐                     ┌─────────────────┐
//! │ SessionConnection │                     │ MutationService │
//! │ (one channel)     │                     │ (write gate)    │
//! └───────────────────┘                     └────────┬────────┘
//!                                                    │
//!                                           ┌────────┴────────┐
//!                                           │ ItemStore       │
//!                                           │ (memory/RocksDB)│
//!                                           └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`item`]: Item model and display ordering
//! - [`protocol`]: Binary wire protocol (bincode-encoded HubMessage)
//! - [`auth`]: Token issue and verification
//! - [`storage`]: Item store trait, in-memory and RocksDB backends
//! - [`service`]: Validated, serialized list mutations
//! - [`broadcast`]: Session registry and full-list fan-out
//! - [`server`]: WebSocket hub server
//! - [`client`]: One authenticated client channel
//! - [`sync_store`]: Client cache and reconnecting state machine

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod item;
pub mod protocol;
pub mod server;
pub mod service;
pub mod storage;
pub mod sync_store;

// Re-exports for convenience
pub use auth::{AuthConfig, AuthError, Authenticator, Claims, IssuedToken, JwtAuthenticator, TokenVerifier};
pub use broadcast::{BroadcastHub, BroadcastStats, PushReport, SessionId, SessionInfo};
pub use client::{CallError, ClientConfig, ConnectionEvent, SessionConnection, TokenTransport};
pub use item::{Item, ItemId, RETENTION_DAYS};
pub use protocol::{
    Completion, ErrorCode, HubError, HubMessage, Invocation, InvocationResult, MessageType,
    ProtocolError,
};
pub use server::{ListHub, ServerConfig, ServerStats, SyncServer};
pub use service::{Clock, MutationService, ServiceError, SystemClock};
pub use storage::{ItemBatch, ItemStore, MemoryItemStore, RocksItemStore, StoreConfig, StoreError};
pub use sync_store::{ClientSyncStore, ConnectionState, SyncError, SyncEvent};
