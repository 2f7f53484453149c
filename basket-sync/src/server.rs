//! WebSocket hub server for the shared list.
//!
//! Architecture:
//! ```text
//! Client A ──┐  (token in Authorization header or ?access_token=)
//!            ├── handshake ── TokenVerifier ── 401 on failure
//! Client B ──┘        │
//!                     ▼
//!              connection task ── Invocation ──► ListHub ──► MutationService
//!                     ▲                             │              │
//!                     │                             │         ItemStore
//!                     │                             ▼
//!                     └──── Outbound queue ◄── BroadcastHub (full list push)
//! ```
//!
//! Per connection, invocations are handled one at a time in arrival order.
//! After every successful mutation the list is read once and pushed to all
//! sessions, the caller included. Reading the list and queueing the push
//! happen under one push gate, so pushes leave in the order their lists
//! were read and the last push always carries the last committed list.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{self, AuthError, Claims, TokenVerifier};
use crate::broadcast::{BroadcastHub, Outbound, SessionId};
use crate::item::RETENTION_DAYS;
use crate::protocol::{
    Completion, ErrorCode, HubError, HubMessage, Invocation, InvocationResult, MessageType,
};
use crate::service::MutationService;
use crate::storage::{ItemStore, MemoryItemStore, RocksItemStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per session before pushes are dropped
    pub session_queue_capacity: usize,
    /// Interval between server pings, in seconds
    pub heartbeat_interval_secs: u64,
    /// Close a session silent for this long, in seconds
    pub client_timeout_secs: u64,
    /// Persistence directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Days a checked item stays visible
    pub retention_days: i64,
    /// fsync every commit when persisting
    pub sync_writes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5157".to_string(),
            session_queue_capacity: 64,
            heartbeat_interval_secs: 15,
            client_timeout_secs: 30,
            storage_path: None,
            retention_days: RETENTION_DAYS,
            sync_writes: true,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_invocations: u64,
    pub failed_invocations: u64,
    pub pushes_delivered: u64,
    pub pushes_dropped: u64,
}

/// Dispatches invocations to the service and fans out the result.
#[derive(Clone)]
pub struct ListHub {
    service: MutationService,
    broadcast: Arc<BroadcastHub>,
    stats: Arc<RwLock<ServerStats>>,
    /// Held from list read to enqueue
    push_gate: Arc<Mutex<()>>,
}

impl ListHub {
    pub fn new(service: MutationService, broadcast: Arc<BroadcastHub>) -> Self {
        Self {
            service,
            broadcast,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            push_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn service(&self) -> &MutationService {
        &self.service
    }

    pub fn broadcast(&self) -> &Arc<BroadcastHub> {
        &self.broadcast
    }

    /// Run one call. Successful mutations are followed by a push of the
    /// whole list; a failed push never undoes the committed change.
    pub async fn invoke(&self, call: Invocation) -> Completion {
        let method = call.method();
        let is_mutation = call.is_mutation();
        let result = self.apply(call).await;

        {
            let mut s = self.stats.write().await;
            s.total_invocations += 1;
            if result.is_err() {
                s.failed_invocations += 1;
            }
        }

        match &result {
            Ok(_) if is_mutation => self.push_current_list().await,
            Ok(_) => {}
            Err(e) => log::debug!("{method} rejected: {e}"),
        }
        result
    }

    async fn apply(&self, call: Invocation) -> Completion {
        let svc = &self.service;
        let result = match call {
            Invocation::GetAllItems => svc.get_all_items().await.map(InvocationResult::Items),
            Invocation::AddItem { name, quantity } => {
                svc.add_item(&name, &quantity).await.map(InvocationResult::Item)
            }
            Invocation::CheckItem { id } => svc.check_item(id).await.map(InvocationResult::Item),
            Invocation::UncheckItem { id } => {
                svc.uncheck_item(id).await.map(InvocationResult::Item)
            }
            Invocation::UpdateItem { id, name, quantity } => svc
                .update_item(id, &name, &quantity)
                .await
                .map(InvocationResult::Item),
            Invocation::DeleteItem { id } => {
                svc.delete_item(id).await.map(|_| InvocationResult::Unit)
            }
            Invocation::DeleteAllCheckedItems => svc
                .delete_all_checked_items()
                .await
                .map(|_| InvocationResult::Unit),
            Invocation::ReorderItems { ordered_ids } => svc
                .reorder_items(&ordered_ids)
                .await
                .map(|_| InvocationResult::Unit),
        };
        result.map_err(HubError::from)
    }

    async fn push_current_list(&self) {
        let _gate = self.push_gate.lock().await;
        let items = match self.service.get_all_items().await {
            Ok(items) => items,
            Err(e) => {
                log::error!("Could not read list for push: {e}");
                return;
            }
        };
        match self.broadcast.push_items(&items).await {
            Ok(report) => {
                let mut s = self.stats.write().await;
                s.pushes_delivered += report.delivered as u64;
                s.pushes_dropped += report.dropped as u64;
            }
            Err(e) => log::error!("Could not encode push: {e}"),
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: ListHub,
    verifier: Arc<dyn TokenVerifier>,
}

impl SyncServer {
    /// Create a server, opening persistent storage if configured.
    pub fn new(config: ServerConfig, verifier: Arc<dyn TokenVerifier>) -> Result<Self, StoreError> {
        let store: Arc<dyn ItemStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksItemStore::open(StoreConfig {
                path: path.clone(),
                sync_writes: config.sync_writes,
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryItemStore::new()),
        };
        Ok(Self::with_store(config, verifier, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(
        config: ServerConfig,
        verifier: Arc<dyn TokenVerifier>,
        store: Arc<dyn ItemStore>,
    ) -> Self {
        let broadcast = Arc::new(BroadcastHub::new(config.session_queue_capacity));
        let service = MutationService::new(store)
            .with_retention(chrono::Duration::days(config.retention_days.max(0)));
        let hub = ListHub::new(service, broadcast);
        Self {
            config,
            hub,
            verifier,
        }
    }

    /// Count the items already in storage.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let store = self.hub.service().store().clone();
        let count = tokio::task::spawn_blocking(move || store.load_all().map(|items| items.len()))
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))??;
        log::info!("Recovered {count} items from storage");
        Ok(count)
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.recover().await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let verifier = self.verifier.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, verifier, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: ListHub,
        verifier: Arc<dyn TokenVerifier>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut claims: Option<Claims> = None;
        let handshake = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match authenticate_request(req, verifier.as_ref()) {
                Ok(c) => {
                    claims = Some(c);
                    Ok(resp)
                }
                Err(e) => {
                    log::warn!("Rejected handshake from {addr}: {e}");
                    Err(unauthorized(&e))
                }
            }
        })
        .await;

        let ws_stream = match handshake {
            Ok(ws) => ws,
            Err(e) => {
                hub.stats.write().await.rejected_handshakes += 1;
                log::debug!("Handshake with {addr} failed: {e}");
                return Ok(());
            }
        };
        let Some(claims) = claims else {
            return Ok(());
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (session_id, mut outbound) = hub.broadcast.register(claims, addr.to_string()).await;
        log::info!("Session {session_id} connected from {addr}");

        {
            let mut s = hub.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let outcome =
            Self::drive_session(&mut ws_sender, &mut ws_receiver, &mut outbound, &hub, session_id, &config)
                .await;

        hub.broadcast.unregister(&session_id).await;
        {
            let mut s = hub.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Session {session_id} removed");

        outcome
    }

    /// Pump one authenticated session until it closes, times out or fails.
    async fn drive_session<S, R>(
        ws_sender: &mut S,
        ws_receiver: &mut R,
        outbound: &mut mpsc::Receiver<Outbound>,
        hub: &ListHub,
        session_id: SessionId,
        config: &ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        heartbeat.tick().await;
        let client_timeout = Duration::from_secs(config.client_timeout_secs.max(1));
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let hub_msg = match HubMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from session {session_id}: {e}");
                                    continue;
                                }
                            };
                            match hub_msg.msg_type {
                                MessageType::Invocation => {
                                    let completion = match hub_msg.as_invocation() {
                                        Ok(call) => {
                                            log::debug!("Session {session_id} invoked {}", call.method());
                                            hub.invoke(call).await
                                        }
                                        Err(e) => Err(HubError::new(
                                            ErrorCode::InvalidInput,
                                            e.to_string(),
                                        )),
                                    };
                                    let reply = HubMessage::completion(hub_msg.invocation_id, &completion)?;
                                    if let Err(e) = ws_sender.send(Message::Binary(reply.encode()?.into())).await {
                                        return Err(e.into());
                                    }
                                }
                                MessageType::Ping => {
                                    let pong = HubMessage::pong().encode()?;
                                    if let Err(e) = ws_sender.send(Message::Binary(pong.into())).await {
                                        return Err(e.into());
                                    }
                                }
                                MessageType::Pong => {}
                                other => {
                                    log::debug!("Unexpected message type from client: {other:?}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Session {session_id} closed by peer");
                            return Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                return Err(e.into());
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from session {session_id}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Hub pushes and close requests
                out = outbound.recv() => {
                    match out {
                        Some(Outbound::Frame(data)) => {
                            if let Err(e) = ws_sender.send(Message::Binary(data.to_vec().into())).await {
                                log::warn!("Push to session {session_id} failed: {e}");
                                return Ok(());
                            }
                        }
                        Some(Outbound::Close) | None => {
                            log::info!("Closing session {session_id} on request");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }

                // Keep-alive and dead-peer detection
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > client_timeout {
                        log::warn!("Session {session_id} timed out");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return Ok(());
                    }
                    let ping = HubMessage::ping().encode()?;
                    if let Err(e) = ws_sender.send(Message::Binary(ping.into())).await {
                        return Err(e.into());
                    }
                }
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.hub.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &ListHub {
        &self.hub
    }
}

/// Pull the token from the handshake and verify it.
fn authenticate_request(req: &Request, verifier: &dyn TokenVerifier) -> Result<Claims, AuthError> {
    let from_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::bearer_token);
    let token = from_header
        .or_else(|| req.uri().query().and_then(auth::query_token))
        .ok_or(AuthError::MissingToken)?;
    verifier.verify(token)
}

fn unauthorized(err: &AuthError) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(err.to_string()));
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp
}
