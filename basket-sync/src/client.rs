//! Client side of one hub channel.
//!
//! A [`SessionConnection`] owns a single authenticated WebSocket:
//! ```text
//!   invoke() ──► pending[id] = oneshot ──► writer task ──► socket
//!                      ▲
//!   socket ──► reader task ──┬── Completion(id) ──► pending[id].send
//!                            ├── Push          ──► ConnectionEvent::Update
//!                            ├── Ping          ──► Pong (via writer)
//!                            └── close / error / silence ──► ConnectionEvent::Closed
//! ```
//! Every frame the reader sees gets a sequence number. Completions and
//! pushes both carry it, so a list snapshot from `GetAllItems` can be
//! ordered against pushes that arrived around it.
//!
//! Reconnection is not handled here; see [`crate::sync_store`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::auth::ACCESS_TOKEN_PARAM;
use crate::item::{Item, ItemId};
use crate::protocol::{
    Completion, HubError, HubMessage, Invocation, InvocationResult, MessageType, ProtocolError,
};

/// How the bearer token reaches the server during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTransport {
    /// `Authorization: Bearer <token>`
    Header,
    /// `?access_token=<token>`, for transports without custom headers
    QueryString,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub endpoint, e.g. `ws://127.0.0.1:5157/list`
    pub server_url: String,
    pub token_transport: TokenTransport,
    /// Give up on the TCP connect plus WebSocket handshake after this long
    pub connect_timeout: Duration,
    /// Treat the channel as dropped after this much silence
    pub server_timeout: Duration,
    /// Wait before each reconnect attempt; the list length is the attempt count
    pub reconnect_delays: Vec<Duration>,
    /// Buffered events per channel
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:5157/list".to_string(),
            token_transport: TokenTransport::Header,
            connect_timeout: Duration::from_secs(10),
            server_timeout: Duration::from_secs(30),
            reconnect_delays: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

/// Events from the reader task.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// `ReceiveUpdate`: the whole list, tagged with its frame sequence
    Update { seq: u64, items: Vec<Item> },
    /// The channel is gone; no further events follow
    Closed,
}

/// Why a call did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The server answered with a business error
    Hub(HubError),
    /// The call never got an answer
    Transport(ProtocolError),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hub(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<ProtocolError> for CallError {
    fn from(e: ProtocolError) -> Self {
        Self::Transport(e)
    }
}

type PendingReply = oneshot::Sender<Result<(u64, Completion), ProtocolError>>;
type PendingMap = Arc<Mutex<HashMap<u64, PendingReply>>>;

/// One authenticated channel to the hub.
pub struct SessionConnection {
    outgoing_tx: mpsc::Sender<Message>,
    pending: PendingMap,
    next_invocation: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SessionConnection {
    /// Open and authenticate a channel.
    ///
    /// A rejected token surfaces as [`ProtocolError::Unauthorized`], a
    /// handshake slower than `connect_timeout` as [`ProtocolError::Timeout`].
    pub async fn connect(
        config: &ClientConfig,
        token: &str,
    ) -> Result<(Self, mpsc::Receiver<ConnectionEvent>), ProtocolError> {
        let request = build_request(config, token)?;
        let handshake = tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(request));
        let ws_stream = match handshake.await.map_err(|_| ProtocolError::Timeout)? {
            Ok((ws, _)) => ws,
            Err(tungstenite::Error::Http(resp)) if resp.status() == StatusCode::UNAUTHORIZED => {
                log::warn!("Hub rejected token");
                return Err(ProtocolError::Unauthorized);
            }
            Err(e) => return Err(ProtocolError::ConnectionFailed(e.to_string())),
        };
        log::info!("Connected to {}", config.server_url);

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || is_close {
                    break;
                }
            }
        });

        // Reader task: completions, pushes, heartbeats
        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            let pong_tx = out_tx.clone();
            let server_timeout = config.server_timeout;
            tokio::spawn(async move {
                let mut seq: u64 = 0;
                loop {
                    let msg = match tokio::time::timeout(server_timeout, ws_reader.next()).await {
                        Ok(Some(Ok(msg))) => msg,
                        Ok(Some(Err(e))) => {
                            log::warn!("Channel error: {e}");
                            break;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            log::warn!("No traffic from hub for {server_timeout:?}, dropping channel");
                            break;
                        }
                    };

                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Close(_) => break,
                        _ => continue,
                    };
                    let hub_msg = match HubMessage::decode(&data) {
                        Ok(m) => m,
                        Err(e) => {
                            log::warn!("Dropping undecodable frame: {e}");
                            continue;
                        }
                    };
                    seq += 1;

                    match hub_msg.msg_type {
                        MessageType::Completion => {
                            let reply = hub_msg.as_completion().map(|c| (seq, c));
                            match pending.lock().await.remove(&hub_msg.invocation_id) {
                                Some(tx) => {
                                    let _ = tx.send(reply);
                                }
                                None => log::debug!(
                                    "Completion for unknown invocation {}",
                                    hub_msg.invocation_id
                                ),
                            }
                        }
                        MessageType::Push => match hub_msg.as_push() {
                            Ok(items) => {
                                if event_tx.send(ConnectionEvent::Update { seq, items }).await.is_err() {
                                    log::debug!("Event receiver dropped");
                                }
                            }
                            Err(e) => log::warn!("Bad push payload: {e}"),
                        },
                        MessageType::Ping => {
                            if let Ok(pong) = HubMessage::pong().encode() {
                                let _ = pong_tx.send(Message::Binary(pong.into())).await;
                            }
                        }
                        MessageType::Pong | MessageType::Invocation => {}
                    }
                }

                // Connection lost: fail whatever is still waiting
                closed.store(true, Ordering::SeqCst);
                pending.lock().await.clear();
                let _ = event_tx.send(ConnectionEvent::Closed).await;
                log::info!("Hub channel closed");
            })
        };

        Ok((
            Self {
                outgoing_tx: out_tx,
                pending,
                next_invocation: AtomicU64::new(1),
                closed,
                reader,
                writer,
            },
            event_rx,
        ))
    }

    /// Call a hub method and wait for its completion.
    pub async fn invoke(&self, call: Invocation) -> Result<InvocationResult, CallError> {
        self.invoke_sequenced(call).await.map(|(_, result)| result)
    }

    /// Like [`invoke`](Self::invoke), also returning the frame sequence of
    /// the completion.
    pub async fn invoke_sequenced(
        &self,
        call: Invocation,
    ) -> Result<(u64, InvocationResult), CallError> {
        if self.is_closed() {
            return Err(CallError::Transport(ProtocolError::ConnectionClosed));
        }

        let id = self.next_invocation.fetch_add(1, Ordering::Relaxed);
        let frame = HubMessage::invocation(id, &call)?.encode()?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        // The reader marks the channel closed before it clears `pending`.
        if self.is_closed() {
            self.pending.lock().await.remove(&id);
            return Err(CallError::Transport(ProtocolError::ConnectionClosed));
        }

        log::debug!("Invoking {} as #{id}", call.method());
        if self.outgoing_tx.send(Message::Binary(frame.into())).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(CallError::Transport(ProtocolError::ConnectionClosed));
        }

        match rx.await {
            Ok(Ok((seq, completion))) => completion.map(|r| (seq, r)).map_err(CallError::Hub),
            Ok(Err(e)) => Err(CallError::Transport(e)),
            Err(_) => Err(CallError::Transport(ProtocolError::ConnectionClosed)),
        }
    }

    // ─── Typed hub methods ────────────────────────────────────────────

    pub async fn get_all_items(&self) -> Result<Vec<Item>, CallError> {
        match self.invoke(Invocation::GetAllItems).await? {
            InvocationResult::Items(items) => Ok(items),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_item(&self, name: &str, quantity: &str) -> Result<Item, CallError> {
        let call = Invocation::AddItem {
            name: name.to_string(),
            quantity: quantity.to_string(),
        };
        expect_item(self.invoke(call).await?)
    }

    pub async fn check_item(&self, id: ItemId) -> Result<Item, CallError> {
        expect_item(self.invoke(Invocation::CheckItem { id }).await?)
    }

    pub async fn uncheck_item(&self, id: ItemId) -> Result<Item, CallError> {
        expect_item(self.invoke(Invocation::UncheckItem { id }).await?)
    }

    pub async fn update_item(&self, id: ItemId, name: &str, quantity: &str) -> Result<Item, CallError> {
        let call = Invocation::UpdateItem {
            id,
            name: name.to_string(),
            quantity: quantity.to_string(),
        };
        expect_item(self.invoke(call).await?)
    }

    pub async fn delete_item(&self, id: ItemId) -> Result<(), CallError> {
        self.invoke(Invocation::DeleteItem { id }).await.map(|_| ())
    }

    pub async fn delete_all_checked_items(&self) -> Result<(), CallError> {
        self.invoke(Invocation::DeleteAllCheckedItems).await.map(|_| ())
    }

    pub async fn reorder_items(&self, ordered_ids: &[ItemId]) -> Result<(), CallError> {
        let call = Invocation::ReorderItems {
            ordered_ids: ordered_ids.to_vec(),
        };
        self.invoke(call).await.map(|_| ())
    }

    /// Send a close frame. The reader reports `Closed` once the hub answers.
    pub async fn close(&self) {
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.reader.is_finished()
    }

    /// Calls still waiting for their completion.
    pub async fn pending_calls(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Drop for SessionConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn build_request(
    config: &ClientConfig,
    token: &str,
) -> Result<tungstenite::handshake::client::Request, ProtocolError> {
    let url = match config.token_transport {
        TokenTransport::Header => config.server_url.clone(),
        TokenTransport::QueryString => {
            let sep = if config.server_url.contains('?') { '&' } else { '?' };
            format!("{}{sep}{ACCESS_TOKEN_PARAM}={token}", config.server_url)
        }
    };
    let mut request = url
        .into_client_request()
        .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
    if config.token_transport == TokenTransport::Header {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

fn expect_item(result: InvocationResult) -> Result<Item, CallError> {
    match result {
        InvocationResult::Item(item) => Ok(item),
        other => Err(unexpected(other)),
    }
}

fn unexpected(result: InvocationResult) -> CallError {
    CallError::Transport(ProtocolError::DeserializationError(format!(
        "Unexpected result: {result:?}"
    )))
}
