//! Client-side list cache and connection state machine.
//!
//! ```text
//!                 initialize_connection()
//!  Disconnected ─────────────────────────► Connecting ──── ok ────► Connected
//!       ▲  ▲                                   │  ▲                    │
//!       │  └──── auth / transport failure ─────┘  └──── drop ──────────┤
//!       │                                                              │
//!       └──────────────────── disconnect() ────────────────────────────┘
//! ```
//!
//! On entering `Connected` the store calls `GetAllItems` once; after that
//! every push replaces the cache wholesale. A drop is retried on the
//! configured delay schedule with the same token, which is re-validated
//! before each attempt. A token that no longer validates signs the client
//! out and ends in `Disconnected` with
//! [`SyncEvent::ReauthenticationRequired`].

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::auth::{AuthError, Authenticator};
use crate::client::{CallError, ClientConfig, ConnectionEvent, SessionConnection};
use crate::item::{Item, ItemId};
use crate::protocol::{Invocation, InvocationResult, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync store.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(ConnectionState),
    /// The cached list was replaced
    ItemsReplaced(Vec<Item>),
    /// The token is gone or no longer valid; sign in again
    ReauthenticationRequired,
}

/// Sync store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No token has been set
    NotSignedIn,
    /// Token failed validation; the client has been signed out
    ReauthenticationRequired(AuthError),
    /// Sign-in was refused
    Auth(AuthError),
    /// No live channel to send the call on
    NotConnected,
    /// Channel could not be opened
    Connection(ProtocolError),
    /// A call failed; connection state is unaffected
    Call(CallError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSignedIn => write!(f, "Not signed in"),
            Self::ReauthenticationRequired(e) => write!(f, "Re-authentication required: {e}"),
            Self::Auth(e) => write!(f, "Sign-in failed: {e}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::Connection(e) => write!(f, "Connection failed: {e}"),
            Self::Call(e) => write!(f, "Call failed: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<CallError> for SyncError {
    fn from(e: CallError) -> Self {
        Self::Call(e)
    }
}

/// Local copy of the list plus the frame sequence it was taken at.
#[derive(Default)]
struct Cache {
    items: Vec<Item>,
    seq: u64,
}

struct Shared {
    config: ClientConfig,
    authenticator: Arc<dyn Authenticator>,
    token: RwLock<Option<String>>,
    state: watch::Sender<ConnectionState>,
    cache: RwLock<Cache>,
    connection: RwLock<Option<Arc<SessionConnection>>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

/// The client sync store.
pub struct ClientSyncStore {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl ClientSyncStore {
    pub fn new(config: ClientConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                authenticator,
                token: RwLock::new(None),
                state,
                cache: RwLock::new(Cache::default()),
                connection: RwLock::new(None),
                event_tx,
            }),
            supervisor: Mutex::new(None),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    // ─── Credentials ──────────────────────────────────────────────────

    /// Exchange a credential for a token and keep it.
    pub async fn sign_in(&self, credential: &str) -> Result<(), SyncError> {
        let issued = self
            .shared
            .authenticator
            .login(credential)
            .await
            .map_err(SyncError::Auth)?;
        *self.shared.token.write().await = Some(issued.token);
        log::info!("Signed in, token valid until {}", issued.expires_at);
        Ok(())
    }

    /// Use a token obtained elsewhere.
    pub async fn set_token(&self, token: impl Into<String>) {
        *self.shared.token.write().await = Some(token.into());
    }

    /// Drop the channel and forget the token. The cached list is kept.
    pub async fn sign_out(&self) {
        self.disconnect().await;
        *self.shared.token.write().await = None;
    }

    pub async fn token(&self) -> Option<String> {
        self.shared.token.read().await.clone()
    }

    // ─── Connection lifecycle ─────────────────────────────────────────

    /// Validate the token and open the channel.
    ///
    /// Does nothing when already connecting or connected. An invalid
    /// token signs the client out and no connection is attempted. The
    /// handshake is bounded by `connect_timeout`, so `disconnect` never
    /// waits longer than that behind a stalled attempt.
    pub async fn initialize_connection(&self) -> Result<(), SyncError> {
        let mut supervisor = self.supervisor.lock().await;
        if self.state() != ConnectionState::Disconnected {
            return Ok(());
        }
        if let Some(old) = supervisor.take() {
            old.abort();
        }

        let token = self.shared.validated_token().await?;

        self.shared.set_state(ConnectionState::Connecting);
        let (conn, events) = match SessionConnection::connect(&self.shared.config, &token).await {
            Ok(pair) => pair,
            Err(e) => {
                if e == ProtocolError::Unauthorized {
                    self.shared.require_reauthentication().await;
                }
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(SyncError::Connection(e));
            }
        };
        let conn = self.shared.install(conn).await;

        let shared = self.shared.clone();
        *supervisor = Some(tokio::spawn(async move {
            shared.supervise(conn, events, token).await;
        }));
        Ok(())
    }

    /// Close the channel on purpose. No reconnection follows.
    pub async fn disconnect(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if let Some(handle) = supervisor.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(conn) = self.shared.connection.write().await.take() {
            conn.close().await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Current cached list, in display order.
    pub async fn items(&self) -> Vec<Item> {
        self.shared.cache.read().await.items.clone()
    }

    // ─── Hub methods ──────────────────────────────────────────────────

    /// Ask for the list again and replace the cache with the answer.
    pub async fn refresh(&self) -> Result<Vec<Item>, SyncError> {
        let conn = self.connection().await?;
        self.shared.load_snapshot(&conn).await
    }

    pub async fn add_item(&self, name: &str, quantity: &str) -> Result<Item, SyncError> {
        Ok(self.connection().await?.add_item(name, quantity).await?)
    }

    pub async fn check_item(&self, id: ItemId) -> Result<Item, SyncError> {
        Ok(self.connection().await?.check_item(id).await?)
    }

    pub async fn uncheck_item(&self, id: ItemId) -> Result<Item, SyncError> {
        Ok(self.connection().await?.uncheck_item(id).await?)
    }

    pub async fn update_item(&self, id: ItemId, name: &str, quantity: &str) -> Result<Item, SyncError> {
        Ok(self.connection().await?.update_item(id, name, quantity).await?)
    }

    pub async fn delete_item(&self, id: ItemId) -> Result<(), SyncError> {
        Ok(self.connection().await?.delete_item(id).await?)
    }

    pub async fn delete_all_checked_items(&self) -> Result<(), SyncError> {
        Ok(self.connection().await?.delete_all_checked_items().await?)
    }

    pub async fn reorder_items(&self, ordered_ids: &[ItemId]) -> Result<(), SyncError> {
        Ok(self.connection().await?.reorder_items(ordered_ids).await?)
    }

    async fn connection(&self) -> Result<Arc<SessionConnection>, SyncError> {
        self.shared
            .connection
            .read()
            .await
            .clone()
            .ok_or(SyncError::NotConnected)
    }
}

impl Drop for ClientSyncStore {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::info!("Connection state {prev:?} -> {next:?}");
            self.emit(SyncEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: SyncEvent) {
        if self.event_tx.try_send(event).is_err() {
            log::debug!("Sync event dropped, receiver full or gone");
        }
    }

    async fn require_reauthentication(&self) {
        *self.token.write().await = None;
        log::warn!("Token rejected, signed out");
        self.emit(SyncEvent::ReauthenticationRequired);
    }

    /// The stored token, if it still validates. Otherwise sign out.
    async fn validated_token(&self) -> Result<String, SyncError> {
        let Some(token) = self.token.read().await.clone() else {
            self.emit(SyncEvent::ReauthenticationRequired);
            return Err(SyncError::NotSignedIn);
        };
        match self.authenticator.validate(&token).await {
            Ok(_) => Ok(token),
            Err(e) => {
                self.require_reauthentication().await;
                Err(SyncError::ReauthenticationRequired(e))
            }
        }
    }

    /// Make `conn` current, enter `Connected` and load the list once.
    async fn install(&self, conn: SessionConnection) -> Arc<SessionConnection> {
        let conn = Arc::new(conn);
        self.cache.write().await.seq = 0;
        *self.connection.write().await = Some(conn.clone());
        self.set_state(ConnectionState::Connected);

        if let Err(e) = self.load_snapshot(&conn).await {
            log::warn!("Initial GetAllItems failed: {e}");
        }
        conn
    }

    async fn load_snapshot(&self, conn: &SessionConnection) -> Result<Vec<Item>, SyncError> {
        match conn.invoke_sequenced(Invocation::GetAllItems).await? {
            (seq, InvocationResult::Items(items)) => {
                self.replace_items(seq, items.clone()).await;
                Ok(items)
            }
            (_, other) => Err(SyncError::Call(CallError::Transport(
                ProtocolError::DeserializationError(format!("Unexpected result: {other:?}")),
            ))),
        }
    }

    /// Replace the cache unless a later frame already did.
    async fn replace_items(&self, seq: u64, items: Vec<Item>) {
        {
            let mut cache = self.cache.write().await;
            if seq < cache.seq {
                return;
            }
            cache.seq = seq;
            cache.items = items.clone();
        }
        self.emit(SyncEvent::ItemsReplaced(items));
    }

    /// Follow one channel's events; on a drop, reconnect or give up.
    async fn supervise(
        self: Arc<Self>,
        mut conn: Arc<SessionConnection>,
        mut events: mpsc::Receiver<ConnectionEvent>,
        token: String,
    ) {
        loop {
            while let Some(event) = events.recv().await {
                match event {
                    ConnectionEvent::Update { seq, items } => self.replace_items(seq, items).await,
                    ConnectionEvent::Closed => break,
                }
            }

            log::warn!("Hub channel dropped");
            {
                let mut current = self.connection.write().await;
                if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &conn)) {
                    *current = None;
                }
            }
            self.set_state(ConnectionState::Connecting);

            match self.reconnect(&token).await {
                Some((next, next_events)) => {
                    conn = self.install(next).await;
                    events = next_events;
                }
                None => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    /// Walk the retry schedule with the same token.
    async fn reconnect(
        &self,
        token: &str,
    ) -> Option<(SessionConnection, mpsc::Receiver<ConnectionEvent>)> {
        for (attempt, delay) in self.config.reconnect_delays.iter().enumerate() {
            tokio::time::sleep(*delay).await;

            if let Err(e) = self.authenticator.validate(token).await {
                log::warn!("Token no longer valid ({e}), stopping reconnection");
                self.require_reauthentication().await;
                return None;
            }

            match SessionConnection::connect(&self.config, token).await {
                Ok(pair) => {
                    log::info!("Reconnected on attempt {}", attempt + 1);
                    return Some(pair);
                }
                Err(ProtocolError::Unauthorized) => {
                    self.require_reauthentication().await;
                    return None;
                }
                Err(e) => log::warn!("Reconnect attempt {} failed: {e}", attempt + 1),
            }
        }
        log::error!("Giving up after {} reconnect attempts", self.config.reconnect_delays.len());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, JwtAuthenticator};
    use std::time::Duration;

    fn store() -> ClientSyncStore {
        let config = ClientConfig {
            reconnect_delays: vec![Duration::ZERO],
            ..ClientConfig::new("ws://127.0.0.1:1/list")
        };
        ClientSyncStore::new(config, Arc::new(JwtAuthenticator::new(AuthConfig::default())))
    }

    #[tokio::test]
    async fn test_initial_state() {
        let store = store();
        assert_eq!(store.state(), ConnectionState::Disconnected);
        assert!(store.items().await.is_empty());
        assert!(store.token().await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_without_token() {
        let mut store = store();
        let mut events = store.take_event_rx().unwrap();

        assert_eq!(store.initialize_connection().await, Err(SyncError::NotSignedIn));
        assert_eq!(store.state(), ConnectionState::Disconnected);
        assert_eq!(events.try_recv().unwrap(), SyncEvent::ReauthenticationRequired);
    }

    #[tokio::test]
    async fn test_invalid_token_signs_out_without_connecting() {
        let mut store = store();
        let mut events = store.take_event_rx().unwrap();
        store.set_token("not-a-jwt").await;

        let err = store.initialize_connection().await.unwrap_err();
        assert!(matches!(err, SyncError::ReauthenticationRequired(_)));
        assert!(store.token().await.is_none());
        assert_eq!(store.state(), ConnectionState::Disconnected);

        // No Connecting transition was ever emitted.
        assert_eq!(events.try_recv().unwrap(), SyncEvent::ReauthenticationRequired);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_returns_to_disconnected() {
        let mut store = store();
        let mut events = store.take_event_rx().unwrap();
        store.sign_in("basket").await.unwrap();

        let err = store.initialize_connection().await.unwrap_err();
        assert!(matches!(err, SyncError::Connection(ProtocolError::ConnectionFailed(_))));
        assert_eq!(store.state(), ConnectionState::Disconnected);
        assert!(store.token().await.is_some());

        assert_eq!(
            events.try_recv().unwrap(),
            SyncEvent::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SyncEvent::StateChanged(ConnectionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_sign_in_wrong_password() {
        let store = store();
        assert_eq!(
            store.sign_in("wrong").await,
            Err(SyncError::Auth(AuthError::InvalidCredential))
        );
    }

    #[tokio::test]
    async fn test_calls_need_a_connection() {
        let store = store();
        assert_eq!(store.add_item("Milk", "1").await, Err(SyncError::NotConnected));
        assert_eq!(store.refresh().await, Err(SyncError::NotConnected));
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_ignored() {
        let store = store();
        let newer = vec![Item::new(1, "Milk", "1", 1), Item::new(2, "Eggs", "6", 2)];
        let older = vec![Item::new(1, "Milk", "1", 1)];

        store.shared.replace_items(5, newer.clone()).await;
        store.shared.replace_items(3, older).await;
        assert_eq!(store.items().await, newer);
    }
}
