// Session management module for the SFU
//
// This module keeps every connection of one signaling session. It wires each
// connection's transport events to the session-level handlers, runs the
// connectivity state machine (grace period on disconnect, immediate failure
// handling on failure) and guarantees at most one live connection per
// logical connection id. Failure handling compares cookies so a deferred
// check never removes the instance that replaced the one it was armed for.

pub mod scheduler;

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

pub use scheduler::TaskScheduler;

use crate::{
    connection::{
        config::{DEFAULT_DUPLICATE_TTL, DEFAULT_PLI_INTERVAL},
        Connection, ConnectionConfig, ConnectionOptions, Role,
    },
    registry::ConcurrentRegistry,
    signaling::{IceCandidateInit, SessionDescription, SignalPayload},
    transport::{DataChannel, RemoteTrack, TransportEvent, TransportFactory},
    Result, SfuError,
};

/// Default grace period between `disconnected` and failure handling
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(10);

/// ICE connectivity state as reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// Wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            IceState::New => "new",
            IceState::Checking => "checking",
            IceState::Connected => "connected",
            IceState::Completed => "completed",
            IceState::Disconnected => "disconnected",
            IceState::Failed => "failed",
            IceState::Closed => "closed",
        }
    }

    /// Whether a connection in this state is a removal candidate
    pub fn is_terminal(&self) -> bool {
        matches!(self, IceState::Disconnected | IceState::Failed | IceState::Closed)
    }
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing configuration of a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay between `disconnected` and failure handling
    pub disconnect_grace: Duration,
    /// Picture loss heartbeat period of new connections
    pub pli_interval: Duration,
    /// Lifetime of duplicate-suppression tags
    pub duplicate_ttl: Duration,
    /// Emit per-packet trace events on connection write paths
    pub trace_packets: bool,
}

impl SessionConfig {
    /// Options handed to each new connection
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            pli_interval: self.pli_interval,
            duplicate_ttl: self.duplicate_ttl,
            trace_packets: self.trace_packets,
        }
    }
}

// Default implementation
impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            pli_interval: DEFAULT_PLI_INTERVAL,
            duplicate_ttl: DEFAULT_DUPLICATE_TTL,
            trace_packets: false,
        }
    }
}

/// `(session, connection, track)`
pub type TrackHandler = Arc<dyn Fn(String, String, Arc<dyn RemoteTrack>) + Send + Sync>;
/// `(session, role, connection)`
pub type ConnectionEventHandler = Arc<dyn Fn(String, Role, String) + Send + Sync>;
/// `(session, connection, candidate)`
pub type CandidateHandler = Arc<dyn Fn(String, String, IceCandidateInit) + Send + Sync>;
/// `(session, connection, cookie)`
pub type NegotiationHandler = Arc<dyn Fn(String, String, String) + Send + Sync>;
/// `(connection, channel)`
pub type DataChannelHandler = Arc<dyn Fn(String, Arc<dyn DataChannel>) + Send + Sync>;
/// Runs after a connection left the registry, before it is closed
pub type RemovalHook = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Session-level callbacks of one connection
#[derive(Clone, Default)]
pub struct ConnectionHandlers {
    pub on_track: Option<TrackHandler>,
    pub on_added: Option<ConnectionEventHandler>,
    pub on_failed: Option<ConnectionEventHandler>,
    pub on_candidate: Option<CandidateHandler>,
    pub on_negotiation_needed: Option<NegotiationHandler>,
    pub on_data_channel: Option<DataChannelHandler>,
}

impl ConnectionHandlers {
    /// No callbacks
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every accepted inbound track
    pub fn on_track(mut self, handler: impl Fn(String, String, Arc<dyn RemoteTrack>) + Send + Sync + 'static) -> Self {
        self.on_track = Some(Arc::new(handler));
        self
    }

    /// Called once, when the connection first reaches `connected`
    pub fn on_added(mut self, handler: impl Fn(String, Role, String) + Send + Sync + 'static) -> Self {
        self.on_added = Some(Arc::new(handler));
        self
    }

    /// Called once, after a failed connection was removed
    pub fn on_failed(mut self, handler: impl Fn(String, Role, String) + Send + Sync + 'static) -> Self {
        self.on_failed = Some(Arc::new(handler));
        self
    }

    /// Called for every gathered local candidate
    pub fn on_candidate(mut self, handler: impl Fn(String, String, IceCandidateInit) + Send + Sync + 'static) -> Self {
        self.on_candidate = Some(Arc::new(handler));
        self
    }

    /// Called when the transport asks for renegotiation
    pub fn on_negotiation_needed(mut self, handler: impl Fn(String, String, String) + Send + Sync + 'static) -> Self {
        self.on_negotiation_needed = Some(Arc::new(handler));
        self
    }

    /// Called when a data channel opens
    pub fn on_data_channel(mut self, handler: impl Fn(String, Arc<dyn DataChannel>) + Send + Sync + 'static) -> Self {
        self.on_data_channel = Some(Arc::new(handler));
        self
    }
}

/// Every connection of one signaling session
pub struct ConnectionRegistry {
    session_id: String,
    factory: Arc<dyn TransportFactory>,
    config: SessionConfig,
    connections: ConcurrentRegistry<String, Arc<Connection>>,
    states: ConcurrentRegistry<String, IceState>,
    /// Disconnect grace checks, keyed by connection id
    scheduler: TaskScheduler,
    /// Serializes additions so a replacement never overlaps its predecessor
    admission: Mutex<()>,
    on_removed: RwLock<Option<RemovalHook>>,
    closed: AtomicBool,
}

impl ConnectionRegistry {
    /// Create an empty registry for `session_id`
    pub fn new(session_id: impl Into<String>, factory: Arc<dyn TransportFactory>, config: SessionConfig) -> Arc<Self> {
        let session_id = session_id.into();
        Arc::new(Self {
            scheduler: TaskScheduler::new(format!("session-{}", session_id)),
            session_id,
            factory,
            config,
            connections: ConcurrentRegistry::new(),
            states: ConcurrentRegistry::new(),
            admission: Mutex::new(()),
            on_removed: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Session id
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Install the hook run for every removed connection
    pub fn set_removal_hook(&self, hook: RemovalHook) {
        *self.on_removed.write() = Some(hook);
    }

    /// Add a media connection, replacing any connection with the same id
    pub async fn add_connection(
        self: &Arc<Self>,
        config: ConnectionConfig,
        handlers: ConnectionHandlers,
    ) -> Result<Arc<Connection>> {
        self.admit(config, handlers, false).await
    }

    /// Add a data-channel-only connection, replacing any connection with the
    /// same id
    pub async fn add_data_channel_connection(
        self: &Arc<Self>,
        config: ConnectionConfig,
        handlers: ConnectionHandlers,
    ) -> Result<Arc<Connection>> {
        self.admit(config, handlers, true).await
    }

    async fn admit(
        self: &Arc<Self>,
        config: ConnectionConfig,
        handlers: ConnectionHandlers,
        data_channel: bool,
    ) -> Result<Arc<Connection>> {
        if self.is_closed() {
            return Err(SfuError::NotInitialized(format!("session {} is closed", self.session_id)));
        }
        let _admission = self.admission.lock().await;

        let id = config.connection_id.clone();
        if self.connections.contains_key(&id) {
            self.remove_connection(&id).await;
            tracing::info!(session = %self.session_id, connection = %id, "Removed existing connection");
        }

        let connection = Connection::new(config, self.config.connection_options());
        let events = if data_channel {
            connection.init_data_channel(self.factory.as_ref()).await
        } else {
            connection.init(self.factory.as_ref()).await
        };
        let events = match events {
            Ok(events) => events,
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        };

        self.states.set(id.clone(), IceState::New);
        self.connections.set(id.clone(), Arc::clone(&connection));
        self.spawn_event_loop(Arc::clone(&connection), events, handlers);

        tracing::info!(
            session = %self.session_id,
            connection = %id,
            cookie = %connection.cookie(),
            role = %connection.role(),
            data_channel,
            "Connection added"
        );
        Ok(connection)
    }

    fn spawn_event_loop(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        mut events: mpsc::Receiver<TransportEvent>,
        handlers: ConnectionHandlers,
    ) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let cancel = connection.cancel_token();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.handle_event(&connection, event, &handlers).await;
            }
            tracing::debug!(connection = %connection.id(), cookie = %connection.cookie(), "Event loop stopped");
        });
    }

    async fn handle_event(self: &Arc<Self>, connection: &Arc<Connection>, event: TransportEvent, handlers: &ConnectionHandlers) {
        match event {
            TransportEvent::IceConnectionStateChange(state) => {
                self.handle_ice_state(connection, state, handlers);
            }
            TransportEvent::IceCandidate(candidate) => {
                if let Some(handler) = &handlers.on_candidate {
                    handler(self.session_id.clone(), connection.id().to_string(), candidate);
                }
            }
            TransportEvent::Track(remote) => {
                let kind = remote.kind();
                if !connection.config().allows_upload(kind) {
                    tracing::warn!(
                        session = %self.session_id,
                        connection = %connection.id(),
                        kind = %kind,
                        "Upload of this kind is not allowed, track dropped"
                    );
                    return;
                }
                if kind == crate::media::TrackKind::Video {
                    connection.handle_video_track(&remote);
                }
                if let Some(handler) = &handlers.on_track {
                    handler(self.session_id.clone(), connection.id().to_string(), remote);
                }
            }
            TransportEvent::NegotiationNeeded => {
                if let Some(handler) = &handlers.on_negotiation_needed {
                    handler(
                        self.session_id.clone(),
                        connection.id().to_string(),
                        connection.cookie().to_string(),
                    );
                }
            }
            TransportEvent::DataChannel(channel) => {
                tracing::debug!(connection = %connection.id(), label = %channel.label(), "Data channel opened");
                if let Some(handler) = &handlers.on_data_channel {
                    handler(connection.id().to_string(), channel);
                }
            }
        }
    }

    /// React to a connectivity change reported for `connection`
    fn handle_ice_state(self: &Arc<Self>, connection: &Arc<Connection>, state: IceState, handlers: &ConnectionHandlers) {
        let id = connection.id().to_string();
        let live = self.connections.get(&id);
        if !live.as_ref().is_some_and(|live| Arc::ptr_eq(live, connection)) {
            tracing::debug!(session = %self.session_id, connection = %id, state = %state, "Ignoring state of a replaced connection");
            return;
        }

        self.states.set(id.clone(), state);
        match state {
            IceState::Connected | IceState::Completed => {
                self.scheduler.cancel(&grace_key(&id));
                if connection.mark_connected() {
                    tracing::info!(session = %self.session_id, connection = %id, cookie = %connection.cookie(), "Connection established");
                    if let Some(handler) = &handlers.on_added {
                        handler(self.session_id.clone(), connection.role(), id);
                    }
                }
            }
            IceState::Disconnected => {
                tracing::warn!(session = %self.session_id, connection = %id, "Connection disconnected, waiting for recovery");
                let registry = Arc::downgrade(self);
                let cookie = connection.cookie().to_string();
                let role = connection.role();
                let on_failed = handlers.on_failed.clone();
                let key = grace_key(&id);
                self.scheduler.schedule(key, self.config.disconnect_grace, async move {
                    if let Some(registry) = registry.upgrade() {
                        registry.check_failed_state(&id, &cookie, role, on_failed).await;
                    }
                });
            }
            IceState::Failed => {
                tracing::warn!(session = %self.session_id, connection = %id, "Connection failed");
                let registry = Arc::clone(self);
                let cookie = connection.cookie().to_string();
                let role = connection.role();
                let on_failed = handlers.on_failed.clone();
                tokio::spawn(async move {
                    registry.check_failed_state(&id, &cookie, role, on_failed).await;
                });
            }
            IceState::Closed => {
                tracing::debug!(session = %self.session_id, connection = %id, "Connection closed");
            }
            IceState::New | IceState::Checking => {}
        }
    }

    /// Remove the connection if it is still terminal and still the instance
    /// identified by `cookie`
    ///
    /// Returns whether the connection was removed.
    pub async fn check_failed_state(
        &self,
        connection_id: &str,
        cookie: &str,
        role: Role,
        on_failed: Option<ConnectionEventHandler>,
    ) -> bool {
        let terminal = self.states.get(connection_id).is_some_and(|state| state.is_terminal());
        let current = self
            .connections
            .get(connection_id)
            .is_some_and(|live| live.cookie() == cookie);
        if !(terminal && current) {
            tracing::debug!(
                session = %self.session_id,
                connection = %connection_id,
                cookie = %cookie,
                terminal,
                current,
                "Skipping failure handling"
            );
            return false;
        }

        self.remove_connection(connection_id).await;
        tracing::error!(session = %self.session_id, connection = %connection_id, cookie = %cookie, "Connection removed after failure");
        if let Some(handler) = on_failed {
            handler(self.session_id.clone(), role, connection_id.to_string());
        }
        true
    }

    /// Remove and close a connection; idempotent
    pub async fn remove_connection(&self, connection_id: &str) {
        let Some(connection) = self.connections.delete(connection_id) else {
            self.states.delete(connection_id);
            return;
        };
        self.states.delete(connection_id);

        let hook = self.on_removed.read().clone();
        if let Some(hook) = hook {
            hook(connection_id.to_string()).await;
        }
        connection.close().await;
        tracing::info!(session = %self.session_id, connection = %connection_id, "Connection removed");
    }

    /// Live connection under `connection_id`
    pub fn get_connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id)
    }

    /// Every live connection
    pub fn get_all_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.values()
    }

    /// Ids of every live connection
    pub fn get_all_connection_ids(&self) -> Vec<String> {
        self.connections.keys()
    }

    /// Last observed state of every connection
    pub fn get_states(&self) -> HashMap<String, IceState> {
        self.states.to_map()
    }

    /// Last observed state of one connection
    pub fn get_state(&self, connection_id: &str) -> Option<IceState> {
        self.states.get(connection_id)
    }

    /// Number of live connections
    pub fn count_all(&self) -> usize {
        self.connections.len()
    }

    /// Apply a remote description to a connection
    pub async fn add_sdp(&self, connection_id: &str, description: SessionDescription) -> Result<Option<SessionDescription>> {
        self.require(connection_id)?.add_sdp(description).await
    }

    /// Apply a remote candidate to a connection
    pub async fn add_candidate(&self, connection_id: &str, candidate: IceCandidateInit) -> Result<()> {
        self.require(connection_id)?.add_ice_candidate(candidate).await
    }

    /// Apply any negotiation payload to a connection
    pub async fn apply_signal(&self, connection_id: &str, payload: SignalPayload) -> Result<Option<SessionDescription>> {
        self.require(connection_id)?.apply_signal(payload).await
    }

    fn require(&self, connection_id: &str) -> Result<Arc<Connection>> {
        self.connections.get(connection_id).ok_or_else(|| {
            SfuError::NotFound(format!("connection {} in session {}", connection_id, self.session_id))
        })
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remove every connection and stop pending checks; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.cancel_all();
        for id in self.connections.keys() {
            self.remove_connection(&id).await;
        }
        tracing::info!(session = %self.session_id, "Session closed");
    }
}

fn grace_key(connection_id: &str) -> String {
    format!("disconnected-{}", connection_id)
}
