// Worker module for the SFU
//
// This module glues the connection lifecycle to the fan-out engine. A worker
// owns one forwarder manager per media kind and one connection registry per
// signaling session. It names inbound tracks after the stream ids their
// uploader declared, runs one read loop per inbound track that pushes raw
// packets into the matching forwarder, and binds downstream connections to
// forwarders so every forwarded packet is written to their local tracks.

pub mod config;
pub mod up_peer;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::BytesMut;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

pub use config::WorkerConfig;
pub use up_peer::UpPeer;

use crate::{
    connection::{Connection, ConnectionConfig},
    forwarder::{manager::ForwarderManager, Forwarder, PacketHandler, SsrcChangeHandler},
    media::{codec::CodecType, TrackKind, Wrapper},
    registry::ConcurrentRegistry,
    session::{ConnectionHandlers, ConnectionRegistry, IceState, RemovalHook},
    transport::{RemoteTrack, TransportFactory},
    Result, SfuError,
};

/// Receives the id of a session that has no connection left
pub type NoConnectionHandler = Arc<dyn Fn(String) + Send + Sync>;

/// `(connection, stream, codec, kind)` of a track whose read deadline passed
pub type ReadDeadlineHandler = Arc<dyn Fn(String, String, CodecType, TrackKind) + Send + Sync>;

/// `(session, connection, stream, reason)` of a failed downstream write
pub type WriteErrorHandler = Arc<dyn Fn(String, String, String, String) + Send + Sync>;

/// How one read on an inbound track ended
enum ReadOutcome {
    Packet(usize),
    Deadline,
    Ended(SfuError),
}

/// Orchestrates sessions and forwarders
pub struct Worker {
    id: String,
    config: WorkerConfig,
    factory: Arc<dyn TransportFactory>,
    video: Arc<ForwarderManager>,
    audio: Arc<ForwarderManager>,
    /// Session id to its connections
    sessions: ConcurrentRegistry<String, Arc<ConnectionRegistry>>,
    /// Uploader connection id to its declared streams
    up_peers: RwLock<HashMap<String, Arc<UpPeer>>>,
    /// Stream id to the inbound track currently feeding it
    remote_tracks: ConcurrentRegistry<String, Arc<dyn RemoteTrack>>,
    /// Stream id to whether read deadlines are reported
    track_meta: ConcurrentRegistry<String, bool>,
    on_no_connection: RwLock<Option<NoConnectionHandler>>,
    on_read_deadline: RwLock<Option<ReadDeadlineHandler>>,
    cancel: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    self_ref: Weak<Self>,
}

impl Worker {
    /// Create a worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(id: impl Into<String>, factory: Arc<dyn TransportFactory>, config: WorkerConfig) -> Arc<Self> {
        let id = id.into();
        let video = Arc::new(ForwarderManager::with_capacity(
            id.clone(),
            TrackKind::Video,
            config.queue_capacity,
        ));
        let audio = Arc::new(ForwarderManager::with_capacity(
            id.clone(),
            TrackKind::Audio,
            config.queue_capacity,
        ));
        tracing::info!(worker = %id, "Worker created");

        Arc::new_cyclic(|self_ref| Self {
            id,
            config,
            factory,
            video,
            audio,
            sessions: ConcurrentRegistry::new(),
            up_peers: RwLock::new(HashMap::new()),
            remote_tracks: ConcurrentRegistry::new(),
            track_meta: ConcurrentRegistry::new(),
            on_no_connection: RwLock::new(None),
            on_read_deadline: RwLock::new(None),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Worker id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configuration
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Video forwarders
    pub fn video_manager(&self) -> &Arc<ForwarderManager> {
        &self.video
    }

    /// Audio forwarders
    pub fn audio_manager(&self) -> &Arc<ForwarderManager> {
        &self.audio
    }

    fn manager(&self, kind: TrackKind) -> &Arc<ForwarderManager> {
        match kind {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        }
    }

    /// Called for sessions found empty by the sweep
    pub fn set_no_connection_handler(&self, handler: NoConnectionHandler) {
        *self.on_no_connection.write() = Some(handler);
    }

    /// Called when an inbound track stays silent past the read deadline
    pub fn set_read_deadline_handler(&self, handler: ReadDeadlineHandler) {
        *self.on_read_deadline.write() = Some(handler);
    }

    /// Called when the source of a video stream changes
    pub fn set_source_changed_handler(&self, handler: SsrcChangeHandler) {
        self.video.set_ssrc_change_handler(handler);
    }

    /// Start the empty-session sweep; idempotent
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let worker = self.self_ref.clone();
        let cancel = self.cancel.child_token();
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(worker) = worker.upgrade() else {
                    break;
                };
                worker.sweep_once();
            }
        });
        tracing::info!(worker = %self.id, interval = ?period, "Worker started");
    }

    /// Report every session without connections; returns their ids
    pub fn sweep_once(&self) -> Vec<String> {
        let handler = self.on_no_connection.read().clone();
        let mut empty = Vec::new();
        let mut total = 0;
        for (session_id, registry) in self.sessions.to_map() {
            let count = registry.count_all();
            total += count;
            if count == 0 {
                empty.push(session_id);
            }
        }
        empty.sort();

        tracing::debug!(worker = %self.id, sessions = self.sessions.len(), connections = total, "Sweep");
        if let Some(handler) = handler {
            for session_id in &empty {
                handler(session_id.clone());
            }
        }
        empty
    }

    /// Registry of `session_id`, created if absent
    pub fn add_connections(&self, session_id: &str) -> Arc<ConnectionRegistry> {
        if let Some(existing) = self.sessions.get(session_id) {
            return existing;
        }

        let registry = ConnectionRegistry::new(session_id, Arc::clone(&self.factory), self.config.session.clone());
        let video = Arc::downgrade(&self.video);
        let audio = Arc::downgrade(&self.audio);
        let hook: RemovalHook = Arc::new(move |connection_id: String| {
            let video = video.clone();
            let audio = audio.clone();
            async move {
                if let Some(video) = video.upgrade() {
                    video.unregister_all(&connection_id).await;
                }
                if let Some(audio) = audio.upgrade() {
                    audio.unregister_all(&connection_id).await;
                }
            }
            .boxed()
        });
        registry.set_removal_hook(hook);

        self.sessions.set(session_id.to_string(), Arc::clone(&registry));
        tracing::info!(worker = %self.id, session = %session_id, "Session added");
        registry
    }

    /// Registry of `session_id`
    pub fn get_connections(&self, session_id: &str) -> Option<Arc<ConnectionRegistry>> {
        self.sessions.get(session_id)
    }

    /// Close and forget the registry of `session_id`
    pub async fn remove_connections(&self, session_id: &str) {
        if let Some(registry) = self.sessions.delete(session_id) {
            registry.close().await;
            tracing::info!(worker = %self.id, session = %session_id, "Session removed");
        }
    }

    fn require_session(&self, session_id: &str) -> Result<Arc<ConnectionRegistry>> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| SfuError::NotFound(format!("session {}", session_id)))
    }

    fn require_connection(&self, session_id: &str, connection_id: &str) -> Result<Arc<Connection>> {
        self.require_session(session_id)?
            .get_connection(connection_id)
            .ok_or_else(|| SfuError::NotFound(format!("connection {} in session {}", connection_id, session_id)))
    }

    /// Connection `connection_id` of `session_id`; `NotFound` if the session
    /// is unknown
    pub fn get_connection(&self, session_id: &str, connection_id: &str) -> Result<Option<Arc<Connection>>> {
        Ok(self.require_session(session_id)?.get_connection(connection_id))
    }

    /// Remove a connection if it is still the instance identified by
    /// `cookie`; returns whether it was removed
    pub async fn remove_connection(&self, session_id: &str, connection_id: &str, cookie: &str) -> Result<bool> {
        let registry = self.require_session(session_id)?;
        let Some(connection) = registry.get_connection(connection_id) else {
            return Ok(false);
        };
        if connection.cookie() != cookie {
            tracing::error!(
                session = %session_id,
                connection = %connection_id,
                cookie = %cookie,
                live_cookie = %connection.cookie(),
                "Cookie mismatch, connection kept"
            );
            return Ok(false);
        }
        registry.remove_connection(connection_id).await;
        Ok(true)
    }

    /// Add a media connection to `session_id`
    ///
    /// Inbound tracks are routed into forwarders before `handlers.on_track`
    /// sees them.
    pub async fn add_connection(
        &self,
        session_id: &str,
        config: ConnectionConfig,
        mut handlers: ConnectionHandlers,
    ) -> Result<Arc<Connection>> {
        let registry = self.require_session(session_id)?;

        let worker = self.self_ref.clone();
        let downstream = handlers.on_track.take();
        handlers.on_track = Some(Arc::new(move |session: String, connection: String, remote: Arc<dyn RemoteTrack>| {
            if let Some(worker) = worker.upgrade() {
                worker.handle_on_track(&session, &connection, Arc::clone(&remote));
            }
            if let Some(downstream) = &downstream {
                downstream(session, connection, remote);
            }
        }));

        registry.add_connection(config, handlers).await
    }

    /// Add a data-channel-only connection to `session_id`
    pub async fn add_data_channel_connection(
        &self,
        session_id: &str,
        config: ConnectionConfig,
        handlers: ConnectionHandlers,
    ) -> Result<Arc<Connection>> {
        self.require_session(session_id)?
            .add_data_channel_connection(config, handlers)
            .await
    }

    /// Create the video forwarder for `stream_id` ahead of its track
    pub fn add_video_fwd(&self, stream_id: &str, codec: CodecType) -> Result<Arc<Forwarder>> {
        if !codec.is_video() {
            return Err(SfuError::InvalidInput(format!("{} is not a video codec", codec)));
        }
        self.video.add_new_forwarder(stream_id, codec, None)
    }

    /// Create the audio forwarder for `stream_id` ahead of its track
    pub fn add_audio_fwd(&self, stream_id: &str) -> Result<Arc<Forwarder>> {
        self.audio.add_new_forwarder(stream_id, CodecType::Opus, None)
    }

    /// Bind `connection_id` to every listed stream
    pub async fn register(
        &self,
        session_id: &str,
        connection_id: &str,
        video_streams: &[String],
        audio_streams: &[String],
        on_error: Option<WriteErrorHandler>,
    ) -> Result<()> {
        self.require_connection(session_id, connection_id)?;
        for stream_id in video_streams {
            self.register_video(session_id, stream_id, connection_id, on_error.clone())
                .await?;
        }
        for stream_id in audio_streams {
            self.register_audio(session_id, stream_id, connection_id, on_error.clone())
                .await?;
        }
        Ok(())
    }

    /// Write every packet of video stream `stream_id` to `connection_id`
    pub async fn register_video(
        &self,
        session_id: &str,
        stream_id: &str,
        connection_id: &str,
        on_error: Option<WriteErrorHandler>,
    ) -> Result<()> {
        self.register_kind(TrackKind::Video, session_id, stream_id, connection_id, on_error)
            .await
    }

    /// Write every packet of audio stream `stream_id` to `connection_id`
    pub async fn register_audio(
        &self,
        session_id: &str,
        stream_id: &str,
        connection_id: &str,
        on_error: Option<WriteErrorHandler>,
    ) -> Result<()> {
        self.register_kind(TrackKind::Audio, session_id, stream_id, connection_id, on_error)
            .await
    }

    async fn register_kind(
        &self,
        kind: TrackKind,
        session_id: &str,
        stream_id: &str,
        connection_id: &str,
        on_error: Option<WriteErrorHandler>,
    ) -> Result<()> {
        let connection = self.require_connection(session_id, connection_id)?;
        if !connection.config().allows_download(kind) {
            return Err(SfuError::InvalidInput(format!(
                "{} may not receive {}",
                connection_id, kind
            )));
        }
        let handler = write_handler(session_id, &connection, kind, on_error, self.config.debug);
        self.manager(kind).register(stream_id, connection_id, handler).await?;
        tracing::debug!(session = %session_id, connection = %connection_id, stream = %stream_id, kind = %kind, "Registered downstream");
        Ok(())
    }

    /// Drop every registration of `connection_id`
    pub async fn unregister(&self, connection_id: &str) {
        self.video.unregister_all(connection_id).await;
        self.audio.unregister_all(connection_id).await;
        tracing::warn!(connection = %connection_id, "Unregistered from every stream");
    }

    /// Drop the registration of `connection_id` on video stream `stream_id`
    pub async fn unregister_video(&self, connection_id: &str, stream_id: &str) {
        if stream_id.is_empty() {
            return;
        }
        self.video.unregister(stream_id, connection_id).await;
        tracing::warn!(connection = %connection_id, stream = %stream_id, "Unregistered from video stream");
    }

    /// Drop the registration of `connection_id` on audio stream `stream_id`
    pub async fn unregister_audio(&self, connection_id: &str, stream_id: &str) {
        if stream_id.is_empty() {
            return;
        }
        self.audio.unregister(stream_id, connection_id).await;
        tracing::warn!(connection = %connection_id, stream = %stream_id, "Unregistered from audio stream");
    }

    /// Resend the cached keyframe of `stream_id` to `connection_id`
    pub async fn send_video_keyframe(&self, stream_id: &str, connection_id: &str) -> Result<bool> {
        self.video.send_keyframe(stream_id, connection_id).await
    }

    /// Last observed state of every connection of every session
    pub fn get_states(&self) -> HashMap<String, IceState> {
        let mut states = HashMap::new();
        for registry in self.sessions.values() {
            states.extend(registry.get_states());
        }
        states
    }

    /// Connection ids of every session
    pub fn get_all_connection_ids(&self) -> HashMap<String, Vec<String>> {
        self.sessions
            .to_map()
            .into_iter()
            .map(|(session_id, registry)| (session_id, registry.get_all_connection_ids()))
            .collect()
    }

    /// Replace every uploader declaration
    pub fn set_up_list(&self, list: HashMap<String, UpPeer>) {
        *self.up_peers.write() = list.into_iter().map(|(id, up)| (id, Arc::new(up))).collect();
    }

    /// Declare the streams of one uploader, replacing its declaration
    pub fn add_up_list(&self, connection_id: &str, up: UpPeer) {
        self.up_peers.write().insert(connection_id.to_string(), Arc::new(up));
    }

    /// Merge into the declaration of one uploader
    pub fn append_up_list(&self, connection_id: &str, up: UpPeer) {
        let mut up_peers = self.up_peers.write();
        match up_peers.get(connection_id) {
            Some(current) => current.append(&up),
            None => {
                up_peers.insert(connection_id.to_string(), Arc::new(up));
            }
        }
    }

    /// Forget the declaration of one uploader
    pub fn delete_up_list(&self, connection_id: &str) {
        self.up_peers.write().remove(connection_id);
    }

    /// Declaration of one uploader
    pub fn get_up_peer(&self, connection_id: &str) -> Option<Arc<UpPeer>> {
        self.up_peers.read().get(connection_id).cloned()
    }

    /// Inbound track currently feeding `stream_id`
    pub fn get_remote_track(&self, stream_id: &str) -> Option<Arc<dyn RemoteTrack>> {
        self.remote_tracks.get(stream_id)
    }

    /// Last activity of every video stream, unix milliseconds
    pub fn get_video_receive_time(&self) -> HashMap<String, i64> {
        self.video.get_last_time_receive()
    }

    /// Last activity of one video stream, unix milliseconds
    pub fn get_video_receive_time_by(&self, stream_id: &str) -> Option<i64> {
        self.video.get_last_time_receive_by(stream_id)
    }

    /// Last activity of every audio stream, unix milliseconds
    pub fn get_audio_receive_time(&self) -> HashMap<String, i64> {
        self.audio.get_last_time_receive()
    }

    /// Last activity of one audio stream, unix milliseconds
    pub fn get_audio_receive_time_by(&self, stream_id: &str) -> Option<i64> {
        self.audio.get_last_time_receive_by(stream_id)
    }

    /// Whether read deadlines of `stream_id` are reported
    pub fn get_track_meta(&self, stream_id: &str) -> bool {
        self.track_meta.get(stream_id).unwrap_or(false)
    }

    /// Turn reporting of read deadlines of `stream_id` on or off
    pub fn set_track_meta(&self, stream_id: &str, report: bool) {
        self.track_meta.set(stream_id.to_string(), report);
    }

    /// Stream id an inbound track of `kind` from `connection_id` carries
    fn find_track_id(&self, connection_id: &str, kind: TrackKind) -> Result<String> {
        let up = self
            .get_up_peer(connection_id)
            .ok_or_else(|| SfuError::NotFound(format!("{} declared no streams", connection_id)))?;
        up.sole_id(kind).ok_or_else(|| {
            SfuError::InvalidInput(format!(
                "{} declared {} {} streams, expected exactly one",
                connection_id,
                up.ids(kind).len(),
                kind
            ))
        })
    }

    /// Start forwarding an accepted inbound track
    fn handle_on_track(&self, session_id: &str, connection_id: &str, remote: Arc<dyn RemoteTrack>) {
        let kind = remote.kind();
        let stream_id = match self.find_track_id(connection_id, kind) {
            Ok(stream_id) => stream_id,
            Err(e) => {
                tracing::warn!(
                    connection = %connection_id,
                    track = %remote.id(),
                    error = %e,
                    "Unresolved stream id, using the transport track id"
                );
                remote.id().to_string()
            }
        };
        tracing::info!(
            session = %session_id,
            connection = %connection_id,
            stream = %stream_id,
            codec = %remote.codec(),
            "Inbound track"
        );

        let Some(worker) = self.self_ref.upgrade() else {
            return;
        };
        let connection_id = connection_id.to_string();
        tokio::spawn(async move {
            worker.pump_track(connection_id, stream_id, remote).await;
        });
    }

    /// Read loop of one inbound track
    async fn pump_track(&self, connection_id: String, stream_id: String, remote: Arc<dyn RemoteTrack>) {
        let kind = remote.kind();
        let codec = remote.codec();
        let manager = self.manager(kind);
        let mtu = self.config.receive_mtu.max(1);
        self.remote_tracks.set(stream_id.clone(), Arc::clone(&remote));

        let mut forwarder: Option<Arc<Forwarder>> = None;
        let mut arena = BytesMut::new();
        loop {
            if arena.capacity() < mtu {
                arena.reserve(mtu * 32);
            }
            arena.resize(mtu, 0);

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = read_packet(remote.as_ref(), &mut arena, self.config.read_deadline) => outcome,
            };
            let len = match outcome {
                ReadOutcome::Packet(len) => len,
                ReadOutcome::Deadline => {
                    tracing::warn!(connection = %connection_id, stream = %stream_id, "Read deadline exceeded");
                    self.report_read_deadline(&connection_id, &stream_id, codec, kind);
                    break;
                }
                ReadOutcome::Ended(e) => {
                    tracing::debug!(connection = %connection_id, stream = %stream_id, error = %e, "Inbound track ended");
                    break;
                }
            };
            arena.truncate(len);
            let data = arena.split().freeze();

            let target = match forwarder.as_ref().filter(|f| !f.is_closed()) {
                Some(target) => Arc::clone(target),
                None => match manager.add_new_forwarder(&stream_id, codec, None) {
                    Ok(target) => {
                        if target.codec() != codec {
                            target.set_codec(codec);
                        }
                        forwarder = Some(Arc::clone(&target));
                        target
                    }
                    Err(e) => {
                        tracing::warn!(stream = %stream_id, error = %e, "No forwarder, stopping read loop");
                        break;
                    }
                },
            };

            if let Err(e) = target.push(Wrapper::new(data).with_kind(kind)).await {
                tracing::debug!(stream = %stream_id, error = %e, "Push failed");
                forwarder = None;
                continue;
            }
            if self.config.debug {
                tracing::trace!(connection = %connection_id, stream = %stream_id, codec = %codec, len, "Pushed packet");
            }
        }

        self.track_meta.delete(&stream_id);
        self.remote_tracks.delete_if(&stream_id, |current| Arc::ptr_eq(current, &remote));
        tracing::info!(connection = %connection_id, stream = %stream_id, "Read loop stopped");
    }

    fn report_read_deadline(&self, connection_id: &str, stream_id: &str, codec: CodecType, kind: TrackKind) {
        if !self.get_track_meta(stream_id) {
            return;
        }
        let handler = self.on_read_deadline.read().clone();
        if let Some(handler) = handler {
            handler(connection_id.to_string(), stream_id.to_string(), codec, kind);
        }
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every session and forwarder; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        for (_, registry) in self.sessions.capture() {
            registry.close().await;
        }
        self.video.close();
        self.audio.close();
        self.remote_tracks.capture();
        self.track_meta.capture();
        tracing::info!(worker = %self.id, "Worker closed");
    }
}

async fn read_packet(remote: &dyn RemoteTrack, buf: &mut [u8], deadline: Option<Duration>) -> ReadOutcome {
    let read = remote.read(buf);
    let result = match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, read).await {
            Ok(result) => result,
            Err(_) => return ReadOutcome::Deadline,
        },
        None => read.await,
    };
    match result {
        Ok(len) => ReadOutcome::Packet(len),
        Err(e) => ReadOutcome::Ended(e),
    }
}

/// Consumer handler writing forwarded packets to a local track of
/// `connection`
fn write_handler(
    session_id: &str,
    connection: &Arc<Connection>,
    kind: TrackKind,
    on_error: Option<WriteErrorHandler>,
    trace: bool,
) -> PacketHandler {
    let session_id = session_id.to_string();
    let connection_id = connection.id().to_string();
    let connection = Arc::downgrade(connection);

    Arc::new(move |stream_id: String, wrapper: Wrapper| {
        let session_id = session_id.clone();
        let connection_id = connection_id.clone();
        let connection = connection.clone();
        let on_error = on_error.clone();
        async move {
            let result = match connection.upgrade() {
                Some(connection) => match wrapper.rtp() {
                    Ok(packet) => match kind {
                        TrackKind::Video => connection.write_video_rtp(&stream_id, packet).await,
                        TrackKind::Audio => connection.write_audio_rtp(&stream_id, packet).await,
                    },
                    Err(e) => Err(e),
                },
                None => Err(SfuError::NotFound(format!("connection {} is gone", connection_id))),
            };

            match &result {
                Ok(()) if trace => {
                    tracing::trace!(connection = %connection_id, stream = %stream_id, kind = %kind, "Wrote packet");
                }
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(session = %session_id, connection = %connection_id, stream = %stream_id, error = %e, "Downstream write failed");
                    if let Some(on_error) = &on_error {
                        on_error(session_id, connection_id, stream_id, e.to_string());
                    }
                }
            }
            result
        }
        .boxed()
    })
}
