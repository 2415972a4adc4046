// Connection module for the SFU
//
// This module wraps one negotiated endpoint connection. A connection owns its
// transport, buffers remote ICE candidates until a remote description is in
// place, keeps its local tracks, and sends periodic picture loss indications
// upstream for the video it receives. Each instance carries a cookie that is
// never reused, so registries can tell a stale instance from its
// replacement.

pub mod candidates;
pub mod config;
pub mod tracks;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use candidates::CandidateCache;
pub use config::{ConnectionConfig, ConnectionOptions, Role};
pub use tracks::{FirstInit, LocalTracks, TrackEntry};

use crate::{
    feedback::RtcpPacket,
    media::{codec::CodecType, frame::MediaSample, rtp::RtpPacket, TrackKind},
    signaling::{IceCandidateInit, SessionDescription, SignalPayload},
    transport::{
        DataChannelMode, LocalTrackSpec, Outbound, PeerTransport, RemoteTrack, TrackFlavor,
        TransportEvent, TransportFactory, TransportSettings,
    },
    Result, SfuError,
};

/// Label of data channels the server opens itself
pub const DATA_CHANNEL_LABEL: &str = "data";

/// One endpoint connection
pub struct Connection {
    /// Generation token of this instance
    cookie: String,
    /// Configuration handed over by signaling
    config: ConnectionConfig,
    /// Timing options
    options: ConnectionOptions,
    /// Underlying transport, absent before init and after close
    transport: Mutex<Option<Arc<dyn PeerTransport>>>,
    /// Remote candidates waiting for a remote description
    candidates: CandidateCache,
    /// Local tracks by kind and stream id
    tracks: LocalTracks,
    /// Set once, on the first connected notification
    connected: AtomicBool,
    /// Close guard
    closed: AtomicBool,
    /// SSRC of the latest remote video track
    remote_video_ssrc: Mutex<Option<u32>>,
    /// Heartbeat period for video tracks received from now on
    pli_interval: Mutex<Duration>,
    /// Stops the heartbeat of the current remote video track
    heartbeat: Mutex<Option<CancellationToken>>,
    /// Live duplicate-suppression tags and their generation
    duplicates: Arc<Mutex<HashMap<String, u64>>>,
    /// Generation counter for duplicate tags
    duplicate_generation: AtomicU64,
    /// Parent of every task this connection runs
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection; the transport is attached by `init`
    pub fn new(config: ConnectionConfig, options: ConnectionOptions) -> Arc<Self> {
        let pli_interval = options.pli_interval;
        Arc::new(Self {
            cookie: Uuid::new_v4().to_string(),
            config,
            options,
            transport: Mutex::new(None),
            candidates: CandidateCache::new(),
            tracks: LocalTracks::new(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remote_video_ssrc: Mutex::new(None),
            pli_interval: Mutex::new(pli_interval),
            heartbeat: Mutex::new(None),
            duplicates: Arc::new(Mutex::new(HashMap::new())),
            duplicate_generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Logical connection id
    pub fn id(&self) -> &str {
        &self.config.connection_id
    }

    /// Generation token of this instance
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Direction of the connection
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Build a media transport
    pub async fn init(&self, factory: &dyn TransportFactory) -> Result<mpsc::Receiver<TransportEvent>> {
        self.attach(factory, None).await
    }

    /// Build a transport that only carries a data channel
    pub async fn init_data_channel(
        &self,
        factory: &dyn TransportFactory,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        let mode = if self.config.create_data_channel_locally {
            DataChannelMode::CreateLocally(DATA_CHANNEL_LABEL.to_string())
        } else {
            DataChannelMode::AwaitRemote
        };
        self.attach(factory, Some(mode)).await
    }

    async fn attach(
        &self,
        factory: &dyn TransportFactory,
        data_channel: Option<DataChannelMode>,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        if self.is_closed() {
            return Err(SfuError::NotInitialized(format!("connection {} is closed", self.id())));
        }
        if self.transport.lock().is_some() {
            return Err(SfuError::InvalidInput(format!(
                "connection {} is already initialized",
                self.id()
            )));
        }

        let settings = TransportSettings {
            connection_id: self.id().to_string(),
            ice_servers: self.config.ice_servers.clone(),
            data_channel,
        };
        let (transport, events) = factory.create(settings).await?;
        *self.transport.lock() = Some(transport);

        tracing::debug!(connection = %self.id(), cookie = %self.cookie, role = %self.role(), "Connection initialized");
        Ok(events)
    }

    /// The transport, or `NotInitialized`
    pub fn transport(&self) -> Result<Arc<dyn PeerTransport>> {
        self.transport
            .lock()
            .clone()
            .ok_or_else(|| SfuError::NotInitialized(format!("connection {} has no transport", self.id())))
    }

    /// Whether the connection ever reached `connected`
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the connection connected; true only for the first call
    ///
    /// The candidate buffer is cleared on that first transition.
    pub(crate) fn mark_connected(&self) -> bool {
        let first = self
            .connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.candidates.clear();
        }
        first
    }

    /// Cancellation signal of every task bound to this connection
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Apply a negotiation payload
    ///
    /// Returns the local answer when the payload was an offer.
    pub async fn apply_signal(&self, payload: SignalPayload) -> Result<Option<SessionDescription>> {
        match payload {
            SignalPayload::Offer(offer) => self.add_offer(offer).await.map(Some),
            SignalPayload::Answer(answer) => self.add_answer(answer).await.map(|_| None),
            SignalPayload::Candidate(candidate) => self.add_ice_candidate(candidate).await.map(|_| None),
        }
    }

    /// Apply a remote description; offers and answers only
    pub async fn add_sdp(&self, description: SessionDescription) -> Result<Option<SessionDescription>> {
        self.apply_signal(SignalPayload::from_description(description)?).await
    }

    /// Apply a remote offer and answer it
    pub async fn add_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let transport = self.transport()?;
        transport.set_remote_description(offer).await?;
        self.drain_candidates(&transport).await;
        self.create_answer().await
    }

    /// Apply a remote answer
    pub async fn add_answer(&self, answer: SessionDescription) -> Result<()> {
        let transport = self.transport()?;
        transport.set_remote_description(answer).await?;
        self.drain_candidates(&transport).await;
        Ok(())
    }

    /// Create and apply a local offer
    pub async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let transport = self.transport()?;
        let offer = transport.create_offer(ice_restart).await?;
        transport.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Create and apply a local answer
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let transport = self.transport()?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Currently applied local description
    pub async fn local_description(&self) -> Option<SessionDescription> {
        match self.transport() {
            Ok(transport) => transport.local_description().await,
            Err(_) => None,
        }
    }

    /// Apply a remote candidate, or buffer it until a remote description
    /// exists
    ///
    /// Buffering because the transport does not exist yet still reports
    /// `NotInitialized`.
    pub async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        let Ok(transport) = self.transport() else {
            self.candidates.insert(candidate);
            return Err(SfuError::NotInitialized(format!(
                "connection {} has no transport, candidate buffered",
                self.id()
            )));
        };

        if transport.remote_description().await.is_some() {
            return transport.add_ice_candidate(candidate).await;
        }

        self.candidates.insert(candidate);
        tracing::debug!(connection = %self.id(), buffered = self.candidates.len(), "Buffered remote candidate");

        // the description may have landed while we were buffering
        if transport.remote_description().await.is_some() {
            self.drain_candidates(&transport).await;
        }
        Ok(())
    }

    /// Number of buffered remote candidates
    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    async fn drain_candidates(&self, transport: &Arc<dyn PeerTransport>) {
        for candidate in self.candidates.drain() {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                tracing::warn!(connection = %self.id(), error = %e, "Failed to apply buffered candidate");
            }
        }
    }

    /// Create a local video track carrying `track_id`
    pub async fn add_video_track(&self, track_id: &str, flavor: TrackFlavor) -> Result<()> {
        let codec = self.config.video_codec()?;
        self.add_track(TrackKind::Video, track_id, codec, flavor).await
    }

    /// Create a local audio track carrying `track_id`; audio is always Opus
    pub async fn add_audio_track(&self, track_id: &str, flavor: TrackFlavor) -> Result<()> {
        self.add_track(TrackKind::Audio, track_id, CodecType::Opus, flavor).await
    }

    async fn add_track(&self, kind: TrackKind, track_id: &str, codec: CodecType, flavor: TrackFlavor) -> Result<()> {
        let transport = self.transport()?;
        let spec = LocalTrackSpec {
            track_id: track_id.to_string(),
            codec,
            flavor,
            payload_type: self.payload_type_for(kind),
        };
        let (track, sender) = transport.add_track(&spec).await?;
        if let Some(previous) = self.tracks.insert(kind, track_id, TrackEntry { track, sender, codec }) {
            // a second add for the same stream leaves one sender behind
            if let Err(e) = transport.remove_track(previous.sender).await {
                tracing::debug!(connection = %self.id(), track = %track_id, error = %e, "Failed to detach replaced sender");
            }
        }
        tracing::debug!(connection = %self.id(), track = %track_id, kind = %kind, codec = %codec, "Local track added");
        Ok(())
    }

    /// Payload type hint applied to local tracks of `kind`; video only
    fn payload_type_for(&self, kind: TrackKind) -> Option<u8> {
        match kind {
            TrackKind::Video => self.config.payload_type,
            TrackKind::Audio => None,
        }
    }

    /// Remove the local video track carrying `track_id`
    pub async fn remove_video_track(&self, track_id: &str) -> Result<()> {
        self.remove_track(TrackKind::Video, track_id).await
    }

    /// Remove the local audio track carrying `track_id`
    pub async fn remove_audio_track(&self, track_id: &str) -> Result<()> {
        self.remove_track(TrackKind::Audio, track_id).await
    }

    async fn remove_track(&self, kind: TrackKind, track_id: &str) -> Result<()> {
        let transport = self.transport()?;
        let entry = self
            .tracks
            .remove(kind, track_id)
            .ok_or_else(|| SfuError::NotFound(format!("no local {} track {}", kind, track_id)))?;
        transport.remove_track(entry.sender).await
    }

    /// Swap the local video track behind `track_id`'s sender for a fresh one
    pub async fn replace_video_track(&self, track_id: &str, codec: Option<CodecType>) -> Result<()> {
        let codec = match codec {
            Some(codec) => codec,
            None => self.config.video_codec()?,
        };
        self.replace_track(TrackKind::Video, track_id, codec).await
    }

    /// Swap the local audio track behind `track_id`'s sender for a fresh one
    pub async fn replace_audio_track(&self, track_id: &str) -> Result<()> {
        self.replace_track(TrackKind::Audio, track_id, CodecType::Opus).await
    }

    async fn replace_track(&self, kind: TrackKind, track_id: &str, codec: CodecType) -> Result<()> {
        let transport = self.transport()?;
        let current = self
            .tracks
            .get(kind, track_id)
            .ok_or_else(|| SfuError::NotFound(format!("no local {} track {}", kind, track_id)))?;
        let spec = LocalTrackSpec {
            track_id: track_id.to_string(),
            codec,
            flavor: current.track.flavor(),
            payload_type: self.payload_type_for(kind),
        };
        let track = transport.replace_track(current.sender, &spec).await?;
        self.tracks.insert(
            kind,
            track_id,
            TrackEntry {
                track,
                sender: current.sender,
                codec,
            },
        );
        Ok(())
    }

    /// Write an RTP packet to the local video track `track_id`
    pub async fn write_video_rtp(&self, track_id: &str, packet: &RtpPacket) -> Result<()> {
        self.write(TrackKind::Video, track_id, Outbound::Rtp(packet)).await
    }

    /// Write an RTP packet to the local audio track `track_id`
    pub async fn write_audio_rtp(&self, track_id: &str, packet: &RtpPacket) -> Result<()> {
        self.write(TrackKind::Audio, track_id, Outbound::Rtp(packet)).await
    }

    /// Write a sample to the local video track `track_id`
    pub async fn write_video_sample(&self, track_id: &str, sample: &MediaSample) -> Result<()> {
        self.write(TrackKind::Video, track_id, Outbound::Sample(sample)).await
    }

    /// Write a sample to the local audio track `track_id`
    pub async fn write_audio_sample(&self, track_id: &str, sample: &MediaSample) -> Result<()> {
        self.write(TrackKind::Audio, track_id, Outbound::Sample(sample)).await
    }

    async fn write(&self, kind: TrackKind, track_id: &str, outbound: Outbound<'_>) -> Result<()> {
        if self.is_closed() {
            return Err(SfuError::NotInitialized(format!("connection {} is closed", self.id())));
        }
        let entry = self
            .tracks
            .get(kind, track_id)
            .ok_or_else(|| SfuError::NotFound(format!("no local {} track {}", kind, track_id)))?;
        entry.track.write(outbound).await?;
        self.tracks.mark_received(track_id);

        if self.options.trace_packets {
            tracing::trace!(connection = %self.id(), track = %track_id, kind = %kind, "Wrote to local track");
        }
        Ok(())
    }

    /// Ids of the local tracks of `kind`
    pub fn local_track_ids(&self, kind: TrackKind) -> Vec<String> {
        self.tracks.ids(kind)
    }

    /// Whether anything was written to the local track `track_id`
    pub fn is_received_data(&self, track_id: &str) -> bool {
        self.tracks.first_init(track_id) == Some(FirstInit::Receiving)
    }

    /// Lifecycle state of the local track `track_id`
    pub fn first_init_state(&self, track_id: &str) -> Option<FirstInit> {
        self.tracks.first_init(track_id)
    }

    /// Start the picture loss heartbeat for an inbound video track
    ///
    /// The first indication goes out immediately; the heartbeat stops when
    /// the connection closes, its transport is gone, or a newer video track
    /// takes over.
    pub fn handle_video_track(self: &Arc<Self>, remote: &Arc<dyn RemoteTrack>) {
        let ssrc = remote.ssrc();
        *self.remote_video_ssrc.lock() = Some(ssrc);

        let period = self.pli_interval();
        let connection: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.child_token();
        if let Some(previous) = self.heartbeat.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        let id = self.id().to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if connection.is_closed() {
                    break;
                }
                if let Err(e) = connection.write_rtcp(&[RtcpPacket::pli(ssrc)]).await {
                    tracing::debug!(connection = %id, ssrc, error = %e, "Stopping picture loss heartbeat");
                    break;
                }
            }
        });
        tracing::debug!(connection = %self.id(), track = %remote.id(), ssrc, "Picture loss heartbeat started");
    }

    /// Ask the publisher for a keyframe now
    pub async fn send_picture_loss_indication(&self) -> Result<()> {
        let ssrc = self.remote_video_ssrc()?;
        self.write_rtcp(&[RtcpPacket::pli(ssrc)]).await
    }

    /// Send a receiver bitrate estimate based on the bitrate hint
    pub async fn send_bitrate_estimate(&self) -> Result<()> {
        let ssrc = self.remote_video_ssrc()?;
        self.write_rtcp(&[RtcpPacket::remb(self.config.bitrate_kbps(), ssrc)]).await
    }

    fn remote_video_ssrc(&self) -> Result<u32> {
        self.remote_video_ssrc
            .lock()
            .ok_or_else(|| SfuError::NotFound(format!("connection {} has no remote video", self.id())))
    }

    async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<()> {
        if self.is_closed() {
            return Err(SfuError::NotInitialized(format!("connection {} is closed", self.id())));
        }
        self.transport()?.write_rtcp(packets).await
    }

    /// Heartbeat period for video tracks received from now on
    pub fn pli_interval(&self) -> Duration {
        *self.pli_interval.lock()
    }

    /// Change the heartbeat period for video tracks received from now on
    pub fn set_pli_interval(&self, period: Duration) {
        *self.pli_interval.lock() = period;
    }

    /// Record `tag`; `DuplicateSuppressed` if it is already live
    ///
    /// Tags expire on their own after the configured lifetime.
    pub fn add_duplicated(&self, tag: &str) -> Result<()> {
        let generation = self.duplicate_generation.fetch_add(1, Ordering::AcqRel);
        {
            let mut duplicates = self.duplicates.lock();
            if duplicates.contains_key(tag) {
                return Err(SfuError::DuplicateSuppressed(tag.to_string()));
            }
            duplicates.insert(tag.to_string(), generation);
        }

        let duplicates = Arc::downgrade(&self.duplicates);
        let cancel = self.cancel.child_token();
        let ttl = self.options.duplicate_ttl;
        let tag = tag.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(ttl) => {
                    if let Some(duplicates) = duplicates.upgrade() {
                        let mut duplicates = duplicates.lock();
                        if duplicates.get(&tag) == Some(&generation) {
                            duplicates.remove(&tag);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Whether `tag` is live
    pub fn is_duplicated(&self, tag: &str) -> bool {
        self.duplicates.lock().contains_key(tag)
    }

    /// Drop `tag` before it expires
    pub fn delete_duplicated(&self, tag: &str) {
        self.duplicates.lock().remove(tag);
    }

    /// Tear everything down; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.candidates.clear();
        self.tracks.clear();
        self.duplicates.lock().clear();

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                tracing::warn!(connection = %self.id(), error = %e, "Transport close failed");
            }
        }
        tracing::info!(connection = %self.id(), cookie = %self.cookie, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use testresult::TestResult;
    use tokio_test::{assert_err, assert_ok};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        media::rtp::RtpHeader,
        transport::memory::{MemoryRemoteTrack, MemoryTransportFactory},
    };

    async fn connected(role: Role) -> (Arc<Connection>, Arc<MemoryTransportFactory>) {
        let factory = Arc::new(MemoryTransportFactory::new());
        let connection = Connection::new(ConnectionConfig::new("pc-1", role), ConnectionOptions::default());
        let _events = connection.init(factory.as_ref()).await.expect("init");
        (connection, factory)
    }

    #[tokio::test]
    async fn test_candidates_before_transport_are_kept() -> TestResult {
        let factory = MemoryTransportFactory::new();
        let connection = Connection::new(ConnectionConfig::new("pc-1", Role::Up), ConnectionOptions::default());

        let early = connection.add_ice_candidate(IceCandidateInit::new("c0")).await;
        assert!(matches!(early, Err(SfuError::NotInitialized(_))));
        assert_eq!(connection.buffered_candidates(), 1);

        let _events = connection.init(&factory).await?;
        connection.add_ice_candidate(IceCandidateInit::new("c1")).await?;
        connection.add_offer(SessionDescription::offer("v=0")).await?;

        let transport = factory.for_connection("pc-1").expect("transport");
        let applied: Vec<_> = transport.applied_candidates().into_iter().map(|c| c.candidate).collect();
        assert_eq!(applied, vec!["c0", "c1"]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_buffered_candidates_apply_once_in_order() -> TestResult {
        let (connection, factory) = connected(Role::Down).await;
        for name in ["c1", "c2", "c3", "c2"] {
            connection.add_ice_candidate(IceCandidateInit::new(name)).await?;
        }
        assert_eq!(connection.buffered_candidates(), 3);
        assert!(logs_contain("Buffered remote candidate"));

        connection.create_offer(false).await?;
        connection.add_sdp(SessionDescription::answer("v=0")).await?;
        connection.add_ice_candidate(IceCandidateInit::new("c4")).await?;

        let transport = factory.for_connection("pc-1").expect("transport");
        let applied: Vec<_> = transport.applied_candidates().into_iter().map(|c| c.candidate).collect();
        assert_eq!(applied, vec!["c1", "c2", "c3", "c4"]);
        assert_eq!(connection.buffered_candidates(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_offer_produces_answer_and_answer_does_not() -> TestResult {
        let (connection, _factory) = connected(Role::Up).await;

        let answer = connection
            .apply_signal(SignalPayload::Offer(SessionDescription::offer("v=0")))
            .await?;
        assert!(answer.is_some());
        assert_eq!(connection.local_description().await, answer);

        let none = connection.add_sdp(SessionDescription::answer("v=0")).await?;
        assert!(none.is_none());

        let rollback = SessionDescription {
            sdp_type: crate::signaling::SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            connection.add_sdp(rollback).await,
            Err(SfuError::InvalidInput(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_mark_connected_once_and_clears_buffer() -> TestResult {
        let (connection, _factory) = connected(Role::Up).await;
        connection.add_ice_candidate(IceCandidateInit::new("c1")).await?;

        assert!(connection.mark_connected());
        assert!(!connection.mark_connected());
        assert!(connection.is_connected());
        assert_eq!(connection.buffered_candidates(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_local_tracks_write_and_replace() -> TestResult {
        let (connection, factory) = connected(Role::Down).await;
        connection.add_video_track("cam-1", TrackFlavor::Rtp).await?;
        connection.add_audio_track("mic-1", TrackFlavor::Sample).await?;
        assert_eq!(connection.first_init_state("cam-1"), Some(FirstInit::Created));

        let packet = RtpPacket::new(RtpHeader::new(98, 1, 1, 1), Bytes::from_static(&[0x08]));
        connection.write_video_rtp("cam-1", &packet).await?;
        assert!(connection.is_received_data("cam-1"));
        assert_err!(connection.write_audio_rtp("mic-1", &packet).await);
        assert_ok!(
            connection
                .write_audio_sample("mic-1", &MediaSample::new(Bytes::from_static(b"s"), Duration::from_millis(20)))
                .await
        );

        let transport = factory.for_connection("pc-1").expect("transport");
        let track = transport.track("cam-1").expect("video track");
        assert_eq!(track.packets().len(), 1);
        assert_eq!(track.spec().codec, CodecType::Vp9);
        assert_eq!(transport.track("mic-1").expect("audio").spec().codec, CodecType::Opus);

        connection.replace_video_track("cam-1", Some(CodecType::H264)).await?;
        let replaced = transport.track("cam-1").expect("replaced track");
        assert_eq!(replaced.spec().codec, CodecType::H264);
        assert_eq!(transport.sender_count(), 2);

        connection.remove_video_track("cam-1").await?;
        assert!(matches!(
            connection.write_video_rtp("cam-1", &packet).await,
            Err(SfuError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_payload_type_hint_applies_to_video_only() -> TestResult {
        let factory = Arc::new(MemoryTransportFactory::new());
        let config = ConnectionConfig::new("pc-1", Role::Down).with_payload_type(100);
        let connection = Connection::new(config, ConnectionOptions::default());
        let _events = connection.init(factory.as_ref()).await?;
        connection.add_video_track("cam-1", TrackFlavor::Rtp).await?;
        connection.add_audio_track("mic-1", TrackFlavor::Rtp).await?;

        let transport = factory.for_connection("pc-1").expect("transport");
        assert_eq!(transport.track("cam-1").expect("video").spec().payload_type, Some(100));
        assert_eq!(transport.track("mic-1").expect("audio").spec().payload_type, None);

        connection.replace_video_track("cam-1", Some(CodecType::H264)).await?;
        assert_eq!(transport.track("cam-1").expect("replaced").spec().payload_type, Some(100));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pli_heartbeat_runs_until_close() -> TestResult {
        let (connection, factory) = connected(Role::Up).await;
        connection.set_pli_interval(Duration::from_secs(5));
        let remote: Arc<dyn RemoteTrack> = MemoryRemoteTrack::new("cam", CodecType::Vp8, 77);
        connection.handle_video_track(&remote);

        tokio::time::sleep(Duration::from_millis(12_500)).await;
        let transport = factory.for_connection("pc-1").expect("transport");
        assert_eq!(transport.rtcp_packets(), vec![RtcpPacket::pli(77); 3]);

        connection.send_picture_loss_indication().await?;
        assert_eq!(transport.rtcp_packets().len(), 4);

        connection.close().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.rtcp_packets().len(), 4);
        assert!(matches!(
            connection.send_picture_loss_indication().await,
            Err(SfuError::NotInitialized(_))
        ));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_video_track_replaces_heartbeat() -> TestResult {
        let (connection, factory) = connected(Role::Up).await;
        connection.set_pli_interval(Duration::from_secs(5));
        let first: Arc<dyn RemoteTrack> = MemoryRemoteTrack::new("cam-a", CodecType::Vp8, 77);
        connection.handle_video_track(&first);
        tokio::time::sleep(Duration::from_millis(7_500)).await;

        let second: Arc<dyn RemoteTrack> = MemoryRemoteTrack::new("cam-b", CodecType::Vp8, 78);
        connection.handle_video_track(&second);
        tokio::time::sleep(Duration::from_millis(12_500)).await;

        let transport = factory.for_connection("pc-1").expect("transport");
        let mut expected = vec![RtcpPacket::pli(77); 2];
        expected.extend(vec![RtcpPacket::pli(78); 3]);
        assert_eq!(transport.rtcp_packets(), expected);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_tags_expire() -> TestResult {
        let (connection, _factory) = connected(Role::Up).await;
        connection.add_duplicated("offer")?;
        let again = connection.add_duplicated("offer");
        assert!(again.as_ref().is_err_and(|e| e.is_soft()));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!connection.is_duplicated("offer"));
        connection.add_duplicated("offer")?;
        connection.delete_duplicated("offer");
        assert!(!connection.is_duplicated("offer"));
        Ok(())
    }

    #[tokio::test]
    async fn test_close_is_idempotent() -> TestResult {
        let (connection, factory) = connected(Role::Up).await;
        connection.close().await;
        connection.close().await;

        assert!(connection.is_closed());
        assert!(factory.for_connection("pc-1").expect("transport").is_closed());
        assert!(matches!(
            connection.create_offer(false).await,
            Err(SfuError::NotInitialized(_))
        ));
        Ok(())
    }
}
