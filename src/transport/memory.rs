// In-memory transport for the SFU
//
// This module implements the transport traits without any networking. Every
// operation is recorded so tests and the loopback demo can drive a worker
// end to end: events are injected with `emit`, inbound media with
// `MemoryRemoteTrack::feed`, and whatever the core writes is kept on the
// `MemoryTrack`s it created.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    feedback::RtcpPacket,
    media::{codec::CodecType, frame::MediaSample, rtp::RtpPacket, TrackKind},
    session::IceState,
    signaling::{IceCandidateInit, SdpType, SessionDescription},
    transport::{
        DataChannel, LocalTrack, LocalTrackSpec, PeerTransport, RemoteTrack, RtpWriter,
        SampleWriter, SenderId, TrackFlavor, TransportEvent, TransportFactory, TransportSettings,
    },
    Result, SfuError,
};

/// Depth of the event queue of every memory transport
const EVENT_CAPACITY: usize = 256;

/// Factory that keeps every transport it built
#[derive(Default)]
pub struct MemoryTransportFactory {
    transports: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryTransportFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport built so far, oldest first
    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        self.transports.lock().clone()
    }

    /// Most recent transport built for `connection_id`
    pub fn for_connection(&self, connection_id: &str) -> Option<Arc<MemoryTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|transport| transport.settings.connection_id == connection_id)
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(
        &self,
        settings: TransportSettings,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<TransportEvent>)> {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let transport = Arc::new(MemoryTransport::new(settings, events));
        self.transports.lock().push(transport.clone());
        Ok((transport, rx))
    }
}

/// Transport that records what the core does with it
pub struct MemoryTransport {
    settings: TransportSettings,
    events: mpsc::Sender<TransportEvent>,
    remote: Mutex<Option<SessionDescription>>,
    local: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidateInit>>,
    rtcp: Mutex<Vec<RtcpPacket>>,
    senders: Mutex<HashMap<SenderId, Arc<MemoryTrack>>>,
    next_sender: AtomicU64,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn new(settings: TransportSettings, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            settings,
            events,
            remote: Mutex::new(None),
            local: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            rtcp: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Settings the transport was built with
    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Report an event to the owning connection
    pub async fn emit(&self, event: TransportEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| SfuError::TransportFailure("event receiver is gone".to_string()))
    }

    /// Report an ICE connectivity change
    pub async fn set_ice_state(&self, state: IceState) -> Result<()> {
        self.emit(TransportEvent::IceConnectionStateChange(state)).await
    }

    /// Remote candidates applied so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidateInit> {
        self.candidates.lock().clone()
    }

    /// RTCP packets written so far
    pub fn rtcp_packets(&self) -> Vec<RtcpPacket> {
        self.rtcp.lock().clone()
    }

    /// Track currently attached under `track_id`
    pub fn track(&self, track_id: &str) -> Option<Arc<MemoryTrack>> {
        self.senders
            .lock()
            .values()
            .find(|track| track.spec.track_id == track_id)
            .cloned()
    }

    /// Number of attached senders
    pub fn sender_count(&self) -> usize {
        self.senders.lock().len()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SfuError::TransportFailure(format!(
                "transport of {} is closed",
                self.settings.connection_id
            )));
        }
        Ok(())
    }

    fn attach(&self, spec: &LocalTrackSpec) -> (LocalTrack, Arc<MemoryTrack>) {
        let track = Arc::new(MemoryTrack::new(spec.clone()));
        let local = match spec.flavor {
            TrackFlavor::Rtp => LocalTrack::Rtp(track.clone()),
            TrackFlavor::Sample => LocalTrack::Sample(track.clone()),
        };
        (local, track)
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.ensure_open()?;
        let restart = if ice_restart { " ice-restart" } else { "" };
        Ok(SessionDescription::offer(format!(
            "v=0 memory offer {}{}",
            self.settings.connection_id, restart
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        match self.remote.lock().as_ref() {
            Some(remote) if remote.sdp_type == SdpType::Offer => Ok(SessionDescription::answer(format!(
                "v=0 memory answer {}",
                self.settings.connection_id
            ))),
            _ => Err(SfuError::TransportFailure("no remote offer to answer".to_string())),
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        self.ensure_open()?;
        if self.remote.lock().is_none() {
            return Err(SfuError::TransportFailure("remote description not set".to_string()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_track(&self, spec: &LocalTrackSpec) -> Result<(LocalTrack, SenderId)> {
        self.ensure_open()?;
        let (local, track) = self.attach(spec);
        let sender = SenderId(self.next_sender.fetch_add(1, Ordering::AcqRel));
        self.senders.lock().insert(sender, track);
        Ok((local, sender))
    }

    async fn replace_track(&self, sender: SenderId, spec: &LocalTrackSpec) -> Result<LocalTrack> {
        self.ensure_open()?;
        let (local, track) = self.attach(spec);
        let mut senders = self.senders.lock();
        let slot = senders
            .get_mut(&sender)
            .ok_or_else(|| SfuError::NotFound(format!("sender {:?}", sender)))?;
        *slot = track;
        Ok(local)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        self.ensure_open()?;
        self.senders
            .lock()
            .remove(&sender)
            .map(|_| ())
            .ok_or_else(|| SfuError::NotFound(format!("sender {:?}", sender)))
    }

    async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<()> {
        self.ensure_open()?;
        self.rtcp.lock().extend_from_slice(packets);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self
            .events
            .try_send(TransportEvent::IceConnectionStateChange(IceState::Closed));
        Ok(())
    }
}

/// Local track that keeps everything written to it
pub struct MemoryTrack {
    spec: LocalTrackSpec,
    packets: Mutex<Vec<RtpPacket>>,
    samples: Mutex<Vec<MediaSample>>,
    failing: AtomicBool,
    stalled: AtomicBool,
}

impl MemoryTrack {
    fn new(spec: LocalTrackSpec) -> Self {
        Self {
            spec,
            packets: Mutex::new(Vec::new()),
            samples: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
        }
    }

    /// Spec the track was created from
    pub fn spec(&self) -> &LocalTrackSpec {
        &self.spec
    }

    /// RTP packets written so far
    pub fn packets(&self) -> Vec<RtpPacket> {
        self.packets.lock().clone()
    }

    /// Samples written so far
    pub fn samples(&self) -> Vec<MediaSample> {
        self.samples.lock().clone()
    }

    /// Make every following write fail
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Make every following write hang until it is dropped
    pub fn stall_writes(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    async fn check_writable(&self) -> Result<()> {
        if self.stalled.load(Ordering::Acquire) {
            futures::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(SfuError::TransportFailure(format!(
                "write to track {} failed",
                self.spec.track_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RtpWriter for MemoryTrack {
    async fn write_rtp(&self, packet: &RtpPacket) -> Result<()> {
        self.check_writable().await?;
        self.packets.lock().push(packet.clone());
        Ok(())
    }
}

#[async_trait]
impl SampleWriter for MemoryTrack {
    async fn write_sample(&self, sample: &MediaSample) -> Result<()> {
        self.check_writable().await?;
        self.samples.lock().push(sample.clone());
        Ok(())
    }
}

/// Inbound track fed by hand
pub struct MemoryRemoteTrack {
    id: String,
    codec: CodecType,
    ssrc: u32,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl MemoryRemoteTrack {
    /// Create a track; its kind follows the codec
    pub fn new(id: impl Into<String>, codec: CodecType, ssrc: u32) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        Arc::new(Self {
            id: id.into(),
            codec,
            ssrc,
            rx: tokio::sync::Mutex::new(rx),
            tx: Mutex::new(Some(tx)),
        })
    }

    /// Queue one raw packet for the reader
    pub async fn feed(&self, data: Bytes) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| SfuError::TransportFailure(format!("track {} finished", self.id)))?;
        tx.send(data)
            .await
            .map_err(|_| SfuError::TransportFailure(format!("track {} has no reader", self.id)))
    }

    /// End the track; the reader sees an error once the queue is drained
    pub fn finish(&self) {
        self.tx.lock().take();
    }
}

#[async_trait]
impl RemoteTrack for MemoryRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.codec.kind()
    }

    fn codec(&self) -> CodecType {
        self.codec
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let data = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SfuError::TransportFailure(format!("track {} ended", self.id)))?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }
}

/// Data channel with a fixed label
#[derive(Debug, Clone)]
pub struct MemoryDataChannel {
    label: String,
    id: Option<u16>,
}

impl MemoryDataChannel {
    /// Create a channel
    pub fn new(label: impl Into<String>, id: Option<u16>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            id,
        })
    }
}

impl DataChannel for MemoryDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> Option<u16> {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[tokio::test]
    async fn test_candidates_need_remote_description() -> TestResult {
        let factory = MemoryTransportFactory::new();
        let (transport, _events) = factory
            .create(TransportSettings {
                connection_id: "pc-1".to_string(),
                ice_servers: Vec::new(),
                data_channel: None,
            })
            .await?;

        assert!(transport.add_ice_candidate(IceCandidateInit::new("c1")).await.is_err());
        transport.set_remote_description(SessionDescription::offer("v=0")).await?;
        transport.add_ice_candidate(IceCandidateInit::new("c1")).await?;
        assert!(transport.create_answer().await.is_ok());

        let memory = factory.for_connection("pc-1").expect("recorded");
        assert_eq!(memory.applied_candidates().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_track_reads_until_finished() -> TestResult {
        let track = MemoryRemoteTrack::new("cam", CodecType::Vp8, 7);
        track.feed(Bytes::from_static(b"abcdef")).await?;
        track.finish();

        let mut buf = [0u8; 4];
        assert_eq!(track.read(&mut buf).await?, 4);
        assert_eq!(&buf, b"abcd");
        assert!(track.read(&mut buf).await.is_err());
        assert!(track.feed(Bytes::new()).await.is_err());
        Ok(())
    }
}
