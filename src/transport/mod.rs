// Transport module for the SFU
//
// This module defines the seam between the forwarding core and the media
// transport (ICE, DTLS, SRTP and SDP negotiation). The core only sees the
// traits below: it applies descriptions and candidates, writes packets or
// samples to local tracks, reads raw packets from remote tracks, and reacts
// to the events a transport reports.

pub mod memory;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    feedback::RtcpPacket,
    media::{codec::CodecType, frame::MediaSample, rtp::RtpPacket, TrackKind},
    session::IceState,
    signaling::{IceCandidateInit, SessionDescription},
    Result, SfuError,
};

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    /// Server urls
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// How a transport should set up its data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelMode {
    /// Open a channel with this label from the server side
    CreateLocally(String),
    /// Wait for the remote side to open one
    AwaitRemote,
}

/// Everything a factory needs to build one transport
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Logical connection id, for logging
    pub connection_id: String,
    /// STUN/TURN servers
    pub ice_servers: Vec<IceServer>,
    /// Data channel setup; `None` for media connections
    pub data_channel: Option<DataChannelMode>,
}

/// Event reported by a transport
pub enum TransportEvent {
    /// ICE connectivity changed
    IceConnectionStateChange(IceState),
    /// A local candidate was gathered
    IceCandidate(IceCandidateInit),
    /// The remote side started sending a track
    Track(Arc<dyn RemoteTrack>),
    /// Renegotiation is required
    NegotiationNeeded,
    /// A data channel opened
    DataChannel(Arc<dyn DataChannel>),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::IceConnectionStateChange(state) => write!(f, "IceConnectionStateChange({})", state),
            TransportEvent::IceCandidate(candidate) => write!(f, "IceCandidate({})", candidate.candidate),
            TransportEvent::Track(track) => write!(f, "Track({}, {})", track.id(), track.kind()),
            TransportEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            TransportEvent::DataChannel(channel) => write!(f, "DataChannel({})", channel.label()),
        }
    }
}

/// Builds transports for new connections
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a transport and the stream of events it reports
    async fn create(
        &self,
        settings: TransportSettings,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<TransportEvent>)>;
}

/// Handle of a sender attached to a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

/// Whether a local track takes RTP packets or whole samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackFlavor {
    /// Forwarded RTP packets
    Rtp,
    /// Encoded samples packetized by the transport
    Sample,
}

/// Description of a local track to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrackSpec {
    /// Track id, the stream id the track carries
    pub track_id: String,
    /// Codec of the track
    pub codec: CodecType,
    /// Packet or sample track
    pub flavor: TrackFlavor,
    /// RTP payload type to negotiate, transport default when absent
    pub payload_type: Option<u8>,
}

/// Connection-level transport operations
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Apply the remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Currently applied remote description
    async fn remote_description(&self) -> Option<SessionDescription>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Currently applied local description
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Create an offer
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()>;

    /// Create a local track and attach it to a new sender
    async fn add_track(&self, spec: &LocalTrackSpec) -> Result<(LocalTrack, SenderId)>;

    /// Swap the track behind an existing sender
    async fn replace_track(&self, sender: SenderId, spec: &LocalTrackSpec) -> Result<LocalTrack>;

    /// Detach a sender
    async fn remove_track(&self, sender: SenderId) -> Result<()>;

    /// Send RTCP feedback
    async fn write_rtcp(&self, packets: &[RtcpPacket]) -> Result<()>;

    /// Release every transport resource
    async fn close(&self) -> Result<()>;
}

/// Inbound media track
#[async_trait]
pub trait RemoteTrack: Send + Sync {
    /// Transport-assigned track id
    fn id(&self) -> &str;

    /// Media kind
    fn kind(&self) -> TrackKind;

    /// Negotiated codec
    fn codec(&self) -> CodecType;

    /// SSRC of the sender
    fn ssrc(&self) -> u32;

    /// Read one raw packet into `buf`, returning its length
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
}

/// Opened data channel
pub trait DataChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Negotiated channel id
    fn id(&self) -> Option<u16>;
}

/// Write capability of a packet-level local track
#[async_trait]
pub trait RtpWriter: Send + Sync {
    /// Write one RTP packet
    async fn write_rtp(&self, packet: &RtpPacket) -> Result<()>;
}

/// Write capability of a sample-level local track
#[async_trait]
pub trait SampleWriter: Send + Sync {
    /// Write one media sample
    async fn write_sample(&self, sample: &MediaSample) -> Result<()>;
}

/// Outbound unit for a local track
#[derive(Debug, Clone, Copy)]
pub enum Outbound<'a> {
    /// RTP packet
    Rtp(&'a RtpPacket),
    /// Media sample
    Sample(&'a MediaSample),
}

/// Local track, resolved to its flavor when created
#[derive(Clone)]
pub enum LocalTrack {
    /// Takes RTP packets
    Rtp(Arc<dyn RtpWriter>),
    /// Takes media samples
    Sample(Arc<dyn SampleWriter>),
}

impl LocalTrack {
    /// Flavor of the track
    pub fn flavor(&self) -> TrackFlavor {
        match self {
            LocalTrack::Rtp(_) => TrackFlavor::Rtp,
            LocalTrack::Sample(_) => TrackFlavor::Sample,
        }
    }

    /// Write `outbound`, which must match the track's flavor
    pub async fn write(&self, outbound: Outbound<'_>) -> Result<()> {
        match (self, outbound) {
            (LocalTrack::Rtp(writer), Outbound::Rtp(packet)) => writer.write_rtp(packet).await,
            (LocalTrack::Sample(writer), Outbound::Sample(sample)) => writer.write_sample(sample).await,
            (track, _) => Err(SfuError::InvalidInput(format!(
                "cannot write that to a {:?} track",
                track.flavor()
            ))),
        }
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalTrack::{:?}", self.flavor())
    }
}
