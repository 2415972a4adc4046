// Media module for the SFU
//
// This module defines the units moved through the fan-out engine and the
// codec-level helpers used to inspect them.

pub mod codec;
pub mod frame;
pub mod keyframe;
pub mod rtp;

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{media::rtp::RtpPacket, Result, SfuError};

/// Media track kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl TrackKind {
    /// Lowercase name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of data moved through a forwarder
///
/// Cloning is cheap: the raw bytes and the decoded payload share their
/// buffers, so every consumer gets its own value without copying packet data.
#[derive(Debug, Clone)]
pub struct Wrapper {
    /// Raw packet bytes as read from the network
    pub data: Bytes,
    /// Decoded RTP packet, filled lazily
    pub packet: Option<RtpPacket>,
    /// Kind of the stream this packet belongs to
    pub kind: Option<TrackKind>,
}

impl Wrapper {
    /// Wrap raw packet bytes
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            packet: None,
            kind: None,
        }
    }

    /// Wrap an already decoded packet
    pub fn from_packet(packet: RtpPacket) -> Self {
        Self {
            data: packet.serialize(),
            packet: Some(packet),
            kind: None,
        }
    }

    /// Tag the wrapper with its stream kind
    pub fn with_kind(mut self, kind: TrackKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Decode the raw bytes if that has not happened yet
    pub fn decode(&mut self) -> Result<&RtpPacket> {
        if self.packet.is_none() {
            self.packet = Some(RtpPacket::parse_bytes(&self.data)?);
        }
        self.rtp()
    }

    /// The decoded packet
    pub fn rtp(&self) -> Result<&RtpPacket> {
        self.packet
            .as_ref()
            .ok_or_else(|| SfuError::InvalidInput("wrapper holds no decoded packet".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::media::rtp::RtpHeader;

    #[test]
    fn test_decode_is_lazy_and_cached() -> TestResult {
        let packet = RtpPacket::new(RtpHeader::new(96, 7, 9000, 0xdead_beef), Bytes::from_static(b"abc"));
        let mut wrapper = Wrapper::new(packet.serialize()).with_kind(TrackKind::Video);
        assert!(wrapper.rtp().is_err());

        let decoded = wrapper.decode()?;
        assert_eq!(decoded.header.ssrc, 0xdead_beef);
        assert_eq!(decoded.header.sequence_number, 7);
        assert!(wrapper.packet.is_some());
        assert_eq!(wrapper.kind, Some(TrackKind::Video));
        Ok(())
    }

    #[test]
    fn test_decode_rejects_short_data() {
        let mut wrapper = Wrapper::new(Bytes::from_static(&[0x80, 0x60]));
        assert!(matches!(wrapper.decode(), Err(SfuError::InvalidInput(_))));
    }
}
