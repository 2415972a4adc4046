// Feedback module for the SFU
//
// This module defines the RTCP feedback a connection sends upstream to its
// publisher: periodic and on-demand picture loss indications, and receiver
// bitrate estimates derived from the configured bitrate hint.

use std::fmt;

/// Default bitrate hint in kbps when a connection does not configure one
pub const DEFAULT_BITRATE_KBPS: u32 = 200;

/// RTCP feedback written to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpPacket {
    /// Picture loss indication, asking the sender for a new keyframe
    PictureLossIndication {
        /// SSRC of the media sender the request targets
        media_ssrc: u32,
    },
    /// Receiver estimated maximum bitrate
    ReceiverEstimatedMaximumBitrate {
        /// Estimated bitrate in bits per second
        bitrate: f32,
        /// SSRCs the estimate applies to
        ssrcs: Vec<u32>,
    },
}

impl RtcpPacket {
    /// Ask `media_ssrc` for a keyframe
    pub fn pli(media_ssrc: u32) -> Self {
        RtcpPacket::PictureLossIndication { media_ssrc }
    }

    /// Estimate of `kbps` kilobits per second for `ssrc`
    pub fn remb(kbps: u32, ssrc: u32) -> Self {
        RtcpPacket::ReceiverEstimatedMaximumBitrate {
            bitrate: (kbps as f32) * 1024.0,
            ssrcs: vec![ssrc],
        }
    }
}

impl fmt::Display for RtcpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtcpPacket::PictureLossIndication { media_ssrc } => write!(f, "PLI(ssrc={})", media_ssrc),
            RtcpPacket::ReceiverEstimatedMaximumBitrate { bitrate, ssrcs } => {
                write!(f, "REMB(bitrate={}, ssrcs={:?})", bitrate, ssrcs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remb_scales_kbps() {
        let packet = RtcpPacket::remb(DEFAULT_BITRATE_KBPS, 42);
        assert_eq!(
            packet,
            RtcpPacket::ReceiverEstimatedMaximumBitrate {
                bitrate: 204_800.0,
                ssrcs: vec![42],
            }
        );
        assert_eq!(RtcpPacket::pli(7).to_string(), "PLI(ssrc=7)");
    }
}
