// Media sample module for the SFU
//
// This module defines the sample-level unit written to sample-based local
// tracks, as opposed to raw RTP packets.

use std::time::Duration;

use bytes::Bytes;

/// A media sample ready to be packetized by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSample {
    /// Encoded frame data
    pub data: Bytes,
    /// Duration of the sample
    pub duration: Duration,
    /// Number of packets lost before this sample, if known
    pub packets_lost: u16,
}

impl MediaSample {
    /// Create a new sample
    pub fn new(data: Bytes, duration: Duration) -> Self {
        Self {
            data,
            duration,
            packets_lost: 0,
        }
    }
}
