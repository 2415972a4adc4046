// RTP packet module for the SFU
//
// This module decodes and encodes the fixed RTP header so forwarders can read
// the source identity and payload of the packets they fan out.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, SfuError};

/// Size of the fixed RTP header
pub const RTP_HEADER_LEN: usize = 12;

/// RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,
    /// Payload data
    pub payload: Bytes,
}

/// RTP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Marker bit
    pub marker: bool,
    /// Payload type
    pub payload_type: u8,
    /// Sequence number
    pub sequence_number: u16,
    /// Timestamp
    pub timestamp: u32,
    /// SSRC identifier
    pub ssrc: u32,
    /// CSRC identifiers
    pub csrc: Vec<u32>,
    /// Header extension
    pub extension: Option<RtpExtension>,
}

/// RTP extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    /// Extension profile
    pub profile: u16,
    /// Extension data, a multiple of four bytes
    pub data: Bytes,
}

impl RtpHeader {
    /// Create a version 2 header with no CSRCs and no extension
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
        }
    }

    /// Encoded length of the header
    pub fn encoded_len(&self) -> usize {
        RTP_HEADER_LEN
            + self.csrc.len() * 4
            + self.extension.as_ref().map_or(0, |ext| 4 + ext.data.len())
    }
}

impl RtpPacket {
    /// Create a new RTP packet
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Read the SSRC without decoding the rest of the packet
    pub fn peek_ssrc(data: &[u8]) -> Option<u32> {
        data.get(8..12)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Parse an RTP packet from a byte slice, copying it once
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::parse_bytes(&Bytes::copy_from_slice(data))
    }

    /// Parse an RTP packet, slicing the payload out of `data` without copying
    pub fn parse_bytes(data: &Bytes) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(SfuError::InvalidInput("RTP packet too short".to_string()));
        }

        let version = (data[0] >> 6) & 0x03;
        if version != 2 {
            return Err(SfuError::InvalidInput(format!("unsupported RTP version {}", version)));
        }
        let padding = (data[0] >> 5) & 0x01 != 0;
        let has_extension = (data[0] >> 4) & 0x01 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;

        let marker = (data[1] >> 7) & 0x01 != 0;
        let payload_type = data[1] & 0x7F;

        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN;

        if offset + csrc_count * 4 > data.len() {
            return Err(SfuError::InvalidInput("RTP packet too short for CSRC".to_string()));
        }
        let csrc = (0..csrc_count)
            .map(|i| {
                let at = offset + i * 4;
                u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
            })
            .collect();
        offset += csrc_count * 4;

        let mut extension = None;
        if has_extension {
            if offset + 4 > data.len() {
                return Err(SfuError::InvalidInput("RTP packet too short for extension".to_string()));
            }

            let profile = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize * 4;
            offset += 4;

            if offset + length > data.len() {
                return Err(SfuError::InvalidInput(
                    "RTP packet too short for extension data".to_string(),
                ));
            }

            extension = Some(RtpExtension {
                profile,
                data: data.slice(offset..offset + length),
            });
            offset += length;
        }

        let mut end = data.len();
        if padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(SfuError::InvalidInput("invalid RTP padding".to_string()));
            }
            end -= pad;
        }

        let header = RtpHeader {
            version,
            padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
        };

        Ok(Self::new(header, data.slice(offset..end)))
    }

    /// Serialize the RTP packet to bytes
    ///
    /// Padding is never emitted; the padding flag is cleared on the wire.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.encoded_len() + self.payload.len());

        // First byte: version, extension, CSRC count
        let b0 = (self.header.version << 6)
            | ((self.header.extension.is_some() as u8) << 4)
            | (self.header.csrc.len() as u8 & 0x0F);
        buf.put_u8(b0);

        // Second byte: marker, payload type
        let b1 = ((self.header.marker as u8) << 7) | (self.header.payload_type & 0x7F);
        buf.put_u8(b1);

        buf.put_u16(self.header.sequence_number);
        buf.put_u32(self.header.timestamp);
        buf.put_u32(self.header.ssrc);

        for csrc_id in &self.header.csrc {
            buf.put_u32(*csrc_id);
        }

        if let Some(ext) = &self.header.extension {
            buf.put_u16(ext.profile);
            buf.put_u16((ext.data.len() / 4) as u16);
            buf.put_slice(&ext.data);
        }

        buf.put_slice(&self.payload);

        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[test]
    fn test_parse_reads_header_fields() -> TestResult {
        let mut header = RtpHeader::new(98, 0xBEEF, 123_456, 0x0102_0304);
        header.marker = true;
        header.csrc = vec![7, 8];
        header.extension = Some(RtpExtension {
            profile: 0xBEDE,
            data: Bytes::from_static(&[1, 2, 3, 4]),
        });
        let wire = RtpPacket::new(header.clone(), Bytes::from_static(b"payload")).serialize();

        let parsed = RtpPacket::parse_bytes(&wire)?;
        assert_eq!(parsed.header, header);
        assert_eq!(&parsed.payload[..], b"payload");
        assert_eq!(RtpPacket::peek_ssrc(&wire), Some(0x0102_0304));
        Ok(())
    }

    #[test]
    fn test_parse_strips_padding() -> TestResult {
        let mut wire = RtpPacket::new(RtpHeader::new(96, 1, 1, 1), Bytes::from_static(b"ab"))
            .serialize()
            .to_vec();
        wire[0] |= 0x20;
        wire.extend_from_slice(&[0, 0, 3]);

        let parsed = RtpPacket::parse(&wire)?;
        assert!(parsed.header.padding);
        assert_eq!(&parsed.payload[..], b"ab");
        Ok(())
    }

    #[test]
    fn test_parse_rejects_truncated_csrc() {
        let mut wire = RtpPacket::new(RtpHeader::new(96, 1, 1, 1), Bytes::new())
            .serialize()
            .to_vec();
        wire[0] |= 0x03;
        assert!(RtpPacket::parse(&wire).is_err());
        assert!(RtpPacket::parse(&wire[..4]).is_err());
        assert_eq!(RtpPacket::peek_ssrc(&wire[..4]), None);
    }
}
