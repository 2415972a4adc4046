// Keyframe detection module for the SFU
//
// This module inspects RTP payloads of the supported video codec families
// and reports whether a packet starts a keyframe. All checks are stateless
// and return false on truncated input.

use crate::media::codec::CodecType;

/// H.264 NAL unit types that mark a decoder entry point (IDR, SPS, PPS)
const H264_KEYFRAME_NALS: [u8; 3] = [5, 7, 8];
const H264_NAL_STAP_A: u8 = 24;
const H264_NAL_FU_A: u8 = 28;

/// Report whether `payload` starts a keyframe for `codec`
///
/// Audio codecs never carry keyframes.
pub fn is_keyframe(codec: CodecType, payload: &[u8]) -> bool {
    match codec {
        CodecType::Vp8 => is_vp8_keyframe(payload),
        CodecType::Vp9 => is_vp9_keyframe(payload),
        CodecType::H264 => is_h264_keyframe(payload),
        _ => false,
    }
}

/// VP8: skip the payload descriptor, then check the P bit of the payload header
///
/// Only the first packet of partition 0 carries the payload header, so
/// continuation packets are never reported as keyframes.
pub fn is_vp8_keyframe(payload: &[u8]) -> bool {
    let Some(&first) = payload.first() else {
        return false;
    };
    let extended = first & 0x80 != 0;
    let start_of_partition = first & 0x10 != 0;
    let partition_id = first & 0x07;
    if !start_of_partition || partition_id != 0 {
        return false;
    }

    let mut index = 1;
    if extended {
        let Some(&ext) = payload.get(index) else {
            return false;
        };
        index += 1;
        if ext & 0x80 != 0 {
            // picture id, 15 bits when M is set
            let Some(&pid) = payload.get(index) else {
                return false;
            };
            index += if pid & 0x80 != 0 { 2 } else { 1 };
        }
        if ext & 0x40 != 0 {
            index += 1;
        }
        if ext & 0x30 != 0 {
            index += 1;
        }
    }

    payload.get(index).is_some_and(|header| header & 0x01 == 0)
}

/// VP9: a non-inter-predicted packet that begins a frame on spatial layer 0
///
/// Descriptor byte layout: I P L F B E V Z.
pub fn is_vp9_keyframe(payload: &[u8]) -> bool {
    let Some(&first) = payload.first() else {
        return false;
    };
    let has_picture_id = first & 0x80 != 0;
    let inter_predicted = first & 0x40 != 0;
    let has_layer_indices = first & 0x20 != 0;
    let begins_frame = first & 0x08 != 0;

    let mut index = 1;
    if has_picture_id {
        let Some(&pid) = payload.get(index) else {
            return false;
        };
        index += if pid & 0x80 != 0 { 2 } else { 1 };
    }

    let mut spatial_id = 0;
    if has_layer_indices {
        // TID(3) U(1) SID(3) D(1)
        let Some(&layer) = payload.get(index) else {
            return false;
        };
        spatial_id = (layer >> 1) & 0x07;
    }

    !inter_predicted && begins_frame && spatial_id == 0
}

/// H.264: an IDR slice or parameter set, looking inside aggregation and
/// fragmentation units
pub fn is_h264_keyframe(payload: &[u8]) -> bool {
    let Some(&first) = payload.first() else {
        return false;
    };

    match first & 0x1F {
        H264_NAL_STAP_A => {
            let mut offset = 1;
            while offset + 2 < payload.len() {
                let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                let nal = payload[offset + 2] & 0x1F;
                if H264_KEYFRAME_NALS.contains(&nal) {
                    return true;
                }
                offset += 2 + size;
            }
            false
        }
        H264_NAL_FU_A => payload.get(1).is_some_and(|fu_header| {
            let starts = fu_header & 0x80 != 0;
            starts && H264_KEYFRAME_NALS.contains(&(fu_header & 0x1F))
        }),
        nal => H264_KEYFRAME_NALS.contains(&nal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vp8_keyframe_bit() {
        // S=1, PID=0, then payload header with P=0
        assert!(is_vp8_keyframe(&[0x10, 0x00, 0x9d]));
        // P=1 is an interframe
        assert!(!is_vp8_keyframe(&[0x10, 0x01]));
        // continuation packet
        assert!(!is_vp8_keyframe(&[0x00, 0x00]));
    }

    #[test]
    fn test_vp8_skips_extended_descriptor() {
        // X=1, S=1; I=1 with 15-bit picture id, L=1, T=1; then header P=0
        let payload = [0x90, 0xE0, 0x80, 0x01, 0x00, 0x00, 0x00];
        assert!(is_vp8_keyframe(&payload));
        // same descriptor truncated before the payload header
        assert!(!is_vp8_keyframe(&payload[..6]));
    }

    #[test]
    fn test_vp9_descriptor() {
        // B=1 only
        assert!(is_vp9_keyframe(&[0x08]));
        // P=1, B=1
        assert!(!is_vp9_keyframe(&[0x48]));
        // B=0
        assert!(!is_vp9_keyframe(&[0x00]));
        // I=1 with two-byte picture id, L=1, spatial layer 0
        assert!(is_vp9_keyframe(&[0xA8, 0x81, 0x02, 0x00]));
        // spatial layer 1
        assert!(!is_vp9_keyframe(&[0x28, 0x02]));
        // truncated layer byte
        assert!(!is_vp9_keyframe(&[0xA8, 0x81, 0x02]));
    }

    #[test]
    fn test_h264_nal_types() {
        assert!(is_h264_keyframe(&[0x65, 0x88]));
        assert!(is_h264_keyframe(&[0x67]));
        assert!(!is_h264_keyframe(&[0x41, 0x9a]));
        // STAP-A carrying SPS
        assert!(is_h264_keyframe(&[0x78, 0x00, 0x02, 0x67, 0x42]));
        // FU-A start of IDR, then a middle fragment
        assert!(is_h264_keyframe(&[0x7C, 0x85]));
        assert!(!is_h264_keyframe(&[0x7C, 0x05]));
    }

    #[test]
    fn test_empty_and_audio_payloads() {
        for codec in [CodecType::Vp8, CodecType::Vp9, CodecType::H264, CodecType::Opus] {
            assert!(!is_keyframe(codec, &[]));
        }
        assert!(!is_keyframe(CodecType::Opus, &[0x08]));
    }
}
