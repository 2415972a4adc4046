// Media codec module for the SFU
//
// This module maps negotiated codec names and mime types onto the codec
// families the forwarding core understands.

use std::{fmt, str::FromStr};

use crate::{media::TrackKind, SfuError};

/// Largest packet the read loop accepts from the network
pub const MAX_MTU: usize = 1460;

/// Codec type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecType {
    /// VP8 video codec
    Vp8,
    /// VP9 video codec
    Vp9,
    /// H.264 video codec
    H264,
    /// Opus audio codec
    Opus,
    /// G.722 audio codec
    G722,
    /// G.711 mu-law audio codec
    Pcmu,
    /// G.711 A-law audio codec
    Pcma,
}

impl CodecType {
    /// Short codec name as used in signaling ("vp9", "opus", ...)
    pub fn name(&self) -> &'static str {
        match self {
            CodecType::Vp8 => "vp8",
            CodecType::Vp9 => "vp9",
            CodecType::H264 => "h264",
            CodecType::Opus => "opus",
            CodecType::G722 => "g722",
            CodecType::Pcmu => "pcmu",
            CodecType::Pcma => "pcma",
        }
    }

    /// Mime type of the codec
    pub fn mime_type(&self) -> &'static str {
        match self {
            CodecType::Vp8 => "video/VP8",
            CodecType::Vp9 => "video/VP9",
            CodecType::H264 => "video/H264",
            CodecType::Opus => "audio/opus",
            CodecType::G722 => "audio/G722",
            CodecType::Pcmu => "audio/PCMU",
            CodecType::Pcma => "audio/PCMA",
        }
    }

    /// Kind of track this codec carries
    pub fn kind(&self) -> TrackKind {
        if self.is_video() {
            TrackKind::Video
        } else {
            TrackKind::Audio
        }
    }

    /// Check if codec is audio
    pub fn is_audio(&self) -> bool {
        !self.is_video()
    }

    /// Check if codec is video
    pub fn is_video(&self) -> bool {
        matches!(self, CodecType::Vp8 | CodecType::Vp9 | CodecType::H264)
    }

    /// Default codec for a kind when nothing was negotiated
    pub fn default_for(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Video => CodecType::Vp9,
            TrackKind::Audio => CodecType::Opus,
        }
    }

    /// Get codec from its short name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "vp8" => Some(CodecType::Vp8),
            "vp9" => Some(CodecType::Vp9),
            "h264" => Some(CodecType::H264),
            "opus" => Some(CodecType::Opus),
            "g722" => Some(CodecType::G722),
            "pcmu" => Some(CodecType::Pcmu),
            "pcma" => Some(CodecType::Pcma),
            _ => None,
        }
    }

    /// Get codec from a mime type, case-insensitively
    pub fn from_mime(mime: &str) -> Option<Self> {
        let (_, name) = mime.split_once('/')?;
        let codec = Self::from_name(name)?;
        codec
            .mime_type()
            .eq_ignore_ascii_case(mime)
            .then_some(codec)
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodecType {
    type Err = SfuError;

    /// Accepts either a short name or a mime type
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
            .or_else(|| Self::from_mime(s))
            .ok_or_else(|| SfuError::InvalidInput(format!("unknown codec: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_and_mimes_resolve() {
        assert_eq!(CodecType::from_name("VP9"), Some(CodecType::Vp9));
        assert_eq!(CodecType::from_mime("video/h264"), Some(CodecType::H264));
        assert_eq!(CodecType::from_mime("audio/vp8"), None);
        assert_eq!("audio/opus".parse::<CodecType>().ok(), Some(CodecType::Opus));
        assert!("video/AV1".parse::<CodecType>().is_err());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(CodecType::Vp8.kind(), TrackKind::Video);
        assert_eq!(CodecType::Pcmu.kind(), TrackKind::Audio);
        assert_eq!(CodecType::default_for(TrackKind::Video), CodecType::Vp9);
    }
}
