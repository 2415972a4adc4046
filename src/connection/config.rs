// Connection configuration for the SFU
//
// This module holds the per-connection surface handed over by signaling and
// the timing options a connection runs with.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    feedback::DEFAULT_BITRATE_KBPS,
    media::{codec::CodecType, TrackKind},
    transport::IceServer,
    Result, SfuError,
};

/// Default period of the picture loss heartbeat
pub const DEFAULT_PLI_INTERVAL: Duration = Duration::from_secs(30);

/// Default lifetime of a duplicate-suppression tag
pub const DEFAULT_DUPLICATE_TTL: Duration = Duration::from_secs(10);

/// Direction of a connection, seen from the participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publishes media to the server
    Up,
    /// Receives media from the server
    Down,
}

impl Role {
    /// Wire name of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Up => "up",
            Role::Down => "down",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SfuError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(Role::Up),
            "down" => Ok(Role::Down),
            other => Err(SfuError::InvalidInput(format!("unknown role: {}", other))),
        }
    }
}

fn allowed() -> bool {
    true
}

/// Per-connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Logical connection id, stable across ICE restarts
    pub connection_id: String,
    /// Direction of the connection
    pub role: Role,
    /// STUN/TURN servers
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    /// Video codec name; VP9 when absent
    #[serde(default)]
    pub codec: Option<String>,
    /// Bitrate hint in kbps
    #[serde(default)]
    pub bitrate: Option<u32>,
    /// Payload type hint
    #[serde(default)]
    pub payload_type: Option<u8>,
    /// Whether inbound video is accepted
    #[serde(default = "allowed")]
    pub allow_upload_video: bool,
    /// Whether inbound audio is accepted
    #[serde(default = "allowed")]
    pub allow_upload_audio: bool,
    /// Whether video may be sent to the participant
    #[serde(default = "allowed")]
    pub allow_download_video: bool,
    /// Whether audio may be sent to the participant
    #[serde(default = "allowed")]
    pub allow_download_audio: bool,
    /// Whether the server opens the data channel
    #[serde(default)]
    pub create_data_channel_locally: bool,
}

impl ConnectionConfig {
    /// Configuration with every direction allowed and no hints
    pub fn new(connection_id: impl Into<String>, role: Role) -> Self {
        Self {
            connection_id: connection_id.into(),
            role,
            ice_servers: Vec::new(),
            codec: None,
            bitrate: None,
            payload_type: None,
            allow_upload_video: true,
            allow_upload_audio: true,
            allow_download_video: true,
            allow_download_audio: true,
            create_data_channel_locally: false,
        }
    }

    /// Set the video codec
    pub fn with_codec(mut self, codec: CodecType) -> Self {
        self.codec = Some(codec.name().to_string());
        self
    }

    /// Set the bitrate hint in kbps
    pub fn with_bitrate(mut self, kbps: u32) -> Self {
        self.bitrate = Some(kbps);
        self
    }

    /// Set the payload type hint
    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = Some(payload_type);
        self
    }

    /// Set the STUN/TURN servers
    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Set upload permissions
    pub fn allow_upload(mut self, video: bool, audio: bool) -> Self {
        self.allow_upload_video = video;
        self.allow_upload_audio = audio;
        self
    }

    /// Set download permissions
    pub fn allow_download(mut self, video: bool, audio: bool) -> Self {
        self.allow_download_video = video;
        self.allow_download_audio = audio;
        self
    }

    /// Let the server open the data channel
    pub fn create_data_channel_locally(mut self, create: bool) -> Self {
        self.create_data_channel_locally = create;
        self
    }

    /// Negotiated video codec
    pub fn video_codec(&self) -> Result<CodecType> {
        let Some(name) = self.codec.as_deref() else {
            return Ok(CodecType::default_for(TrackKind::Video));
        };
        let codec: CodecType = name.parse()?;
        if !codec.is_video() {
            return Err(SfuError::InvalidInput(format!("{} is not a video codec", codec)));
        }
        Ok(codec)
    }

    /// Bitrate hint in kbps
    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate.unwrap_or(DEFAULT_BITRATE_KBPS)
    }

    /// Whether inbound media of `kind` is accepted
    pub fn allows_upload(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Video => self.allow_upload_video,
            TrackKind::Audio => self.allow_upload_audio,
        }
    }

    /// Whether media of `kind` may be sent to the participant
    pub fn allows_download(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Video => self.allow_download_video,
            TrackKind::Audio => self.allow_download_audio,
        }
    }
}

/// Timing options of a connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Period of the picture loss heartbeat
    pub pli_interval: Duration,
    /// Lifetime of a duplicate-suppression tag
    pub duplicate_ttl: Duration,
    /// Emit per-packet trace events
    pub trace_packets: bool,
}

// Default implementation
impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            pli_interval: DEFAULT_PLI_INTERVAL,
            duplicate_ttl: DEFAULT_DUPLICATE_TTL,
            trace_packets: false,
        }
    }
}
