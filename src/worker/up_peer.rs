// Uploader declarations for the SFU
//
// An uploading connection declares which stream ids it is going to publish
// and with which codec. The worker uses the declaration to name inbound
// tracks, which only carry transport-assigned ids.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::media::TrackKind;

/// Stream ids and codec names one uploader is expected to produce
#[derive(Debug, Default)]
pub struct UpPeer {
    video: RwLock<HashMap<String, String>>,
    audio: RwLock<HashMap<String, String>>,
}

impl UpPeer {
    /// Empty declaration
    pub fn new() -> Self {
        Self::default()
    }

    /// Declaration from stream id to codec name maps
    pub fn with_tracks(video: HashMap<String, String>, audio: HashMap<String, String>) -> Self {
        Self {
            video: RwLock::new(video),
            audio: RwLock::new(audio),
        }
    }

    fn table(&self, kind: TrackKind) -> &RwLock<HashMap<String, String>> {
        match kind {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        }
    }

    /// Declare one stream
    pub fn set(&self, kind: TrackKind, stream_id: impl Into<String>, codec: impl Into<String>) {
        self.table(kind).write().insert(stream_id.into(), codec.into());
    }

    /// Replace every stream of `kind`
    pub fn set_list(&self, kind: TrackKind, list: HashMap<String, String>) {
        *self.table(kind).write() = list;
    }

    /// Stream id to codec name for `kind`
    pub fn list(&self, kind: TrackKind) -> HashMap<String, String> {
        self.table(kind).read().clone()
    }

    /// Stream ids of `kind`, sorted
    pub fn ids(&self, kind: TrackKind) -> Vec<String> {
        let mut ids: Vec<_> = self.table(kind).read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Merge `other` into this declaration; `other` wins on conflicts
    pub fn append(&self, other: &UpPeer) {
        for kind in [TrackKind::Video, TrackKind::Audio] {
            let incoming = other.list(kind);
            self.table(kind).write().extend(incoming);
        }
    }

    /// The single stream id of `kind`, if exactly one is declared
    pub fn sole_id(&self, kind: TrackKind) -> Option<String> {
        let table = self.table(kind).read();
        match table.len() {
            1 => table.keys().next().cloned(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sole_id_needs_exactly_one_stream() {
        let up = UpPeer::new();
        assert_eq!(up.sole_id(TrackKind::Video), None);

        up.set(TrackKind::Video, "cam-1", "video/VP9");
        assert_eq!(up.sole_id(TrackKind::Video).as_deref(), Some("cam-1"));

        up.set(TrackKind::Video, "screen-1", "video/VP8");
        assert_eq!(up.sole_id(TrackKind::Video), None);
        assert_eq!(up.ids(TrackKind::Video), vec!["cam-1", "screen-1"]);
    }

    #[test]
    fn test_append_merges_both_kinds() {
        let up = UpPeer::new();
        up.set(TrackKind::Video, "cam-1", "video/VP9");

        let extra = UpPeer::new();
        extra.set(TrackKind::Video, "cam-1", "video/H264");
        extra.set(TrackKind::Audio, "mic-1", "audio/opus");
        up.append(&extra);

        assert_eq!(up.list(TrackKind::Video).get("cam-1").map(String::as_str), Some("video/H264"));
        assert_eq!(up.sole_id(TrackKind::Audio).as_deref(), Some("mic-1"));
    }
}
