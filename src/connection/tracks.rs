// Local track bookkeeping for the SFU
//
// A connection sends each forwarded stream on its own local track. This
// module keeps those tracks by kind and stream id, along with whether any
// media has been written to them yet.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{
    media::{codec::CodecType, TrackKind},
    transport::{LocalTrack, SenderId},
};

/// Lifecycle of a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstInit {
    /// Created, nothing written yet
    Created,
    /// At least one write went through
    Receiving,
}

/// A local track and the sender carrying it
#[derive(Debug, Clone)]
pub struct TrackEntry {
    /// Write handle
    pub track: LocalTrack,
    /// Sender on the transport
    pub sender: SenderId,
    /// Codec of the track
    pub codec: CodecType,
}

/// Local tracks of one connection
#[derive(Default)]
pub struct LocalTracks {
    video: RwLock<HashMap<String, TrackEntry>>,
    audio: RwLock<HashMap<String, TrackEntry>>,
    state: RwLock<HashMap<String, FirstInit>>,
}

impl LocalTracks {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: TrackKind) -> &RwLock<HashMap<String, TrackEntry>> {
        match kind {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        }
    }

    /// Store a track, returning the one it replaced
    pub fn insert(&self, kind: TrackKind, track_id: &str, entry: TrackEntry) -> Option<TrackEntry> {
        self.state.write().insert(track_id.to_string(), FirstInit::Created);
        self.table(kind).write().insert(track_id.to_string(), entry)
    }

    /// Track stored under `track_id`
    pub fn get(&self, kind: TrackKind, track_id: &str) -> Option<TrackEntry> {
        self.table(kind).read().get(track_id).cloned()
    }

    /// Forget a track
    pub fn remove(&self, kind: TrackKind, track_id: &str) -> Option<TrackEntry> {
        let removed = self.table(kind).write().remove(track_id);
        if removed.is_some() {
            self.state.write().remove(track_id);
        }
        removed
    }

    /// Ids of the tracks of `kind`
    pub fn ids(&self, kind: TrackKind) -> Vec<String> {
        self.table(kind).read().keys().cloned().collect()
    }

    /// Record a successful write
    pub fn mark_received(&self, track_id: &str) {
        if let Some(state) = self.state.write().get_mut(track_id) {
            *state = FirstInit::Receiving;
        }
    }

    /// Lifecycle state of `track_id`
    pub fn first_init(&self, track_id: &str) -> Option<FirstInit> {
        self.state.read().get(track_id).copied()
    }

    /// Forget every track
    pub fn clear(&self) {
        self.video.write().clear();
        self.audio.write().clear();
        self.state.write().clear();
    }
}
