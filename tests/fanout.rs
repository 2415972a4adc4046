// End-to-end forwarding through a worker over the in-memory transport

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use rust_sfu_core::{
    media::{
        codec::CodecType,
        rtp::{RtpHeader, RtpPacket},
    },
    session::IceState,
    transport::{
        memory::{MemoryRemoteTrack, MemoryTransportFactory},
        TrackFlavor, TransportEvent,
    },
    ConnectionConfig, ConnectionHandlers, Role, TrackKind, UpPeer, Worker, WorkerConfig,
};
use testresult::TestResult;
use tokio_test::assert_ok;

const SESSION: &str = "room-1";

fn vp8(seq: u16, ssrc: u32, keyframe: bool) -> Bytes {
    let payload = if keyframe { vec![0x10, 0x00, 0x9d] } else { vec![0x10, 0x01, 0x00] };
    RtpPacket::new(RtpHeader::new(96, seq, u32::from(seq) * 3000, ssrc), Bytes::from(payload)).serialize()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

struct Room {
    worker: Arc<Worker>,
    factory: Arc<MemoryTransportFactory>,
}

impl Room {
    async fn new() -> Self {
        Self::with_config(WorkerConfig::default()).await
    }

    async fn with_config(config: WorkerConfig) -> Self {
        let factory = Arc::new(MemoryTransportFactory::new());
        let worker = Worker::new("worker-1", factory.clone(), config);
        worker.add_connections(SESSION);
        Self { worker, factory }
    }

    async fn uploader(&self, id: &str, stream: &str) -> TestResult {
        let up = UpPeer::new();
        up.set(TrackKind::Video, stream, "video/VP8");
        self.worker.add_up_list(id, up);
        self.worker
            .add_connection(SESSION, ConnectionConfig::new(id, Role::Up), ConnectionHandlers::new())
            .await?;
        self.factory
            .for_connection(id)
            .expect("uploader transport")
            .set_ice_state(IceState::Connected)
            .await?;
        Ok(())
    }

    async fn publish(&self, id: &str, track: Arc<MemoryRemoteTrack>) -> TestResult {
        self.factory
            .for_connection(id)
            .expect("uploader transport")
            .emit(TransportEvent::Track(track))
            .await?;
        settle().await;
        Ok(())
    }

    async fn downloader(&self, id: &str, stream: &str) -> TestResult {
        let connection = self
            .worker
            .add_connection(
                SESSION,
                ConnectionConfig::new(id, Role::Down).with_codec(CodecType::Vp8),
                ConnectionHandlers::new(),
            )
            .await?;
        connection.add_video_track(stream, TrackFlavor::Rtp).await?;
        self.worker.register_video(SESSION, stream, id, None).await?;
        Ok(())
    }

    fn received(&self, id: &str, stream: &str) -> Vec<u16> {
        self.factory
            .for_connection(id)
            .and_then(|transport| transport.track(stream))
            .map(|track| track.packets().iter().map(|p| p.header.sequence_number).collect())
            .unwrap_or_default()
    }
}

#[tokio::test]
async fn test_every_downloader_receives_in_order() -> TestResult {
    let room = Room::new().await;
    room.uploader("up-1", "cam-1").await?;
    room.downloader("down-1", "cam-1").await?;
    room.downloader("down-2", "cam-1").await?;

    let remote = MemoryRemoteTrack::new("t-video", CodecType::Vp8, 1);
    room.publish("up-1", remote.clone()).await?;
    for seq in 0..20 {
        remote.feed(vp8(seq, 1, seq == 0)).await?;
    }
    settle().await;

    let expected: Vec<u16> = (0..20).collect();
    assert_eq!(room.received("down-1", "cam-1"), expected);
    assert_eq!(room.received("down-2", "cam-1"), expected);

    let connection = room.worker.get_connection(SESSION, "down-1")?.expect("downloader");
    assert!(connection.is_received_data("cam-1"));
    Ok(())
}

#[tokio::test]
async fn test_late_joiner_gets_cached_keyframe_only() -> TestResult {
    let room = Room::new().await;
    room.uploader("up-1", "cam-1").await?;
    room.downloader("down-1", "cam-1").await?;

    let remote = MemoryRemoteTrack::new("t-video", CodecType::Vp8, 1);
    room.publish("up-1", remote.clone()).await?;
    remote.feed(vp8(1, 1, true)).await?;
    for seq in 2..6 {
        remote.feed(vp8(seq, 1, false)).await?;
    }
    settle().await;

    room.downloader("down-2", "cam-1").await?;
    assert!(room.worker.send_video_keyframe("cam-1", "down-2").await?);
    settle().await;

    assert_eq!(room.received("down-2", "cam-1"), vec![1]);
    assert_eq!(room.received("down-1", "cam-1"), vec![1, 2, 3, 4, 5]);
    Ok(())
}

#[tokio::test]
async fn test_unregistered_downloader_stops_receiving() -> TestResult {
    let room = Room::new().await;
    room.uploader("up-1", "cam-1").await?;
    room.downloader("down-1", "cam-1").await?;
    room.downloader("down-2", "cam-1").await?;

    let remote = MemoryRemoteTrack::new("t-video", CodecType::Vp8, 1);
    room.publish("up-1", remote.clone()).await?;
    remote.feed(vp8(1, 1, true)).await?;
    settle().await;

    room.worker.unregister_video("down-2", "cam-1").await;
    remote.feed(vp8(2, 1, false)).await?;
    settle().await;

    assert_eq!(room.received("down-1", "cam-1"), vec![1, 2]);
    assert_eq!(room.received("down-2", "cam-1"), vec![1]);
    assert_eq!(room.worker.video_manager().get_client("cam-1"), vec!["down-1"]);
    Ok(())
}

#[tokio::test]
async fn test_republish_with_new_ssrc_reports_source_change() -> TestResult {
    let room = Room::new().await;
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    room.worker.set_source_changed_handler(Arc::new(move |stream: &str, consumers: &[String]| {
        sink.lock().push((stream.to_string(), consumers.to_vec()));
    }));

    room.uploader("up-1", "cam-1").await?;
    room.downloader("down-1", "cam-1").await?;

    let first = MemoryRemoteTrack::new("t-video-1", CodecType::Vp8, 1);
    room.publish("up-1", first.clone()).await?;
    first.feed(vp8(1, 1, true)).await?;
    settle().await;
    first.finish();
    settle().await;
    assert!(changes.lock().is_empty());

    // the uploader renegotiates and comes back with a new source
    room.uploader("up-1", "cam-1").await?;
    let second = MemoryRemoteTrack::new("t-video-2", CodecType::Vp8, 2);
    room.publish("up-1", second.clone()).await?;
    second.feed(vp8(1, 2, true)).await?;
    settle().await;

    assert_eq!(
        *changes.lock(),
        vec![("cam-1".to_string(), vec!["down-1".to_string()])]
    );
    assert_eq!(room.received("down-1", "cam-1"), vec![1, 1]);
    Ok(())
}

#[tokio::test]
async fn test_audio_is_forwarded_without_keyframes() -> TestResult {
    let room = Room::new().await;
    let up = UpPeer::new();
    up.set(TrackKind::Audio, "mic-1", "audio/opus");
    room.worker.add_up_list("up-1", up);
    room.worker
        .add_connection(SESSION, ConnectionConfig::new("up-1", Role::Up), ConnectionHandlers::new())
        .await?;

    let connection = room
        .worker
        .add_connection(SESSION, ConnectionConfig::new("down-1", Role::Down), ConnectionHandlers::new())
        .await?;
    connection.add_audio_track("mic-1", TrackFlavor::Rtp).await?;
    assert_ok!(room.worker.register_audio(SESSION, "mic-1", "down-1", None).await);

    let remote = MemoryRemoteTrack::new("t-audio", CodecType::Opus, 7);
    room.publish("up-1", remote.clone()).await?;
    for seq in 0..4 {
        let packet = RtpPacket::new(RtpHeader::new(111, seq, u32::from(seq) * 960, 7), Bytes::from_static(&[0xfc, 0xff]));
        remote.feed(packet.serialize()).await?;
    }
    settle().await;

    assert_eq!(room.received("down-1", "mic-1"), vec![0, 1, 2, 3]);
    let forwarder = room.worker.audio_manager().get_forwarder("mic-1").expect("audio forwarder");
    assert!(forwarder.keyframe().is_none());
    assert!(!room.worker.send_video_keyframe("mic-1", "down-1").await.unwrap_or(false));
    assert!(room.worker.get_audio_receive_time_by("mic-1").is_some());
    Ok(())
}

#[tokio::test]
async fn test_stalled_downloader_is_removed_without_starving_others() -> TestResult {
    let config = WorkerConfig {
        queue_capacity: 4,
        ..WorkerConfig::default()
    };
    let room = Room::with_config(config).await;
    room.uploader("up-1", "cam-1").await?;
    room.downloader("down-1", "cam-1").await?;
    room.downloader("down-2", "cam-1").await?;
    room.factory
        .for_connection("down-2")
        .and_then(|transport| transport.track("cam-1"))
        .expect("down-2 track")
        .stall_writes(true);

    let remote = MemoryRemoteTrack::new("t-video", CodecType::Vp8, 1);
    room.publish("up-1", remote.clone()).await?;
    let feeder = {
        let remote = remote.clone();
        tokio::spawn(async move {
            for seq in 0..50 {
                if remote.feed(vp8(seq, 1, seq == 0)).await.is_err() {
                    break;
                }
            }
        })
    };
    settle().await;
    assert!(room.received("down-1", "cam-1").len() < 50);

    let stalled = room.worker.get_connection(SESSION, "down-2")?.expect("downloader");
    let removed = tokio::time::timeout(
        Duration::from_secs(2),
        room.worker.remove_connection(SESSION, "down-2", stalled.cookie()),
    )
    .await??;
    assert!(removed);
    assert!(stalled.is_closed());

    tokio::time::timeout(Duration::from_secs(2), feeder).await??;
    settle().await;
    assert_eq!(room.received("down-1", "cam-1"), (0..50).collect::<Vec<u16>>());
    assert_eq!(room.worker.video_manager().get_client("cam-1"), vec!["down-1"]);
    Ok(())
}
