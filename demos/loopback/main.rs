// Loopback demo of the SFU core
//
// This demo runs a worker over the in-memory transport: one uploader
// publishes a synthetic video stream and a number of downloaders receive it
// through the forwarder.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use rust_sfu_core::{
    init_logging,
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

/// Loopback SFU demo
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Number of downstream connections
    #[clap(short, long, default_value = "3")]
    downloaders: usize,

    /// Number of packets to publish
    #[clap(short, long, default_value = "100")]
    packets: u16,

    /// Video codec of the published stream
    #[clap(short, long, default_value = "vp8")]
    codec: String,

    /// Send a keyframe every this many packets
    #[clap(short, long, default_value = "30")]
    keyframe_every: u16,

    /// Per-packet tracing
    #[clap(long)]
    debug: bool,
}

const SESSION: &str = "loopback";
const STREAM: &str = "cam-1";
const SSRC: u32 = 0x5eed;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    // Parse command line arguments
    let args = Args::parse();
    let codec: CodecType = args.codec.parse().context("unsupported codec")?;
    anyhow::ensure!(codec.is_video(), "{} is not a video codec", codec);

    let mut config = WorkerConfig::from_env();
    config.debug |= args.debug;
    config.session.trace_packets = config.debug;

    let factory = Arc::new(MemoryTransportFactory::new());
    let worker = Worker::new("loopback-worker", factory.clone(), config);
    worker.set_no_connection_handler(Arc::new(|session| {
        tracing::info!(session = %session, "Session has no connection left");
    }));
    worker.start();
    worker.add_connections(SESSION);

    // Uploader
    let up = UpPeer::new();
    up.set(TrackKind::Video, STREAM, codec.mime_type());
    worker.add_up_list("uploader", up);
    worker
        .add_connection(SESSION, ConnectionConfig::new("uploader", Role::Up), ConnectionHandlers::new())
        .await?;
    let uploader = factory
        .for_connection("uploader")
        .context("uploader transport missing")?;
    uploader.set_ice_state(IceState::Connected).await?;

    // Downloaders
    let mut downloaders = Vec::with_capacity(args.downloaders);
    for i in 0..args.downloaders {
        let id = format!("downloader-{}", i + 1);
        let connection = worker
            .add_connection(
                SESSION,
                ConnectionConfig::new(id.clone(), Role::Down).with_codec(codec),
                ConnectionHandlers::new().on_added(|session, role, id| {
                    tracing::info!(session = %session, role = %role, connection = %id, "Connection up");
                }),
            )
            .await?;
        connection.add_video_track(STREAM, TrackFlavor::Rtp).await?;
        factory
            .for_connection(&id)
            .context("downloader transport missing")?
            .set_ice_state(IceState::Connected)
            .await?;
        worker
            .register_video(
                SESSION,
                STREAM,
                &id,
                Some(Arc::new(|session, connection, stream, reason| {
                    tracing::error!(session = %session, connection = %connection, stream = %stream, reason = %reason, "Write failed");
                })),
            )
            .await?;
        downloaders.push(id);
    }

    // Publish
    let remote = MemoryRemoteTrack::new("uploader-video", codec, SSRC);
    uploader.emit(TransportEvent::Track(remote.clone())).await?;
    for seq in 0..args.packets {
        let keyframe = args.keyframe_every > 0 && seq % args.keyframe_every == 0;
        remote.feed(synthetic_packet(codec, seq, keyframe)).await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    for id in &downloaders {
        let received = factory
            .for_connection(id)
            .and_then(|transport| transport.track(STREAM))
            .map(|track| track.packets().len())
            .unwrap_or_default();
        println!("{}: {} of {} packets", id, received, args.packets);
    }
    println!("last receive times: {:?}", worker.get_video_receive_time());

    remote.finish();
    worker.close().await;
    println!("Loopback finished");

    Ok(())
}

/// RTP packet whose payload starts a keyframe or a delta frame of `codec`
fn synthetic_packet(codec: CodecType, seq: u16, keyframe: bool) -> Bytes {
    let payload: Vec<u8> = match (codec, keyframe) {
        (CodecType::Vp8, true) => vec![0x10, 0x00, 0x9d, 0x01, 0x2a],
        (CodecType::Vp8, false) => vec![0x10, 0x01, 0x00],
        (CodecType::Vp9, true) => vec![0x08, 0x80, 0x49],
        (CodecType::Vp9, false) => vec![0x48, 0x00],
        (_, true) => vec![0x65, 0x88, 0x84],
        (_, false) => vec![0x41, 0x9a],
    };
    RtpPacket::new(
        RtpHeader::new(96, seq, u32::from(seq) * 3000, SSRC),
        Bytes::from(payload),
    )
    .serialize()
}
