// Forwarder manager module for the SFU
//
// This module indexes the forwarders of one media kind by stream id and
// aggregates their liveness timestamps.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    forwarder::{
        Activity, Forwarder, ForwarderOptions, PacketHandler, SsrcChangeHandler,
        DEFAULT_QUEUE_CAPACITY,
    },
    media::{codec::CodecType, TrackKind, Wrapper},
    Result, SfuError,
};

type ForwarderMap = Arc<RwLock<HashMap<String, Arc<Forwarder>>>>;

/// Registry of the forwarders for one media kind
pub struct ForwarderManager {
    /// Owning worker id
    id: String,
    /// Media kind of every forwarder in this manager
    kind: TrackKind,
    /// Queue depth handed to new forwarders
    capacity: usize,
    /// Stream id to forwarder
    forwarders: ForwarderMap,
    /// Stream id to unix milliseconds of the last dispatched packet
    activity: Arc<RwLock<HashMap<String, i64>>>,
    /// Liveness sink shared by all forwarders
    activity_tx: mpsc::Sender<Activity>,
    /// SSRC callback used when a forwarder is created without one
    on_ssrc_change: RwLock<Option<SsrcChangeHandler>>,
    /// Stops the liveness loop
    cancel: CancellationToken,
    /// Close guard
    closed: AtomicBool,
}

impl ForwarderManager {
    /// Create a manager with the default queue depth
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self::with_capacity(id, kind, DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a manager whose forwarders use `capacity`-deep queues
    pub fn with_capacity(id: impl Into<String>, kind: TrackKind, capacity: usize) -> Self {
        let id = id.into();
        let forwarders: ForwarderMap = Arc::new(RwLock::new(HashMap::new()));
        let activity = Arc::new(RwLock::new(HashMap::new()));
        let (activity_tx, activity_rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();

        tokio::spawn(record_activity(
            activity_rx,
            forwarders.clone(),
            activity.clone(),
            cancel.clone(),
        ));

        tracing::debug!(worker = %id, kind = %kind, "Forwarder manager created");

        Self {
            id,
            kind,
            capacity,
            forwarders,
            activity,
            activity_tx,
            on_ssrc_change: RwLock::new(None),
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    /// Owning worker id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Media kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Callback used for forwarders created without their own
    pub fn set_ssrc_change_handler(&self, handler: SsrcChangeHandler) {
        *self.on_ssrc_change.write() = Some(handler);
    }

    /// Get the forwarder for `stream_id`, creating it if absent
    ///
    /// An existing live forwarder is returned unchanged, whatever `codec` and
    /// `on_ssrc_change` say; a closed one is replaced.
    pub fn add_new_forwarder(
        &self,
        stream_id: &str,
        codec: CodecType,
        on_ssrc_change: Option<SsrcChangeHandler>,
    ) -> Result<Arc<Forwarder>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SfuError::NotFound(format!(
                "{} forwarder manager of worker {} is closed",
                self.kind, self.id
            )));
        }

        let mut forwarders = self.forwarders.write();
        if let Some(existing) = forwarders.get(stream_id) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }

        let options = ForwarderOptions {
            capacity: self.capacity,
            on_ssrc_change: on_ssrc_change.or_else(|| self.on_ssrc_change.read().clone()),
            activity: Some(self.activity_tx.clone()),
        };
        let forwarder = Arc::new(Forwarder::new(stream_id, codec, options));
        forwarders.insert(stream_id.to_string(), forwarder.clone());

        tracing::info!(worker = %self.id, kind = %self.kind, stream = %stream_id, codec = %codec, "Forwarder added");
        Ok(forwarder)
    }

    /// Close and forget the forwarder for `stream_id`
    pub fn remove_forwarder(&self, stream_id: &str) {
        let removed = self.forwarders.write().remove(stream_id);
        self.activity.write().remove(stream_id);
        if let Some(forwarder) = removed {
            forwarder.close();
        }
    }

    /// Forwarder for `stream_id`
    pub fn get_forwarder(&self, stream_id: &str) -> Option<Arc<Forwarder>> {
        self.forwarders.read().get(stream_id).cloned()
    }

    /// Ids of every stream with a forwarder
    pub fn get_keys(&self) -> Vec<String> {
        self.forwarders.read().keys().cloned().collect()
    }

    /// Number of forwarders
    pub fn len(&self) -> usize {
        self.forwarders.read().len()
    }

    /// Whether the manager owns no forwarder
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a packet into the forwarder for `stream_id`
    pub async fn push(&self, stream_id: &str, wrapper: Wrapper) -> Result<()> {
        self.require(stream_id)?.push(wrapper).await
    }

    /// Register `consumer_id` on `stream_id`, creating the forwarder lazily
    /// with the kind's default codec
    pub async fn register(&self, stream_id: &str, consumer_id: &str, handler: PacketHandler) -> Result<()> {
        let forwarder = match self.get_forwarder(stream_id) {
            Some(forwarder) if !forwarder.is_closed() => forwarder,
            _ => self.add_new_forwarder(stream_id, CodecType::default_for(self.kind), None)?,
        };
        forwarder.register(consumer_id, handler).await
    }

    /// Unregister `consumer_id` from `stream_id`
    pub async fn unregister(&self, stream_id: &str, consumer_id: &str) {
        if let Some(forwarder) = self.get_forwarder(stream_id) {
            forwarder.unregister(consumer_id).await;
        }
    }

    /// Unregister `consumer_id` from every forwarder
    pub async fn unregister_all(&self, consumer_id: &str) {
        for forwarder in self.snapshot() {
            if forwarder.has_consumer(consumer_id) {
                forwarder.unregister(consumer_id).await;
            }
        }
    }

    /// Consumer ids registered on `stream_id`
    pub fn get_client(&self, stream_id: &str) -> Vec<String> {
        self.get_forwarder(stream_id)
            .map(|forwarder| forwarder.consumer_ids())
            .unwrap_or_default()
    }

    /// Resend the cached keyframe of `stream_id` to `consumer_id`
    pub async fn send_keyframe(&self, stream_id: &str, consumer_id: &str) -> Result<bool> {
        self.require(stream_id)?.send_keyframe(consumer_id).await
    }

    /// Resend every cached keyframe `consumer_id` is registered for
    ///
    /// Returns the number of keyframes queued.
    pub async fn send_all_keyframe(&self, consumer_id: &str) -> usize {
        let mut sent = 0;
        for forwarder in self.snapshot() {
            if !forwarder.has_consumer(consumer_id) {
                continue;
            }
            if let Ok(true) = forwarder.send_keyframe(consumer_id).await {
                sent += 1;
            }
        }
        sent
    }

    /// Last activity of every stream, unix milliseconds
    pub fn get_last_time_receive(&self) -> HashMap<String, i64> {
        self.activity.read().clone()
    }

    /// Last activity of `stream_id`, unix milliseconds
    pub fn get_last_time_receive_by(&self, stream_id: &str) -> Option<i64> {
        self.activity.read().get(stream_id).copied()
    }

    /// Close every forwarder; idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let forwarders: Vec<_> = self.forwarders.write().drain().map(|(_, f)| f).collect();
        for forwarder in &forwarders {
            forwarder.close();
        }
        self.activity.write().clear();
        self.cancel.cancel();
        tracing::info!(worker = %self.id, kind = %self.kind, forwarders = forwarders.len(), "Forwarder manager closed");
    }

    fn require(&self, stream_id: &str) -> Result<Arc<Forwarder>> {
        self.get_forwarder(stream_id)
            .ok_or_else(|| SfuError::NotFound(format!("no {} forwarder for stream {}", self.kind, stream_id)))
    }

    fn snapshot(&self) -> Vec<Arc<Forwarder>> {
        self.forwarders.read().values().cloned().collect()
    }
}

impl Drop for ForwarderManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Fold liveness signals into the activity map
///
/// Signals for streams that were removed in the meantime are ignored.
async fn record_activity(
    mut rx: mpsc::Receiver<Activity>,
    forwarders: ForwarderMap,
    activity: Arc<RwLock<HashMap<String, i64>>>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(signal) => signal,
                None => break,
            },
        };
        if forwarders.read().contains_key(&signal.stream_id) {
            activity.write().insert(signal.stream_id, signal.at);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures::FutureExt;
    use testresult::TestResult;

    use super::*;
    use crate::media::rtp::{RtpHeader, RtpPacket};

    fn counting_handler() -> (PacketHandler, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: PacketHandler = Arc::new(move |stream_id, _| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(stream_id);
                Ok(())
            }
            .boxed()
        });
        (handler, rx)
    }

    fn keyframe_packet(seq: u16) -> Wrapper {
        let header = RtpHeader::new(98, seq, 0, 5);
        Wrapper::new(RtpPacket::new(header, Bytes::from_static(&[0x08, 0x01])).serialize())
    }

    #[tokio::test]
    async fn test_add_new_forwarder_is_get_or_create() -> TestResult {
        let manager = ForwarderManager::new("worker-1", TrackKind::Video);
        let first = manager.add_new_forwarder("cam-1", CodecType::Vp9, None)?;
        let second = manager.add_new_forwarder("cam-1", CodecType::H264, None)?;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.codec(), CodecType::Vp9);
        assert_eq!(manager.get_keys(), vec!["cam-1".to_string()]);

        first.close();
        let third = manager.add_new_forwarder("cam-1", CodecType::H264, None)?;
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(manager.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_register_creates_forwarder_lazily() -> TestResult {
        let manager = ForwarderManager::new("worker-1", TrackKind::Video);
        let (handler, mut rx) = counting_handler();
        manager.register("cam-1", "pc-1", handler).await?;

        let forwarder = manager.get_forwarder("cam-1").expect("created by register");
        assert_eq!(forwarder.codec(), CodecType::Vp9);
        assert_eq!(manager.get_client("cam-1"), vec!["pc-1".to_string()]);

        manager.push("cam-1", keyframe_packet(1)).await?;
        assert_eq!(rx.recv().await.as_deref(), Some("cam-1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_push_to_unknown_stream_is_not_found() {
        let manager = ForwarderManager::new("worker-1", TrackKind::Audio);
        let result = manager.push("missing", keyframe_packet(1)).await;
        assert!(matches!(result, Err(SfuError::NotFound(_))));
        assert!(matches!(
            manager.send_keyframe("missing", "pc").await,
            Err(SfuError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_all_and_send_all_keyframe() -> TestResult {
        let manager = ForwarderManager::new("worker-1", TrackKind::Video);
        let (handler, mut rx) = counting_handler();
        for stream in ["cam-1", "cam-2", "cam-3"] {
            manager.add_new_forwarder(stream, CodecType::Vp9, None)?;
            manager.register(stream, "pc-1", handler.clone()).await?;
        }
        for (seq, stream) in ["cam-1", "cam-2"].into_iter().enumerate() {
            manager.push(stream, keyframe_packet(seq as u16)).await?;
        }
        for _ in 0..2 {
            rx.recv().await;
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.get_forwarder("cam-2").and_then(|f| f.keyframe()).is_none()
                || manager.get_forwarder("cam-1").and_then(|f| f.keyframe()).is_none()
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        assert_eq!(manager.send_all_keyframe("pc-1").await, 2);
        assert_eq!(manager.send_all_keyframe("pc-2").await, 0);

        manager.unregister_all("pc-1").await;
        for stream in ["cam-1", "cam-2", "cam-3"] {
            assert!(manager.get_client(stream).is_empty());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_activity_is_tracked_and_forgotten() -> TestResult {
        let manager = ForwarderManager::new("worker-1", TrackKind::Video);
        manager.add_new_forwarder("cam-1", CodecType::Vp9, None)?;
        manager.push("cam-1", keyframe_packet(1)).await?;

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.get_last_time_receive_by("cam-1").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        assert!(manager.get_last_time_receive().contains_key("cam-1"));

        manager.remove_forwarder("cam-1");
        assert!(manager.get_last_time_receive_by("cam-1").is_none());
        assert!(manager.get_forwarder("cam-1").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_close_closes_every_forwarder() -> TestResult {
        let manager = ForwarderManager::new("worker-1", TrackKind::Audio);
        let forwarder = manager.add_new_forwarder("mic-1", CodecType::Opus, None)?;
        manager.close();
        manager.close();

        assert!(forwarder.is_closed());
        assert!(manager.is_empty());
        assert!(manager.add_new_forwarder("mic-2", CodecType::Opus, None).is_err());
        Ok(())
    }
}
