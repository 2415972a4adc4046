// Forwarder module for the SFU
//
// This module implements the fan-out engine for one logical media stream.
// A forwarder is an actor: register/unregister/resend commands and pushed
// packets are serialized through one dispatch loop, so consumer-set changes
// never race with delivery. Video forwarders run a second loop that caches
// the latest keyframe and watches for upstream SSRC changes, and every
// consumer gets its own delivery loop so a slow or failing consumer only
// affects itself.

pub mod manager;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    media::{codec::CodecType, keyframe, TrackKind, Wrapper},
    unix_millis, Result, SfuError,
};

/// Default depth of every queue owned by a forwarder
pub const DEFAULT_QUEUE_CAPACITY: usize = 2048;

/// Handler invoked for every packet delivered to a consumer
///
/// Receives the stream id and the packet; returning an error stops delivery
/// to that consumer.
pub type PacketHandler = Arc<dyn Fn(String, Wrapper) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Callback invoked with the stream id and current consumer ids when the
/// upstream SSRC changes
pub type SsrcChangeHandler = Arc<dyn Fn(&str, &[String]) + Send + Sync>;

/// Liveness signal published after every dispatched packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    /// Stream the packet belonged to
    pub stream_id: String,
    /// Unix time in milliseconds
    pub at: i64,
}

/// Forwarder construction options
#[derive(Clone)]
pub struct ForwarderOptions {
    /// Depth of the inbound, command and per-consumer queues
    pub capacity: usize,
    /// SSRC change callback
    pub on_ssrc_change: Option<SsrcChangeHandler>,
    /// Where liveness timestamps are published, best effort
    pub activity: Option<mpsc::Sender<Activity>>,
}

// Default implementation
impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            on_ssrc_change: None,
            activity: None,
        }
    }
}

/// Actions understood by the dispatch loop
enum Command {
    Register {
        consumer_id: String,
        consumer: Consumer,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        consumer_id: String,
        ack: oneshot::Sender<()>,
    },
    SendKeyFrame {
        consumer_id: String,
        ack: oneshot::Sender<bool>,
    },
}

/// Dispatch-side handle of a registered consumer
struct Consumer {
    generation: u64,
    queue: mpsc::Sender<Wrapper>,
    cancel: CancellationToken,
}

/// Caller-side handle of a registered consumer
///
/// Lets `register` and `unregister` stop a consumer without waiting for the
/// dispatch loop, which may be blocked on that very consumer's queue.
struct Registration {
    generation: u64,
    cancel: CancellationToken,
}

/// State readable from outside the actor
#[derive(Default)]
struct Shared {
    /// Most recent keyframe, last write wins
    keyframe: RwLock<Option<Wrapper>>,
    /// Registered consumer ids, republished after every change
    consumer_ids: RwLock<Vec<String>>,
    /// Unix milliseconds of the last dispatched packet, 0 if none
    last_received: AtomicI64,
    /// Consumer id to its live registration
    registrations: Mutex<HashMap<String, Registration>>,
}

impl Shared {
    /// Forget `consumer_id` if it is still registered as `generation`
    fn forget(&self, consumer_id: &str, generation: u64) {
        let mut registrations = self.registrations.lock();
        if registrations
            .get(consumer_id)
            .is_some_and(|current| current.generation == generation)
        {
            registrations.remove(consumer_id);
        }
    }
}

/// Fan-out engine for one stream
pub struct Forwarder {
    /// Stream id
    id: String,
    /// Media kind, fixed at creation
    kind: TrackKind,
    /// Codec used for keyframe inspection
    codec: Arc<RwLock<CodecType>>,
    /// Per-consumer queue depth
    capacity: usize,
    /// Source of consumer registration generations
    next_generation: AtomicU64,
    /// Inbound packets
    hub: mpsc::Sender<Wrapper>,
    /// Consumer-set commands
    commands: mpsc::Sender<Command>,
    /// State shared with the loops
    shared: Arc<Shared>,
    /// Parent of every loop this forwarder runs
    cancel: CancellationToken,
    /// Close guard
    closed: AtomicBool,
}

impl Forwarder {
    /// Create a forwarder and start its loops
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(id: impl Into<String>, codec: CodecType, options: ForwarderOptions) -> Self {
        let id = id.into();
        let capacity = options.capacity.max(1);
        let kind = codec.kind();
        let (hub, hub_rx) = mpsc::channel(capacity);
        let (commands, command_rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared::default());
        let codec = Arc::new(RwLock::new(codec));

        let keyframes = (kind == TrackKind::Video).then(|| {
            let (tx, rx) = mpsc::channel(capacity);
            let inspector = KeyframeInspector {
                stream_id: id.clone(),
                codec: codec.clone(),
                shared: shared.clone(),
                on_ssrc_change: options.on_ssrc_change.clone(),
                cancel: cancel.clone(),
            };
            tokio::spawn(inspector.run(rx));
            tx
        });

        let dispatcher = Dispatcher {
            stream_id: id.clone(),
            consumers: HashMap::new(),
            shared: shared.clone(),
            keyframes,
            activity: options.activity,
            cancel: cancel.clone(),
        };
        tokio::spawn(dispatcher.run(command_rx, hub_rx));

        tracing::debug!(stream = %id, kind = %kind, codec = %*codec.read(), "Forwarder created");

        Self {
            id,
            kind,
            codec,
            capacity,
            next_generation: AtomicU64::new(1),
            hub,
            commands,
            shared,
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Media kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Codec used for keyframe inspection
    pub fn codec(&self) -> CodecType {
        *self.codec.read()
    }

    /// Change the codec used for keyframe inspection
    ///
    /// Forwarders created lazily by a registration start with the kind's
    /// default codec until the producer's track shows up.
    pub fn set_codec(&self, codec: CodecType) {
        let mut current = self.codec.write();
        if *current != codec {
            tracing::debug!(stream = %self.id, from = %*current, to = %codec, "Forwarder codec changed");
            *current = codec;
        }
    }

    /// Whether the forwarder has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enqueue a packet for fan-out
    ///
    /// Waits while the inbound queue is full; callers on a real-time path may
    /// drop instead of waiting.
    pub async fn push(&self, wrapper: Wrapper) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.closed_error()),
            sent = self.hub.send(wrapper) => sent.map_err(|_| self.closed_error()),
        }
    }

    /// Register `consumer_id`, replacing any existing registration
    ///
    /// Returns once the dispatch loop has applied the registration, so every
    /// packet pushed afterwards reaches the new consumer.
    pub async fn register(&self, consumer_id: &str, handler: PacketHandler) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let (queue, rx) = mpsc::channel(self.capacity);
        let cancel = self.cancel.child_token();
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let previous = self.shared.registrations.lock().insert(
            consumer_id.to_string(),
            Registration {
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        tokio::spawn(consume(
            self.id.clone(),
            consumer_id.to_string(),
            rx,
            handler,
            cancel.clone(),
        ));

        let (ack, done) = oneshot::channel();
        let command = Command::Register {
            consumer_id: consumer_id.to_string(),
            consumer: Consumer {
                generation,
                queue,
                cancel: cancel.clone(),
            },
            ack,
        };
        if let Err(e) = self.request(command, done).await {
            cancel.cancel();
            self.shared.forget(consumer_id, generation);
            return Err(e);
        }

        tracing::debug!(stream = %self.id, consumer = %consumer_id, "Consumer registered");
        Ok(())
    }

    /// Stop delivery to `consumer_id`; unknown ids are ignored
    ///
    /// The consumer is cancelled before the dispatch loop is asked to drop
    /// it, so a consumer that stopped draining its queue cannot hold the
    /// call up.
    pub async fn unregister(&self, consumer_id: &str) {
        let removed = self.shared.registrations.lock().remove(consumer_id);
        if let Some(registration) = removed {
            registration.cancel.cancel();
        }

        let (ack, done) = oneshot::channel();
        let command = Command::Unregister {
            consumer_id: consumer_id.to_string(),
            ack,
        };
        if self.request(command, done).await.is_ok() {
            tracing::debug!(stream = %self.id, consumer = %consumer_id, "Consumer unregistered");
        }
    }

    /// Resend the cached keyframe to `consumer_id` only
    ///
    /// Returns whether a keyframe was queued; false when there is no cached
    /// keyframe or the consumer is not registered.
    pub async fn send_keyframe(&self, consumer_id: &str) -> Result<bool> {
        let (ack, done) = oneshot::channel();
        let command = Command::SendKeyFrame {
            consumer_id: consumer_id.to_string(),
            ack,
        };
        self.request(command, done).await
    }

    /// The cached keyframe, if any
    pub fn keyframe(&self) -> Option<Wrapper> {
        self.shared.keyframe.read().clone()
    }

    /// Ids of the registered consumers, sorted
    pub fn consumer_ids(&self) -> Vec<String> {
        self.shared.consumer_ids.read().clone()
    }

    /// Whether `consumer_id` is registered
    pub fn has_consumer(&self, consumer_id: &str) -> bool {
        self.shared
            .consumer_ids
            .read()
            .iter()
            .any(|id| id == consumer_id)
    }

    /// Unix milliseconds of the last dispatched packet
    pub fn last_received(&self) -> Option<i64> {
        match self.shared.last_received.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }

    /// Stop every loop; idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        tracing::info!(stream = %self.id, "Forwarder closed");
    }

    async fn request<T>(&self, command: Command, done: oneshot::Receiver<T>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.closed_error()),
            sent = self.commands.send(command) => sent.map_err(|_| self.closed_error())?,
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.closed_error()),
            reply = done => reply.map_err(|_| self.closed_error()),
        }
    }

    fn closed_error(&self) -> SfuError {
        SfuError::NotFound(format!("forwarder {} is closed", self.id))
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Command and dispatch loop state, owned by one task
struct Dispatcher {
    stream_id: String,
    consumers: HashMap<String, Consumer>,
    shared: Arc<Shared>,
    keyframes: Option<mpsc::Sender<Wrapper>>,
    activity: Option<mpsc::Sender<Activity>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut hub: mpsc::Receiver<Wrapper>) {
        loop {
            // commands first: a registration enqueued before a push is
            // always applied before that push is dispatched
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = commands.recv() => self.apply(command).await,
                Some(wrapper) = hub.recv() => self.dispatch(wrapper).await,
                else => break,
            }
        }

        for consumer in self.consumers.values() {
            consumer.cancel.cancel();
        }
        self.consumers.clear();
        self.shared.registrations.lock().clear();
        self.shared.consumer_ids.write().clear();
        tracing::debug!(stream = %self.stream_id, "Forwarder dispatch loop stopped");
    }

    async fn apply(&mut self, command: Command) {
        match command {
            Command::Register {
                consumer_id,
                consumer,
                ack,
            } => {
                // unregistered or replaced while the command was queued
                if consumer.cancel.is_cancelled() {
                    let _ = ack.send(());
                    return;
                }
                if let Some(previous) = self.consumers.insert(consumer_id.clone(), consumer) {
                    previous.cancel.cancel();
                    tracing::debug!(stream = %self.stream_id, consumer = %consumer_id, "Replaced existing consumer");
                }
                self.publish_consumers();
                let _ = ack.send(());
            }
            Command::Unregister { consumer_id, ack } => {
                // a registration applied after the caller cancelled the old
                // one is live and stays
                let retired = self
                    .consumers
                    .get(&consumer_id)
                    .is_some_and(|consumer| consumer.cancel.is_cancelled());
                if retired {
                    self.consumers.remove(&consumer_id);
                    self.publish_consumers();
                }
                let _ = ack.send(());
            }
            Command::SendKeyFrame { consumer_id, ack } => {
                let keyframe = self.shared.keyframe.read().clone();
                let sent = match (keyframe, self.consumers.get(&consumer_id)) {
                    (Some(keyframe), Some(consumer)) => deliver(consumer, keyframe, &self.cancel).await,
                    _ => false,
                };
                let _ = ack.send(sent);
            }
        }
    }

    async fn dispatch(&mut self, mut wrapper: Wrapper) {
        // decode once so every consumer clone shares the parsed packet
        if let Err(e) = wrapper.decode() {
            tracing::debug!(stream = %self.stream_id, error = %e, "Dispatching undecodable packet");
        }

        if let Some(keyframes) = &self.keyframes {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = keyframes.send(wrapper.clone()) => {}
            }
        }

        let mut gone = Vec::new();
        for (consumer_id, consumer) in &self.consumers {
            if !deliver(consumer, wrapper.clone(), &self.cancel).await {
                if self.cancel.is_cancelled() {
                    return;
                }
                gone.push(consumer_id.clone());
            }
        }
        if !gone.is_empty() {
            for consumer_id in gone {
                if let Some(consumer) = self.consumers.remove(&consumer_id) {
                    consumer.cancel.cancel();
                    self.shared.forget(&consumer_id, consumer.generation);
                }
                tracing::debug!(stream = %self.stream_id, consumer = %consumer_id, "Dropped consumer whose loop has stopped");
            }
            self.publish_consumers();
        }

        let now = unix_millis();
        self.shared.last_received.store(now, Ordering::Release);
        if let Some(activity) = &self.activity {
            let _ = activity.try_send(Activity {
                stream_id: self.stream_id.clone(),
                at: now,
            });
        }
    }

    fn publish_consumers(&self) {
        let mut ids: Vec<String> = self.consumers.keys().cloned().collect();
        ids.sort();
        *self.shared.consumer_ids.write() = ids;
    }
}

/// Queue `wrapper` for one consumer, racing both cancellation signals
async fn deliver(consumer: &Consumer, wrapper: Wrapper, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = consumer.cancel.cancelled() => false,
        sent = consumer.queue.send(wrapper) => sent.is_ok(),
    }
}

/// Per-consumer delivery loop
async fn consume(
    stream_id: String,
    consumer_id: String,
    mut rx: mpsc::Receiver<Wrapper>,
    handler: PacketHandler,
    cancel: CancellationToken,
) {
    loop {
        let mut wrapper = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(wrapper) => wrapper,
                None => break,
            },
        };

        if let Err(e) = wrapper.decode() {
            tracing::debug!(stream = %stream_id, consumer = %consumer_id, error = %e, "Skipping undecodable packet");
            continue;
        }

        let handled = tokio::select! {
            _ = cancel.cancelled() => break,
            handled = handler(stream_id.clone(), wrapper) => handled,
        };
        if let Err(e) = handled {
            tracing::error!(stream = %stream_id, consumer = %consumer_id, error = %e, "Consumer handler failed, stopping delivery");
            break;
        }
    }

    tracing::debug!(stream = %stream_id, consumer = %consumer_id, "Consumer loop stopped");
}

/// Keyframe cache and SSRC watch for video streams
struct KeyframeInspector {
    stream_id: String,
    codec: Arc<RwLock<CodecType>>,
    shared: Arc<Shared>,
    on_ssrc_change: Option<SsrcChangeHandler>,
    cancel: CancellationToken,
}

impl KeyframeInspector {
    async fn run(self, mut rx: mpsc::Receiver<Wrapper>) {
        let mut last_ssrc: Option<u32> = None;

        loop {
            let wrapper = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(wrapper) => wrapper,
                    None => break,
                },
            };

            let codec = *self.codec.read();
            let Some(packet) = wrapper.packet.as_ref() else {
                continue;
            };
            if !keyframe::is_keyframe(codec, &packet.payload) {
                continue;
            }

            let ssrc = packet.header.ssrc;
            if last_ssrc.is_some_and(|previous| previous != ssrc) {
                let consumers = self.shared.consumer_ids.read().clone();
                tracing::info!(
                    stream = %self.stream_id,
                    ssrc,
                    consumers = consumers.len(),
                    "Upstream SSRC changed"
                );
                if let Some(handler) = &self.on_ssrc_change {
                    handler(&self.stream_id, &consumers);
                }
            }
            last_ssrc = Some(ssrc);

            *self.shared.keyframe.write() = Some(wrapper);
            tracing::trace!(stream = %self.stream_id, ssrc, "Cached keyframe");
        }
    }
}
