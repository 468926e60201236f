//! Watch multiplexer: many logical watchers over one duplex stream.
//!
//! The manager owns a single bidirectional stream per client and an actor
//! task that serializes all protocol state. etcd does not guarantee that
//! watch-create responses arrive in request order, so creates are strictly
//! serialized: only one `create_request` is in flight at a time, and the
//! next is written only after the previous watcher receives its id.
//!
//! On any stream failure every attached watcher is notified, the stream is
//! re-established after a backoff delay, and the still-attached watchers are
//! re-created starting at their last observed revision + 1, so no committed
//! events are missed across reconnects (at-least-once replay).

use crate::errors::{cast_error_message, ClientError};
use crate::pool::ConnectionPool;
use crate::range::Range;
use crate::transport::{FrameSink, FrameSource};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_core_resilience::backoff::{Backoff, BackoffContext};
use tether_core_resilience::{ExponentialBackoff, ExponentialOptions, Jitter};
use tether_proto::{
    methods, KeyValue, ResponseHeader, Revision, Service, WatchCancelRequest, WatchCreateRequest,
    WatchFilter, WatchRequest, WatchResponse,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use tether_proto::EventType;

static NEXT_WATCHER_KEY: AtomicU64 = AtomicU64::new(1);

/// What to watch and how.
#[derive(Debug, Clone)]
pub struct WatchSpec {
    key: Bytes,
    range_end: Option<Bytes>,
    start_revision: Option<Revision>,
    prev_kv: bool,
    progress_notify: bool,
    filters: Vec<WatchFilter>,
    strip_prefix: Option<Bytes>,
}

impl WatchSpec {
    /// Watches a single key.
    pub fn key(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            range_end: None,
            start_revision: None,
            prev_kv: false,
            progress_notify: true,
            filters: Vec::new(),
            strip_prefix: None,
        }
    }

    /// Watches all keys with the given prefix; the prefix is stripped from
    /// keys in emitted events.
    pub fn prefix(prefix: impl Into<Bytes>) -> Self {
        let prefix: Bytes = prefix.into();
        let mut spec = Self::range(Range::prefix(prefix.clone()));
        spec.strip_prefix = Some(prefix);
        spec
    }

    /// Watches a byte range of keys.
    pub fn range(range: Range) -> Self {
        let mut spec = Self::key(range.start);
        spec.range_end = Some(range.end);
        spec
    }

    /// Starts watching from a specific revision.
    pub fn with_start_revision(mut self, revision: Revision) -> Self {
        self.start_revision = Some(revision);
        self
    }

    /// Includes the previous key/value pair in update events.
    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    /// Omits put events from the stream.
    pub fn ignore_puts(mut self) -> Self {
        self.filters.push(WatchFilter::NoPut);
        self
    }

    /// Omits delete events from the stream.
    pub fn ignore_deletes(mut self) -> Self {
        self.filters.push(WatchFilter::NoDelete);
        self
    }

    fn to_create_request(&self) -> WatchCreateRequest {
        WatchCreateRequest {
            key: self.key.clone(),
            range_end: self.range_end.clone(),
            start_revision: self.start_revision,
            progress_notify: self.progress_notify,
            filters: self.filters.clone(),
            prev_kv: self.prev_kv,
        }
    }
}

/// Events delivered to a watcher.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// The watcher was (re)established on the server.
    Connected { revision: Revision },
    /// The underlying stream dropped; the watcher will be re-established.
    Disconnected { error: ClientError },
    Put {
        kv: KeyValue,
        prev_kv: Option<KeyValue>,
    },
    Delete {
        kv: KeyValue,
        prev_kv: Option<KeyValue>,
    },
    /// The watcher was cancelled gracefully and will emit nothing further.
    End,
    /// The server cancelled the watcher with an error.
    Error(ClientError),
}

/// A logical watch subscription; events arrive via [`Watcher::next`].
pub struct Watcher {
    key: u64,
    events: mpsc::UnboundedReceiver<WatchEvent>,
    commands: mpsc::UnboundedSender<Internal>,
    last_revision: Arc<Mutex<Option<Revision>>>,
}

impl Watcher {
    /// The next event, or `None` once the watcher has ended.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// The latest store revision this watcher has observed.
    pub fn last_revision(&self) -> Option<Revision> {
        *self.last_revision.lock()
    }

    /// Cancels the watcher, waiting for the server to confirm removal.
    pub async fn cancel(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(Internal::Detach {
                key: self.key,
                ack: ack_tx,
            })
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }
}

struct StreamParts {
    sink: Arc<dyn FrameSink>,
    source: Box<dyn FrameSource>,
    host: Arc<crate::host::Host>,
}

enum Internal {
    Attach(NewWatcher),
    Detach {
        key: u64,
        ack: oneshot::Sender<()>,
    },
    StreamReady {
        generation: u64,
        result: Result<StreamParts, ClientError>,
    },
    Frame {
        generation: u64,
        frame: WatchResponse,
    },
    StreamError {
        generation: u64,
        error: ClientError,
    },
    Reconnect,
}

struct NewWatcher {
    key: u64,
    spec: WatchSpec,
    events: mpsc::UnboundedSender<WatchEvent>,
    ready: oneshot::Sender<()>,
    last_revision: Arc<Mutex<Option<Revision>>>,
}

/// Multiplexes logical watchers over one stream; see the module docs.
pub struct WatchManager {
    commands: mpsc::UnboundedSender<Internal>,
}

impl WatchManager {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self::with_backoff(
            pool,
            Arc::new(ExponentialBackoff::new(ExponentialOptions {
                initial: std::time::Duration::from_millis(300),
                max_delay: std::time::Duration::from_secs(30),
                exponent: 2.0,
                max_attempts: None,
                jitter: Jitter::Full,
            })),
        )
    }

    /// As [`Self::new`] with a custom reconnect backoff.
    pub fn with_backoff(pool: Arc<ConnectionPool>, backoff: Arc<dyn Backoff>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = WatchActor {
            pool,
            tx: tx.clone(),
            watchers: BTreeMap::new(),
            queue: VecDeque::new(),
            in_flight: None,
            expected_closers: HashSet::new(),
            detach_acks: HashMap::new(),
            state: StreamState::Idle,
            generation: 0,
            backoff_initial: backoff.clone(),
            backoff,
            attempt: 0,
        };
        tokio::spawn(actor.run(rx));
        Self { commands: tx }
    }

    /// Registers a watcher and resolves once the server has confirmed its
    /// creation (surviving reconnect attempts in between).
    pub async fn watch(&self, spec: WatchSpec) -> Result<Watcher, ClientError> {
        let key = NEXT_WATCHER_KEY.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let last_revision = Arc::new(Mutex::new(None));

        self.commands
            .send(Internal::Attach(NewWatcher {
                key,
                spec,
                events: events_tx,
                ready: ready_tx,
                last_revision: last_revision.clone(),
            }))
            .map_err(|_| ClientError::ClientRuntime("watch manager terminated".into()))?;

        ready_rx
            .await
            .map_err(|_| ClientError::ClientRuntime("watch manager terminated".into()))?;

        Ok(Watcher {
            key,
            events: events_rx,
            commands: self.commands.clone(),
            last_revision,
        })
    }
}

enum StreamState {
    Idle,
    Connecting,
    Connected {
        sink: Arc<dyn FrameSink>,
        host: Arc<crate::host::Host>,
    },
}

struct ActorWatcher {
    spec: WatchSpec,
    server_id: Option<i64>,
    events: mpsc::UnboundedSender<WatchEvent>,
    ready: Option<oneshot::Sender<()>>,
    last_revision: Arc<Mutex<Option<Revision>>>,
    detach_requested: bool,
}

struct WatchActor {
    pool: Arc<ConnectionPool>,
    tx: mpsc::UnboundedSender<Internal>,
    watchers: BTreeMap<u64, ActorWatcher>,
    queue: VecDeque<u64>,
    in_flight: Option<u64>,
    expected_closers: HashSet<u64>,
    detach_acks: HashMap<u64, Vec<oneshot::Sender<()>>>,
    state: StreamState,
    generation: u64,
    backoff_initial: Arc<dyn Backoff>,
    backoff: Arc<dyn Backoff>,
    attempt: u32,
}

impl WatchActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Internal>) {
        while let Some(message) = rx.recv().await {
            match message {
                Internal::Attach(new) => self.attach(new).await,
                Internal::Detach { key, ack } => self.detach(key, ack).await,
                Internal::StreamReady { generation, result } => {
                    self.stream_ready(generation, result).await
                }
                Internal::Frame { generation, frame } => self.handle_frame(generation, frame).await,
                Internal::StreamError { generation, error } => {
                    if generation == self.generation {
                        self.handle_error(error);
                    }
                }
                Internal::Reconnect => {
                    if matches!(self.state, StreamState::Idle) {
                        self.establish();
                    }
                }
            }
        }

        // Every handle is gone; end any remaining watchers.
        for (_, watcher) in std::mem::take(&mut self.watchers) {
            let _ = watcher.events.send(WatchEvent::End);
        }
    }

    async fn attach(&mut self, new: NewWatcher) {
        let key = new.key;
        self.watchers.insert(
            key,
            ActorWatcher {
                spec: new.spec,
                server_id: None,
                events: new.events,
                ready: Some(new.ready),
                last_revision: new.last_revision,
                detach_requested: false,
            },
        );
        match self.state {
            StreamState::Idle => self.establish(),
            StreamState::Connecting => {}
            StreamState::Connected { .. } => {
                self.queue.push_back(key);
                self.kick_queue().await;
            }
        }
    }

    async fn detach(&mut self, key: u64, ack: oneshot::Sender<()>) {
        if !matches!(self.state, StreamState::Connected { .. }) {
            if let Some(watcher) = self.watchers.remove(&key) {
                let _ = watcher.events.send(WatchEvent::End);
            }
            self.queue.retain(|k| *k != key);
            let _ = ack.send(());
            return;
        }

        let server_id = match self.watchers.get_mut(&key) {
            Some(watcher) => match watcher.server_id {
                // Creation is in flight; finish the detach once the id
                // arrives or the stream drops.
                None => {
                    watcher.detach_requested = true;
                    self.detach_acks.entry(key).or_default().push(ack);
                    return;
                }
                Some(id) => id,
            },
            None => {
                let _ = ack.send(());
                return;
            }
        };

        self.detach_acks.entry(key).or_default().push(ack);
        self.write_cancel(key, server_id).await;
    }

    fn establish(&mut self) {
        if !matches!(self.state, StreamState::Idle) {
            return;
        }

        // Anyone mid-close is simply dropped; we will not re-add them.
        let closers: Vec<u64> = self.expected_closers.drain().collect();
        for key in closers {
            if let Some(watcher) = self.watchers.remove(&key) {
                let _ = watcher.events.send(WatchEvent::End);
            }
            for ack in self.detach_acks.remove(&key).unwrap_or_default() {
                let _ = ack.send(());
            }
        }

        if self.watchers.is_empty() {
            return;
        }

        self.state = StreamState::Connecting;
        self.generation += 1;
        let generation = self.generation;
        let pool = self.pool.clone();
        let tx = self.tx.clone();
        debug!("establishing watch stream");
        tokio::spawn(async move {
            let result = async {
                let conn = pool.connection(Service::Watch).await?;
                let host = conn.host.clone();
                let stream = conn.open_duplex(methods::WATCH).await?;
                let (sink, source) = stream.split();
                Ok(StreamParts { sink, source, host })
            }
            .await;
            let _ = tx.send(Internal::StreamReady { generation, result });
        });
    }

    async fn stream_ready(&mut self, generation: u64, result: Result<StreamParts, ClientError>) {
        if generation != self.generation || !matches!(self.state, StreamState::Connecting) {
            return; // stale connection attempt
        }
        let parts = match result {
            Ok(parts) => parts,
            Err(error) => {
                self.handle_error(error);
                return;
            }
        };

        self.state = StreamState::Connected {
            sink: parts.sink,
            host: parts.host,
        };
        self.spawn_pump(generation, parts.source);

        // Watchers may all have detached while we were connecting.
        if self.watchers.is_empty() {
            self.destroy_stream();
            return;
        }

        self.queue = self.watchers.keys().copied().collect();
        self.in_flight = None;
        self.kick_queue().await;
    }

    fn spawn_pump(&self, generation: u64, mut source: Box<dyn FrameSource>) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            loop {
                match source.next().await {
                    Some(Ok(value)) => match serde_json::from_value::<WatchResponse>(value) {
                        Ok(frame) => {
                            if tx.send(Internal::Frame { generation, frame }).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Internal::StreamError {
                                generation,
                                error: ClientError::ClientRuntime(format!(
                                    "malformed watch frame: {e}"
                                )),
                            });
                            return;
                        }
                    },
                    Some(Err(error)) => {
                        let _ = tx.send(Internal::StreamError { generation, error });
                        return;
                    }
                    None => {
                        let _ = tx.send(Internal::StreamError {
                            generation,
                            error: ClientError::WatchStreamEnded,
                        });
                        return;
                    }
                }
            }
        });
    }

    async fn kick_queue(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        loop {
            let Some(&key) = self.queue.front() else {
                return;
            };
            let Some(watcher) = self.watchers.get(&key) else {
                self.queue.pop_front();
                continue;
            };
            let sink = match &self.state {
                StreamState::Connected { sink, .. } => sink.clone(),
                _ => return,
            };

            let create = watcher.spec.to_create_request();
            let frame = match serde_json::to_value(WatchRequest::CreateRequest(create)) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to encode watch create request");
                    self.queue.pop_front();
                    continue;
                }
            };

            self.in_flight = Some(key);
            if sink.send(frame).await.is_err() {
                // The stream died under us; the pump will report it.
                self.in_flight = None;
            }
            return;
        }
    }

    async fn handle_frame(&mut self, generation: u64, frame: WatchResponse) {
        if generation != self.generation {
            return;
        }

        // Data on the stream proves the connection recovered.
        self.backoff = self.backoff_initial.clone();
        self.attempt = 0;

        if frame.created {
            self.handle_create(frame).await;
            return;
        }

        let Some(key) = self
            .watchers
            .iter()
            .find(|(_, w)| w.server_id == Some(frame.watch_id))
            .map(|(key, _)| *key)
        else {
            warn!(watch_id = frame.watch_id, "frame for unknown watcher");
            return;
        };

        if frame.canceled {
            self.handle_cancel(key, frame);
            if self.watchers.is_empty() {
                self.destroy_stream();
            }
        } else {
            self.dispatch_update(key, frame);
        }
    }

    async fn handle_create(&mut self, frame: WatchResponse) {
        let Some(key) = self.in_flight.take() else {
            warn!("create response with no creation in flight");
            return;
        };
        if self.queue.front() == Some(&key) {
            self.queue.pop_front();
        }

        let mut cancel_now = None;
        if let Some(watcher) = self.watchers.get_mut(&key) {
            watcher.server_id = Some(frame.watch_id);
            Self::update_revision(watcher, &frame.header);
            if let Some(ready) = watcher.ready.take() {
                let _ = ready.send(());
            }
            let _ = watcher.events.send(WatchEvent::Connected {
                revision: frame.header.revision,
            });
            if watcher.detach_requested {
                cancel_now = Some(frame.watch_id);
            }
        }
        if let Some(id) = cancel_now {
            self.write_cancel(key, id).await;
        }

        self.kick_queue().await;
    }

    fn handle_cancel(&mut self, key: u64, frame: WatchResponse) {
        let watcher = self.watchers.remove(&key);
        self.queue.retain(|k| *k != key);

        if self.expected_closers.remove(&key) {
            if let Some(watcher) = watcher {
                let _ = watcher.events.send(WatchEvent::End);
            }
            for ack in self.detach_acks.remove(&key).unwrap_or_default() {
                let _ = ack.send(());
            }
            return;
        }

        if let Some(watcher) = watcher {
            let reason = frame
                .cancel_reason
                .unwrap_or_else(|| "watcher canceled".to_string());
            let _ = watcher
                .events
                .send(WatchEvent::Error(cast_error_message(&reason)));
        }
    }

    fn dispatch_update(&mut self, key: u64, frame: WatchResponse) {
        let Some(watcher) = self.watchers.get_mut(&key) else {
            return;
        };
        for event in frame.events {
            let mut kv = event.kv;
            let mut prev_kv = event.prev_kv;
            if let Some(prefix) = &watcher.spec.strip_prefix {
                kv.key = strip_prefix(kv.key, prefix);
                if let Some(prev) = &mut prev_kv {
                    prev.key = strip_prefix(prev.key.clone(), prefix);
                }
            }
            let message = match event.event_type {
                EventType::Put => WatchEvent::Put { kv, prev_kv },
                EventType::Delete => WatchEvent::Delete { kv, prev_kv },
            };
            let _ = watcher.events.send(message);
        }
        Self::update_revision(watcher, &frame.header);
    }

    fn update_revision(watcher: &mut ActorWatcher, header: &ResponseHeader) {
        watcher.spec.start_revision = Some(header.revision.succ());
        *watcher.last_revision.lock() = Some(header.revision);
    }

    async fn write_cancel(&mut self, key: u64, server_id: i64) {
        self.expected_closers.insert(key);
        let sink = match &self.state {
            StreamState::Connected { sink, .. } => sink.clone(),
            _ => return,
        };
        if let Ok(frame) = serde_json::to_value(WatchRequest::CancelRequest(WatchCancelRequest {
            watch_id: server_id,
        })) {
            let _ = sink.send(frame).await;
        }
    }

    fn destroy_stream(&mut self) {
        debug!("destroying watch stream with no active watchers");
        self.generation += 1;
        self.state = StreamState::Idle;
        self.queue.clear();
        self.in_flight = None;
    }

    fn handle_error(&mut self, error: ClientError) {
        if let StreamState::Connected { host, .. } = &self.state {
            self.pool.mark_failed(host, &error);
        }
        debug!(error = %error, "watch stream disconnected");

        self.generation += 1;
        self.state = StreamState::Idle;
        self.queue.clear();
        self.in_flight = None;

        let mut detached = Vec::new();
        for (key, watcher) in self.watchers.iter_mut() {
            watcher.server_id = None;
            let _ = watcher.events.send(WatchEvent::Disconnected {
                error: error.clone(),
            });
            if watcher.detach_requested {
                detached.push(*key);
            }
        }
        for key in detached {
            if let Some(watcher) = self.watchers.remove(&key) {
                let _ = watcher.events.send(WatchEvent::End);
            }
            for ack in self.detach_acks.remove(&key).unwrap_or_default() {
                let _ = ack.send(());
            }
        }

        let delay = self.backoff.duration();
        self.attempt += 1;
        if let Some(next) = self.backoff.next(&BackoffContext {
            attempt: self.attempt,
        }) {
            self.backoff = next;
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::Reconnect);
        });
    }
}

fn strip_prefix(key: Bytes, prefix: &Bytes) -> Bytes {
    if key.starts_with(prefix) {
        key.slice(prefix.len()..)
    } else {
        key
    }
}
