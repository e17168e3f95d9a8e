//! In-process publish/subscribe bus.

use super::{Stream, Subscription};
use crate::consumer::MessageHandler;
use crate::error::{Result, StreamError};
use crate::types::{Message, Subject};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::debug;

/// Per-domain history kept for late subscribers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayLog {
    /// Late subscribers only see live messages.
    #[default]
    Disabled,
    /// Keep every message.
    Unbounded,
    /// Keep the newest N messages.
    Bounded(usize),
}

impl ReplayLog {
    fn capacity(self) -> Option<usize> {
        match self {
            ReplayLog::Disabled => None,
            ReplayLog::Unbounded => Some(usize::MAX),
            ReplayLog::Bounded(n) => Some(n),
        }
    }
}

/// Configuration for a [`MemoryStream`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MemoryStreamConfig {
    pub replay_log: ReplayLog,
}

/// Message counters for a [`MemoryStream`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Messages accepted by `publish`.
    pub published: u64,
    /// Handler invocations across all subscriptions.
    pub delivered: u64,
}

/// Messages waiting for one subscription's worker.
struct Pending {
    state: Mutex<PendingState>,
    ready: Condvar,
    /// Held by the worker for the duration of a handler call.
    delivering: Mutex<()>,
}

struct PendingState {
    queue: VecDeque<Arc<Message>>,
    closed: bool,
}

impl Pending {
    fn new() -> Self {
        Self {
            state: Mutex::new(PendingState {
                queue: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            delivering: Mutex::new(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn push(&self, msg: Arc<Message>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.queue.push_back(msg);
        self.ready.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.queue.clear();
        self.ready.notify_all();
    }

    /// Block until a message is available. `None` once closed.
    fn next(&self) -> Option<Arc<Message>> {
        let mut state = self.state.lock();
        while state.queue.is_empty() && !state.closed {
            self.ready.wait(&mut state);
        }
        if state.closed {
            return None;
        }
        state.queue.pop_front()
    }
}

/// Subscriptions and history of one domain.
struct Channel {
    subs: HashMap<u64, Arc<Pending>>,
    /// Replay log; also serializes fan-out so every subscription sees the
    /// same order.
    log: Mutex<VecDeque<Arc<Message>>>,
}

impl Channel {
    fn new() -> Self {
        Self {
            subs: HashMap::new(),
            log: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, msg: Arc<Message>, replay: ReplayLog) {
        let mut log = self.log.lock();
        if let Some(capacity) = replay.capacity() {
            if capacity > 0 {
                log.push_back(msg.clone());
                while log.len() > capacity {
                    log.pop_front();
                }
            }
        }
        for sub in self.subs.values() {
            sub.push(msg.clone());
        }
    }
}

struct Inner {
    config: MemoryStreamConfig,
    next_id: AtomicU64,
    channels: RwLock<HashMap<String, Channel>>,
    closed: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
}

impl Inner {
    fn unsubscribe(&self, domain: &str, id: u64) -> Option<Arc<Pending>> {
        let mut channels = self.channels.write();
        let channel = channels.get_mut(domain)?;
        let pending = channel.subs.remove(&id);
        if channel.subs.is_empty() && self.config.replay_log.capacity().is_none() {
            channels.remove(domain);
        }
        pending
    }
}

/// In-process bus.
///
/// Each subscription is served by its own worker thread draining a FIFO
/// queue, so a slow handler never holds up the publisher or other
/// subscriptions.
#[derive(Clone)]
pub struct MemoryStream {
    inner: Arc<Inner>,
}

impl MemoryStream {
    /// Create a bus without a replay log.
    pub fn new() -> Self {
        Self::with_config(MemoryStreamConfig::default())
    }

    pub fn with_config(config: MemoryStreamConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                next_id: AtomicU64::new(1),
                channels: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Create a bus that replays the newest `capacity` messages per domain to
    /// late subscribers.
    pub fn with_replay_log(capacity: usize) -> Self {
        Self::with_config(MemoryStreamConfig {
            replay_log: ReplayLog::Bounded(capacity),
        })
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
        }
    }

    /// Active subscriptions across all domains.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .channels
            .read()
            .values()
            .map(|c| c.subs.len())
            .sum()
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for MemoryStream {
    fn publish(&self, msg: Message) -> Result<()> {
        let replay = self.inner.config.replay_log;
        let msg = Arc::new(msg);
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        {
            let channels = self.inner.channels.read();
            if let Some(channel) = channels.get(msg.domain()) {
                channel.push(msg, replay);
                return Ok(());
            }
        }

        // Nobody listening. Only the replay log cares.
        if replay.capacity().is_some() {
            let mut channels = self.inner.channels.write();
            channels
                .entry(msg.domain().to_string())
                .or_insert_with(Channel::new)
                .push(msg, replay);
        }
        Ok(())
    }

    fn subscribe(&self, domain: &str, handler: Arc<dyn MessageHandler>) -> Result<Box<dyn Subscription>> {
        Subject::validate_domain(domain)?;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let pending = Arc::new(Pending::new());

        {
            let mut channels = self.inner.channels.write();
            let channel = channels.entry(domain.to_string()).or_insert_with(Channel::new);
            let log = channel.log.lock();
            pending.state.lock().queue.extend(log.iter().cloned());
            drop(log);
            channel.subs.insert(id, pending.clone());
        }

        let worker = Worker {
            inner: self.inner.clone(),
            pending: pending.clone(),
            handler,
        };
        let spawned = thread::Builder::new()
            .name(format!("stream-{}-{}", domain, id))
            .spawn(move || worker.run());
        let worker = match spawned {
            Ok(handle) => handle.thread().id(),
            Err(e) => {
                self.inner.unsubscribe(domain, id);
                return Err(StreamError::Io(e));
            }
        };

        debug!(domain, id, "memory stream subscribed");
        Ok(Box::new(MemorySubscription {
            id,
            domain: domain.to_string(),
            inner: self.inner.clone(),
            pending,
            worker,
        }))
    }

    fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        let channels: Vec<Channel> = self.inner.channels.write().drain().map(|(_, c)| c).collect();
        for channel in channels {
            for sub in channel.subs.values() {
                sub.close();
            }
        }
        Ok(())
    }
}

struct Worker {
    inner: Arc<Inner>,
    pending: Arc<Pending>,
    handler: Arc<dyn MessageHandler>,
}

impl Worker {
    fn run(self) {
        while let Some(msg) = self.pending.next() {
            let _delivering = self.pending.delivering.lock();
            if self.pending.is_closed() {
                break;
            }
            if let Err(e) = self.handler.handle_message(&msg) {
                debug!(subject = %msg.subject(), error = %e, "handler returned error");
            }
            self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct MemorySubscription {
    id: u64,
    domain: String,
    inner: Arc<Inner>,
    pending: Arc<Pending>,
    worker: ThreadId,
}

impl Subscription for MemorySubscription {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn close(&self) -> Result<()> {
        self.inner.unsubscribe(&self.domain, self.id);
        self.pending.close();
        // Wait out an in-flight delivery, unless the handler is closing its
        // own subscription.
        if thread::current().id() != self.worker {
            drop(self.pending.delivering.lock());
        }
        Ok(())
    }
}
