//! Handler wrappers the switch builds around every consumer binding.
//!
//! Innermost first: error guard, type limit, exclusive lock, catch-up
//! tracking.

use super::latch::CountdownLatch;
use super::stats::StatsRecorder;
use crate::consumer::{CatchupListener, Consumer, Exclusive, MessageHandler};
use crate::error::{HandlerError, HandlerResult};
use crate::mux::StreamMux;
use crate::types::Message;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Calls the consumer, logging and counting its errors instead of passing
/// them on.
pub(crate) struct Guard {
    name: String,
    consumer: Arc<dyn Consumer>,
    stats: Arc<StatsRecorder>,
}

impl Guard {
    pub fn new(name: &str, consumer: Arc<dyn Consumer>, stats: Arc<StatsRecorder>) -> Self {
        Self {
            name: name.to_string(),
            consumer,
            stats,
        }
    }
}

impl MessageHandler for Guard {
    fn handle_message(&self, msg: &Message) -> HandlerResult {
        self.stats.record_in();
        if let Err(e) = self.consumer.handle_message(msg) {
            self.stats.record_handler_error();
            warn!(consumer = %self.name, subject = %msg.subject(), error = %e, "consumer failed");
        }
        Ok(())
    }
}

/// Drops messages whose type is not one of `types`.
struct Limit {
    inner: Arc<dyn MessageHandler>,
    types: Vec<String>,
}

impl MessageHandler for Limit {
    fn handle_message(&self, msg: &Message) -> HandlerResult {
        if self.types.iter().any(|t| t == msg.subject().kind()) {
            return self.inner.handle_message(msg);
        }
        Ok(())
    }
}

/// Restrict `inner` to `types`. No types, or a blank one, lets everything
/// through.
pub(crate) fn limit(inner: Arc<dyn MessageHandler>, types: Vec<String>) -> Arc<dyn MessageHandler> {
    if types.is_empty() || types.iter().any(String::is_empty) {
        return inner;
    }
    Arc::new(Limit { inner, types })
}

/// Serializes deliveries under the consumer's own lock.
pub(crate) struct ExclusiveHandler {
    inner: Arc<dyn MessageHandler>,
    owner: Arc<dyn Exclusive>,
}

impl ExclusiveHandler {
    pub fn new(inner: Arc<dyn MessageHandler>, owner: Arc<dyn Exclusive>) -> Self {
        Self { inner, owner }
    }
}

impl MessageHandler for ExclusiveHandler {
    fn handle_message(&self, msg: &Message) -> HandlerResult {
        let _guard = self.owner.delivery_lock().lock();
        self.inner.handle_message(msg)
    }
}

/// Catch-up bookkeeping for one consumer, shared by all of its bindings.
pub(crate) struct CatchupTracker {
    name: String,
    listener: Option<Arc<dyn CatchupListener>>,
    domains: Vec<String>,
    produces: Vec<String>,
    mux: Arc<StreamMux>,
    latch: Arc<CountdownLatch>,
    stats: Arc<StatsRecorder>,
    done: AtomicBool,
    /// Domains that have signalled. Also serializes listener deliveries
    /// until done.
    caught_up: Mutex<HashSet<String>>,
}

impl CatchupTracker {
    /// Registers one latch unit per consumed domain.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        listener: Option<Arc<dyn CatchupListener>>,
        domains: Vec<String>,
        produces: Vec<String>,
        mux: Arc<StreamMux>,
        latch: Arc<CountdownLatch>,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        latch.add(domains.len());
        info!(consumer = name, domains = ?domains, "waiting for catch-up");
        Self {
            name: name.to_string(),
            listener,
            domains,
            produces,
            mux,
            latch,
            stats,
            done: AtomicBool::new(false),
            caught_up: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn handle(&self, inner: &dyn MessageHandler, msg: &Message) -> HandlerResult {
        if self.is_done() {
            return inner.handle_message(msg);
        }

        if !msg.is_caught_up() {
            if self.listener.is_some() {
                let _serialized = self.caught_up.lock();
                return inner.handle_message(msg);
            }
            return inner.handle_message(msg);
        }

        let mut caught_up = self.caught_up.lock();
        if self.is_done() {
            return inner.handle_message(msg);
        }
        caught_up.insert(msg.domain().to_string());
        if caught_up.len() != self.domains.len() {
            return Ok(());
        }

        if let Some(listener) = &self.listener {
            listener.caught_up();
        }
        self.done.store(true, Ordering::Release);

        let mut last_err = None;
        for domain in &self.produces {
            let published = Message::caught_up(domain).and_then(|m| self.mux.lookup(domain).publish(m));
            match published {
                Ok(()) => self.stats.record_out(),
                Err(e) => {
                    error!(consumer = %self.name, domain = %domain, error = %e, "publishing caught-up marker failed");
                    last_err = Some(e);
                }
            }
        }

        info!(consumer = %self.name, domains = ?self.domains, "caught up");
        self.latch.count_down(self.domains.len());

        match last_err {
            Some(e) => Err(HandlerError::Stream(e)),
            None => Ok(()),
        }
    }
}

/// Routes one binding's deliveries through its consumer's tracker.
pub(crate) struct CatchupHandler {
    inner: Arc<dyn MessageHandler>,
    tracker: Arc<CatchupTracker>,
}

impl CatchupHandler {
    pub fn new(inner: Arc<dyn MessageHandler>, tracker: Arc<CatchupTracker>) -> Self {
        Self { inner, tracker }
    }
}

impl MessageHandler for CatchupHandler {
    fn handle_message(&self, msg: &Message) -> HandlerResult {
        self.tracker.handle(self.inner.as_ref(), msg)
    }
}
