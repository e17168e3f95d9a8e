//! Stream adapter over a durable, sequence-numbered broker.

use super::{DiscardList, Stream, Subscription};
use crate::broker::{Broker, BrokerRecord};
use crate::consumer::MessageHandler;
use crate::error::Result;
use crate::types::{Message, Sequence, Subject, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Durable stream configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DurableStreamConfig {
    /// Emit the caught-up marker before any stored record, skipping the wait
    /// for the backlog.
    pub immediate_catch_up: bool,

    /// Records never handed to subscribers.
    pub discard: DiscardList,
}

/// Counters shared by every subscription of a durable stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DurableStats {
    /// Records received from the broker.
    pub messages: u64,
    /// Records skipped by the discard list.
    pub discarded: u64,
    /// Records whose envelope could not be decoded.
    pub decode_errors: u64,
}

/// On-the-wire form of a message. The domain is the broker channel.
#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    time: Timestamp,
    body: Vec<u8>,
    meta: Vec<u8>,
}

#[derive(Default)]
struct Counters {
    messages: AtomicU64,
    discarded: AtomicU64,
    decode_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DurableStats {
        DurableStats {
            messages: self.messages.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// A [`Stream`] over a [`Broker`] that announces when each subscription has
/// replayed the backlog that existed when its domain was first subscribed.
pub struct DurableStream<B: Broker> {
    broker: Arc<B>,
    config: DurableStreamConfig,
    last_sequences: Mutex<HashMap<String, Sequence>>,
    counters: Arc<Counters>,
}

impl<B: Broker + 'static> DurableStream<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self::with_config(broker, DurableStreamConfig::default())
    }

    pub fn with_config(broker: Arc<B>, config: DurableStreamConfig) -> Self {
        Self {
            broker,
            config,
            last_sequences: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn stats(&self) -> DurableStats {
        self.counters.snapshot()
    }

    /// Last sequence of `domain`, queried once and then cached.
    fn last_sequence(&self, domain: &str) -> Result<Sequence> {
        let mut cache = self.last_sequences.lock();
        if let Some(seq) = cache.get(domain) {
            return Ok(*seq);
        }
        let seq = self.broker.last_sequence(domain)?;
        cache.insert(domain.to_string(), seq);
        Ok(seq)
    }
}

fn encode(msg: Message) -> Result<(String, Vec<u8>)> {
    let (subject, time, body, meta) = msg.into_parts();
    let envelope = Envelope {
        kind: subject.kind().to_string(),
        time,
        body,
        meta,
    };
    Ok((subject.domain().to_string(), rmp_serde::to_vec_named(&envelope)?))
}

fn decode(record: BrokerRecord) -> Result<Message> {
    let envelope: Envelope = rmp_serde::from_slice(&record.data)?;
    let subject = Subject::new(record.domain, envelope.kind)?;
    Ok(Message::raw(subject, envelope.body)
        .with_meta(envelope.meta)
        .with_time(envelope.time)
        .with_sequence(record.sequence))
}

fn announce(domain: &str, handler: &dyn MessageHandler) -> Result<()> {
    let msg = Message::caught_up(domain)?;
    if let Err(e) = handler.handle_message(&msg) {
        debug!(domain, error = %e, "caught-up handler failed");
    }
    Ok(())
}

impl<B: Broker + 'static> Stream for DurableStream<B> {
    fn publish(&self, msg: Message) -> Result<()> {
        // Markers are synthesized on subscribe and never stored.
        if msg.is_caught_up() {
            debug!(domain = msg.subject().domain(), "caught-up marker not persisted");
            return Ok(());
        }
        let (domain, data) = encode(msg)?;
        let seq = self.broker.publish(&domain, &data)?;
        debug!(domain = %domain, sequence = seq.0, "durable publish");
        Ok(())
    }

    fn subscribe(&self, domain: &str, handler: Arc<dyn MessageHandler>) -> Result<Box<dyn Subscription>> {
        Subject::validate_domain(domain)?;
        let last = self.last_sequence(domain)?;

        let caught_up = Arc::new(AtomicBool::new(false));
        if !last.is_assigned() || self.config.immediate_catch_up {
            caught_up.store(true, Ordering::Release);
            announce(domain, handler.as_ref())?;
            info!(domain, messages = 0, "durable subscription caught up");
        }

        let discard = self.config.discard.clone();
        let counters = self.counters.clone();
        let owned_domain = domain.to_string();
        let deliver = Box::new(move |record: BrokerRecord| {
            counters.messages.fetch_add(1, Ordering::Relaxed);
            let sequence = record.sequence;

            if discard.contains(&owned_domain, sequence) {
                counters.discarded.fetch_add(1, Ordering::Relaxed);
            } else {
                match decode(record) {
                    Ok(msg) if msg.is_caught_up() => {
                        counters.discarded.fetch_add(1, Ordering::Relaxed);
                        debug!(domain = %owned_domain, sequence = sequence.0, "stored caught-up marker skipped");
                    }
                    Ok(msg) => {
                        if let Err(e) = handler.handle_message(&msg) {
                            debug!(domain = %owned_domain, sequence = sequence.0, error = %e, "handler failed");
                        }
                    }
                    Err(e) => {
                        counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                        debug!(domain = %owned_domain, sequence = sequence.0, error = %e, "undecodable record");
                    }
                }
            }

            // The marker follows the last backlog record whatever happened to it.
            if sequence >= last && !caught_up.swap(true, Ordering::AcqRel) {
                if let Err(e) = announce(&owned_domain, handler.as_ref()) {
                    debug!(domain = %owned_domain, error = %e, "caught-up marker failed");
                }
                let stats = counters.snapshot();
                info!(
                    domain = %owned_domain,
                    messages = stats.messages,
                    discarded = stats.discarded,
                    decode_errors = stats.decode_errors,
                    "durable subscription caught up"
                );
            }
        });

        self.broker.subscribe(domain, Sequence(1), deliver)
    }

    fn close(&self) -> Result<()> {
        self.broker.close()
    }
}
