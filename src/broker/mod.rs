//! Durable, sequence-numbered message brokers.
//!
//! A broker stores opaque payloads per domain and numbers them from 1. It is
//! the narrow contract a [`DurableStream`] needs: query the last sequence,
//! append, and replay-then-follow from a sequence.
//!
//! [`DurableStream`]: crate::stream::DurableStream

mod log;

pub use self::log::{LogBroker, LogBrokerConfig};

use crate::error::Result;
use crate::stream::Subscription;
use crate::types::{Sequence, Timestamp};

/// A payload as stored by a broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerRecord {
    pub domain: String,
    pub sequence: Sequence,
    pub time: Timestamp,
    pub data: Vec<u8>,
}

/// Callback receiving records on a subscription's worker, in sequence order.
pub type Deliver = Box<dyn FnMut(BrokerRecord) + Send>;

/// The durable transport contract.
pub trait Broker: Send + Sync {
    /// Highest sequence stored for `domain`; `Sequence(0)` if none.
    fn last_sequence(&self, domain: &str) -> Result<Sequence>;

    /// Append a payload and return its sequence.
    fn publish(&self, domain: &str, data: &[u8]) -> Result<Sequence>;

    /// Deliver every record with sequence >= `from`, then follow new ones.
    fn subscribe(&self, domain: &str, from: Sequence, deliver: Deliver) -> Result<Box<dyn Subscription>>;

    fn close(&self) -> Result<()>;
}
