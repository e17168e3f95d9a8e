//! Transports that move messages between publishers and handlers.
//!
//! A stream routes by domain only: every subscription on a domain sees every
//! message published to it, in publish order. Type filtering happens above
//! this layer. Two implementations are provided:
//! - [`MemoryStream`]: in-process bus with an optional replay log
//! - [`DurableStream`]: adapter over a sequence-numbered [`Broker`] that
//!   announces when a subscription has replayed its backlog
//!
//! # Example
//!
//! ```ignore
//! let stream = MemoryStream::new();
//! let sub = stream.subscribe("service", Arc::new(|msg: &Message| {
//!     println!("got {}", msg.subject());
//!     Ok(())
//! }))?;
//!
//! stream.publish(Message::new(Subject::parse("service:updated")?))?;
//! sub.close()?;
//! ```
//!
//! [`Broker`]: crate::broker::Broker

mod discard;
mod durable;
mod memory;

pub use discard::DiscardList;
pub use durable::{DurableStats, DurableStream, DurableStreamConfig};
pub use memory::{MemoryStream, MemoryStreamConfig, ReplayLog, StreamStats};

use crate::consumer::MessageHandler;
use crate::error::Result;
use crate::types::Message;
use std::sync::Arc;

/// A publish/subscribe transport.
pub trait Stream: Send + Sync {
    /// Publish a message on its subject's domain.
    fn publish(&self, msg: Message) -> Result<()>;

    /// Deliver every message on `domain` to `handler`, in order, on a
    /// background worker.
    fn subscribe(&self, domain: &str, handler: Arc<dyn MessageHandler>) -> Result<Box<dyn Subscription>>;

    /// Release the transport and its subscriptions.
    fn close(&self) -> Result<()>;
}

/// Interest of one handler in one domain.
pub trait Subscription: Send + Sync {
    fn domain(&self) -> &str;

    /// Stop delivery. Idempotent; no delivery starts after this returns.
    fn close(&self) -> Result<()>;
}

impl<S: Stream + ?Sized> Stream for Arc<S> {
    fn publish(&self, msg: Message) -> Result<()> {
        (**self).publish(msg)
    }

    fn subscribe(&self, domain: &str, handler: Arc<dyn MessageHandler>) -> Result<Box<dyn Subscription>> {
        (**self).subscribe(domain, handler)
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}
