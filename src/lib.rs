//! # Stream Switch
//!
//! Wires independently written event consumers into one deterministically
//! ordered pipeline over one or more transports.
//!
//! ## Core Concepts
//!
//! - **Subjects**: `domain[:type]` names; domains route, types filter
//! - **Streams**: transports with ordered per-subscription delivery, either
//!   in-process or over a durable, sequence-numbered broker
//! - **Topology**: derived domains are subscribed before the roots feeding them
//! - **Switch**: builds handler chains, fans root domains out and propagates
//!   "caught up" through the pipeline
//!
//! ## Example
//!
//! ```ignore
//! use streamswitch::{MemoryStream, Registration, StreamMux, Switch, SwitchConfig};
//!
//! let mux = Arc::new(StreamMux::new(Arc::new(MemoryStream::new())));
//! let switch = Switch::new(
//!     mux,
//!     vec![Registration::new(Arc::new(projection)).producer().build()],
//!     SwitchConfig::default(),
//! )?;
//!
//! let (shutdown, cancel) = Switch::shutdown_channel();
//! switch.run(&cancel)?;
//! ```

pub mod broker;
pub mod consumer;
pub mod error;
pub mod mux;
pub mod publisher;
pub mod stream;
pub mod switch;
pub mod topology;
pub mod types;

// Re-exports
pub use broker::{Broker, BrokerRecord, LogBroker, LogBrokerConfig};
pub use consumer::{
    CatchupListener, Consumer, Exclusive, MessageHandler, Producer, Registration,
    RegistrationBuilder,
};
pub use error::{HandlerError, HandlerResult, Result, StreamError};
pub use mux::StreamMux;
pub use publisher::EntityPublisher;
pub use stream::{
    DiscardList, DurableStats, DurableStream, DurableStreamConfig, MemoryStream,
    MemoryStreamConfig, ReplayLog, Stream, StreamStats, Subscription,
};
pub use switch::{Switch, SwitchConfig, SwitchState, SwitchStats};
pub use topology::Topology;
pub use types::*;
