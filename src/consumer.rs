//! Consumer capabilities and their registration with a switch.

use crate::error::HandlerResult;
use crate::types::{Message, Subject};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Something that handles delivered messages.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, msg: &Message) -> HandlerResult;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> HandlerResult + Send + Sync,
{
    fn handle_message(&self, msg: &Message) -> HandlerResult {
        self(msg)
    }
}

/// A message handler with declared interests.
pub trait Consumer: MessageHandler {
    /// Subjects to deliver. A domain-only subject means every type.
    fn consumes(&self) -> Vec<Subject>;
}

/// A consumer that publishes on other subjects while handling messages.
pub trait Producer: Send + Sync {
    fn produces(&self) -> Vec<Subject>;
}

/// Notified once every consumed domain has replayed its backlog.
pub trait CatchupListener: Send + Sync {
    fn caught_up(&self);
}

/// A consumer that owns a lock its deliveries must be serialized under.
///
/// Lets one instance receive on several domains at once while sharing the
/// same lock with its own readers.
pub trait Exclusive: Send + Sync {
    fn delivery_lock(&self) -> &Mutex<()>;
}

/// A consumer together with the optional capabilities it provides.
#[derive(Clone)]
pub struct Registration {
    name: String,
    consumer: Arc<dyn Consumer>,
    producer: Option<Arc<dyn Producer>>,
    listener: Option<Arc<dyn CatchupListener>>,
    exclusive: Option<Arc<dyn Exclusive>>,
}

impl Registration {
    /// Start registering a consumer. Declare further capabilities on the
    /// returned builder.
    pub fn new<C: Consumer + 'static>(consumer: Arc<C>) -> RegistrationBuilder<C> {
        RegistrationBuilder {
            name: std::any::type_name::<C>().to_string(),
            consumer,
            producer: None,
            listener: None,
            exclusive: None,
        }
    }

    /// Name used in logs and stats.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumer(&self) -> &Arc<dyn Consumer> {
        &self.consumer
    }

    pub fn consumes(&self) -> Vec<Subject> {
        self.consumer.consumes()
    }

    /// Produced subjects, empty for pure consumers.
    pub fn produces(&self) -> Vec<Subject> {
        self.producer
            .as_ref()
            .map(|p| p.produces())
            .unwrap_or_default()
    }

    pub fn listener(&self) -> Option<&Arc<dyn CatchupListener>> {
        self.listener.as_ref()
    }

    pub fn exclusive(&self) -> Option<&Arc<dyn Exclusive>> {
        self.exclusive.as_ref()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("producer", &self.producer.is_some())
            .field("listener", &self.listener.is_some())
            .field("exclusive", &self.exclusive.is_some())
            .finish()
    }
}

/// Builder returned by [`Registration::new`].
pub struct RegistrationBuilder<C> {
    name: String,
    consumer: Arc<C>,
    producer: Option<Arc<dyn Producer>>,
    listener: Option<Arc<dyn CatchupListener>>,
    exclusive: Option<Arc<dyn Exclusive>>,
}

impl<C: Consumer + 'static> RegistrationBuilder<C> {
    /// Override the name used in logs (defaults to the type name).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The consumer publishes on the subjects of its [`Producer`] impl.
    pub fn producer(mut self) -> Self
    where
        C: Producer,
    {
        self.producer = Some(self.consumer.clone() as Arc<dyn Producer>);
        self
    }

    /// The consumer wants [`CatchupListener::caught_up`].
    pub fn catchup_listener(mut self) -> Self
    where
        C: CatchupListener,
    {
        self.listener = Some(self.consumer.clone() as Arc<dyn CatchupListener>);
        self
    }

    /// Deliveries go through the consumer's [`Exclusive`] lock.
    pub fn exclusive(mut self) -> Self
    where
        C: Exclusive,
    {
        self.exclusive = Some(self.consumer.clone() as Arc<dyn Exclusive>);
        self
    }

    pub fn build(self) -> Registration {
        Registration {
            name: self.name,
            consumer: self.consumer,
            producer: self.producer,
            listener: self.listener,
            exclusive: self.exclusive,
        }
    }
}

impl<C: Consumer + 'static> From<RegistrationBuilder<C>> for Registration {
    fn from(builder: RegistrationBuilder<C>) -> Self {
        builder.build()
    }
}
