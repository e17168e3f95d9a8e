use crate::consumer::MessageHandler;
use crate::error::{HandlerResult, Result};
use crate::stream::{MemoryStream, Stream, Subscription};
use crate::types::Message;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};

/// Re-broadcasts one physical subscription to many handlers.
///
/// Every message received is republished on a private in-process bus that
/// all handlers subscribe to, so they observe the same ordered sequence
/// without the upstream transport keeping a log for late subscribers.
pub struct FanoutHandler {
    domain: String,
    bus: MemoryStream,
    subscriptions: Mutex<Vec<Box<dyn Subscription>>>,
}

impl FanoutHandler {
    pub fn new(domain: &str, handlers: impl IntoIterator<Item = Arc<dyn MessageHandler>>) -> Result<Self> {
        let bus = MemoryStream::new();
        let mut subscriptions = Vec::new();
        for handler in handlers {
            match bus.subscribe(domain, handler) {
                Ok(sub) => subscriptions.push(sub),
                Err(e) => {
                    for sub in &subscriptions {
                        let _ = sub.close();
                    }
                    return Err(e);
                }
            }
        }
        debug!(domain, handlers = subscriptions.len(), "fanout created");
        Ok(Self {
            domain: domain.to_string(),
            bus,
            subscriptions: Mutex::new(subscriptions),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Handlers still attached.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach every handler and close the private bus.
    pub fn close(&self) -> Result<()> {
        let subscriptions: Vec<Box<dyn Subscription>> = self.subscriptions.lock().drain(..).collect();
        let mut last_err = None;
        for sub in subscriptions {
            if let Err(e) = sub.close() {
                error!(domain = %self.domain, error = %e, "closing fanout subscription failed");
                last_err = Some(e);
            }
        }
        if let Err(e) = self.bus.close() {
            last_err = Some(e);
        }
        last_err.map_or(Ok(()), Err)
    }
}

impl MessageHandler for FanoutHandler {
    fn handle_message(&self, msg: &Message) -> HandlerResult {
        self.bus.publish(msg.clone())?;
        Ok(())
    }
}
