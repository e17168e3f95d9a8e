//! The switch: wires registered consumers to their streams.
//!
//! A switch takes the set of consumers of a process and
//! 1. explodes each into one handler chain per consumed domain,
//! 2. subscribes derived domains before the roots feeding them (see
//!    [`Topology`]),
//! 3. gives every root domain with several consumers a single physical
//!    subscription that fans out over a private bus,
//! 4. tracks when each consumer has replayed all of its domains, passes the
//!    news on to the domains it produces and releases [`Switch::run`] once
//!    everyone is caught up.
//!
//! # Example
//!
//! ```ignore
//! let stream = Arc::new(MemoryStream::new());
//! let mux = Arc::new(StreamMux::new(stream));
//! let switch = Switch::new(mux, registrations, SwitchConfig::default())?
//!     .on_caught_up(|| info!("ready"));
//!
//! let (shutdown, cancel) = Switch::shutdown_channel();
//! // ... hand `shutdown` to a signal handler
//! switch.run(&cancel)?;
//! ```

mod fanout;
mod latch;
mod middleware;
mod stats;

pub use fanout::FanoutHandler;
pub use latch::CountdownLatch;
pub use stats::SwitchStats;

use self::middleware::{limit, CatchupHandler, CatchupTracker, ExclusiveHandler, Guard};
use self::stats::StatsRecorder;
use crate::consumer::{MessageHandler, Registration};
use crate::error::{Result, StreamError};
use crate::mux::StreamMux;
use crate::stream::Subscription;
use crate::topology::Topology;
use crate::types::Subject;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Switch configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Block `run` until every consumer is caught up. When disabled, every
    /// catch-up listener is notified right after subscribing.
    pub wait_on_caught_up: bool,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            wait_on_caught_up: true,
        }
    }
}

/// Lifecycle of a switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchState {
    Building,
    Subscribing,
    AwaitingCatchUp,
    Serving,
    Closing,
    Closed,
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwitchState::Building => "building",
            SwitchState::Subscribing => "subscribing",
            SwitchState::AwaitingCatchUp => "awaiting catch-up",
            SwitchState::Serving => "serving",
            SwitchState::Closing => "closing",
            SwitchState::Closed => "closed",
        };
        f.write_str(name)
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// One consumer's chain on one domain.
struct Binding {
    consumer: String,
    handler: Arc<dyn MessageHandler>,
}

/// Publish/subscribe orchestrator.
pub struct Switch {
    mux: Arc<StreamMux>,
    registrations: Vec<Registration>,
    config: SwitchConfig,
    topology: Topology,
    bindings: BTreeMap<String, Vec<Binding>>,
    latch: Arc<CountdownLatch>,
    stats: Arc<StatsRecorder>,
    state: Mutex<SwitchState>,
    subscriptions: Mutex<Vec<Box<dyn Subscription>>>,
    fanouts: Mutex<Vec<Arc<FanoutHandler>>>,
    on_subscribed: Option<Hook>,
    on_caught_up: Option<Hook>,
}

impl Switch {
    /// Build the handler chains and the subscription order.
    pub fn new(mux: Arc<StreamMux>, registrations: Vec<Registration>, config: SwitchConfig) -> Result<Self> {
        let topology = Topology::new(&registrations);
        for (domain, producers) in topology.duplicate_producers() {
            warn!(domain, producers = ?producers, "domain has several producers");
        }

        let latch = Arc::new(CountdownLatch::new());
        let stats = Arc::new(StatsRecorder::default());
        let mut bindings: BTreeMap<String, Vec<Binding>> = BTreeMap::new();

        for registration in &registrations {
            let consumed = split_types(&registration.consumes())?;
            let produced: Vec<String> = split_types(&registration.produces())?.into_keys().collect();

            let tracker = if config.wait_on_caught_up {
                Some(Arc::new(CatchupTracker::new(
                    registration.name(),
                    registration.listener().cloned(),
                    consumed.keys().cloned().collect(),
                    produced,
                    mux.clone(),
                    latch.clone(),
                    stats.clone(),
                )))
            } else {
                None
            };

            for (domain, types) in consumed {
                let guard: Arc<dyn MessageHandler> =
                    Arc::new(Guard::new(registration.name(), registration.consumer().clone(), stats.clone()));
                let mut handler = limit(guard, types.into_iter().collect());
                if let Some(owner) = registration.exclusive() {
                    handler = Arc::new(ExclusiveHandler::new(handler, owner.clone()));
                }
                if let Some(tracker) = &tracker {
                    handler = Arc::new(CatchupHandler::new(handler, tracker.clone()));
                }
                bindings.entry(domain).or_default().push(Binding {
                    consumer: registration.name().to_string(),
                    handler,
                });
            }
        }

        debug!(
            consumers = registrations.len(),
            domains = bindings.len(),
            pending = latch.count(),
            "switch built"
        );
        Ok(Self {
            mux,
            registrations,
            config,
            topology,
            bindings,
            latch,
            stats,
            state: Mutex::new(SwitchState::Building),
            subscriptions: Mutex::new(Vec::new()),
            fanouts: Mutex::new(Vec::new()),
            on_subscribed: None,
            on_caught_up: None,
        })
    }

    /// Called once every subscription is in place.
    pub fn on_subscribed(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_subscribed = Some(Box::new(hook));
        self
    }

    /// Called once every consumer has caught up.
    pub fn on_caught_up(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_caught_up = Some(Box::new(hook));
        self
    }

    /// A cancellation pair for [`Switch::run`]. Sending on, or dropping, the
    /// sender stops the switch.
    pub fn shutdown_channel() -> (Sender<()>, Receiver<()>) {
        bounded(1)
    }

    pub fn state(&self) -> SwitchState {
        *self.state.lock()
    }

    pub fn stats(&self) -> SwitchStats {
        self.stats.snapshot()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    /// Subscribe everything, wait for catch-up and serve until `cancel`
    /// fires. Subscriptions are closed before this returns.
    ///
    /// Can be called once per switch.
    pub fn run(&self, cancel: &Receiver<()>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SwitchState::Building {
                return Err(StreamError::InvalidState {
                    expected: SwitchState::Building.to_string(),
                    got: state.to_string(),
                });
            }
            *state = SwitchState::Subscribing;
        }
        self.stats.mark_start();
        info!(domains = self.bindings.len(), "switch subscribing");

        let served = self.serve(cancel);
        if let Err(e) = &served {
            error!(error = %e, "switch failed");
        }

        self.set_state(SwitchState::Closing);
        let closed = self.close();
        self.set_state(SwitchState::Closed);
        info!("switch closed");

        served.and(closed)
    }

    fn serve(&self, cancel: &Receiver<()>) -> Result<()> {
        self.subscribe_all()?;
        self.stats.mark_subscribed();
        if let Some(hook) = &self.on_subscribed {
            hook();
        }

        if self.config.wait_on_caught_up {
            self.set_state(SwitchState::AwaitingCatchUp);
            info!(pending = self.latch.count(), "switch waiting for catch-up");
            if !self.latch.wait(cancel) {
                info!("switch cancelled before catch-up");
                return Ok(());
            }
            info!("switch caught up");
        } else {
            for registration in &self.registrations {
                if let Some(listener) = registration.listener() {
                    listener.caught_up();
                }
            }
        }

        self.stats.mark_caught_up();
        self.set_state(SwitchState::Serving);
        if let Some(hook) = &self.on_caught_up {
            hook();
        }

        // Either a message or a dropped sender.
        let _ = cancel.recv();
        info!("switch cancelled");
        Ok(())
    }

    fn subscribe_all(&self) -> Result<()> {
        for domain in self.topology.sorted_domains() {
            let Some(bindings) = self.bindings.get(&domain) else {
                continue;
            };
            let stream = self.mux.lookup(&domain);
            let root = self.topology.is_root(&domain);

            if root && bindings.len() > 1 {
                let fanout = Arc::new(FanoutHandler::new(
                    &domain,
                    bindings.iter().map(|b| b.handler.clone()),
                )?);
                self.fanouts.lock().push(fanout.clone());
                let sub = stream
                    .subscribe(&domain, fanout)
                    .map_err(|e| subscribe_error(&domain, e))?;
                self.subscriptions.lock().push(sub);
            } else {
                for binding in bindings {
                    let sub = stream
                        .subscribe(&domain, binding.handler.clone())
                        .map_err(|e| subscribe_error(&domain, e))?;
                    self.subscriptions.lock().push(sub);
                }
            }

            let consumers: Vec<&str> = bindings.iter().map(|b| b.consumer.as_str()).collect();
            debug!(domain = %domain, root, consumers = ?consumers, "switch subscribed");
        }
        Ok(())
    }

    /// Close every subscription and fanout bus, returning the last error.
    pub fn close(&self) -> Result<()> {
        let subscriptions: Vec<Box<dyn Subscription>> = self.subscriptions.lock().drain(..).collect();
        let fanouts: Vec<Arc<FanoutHandler>> = self.fanouts.lock().drain(..).collect();

        let mut last_err = None;
        for sub in subscriptions {
            if let Err(e) = sub.close() {
                error!(domain = sub.domain(), error = %e, "closing subscription failed");
                last_err = Some(e);
            }
        }
        for fanout in fanouts {
            if let Err(e) = fanout.close() {
                error!(domain = fanout.domain(), error = %e, "closing fanout failed");
                last_err = Some(e);
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    fn set_state(&self, next: SwitchState) {
        let mut state = self.state.lock();
        let previous = *state;
        debug!(from = %previous, to = %next, "switch state");
        *state = next;
    }
}

impl fmt::Debug for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Switch")
            .field("state", &self.state())
            .field("domains", &self.bindings.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

fn subscribe_error(domain: &str, e: StreamError) -> StreamError {
    StreamError::Subscribe {
        domain: domain.to_string(),
        reason: e.to_string(),
    }
}

/// Group subjects by domain. A domain-only subject contributes the blank
/// type.
fn split_types(subjects: &[Subject]) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut split: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for subject in subjects {
        Subject::validate_domain(subject.domain())?;
        split
            .entry(subject.domain().to_string())
            .or_default()
            .insert(subject.kind().to_string());
    }
    Ok(split)
}
