use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Snapshot of a switch's counters and timers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SwitchStats {
    /// Messages delivered to consumers.
    pub in_msgs: u64,
    /// Caught-up markers published on produced domains.
    pub out_msgs: u64,
    /// Consumer errors swallowed by the switch.
    pub handler_errors: u64,
    /// When `run` started.
    pub start: Option<SystemTime>,
    /// From start until every subscription was in place.
    pub subscribe_duration: Option<Duration>,
    /// From start until every consumer caught up.
    pub caught_up_duration: Option<Duration>,
}

impl fmt::Display for SwitchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Messages")?;
        writeln!(f, "--------")?;
        writeln!(f, "In: {}", self.in_msgs)?;
        writeln!(f, "Out: {}", self.out_msgs)?;
        writeln!(f, "Handler errors: {}", self.handler_errors)?;
        writeln!(f)?;
        writeln!(f, "Timers")?;
        writeln!(f, "------")?;
        match self.start.and_then(|t| t.duration_since(UNIX_EPOCH).ok()) {
            Some(since_epoch) => writeln!(f, "Started: {}s since epoch", since_epoch.as_secs())?,
            None => writeln!(f, "Started: -")?,
        }
        writeln!(f, "Subscribe: {}", format_duration(self.subscribe_duration))?;
        write!(f, "Caught up: {}", format_duration(self.caught_up_duration))
    }
}

fn format_duration(d: Option<Duration>) -> String {
    match d {
        Some(d) => format!("{:?}", d),
        None => "-".to_string(),
    }
}

#[derive(Default)]
struct Timers {
    start: Option<(SystemTime, Instant)>,
    subscribe_duration: Option<Duration>,
    caught_up_duration: Option<Duration>,
}

/// Live counters shared by the switch and its middleware.
#[derive(Default)]
pub(crate) struct StatsRecorder {
    in_msgs: AtomicU64,
    out_msgs: AtomicU64,
    handler_errors: AtomicU64,
    timers: Mutex<Timers>,
}

impl StatsRecorder {
    pub fn record_in(&self) {
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self) {
        self.out_msgs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_start(&self) {
        self.timers.lock().start = Some((SystemTime::now(), Instant::now()));
    }

    pub fn mark_subscribed(&self) {
        let mut timers = self.timers.lock();
        timers.subscribe_duration = timers.start.map(|(_, at)| at.elapsed());
    }

    pub fn mark_caught_up(&self) {
        let mut timers = self.timers.lock();
        timers.caught_up_duration = timers.start.map(|(_, at)| at.elapsed());
    }

    pub fn snapshot(&self) -> SwitchStats {
        let timers = self.timers.lock();
        SwitchStats {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            start: timers.start.map(|(wall, _)| wall),
            subscribe_duration: timers.subscribe_duration,
            caught_up_duration: timers.caught_up_duration,
        }
    }
}
