use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;

/// A counting barrier that releases once its count drops back to zero.
///
/// Release is signalled by disconnecting an internal channel, so waiting can
/// be combined with other channels in a `select!`.
pub struct CountdownLatch {
    state: Mutex<LatchState>,
    released: Receiver<()>,
}

struct LatchState {
    count: usize,
    /// Dropped on release.
    sender: Option<Sender<()>>,
}

impl CountdownLatch {
    pub fn new() -> Self {
        let (sender, released) = bounded(0);
        Self {
            state: Mutex::new(LatchState {
                count: 0,
                sender: Some(sender),
            }),
            released,
        }
    }

    /// Raise the count. Has no effect after release.
    pub fn add(&self, n: usize) {
        let mut state = self.state.lock();
        if state.sender.is_some() {
            state.count += n;
        }
    }

    /// Lower the count, releasing waiters when it reaches zero.
    pub fn count_down(&self, n: usize) {
        let mut state = self.state.lock();
        state.count = state.count.saturating_sub(n);
        if state.count == 0 {
            state.sender = None;
        }
    }

    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_released(&self) -> bool {
        let state = self.state.lock();
        state.sender.is_none() || state.count == 0
    }

    /// Block until released or `cancel` fires. Returns `false` on cancel.
    pub fn wait(&self, cancel: &Receiver<()>) -> bool {
        if self.is_released() {
            return true;
        }
        select! {
            recv(self.released) -> _ => true,
            recv(cancel) -> _ => false,
        }
    }
}

impl Default for CountdownLatch {
    fn default() -> Self {
        Self::new()
    }
}
