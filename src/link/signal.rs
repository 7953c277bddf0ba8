use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

const ARMED: u8 = 0;
const NOTIFIED: u8 = 1;
const ACKNOWLEDGED: u8 = 2;
const RETIRED: u8 = 3;

/// Single-slot cancellation signal owned by one heartbeat loop.
///
/// The signal moves `Armed -> Notified -> Acknowledged`, or to `Retired`
/// when its loop ends on its own. It can be raised at most once.
#[derive(Debug)]
pub struct PingSignal {
    state: AtomicU8,
    notify: Notify,
}

impl PingSignal {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ARMED),
            notify: Notify::new(),
        }
    }

    /// Raise the signal. Returns `false` if it was raised before or its loop
    /// is already gone.
    pub fn notify(&self) -> bool {
        let raised = self
            .state
            .compare_exchange(ARMED, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if raised {
            // Stores a permit if the loop is not currently waiting
            self.notify.notify_one();
        }
        raised
    }

    /// Non-blocking check by the owning loop. A raised signal is
    /// acknowledged by this call.
    pub fn take(&self) -> bool {
        self.state
            .compare_exchange(NOTIFIED, ACKNOWLEDGED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Resolves once the signal has been raised.
    pub async fn raised(&self) {
        loop {
            let notified = self.notify.notified();
            if self.state.load(Ordering::Acquire) != ARMED {
                return;
            }
            notified.await;
        }
    }

    /// The owning loop has ended.
    pub fn retire(&self) {
        self.state.store(RETIRED, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), ACKNOWLEDGED | RETIRED)
    }
}

/// The signals of every heartbeat loop a node has started.
#[derive(Debug, Default)]
pub struct PingSignals {
    signals: Mutex<Vec<Arc<PingSignal>>>,
}

impl PingSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// New signal for a heartbeat loop about to start.
    pub fn arm(&self) -> Arc<PingSignal> {
        let signal = Arc::new(PingSignal::new());
        self.signals.lock().push(signal.clone());
        signal
    }

    /// Raise every armed signal and drop the ones whose loop is done.
    /// Returns how many signals were raised by this call.
    pub fn broadcast(&self) -> usize {
        let mut signals = self.signals.lock();
        let raised = signals.iter().filter(|s| s.notify()).count();
        signals.retain(|s| !s.is_finished());
        raised
    }

    pub fn len(&self) -> usize {
        self.signals.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
