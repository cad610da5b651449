use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Cooperative stop flag shared between the spawner and a background loop.
/// The firmware never raises it; both loops still check it every cycle.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    /// Sleep for `period` unless a stop was already requested.
    /// Returns `false` once the loop should exit.
    pub fn sleep(&self, period: Duration) -> bool {
        if self.is_requested() {
            return false;
        }
        thread::sleep(period);
        !self.is_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let signal = ShutdownSignal::new();
        let handle = signal.clone();
        assert!(!handle.is_requested());

        signal.request();
        assert!(handle.is_requested());
        assert!(!handle.sleep(Duration::from_millis(1)));
    }
}
