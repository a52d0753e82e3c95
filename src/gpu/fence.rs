//! Completion signal attached to every frame produced by GPU work

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Pending,
    Signaled,
    Failed,
}

/// One-shot completion signal. Waiters block on a condvar, never spin.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<(Mutex<FenceState>, Condvar)>,
}

impl Fence {
    pub fn pending() -> Self {
        Self {
            inner: Arc::new((Mutex::new(FenceState::Pending), Condvar::new())),
        }
    }

    pub fn signaled() -> Self {
        Self {
            inner: Arc::new((Mutex::new(FenceState::Signaled), Condvar::new())),
        }
    }

    pub fn state(&self) -> FenceState {
        *self.lock()
    }

    pub fn is_signaled(&self) -> bool {
        self.state() == FenceState::Signaled
    }

    pub fn signal(&self) {
        self.complete(FenceState::Signaled);
    }

    pub fn fail(&self) {
        self.complete(FenceState::Failed);
    }

    /// Blocks until the fence leaves `Pending` or the timeout expires.
    /// Returns the state observed last.
    pub fn wait_timeout(&self, timeout: Duration) -> FenceState {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |state| *state == FenceState::Pending)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }

    fn complete(&self, state: FenceState) {
        let (lock, cvar) = &*self.inner;
        let mut guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        // first completion wins
        if *guard == FenceState::Pending {
            *guard = state;
            cvar.notify_all();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FenceState> {
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fence").field(&self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_returns_after_signal_from_other_thread() {
        let fence = Fence::pending();
        let remote = fence.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.signal();
        });
        assert_eq!(fence.wait_timeout(Duration::from_secs(5)), FenceState::Signaled);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_times_out_while_pending() {
        let fence = Fence::pending();
        assert_eq!(
            fence.wait_timeout(Duration::from_millis(10)),
            FenceState::Pending
        );
    }

    #[test]
    fn test_failure_is_sticky() {
        let fence = Fence::pending();
        fence.fail();
        fence.signal();
        assert_eq!(fence.state(), FenceState::Failed);
    }
}
