//! Cooperative pause gate.
//!
//! `pause()` arms the gate, `wait_if_paused()` blocks while it is armed and
//! `resume()` releases every waiter. The executor only waits at loop-safe
//! points (before a milestone, before QA, before a checkpoint); an agent call
//! that is already in flight is never interrupted.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info};

#[derive(Debug, Default)]
struct Gate {
    armed: bool,
    /// Bumped on every resume so waiters can tell a release from a
    /// spurious wakeup even if the gate is re-armed immediately.
    generation: u64,
}

/// Shared handle; clones control the same gate.
#[derive(Debug, Clone, Default)]
pub struct PauseController {
    inner: Arc<(Mutex<Gate>, Condvar)>,
}

impl PauseController {
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        // A poisoned gate only means a waiter panicked; the bool is still valid.
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm the gate. Idempotent.
    pub fn pause(&self) {
        let mut gate = self.gate();
        if !gate.armed {
            info!("pause requested; will stop at the next safe point");
        }
        gate.armed = true;
    }

    /// Release all waiters and disarm. A no-op when not paused.
    pub fn resume(&self) {
        let mut gate = self.gate();
        if !gate.armed {
            return;
        }
        gate.armed = false;
        gate.generation = gate.generation.wrapping_add(1);
        info!("resumed");
        self.inner.1.notify_all();
    }

    /// Force the unarmed state, releasing anyone currently waiting.
    pub fn reset(&self) {
        let mut gate = self.gate();
        gate.armed = false;
        gate.generation = gate.generation.wrapping_add(1);
        self.inner.1.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.gate().armed
    }

    /// Block until resumed if the gate is armed; return immediately otherwise.
    ///
    /// Returns `true` when the caller actually waited.
    pub fn wait_if_paused(&self) -> bool {
        let gate = self.gate();
        if !gate.armed {
            return false;
        }
        debug!("waiting at pause gate");
        let generation = gate.generation;
        let _released = self
            .inner
            .1
            .wait_while(gate, |g| g.armed && g.generation == generation)
            .unwrap_or_else(|e| e.into_inner());
        true
    }

    /// Like [`wait_if_paused`](Self::wait_if_paused) but gives up after
    /// `timeout`. Returns `true` if the gate is open when it returns.
    pub fn wait_if_paused_timeout(&self, timeout: Duration) -> bool {
        let gate = self.gate();
        if !gate.armed {
            return true;
        }
        let generation = gate.generation;
        let (gate, _) = self
            .inner
            .1
            .wait_timeout_while(gate, timeout, |g| g.armed && g.generation == generation)
            .unwrap_or_else(|e| e.into_inner());
        !gate.armed || gate.generation != generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn unpaused_wait_returns_immediately() {
        let pause = PauseController::new();
        assert!(!pause.wait_if_paused());
    }

    #[test]
    fn resume_without_pause_is_noop() {
        let pause = PauseController::new();
        pause.resume();
        assert!(!pause.is_paused());
        assert!(!pause.wait_if_paused());
    }

    #[test]
    fn pause_blocks_until_resume_from_another_thread() {
        let pause = PauseController::new();
        pause.pause();
        assert!(pause.is_paused());

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let pause = pause.clone();
            let released = released.clone();
            thread::spawn(move || {
                let waited = pause.wait_if_paused();
                released.store(true, Ordering::SeqCst);
                waited
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!released.load(Ordering::SeqCst), "waiter passed an armed gate");

        pause.resume();
        let waited = waiter.join().unwrap();
        assert!(waited);
        assert!(released.load(Ordering::SeqCst));
        assert!(!pause.is_paused());
    }

    #[test]
    fn resume_releases_all_waiters() {
        let pause = PauseController::new();
        pause.pause();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pause = pause.clone();
                thread::spawn(move || pause.wait_if_paused())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        pause.resume();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn reset_disarms_and_releases() {
        let pause = PauseController::new();
        pause.pause();
        let waiter = {
            let pause = pause.clone();
            thread::spawn(move || pause.wait_if_paused())
        };
        thread::sleep(Duration::from_millis(50));
        pause.reset();
        assert!(waiter.join().unwrap());
        assert!(!pause.is_paused());
    }

    #[test]
    fn timed_wait_gives_up_while_paused() {
        let pause = PauseController::new();
        pause.pause();
        assert!(!pause.wait_if_paused_timeout(Duration::from_millis(20)));
        pause.resume();
        assert!(pause.wait_if_paused_timeout(Duration::from_millis(20)));
    }
}
