//! Pause and abort control for long-running installer components.

use parking_lot::{Condvar, Mutex};

/// A component the installer can pause and abort.
pub trait Controllable: Send + Sync {
    /// Stop work as soon as possible. Irreversible.
    fn abort(&self);

    fn set_paused(&self, paused: bool);
}

#[derive(Debug, Default, Clone, Copy)]
struct FlagState {
    aborted: bool,
    paused: bool,
}

/// Shared pause/abort flags embedded in controllable components.
#[derive(Debug, Default)]
pub struct ControlFlags {
    state: Mutex<FlagState>,
    changed: Condvar,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Block while paused.
    ///
    /// Returns `false` if the component was aborted.
    pub fn wait_while_paused(&self) -> bool {
        let mut state = self.state.lock();
        while state.paused && !state.aborted {
            self.changed.wait(&mut state);
        }
        !state.aborted
    }

    fn update(&self, apply: impl FnOnce(&mut FlagState)) {
        apply(&mut self.state.lock());
        self.changed.notify_all();
    }
}

impl Controllable for ControlFlags {
    fn abort(&self) {
        self.update(|state| state.aborted = true);
    }

    fn set_paused(&self, paused: bool) {
        self.update(|state| state.paused = paused);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_flags_default_running() {
        let flags = ControlFlags::new();
        assert!(!flags.is_aborted());
        assert!(!flags.is_paused());
        assert!(flags.wait_while_paused());
    }

    #[test]
    fn test_abort_releases_paused_waiter() {
        let flags = Arc::new(ControlFlags::new());
        flags.set_paused(true);

        let waiter = {
            let flags = Arc::clone(&flags);
            thread::spawn(move || flags.wait_while_paused())
        };

        thread::sleep(Duration::from_millis(30));
        flags.abort();

        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_unpause_releases_waiter() {
        let flags = Arc::new(ControlFlags::new());
        flags.set_paused(true);

        let start = Instant::now();
        let waiter = {
            let flags = Arc::clone(&flags);
            thread::spawn(move || flags.wait_while_paused())
        };

        thread::sleep(Duration::from_millis(30));
        flags.set_paused(false);

        assert!(waiter.join().unwrap());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
