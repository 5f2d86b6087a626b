//! Registry of pausable, abortable installer components.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::control::Controllable;

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<(u64, Arc<dyn Controllable>)>,
    aborted: bool,
    paused: bool,
    paused_since: Option<Instant>,
    paused_total: Duration,
}

/// Fans pause and abort out to every registered component.
///
/// Components registered after an abort or while paused take on that state
/// immediately.
#[derive(Default)]
pub struct ControlRegistry {
    inner: Mutex<RegistryInner>,
}

/// Keeps a component registered until dropped.
#[must_use = "the component is unregistered when the guard is dropped"]
pub struct ControlGuard {
    registry: Arc<ControlRegistry>,
    id: u64,
}

impl ControlRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, component: Arc<dyn Controllable>) -> ControlGuard {
        let mut inner = self.inner.lock();
        if inner.aborted {
            component.abort();
        }
        if inner.paused {
            component.set_paused(true);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push((id, component));
        ControlGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn abort_all(&self) {
        let entries = {
            let mut inner = self.inner.lock();
            inner.aborted = true;
            inner.entries.clone()
        };
        for (_, component) in entries {
            component.abort();
        }
    }

    /// Let components registered from now on run again. Components already
    /// aborted stay aborted.
    pub fn reset_abort(&self) {
        self.inner.lock().aborted = false;
    }

    pub fn set_paused(&self, paused: bool) {
        let entries = {
            let mut inner = self.inner.lock();
            if inner.paused == paused {
                return;
            }
            inner.paused = paused;
            let now = Instant::now();
            if paused {
                inner.paused_since = Some(now);
            } else if let Some(since) = inner.paused_since.take() {
                inner.paused_total += now.saturating_duration_since(since);
            }
            inner.entries.clone()
        };
        for (_, component) in entries {
            component.set_paused(paused);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    /// Total time spent paused, including a pause still in progress.
    pub fn paused_time(&self) -> Duration {
        let inner = self.inner.lock();
        let current = inner
            .paused_since
            .map_or(Duration::ZERO, |since| since.elapsed());
        inner.paused_total + current
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unregister(&self, id: u64) {
        self.inner.lock().entries.retain(|(entry, _)| *entry != id);
    }
}

impl Drop for ControlGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
