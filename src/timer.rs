use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    Negotiation,
    ConfirmSmaller,
    ConfirmLarger,
}

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Deadline registry keyed by (kind, id). Arming a key replaces any previous
/// timer for it; cancelling aborts the pending sleep. A fire that lost its
/// slot (cancelled or superseded) never runs its callback, and callbacks are
/// still expected to re-check engine state under the lock.
pub(crate) struct TimerService {
    slots: Arc<DashMap<(TimerKind, String), TimerSlot>>,
}

impl TimerService {
    pub(crate) fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    pub(crate) fn arm<F>(&self, kind: TimerKind, id: String, after: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = (kind, id);
        let generation = self
            .slots
            .get(&key)
            .map(|slot| slot.generation + 1)
            .unwrap_or(0);
        let slots = self.slots.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let current = slots
                .get(&task_key)
                .map(|slot| slot.generation == generation)
                .unwrap_or(false);
            if !current {
                return;
            }
            slots.remove_if(&task_key, |_, slot| slot.generation == generation);
            fire.await;
        });
        if let Some(prev) = self.slots.insert(key, TimerSlot { generation, handle }) {
            prev.handle.abort();
        }
    }

    pub(crate) fn cancel(&self, kind: TimerKind, id: &str) {
        if let Some((_, slot)) = self.slots.remove(&(kind, id.to_string())) {
            slot.handle.abort();
        }
    }
}
