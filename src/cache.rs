use std::time::{Duration, Instant};

use crate::engine::Order;
use crate::state::PerfCounters;
use crate::store::OrderStore;

/// Process-local view of the active order set with bounded freshness.
///
/// The vector is only ever replaced wholesale, never mutated in place, so a
/// caller always works on a value snapshot. A store failure keeps the previous
/// vector and leaves `fetched_at` untouched, so the next access retries.
pub(crate) struct SnapshotCache {
    orders: Vec<Order>,
    fetched_at: Option<Instant>,
    validity: Duration,
}

impl SnapshotCache {
    pub(crate) fn new(validity: Duration) -> Self {
        Self {
            orders: Vec::new(),
            fetched_at: None,
            validity,
        }
    }

    pub(crate) async fn load(&mut self, store: &dyn OrderStore, perf: &PerfCounters) -> Vec<Order> {
        let fresh = self
            .fetched_at
            .map(|at| at.elapsed() < self.validity)
            .unwrap_or(false);
        if !fresh {
            match store.find_active_orders().await {
                Ok(orders) => {
                    self.orders = orders;
                    self.fetched_at = Some(Instant::now());
                    perf.snapshot_refreshes
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                Err(e) => {
                    perf.snapshot_errors
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    eprintln!("[snapshot] refresh_failed error={e}");
                }
            }
        }
        self.orders.clone()
    }

    pub(crate) fn invalidate(&mut self) {
        self.fetched_at = None;
    }
}
