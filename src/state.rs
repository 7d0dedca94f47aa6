use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::MatchingConfig;
use crate::control::ControlStore;
use crate::engine::EngineCore;
use crate::notify::Notifier;
use crate::orderbook::BookProjection;
use crate::store::OrderStore;
use crate::timer::TimerService;

/// Everything the engine's tasks and handlers share. `core` is the single
/// serialization domain for controller state and the snapshot cache.
pub(crate) struct EngineShared {
    pub(crate) cfg: MatchingConfig,
    pub(crate) store: Arc<dyn OrderStore>,
    pub(crate) control: Arc<dyn ControlStore>,
    pub(crate) notifier: Notifier,
    pub(crate) projection: Arc<dyn BookProjection>,
    pub(crate) core: RwLock<EngineCore>,
    pub(crate) timers: TimerService,
    pub(crate) perf: Arc<PerfCounters>,
    pub(crate) running: AtomicBool,
    pub(crate) worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct PerfCounters {
    pub(crate) ticks: AtomicU64,
    pub(crate) tick_errors: AtomicU64,
    pub(crate) assets_scanned: AtomicU64,
    pub(crate) asset_errors: AtomicU64,
    pub(crate) snapshot_refreshes: AtomicU64,
    pub(crate) snapshot_errors: AtomicU64,
    pub(crate) trades_committed: AtomicU64,
    pub(crate) commit_errors: AtomicU64,
    pub(crate) confirmations_opened: AtomicU64,
    pub(crate) confirmations_accepted: AtomicU64,
    pub(crate) confirmations_declined: AtomicU64,
    pub(crate) negotiations_opened: AtomicU64,
    pub(crate) negotiations_closed: AtomicU64,
    pub(crate) advisories_sent: AtomicU64,
    pub(crate) realtime_failures: AtomicU64,
    pub(crate) secondary_failures: AtomicU64,
    pub(crate) missing_contacts: AtomicU64,
}

impl PerfCounters {
    pub(crate) fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            tick_errors: AtomicU64::new(0),
            assets_scanned: AtomicU64::new(0),
            asset_errors: AtomicU64::new(0),
            snapshot_refreshes: AtomicU64::new(0),
            snapshot_errors: AtomicU64::new(0),
            trades_committed: AtomicU64::new(0),
            commit_errors: AtomicU64::new(0),
            confirmations_opened: AtomicU64::new(0),
            confirmations_accepted: AtomicU64::new(0),
            confirmations_declined: AtomicU64::new(0),
            negotiations_opened: AtomicU64::new(0),
            negotiations_closed: AtomicU64::new(0),
            advisories_sent: AtomicU64::new(0),
            realtime_failures: AtomicU64::new(0),
            secondary_failures: AtomicU64::new(0),
            missing_contacts: AtomicU64::new(0),
        }
    }

    pub(crate) fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "loop": {
                "ticks": self.ticks.load(Ordering::Relaxed),
                "tick_errors": self.tick_errors.load(Ordering::Relaxed),
                "assets_scanned": self.assets_scanned.load(Ordering::Relaxed),
                "asset_errors": self.asset_errors.load(Ordering::Relaxed),
            },
            "snapshot": {
                "refreshes": self.snapshot_refreshes.load(Ordering::Relaxed),
                "errors": self.snapshot_errors.load(Ordering::Relaxed),
            },
            "committer": {
                "trades": self.trades_committed.load(Ordering::Relaxed),
                "errors": self.commit_errors.load(Ordering::Relaxed),
            },
            "confirmations": {
                "opened": self.confirmations_opened.load(Ordering::Relaxed),
                "accepted": self.confirmations_accepted.load(Ordering::Relaxed),
                "declined": self.confirmations_declined.load(Ordering::Relaxed),
            },
            "negotiations": {
                "opened": self.negotiations_opened.load(Ordering::Relaxed),
                "closed": self.negotiations_closed.load(Ordering::Relaxed),
            },
            "notify": {
                "advisories_sent": self.advisories_sent.load(Ordering::Relaxed),
                "realtime_failures": self.realtime_failures.load(Ordering::Relaxed),
                "secondary_failures": self.secondary_failures.load(Ordering::Relaxed),
                "missing_contacts": self.missing_contacts.load(Ordering::Relaxed),
            }
        })
    }
}

// ===== Profiled lock helpers =====

const LOCK_PROFILE_WARN_MS: u128 = 500;
const LOCK_PROFILE_COOLDOWN_MS: i64 = 1000;
static LOCK_LOG_LAST_MS: Lazy<DashMap<&'static str, i64>> = Lazy::new(DashMap::new);

fn now_epoch_ms() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

fn should_emit_lock_log(label: &'static str) -> bool {
    let now = now_epoch_ms();
    if let Some(mut last) = LOCK_LOG_LAST_MS.get_mut(label) {
        if now - *last < LOCK_PROFILE_COOLDOWN_MS {
            return false;
        }
        *last = now;
        true
    } else {
        LOCK_LOG_LAST_MS.insert(label, now);
        true
    }
}

pub(crate) struct ProfiledReadGuard<'a, T> {
    label: &'static str,
    wait_ms: u128,
    acquired_at: Instant,
    guard: tokio::sync::RwLockReadGuard<'a, T>,
}

impl<T> Deref for ProfiledReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> Drop for ProfiledReadGuard<'_, T> {
    fn drop(&mut self) {
        let hold_ms = self.acquired_at.elapsed().as_millis();
        if (self.wait_ms >= LOCK_PROFILE_WARN_MS || hold_ms >= LOCK_PROFILE_WARN_MS)
            && should_emit_lock_log(self.label)
        {
            eprintln!(
                "[lock] kind=read label={} wait_ms={} hold_ms={}",
                self.label, self.wait_ms, hold_ms
            );
        }
    }
}

pub(crate) struct ProfiledWriteGuard<'a, T> {
    label: &'static str,
    wait_ms: u128,
    acquired_at: Instant,
    guard: tokio::sync::RwLockWriteGuard<'a, T>,
}

impl<T> Deref for ProfiledWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for ProfiledWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T> Drop for ProfiledWriteGuard<'_, T> {
    fn drop(&mut self) {
        let hold_ms = self.acquired_at.elapsed().as_millis();
        if (self.wait_ms >= LOCK_PROFILE_WARN_MS || hold_ms >= LOCK_PROFILE_WARN_MS)
            && should_emit_lock_log(self.label)
        {
            eprintln!(
                "[lock] kind=write label={} wait_ms={} hold_ms={}",
                self.label, self.wait_ms, hold_ms
            );
        }
    }
}

pub(crate) async fn lock_read<'a, T>(
    lock: &'a RwLock<T>,
    label: &'static str,
) -> ProfiledReadGuard<'a, T> {
    let wait_started = Instant::now();
    let guard = lock.read().await;
    ProfiledReadGuard {
        label,
        wait_ms: wait_started.elapsed().as_millis(),
        acquired_at: Instant::now(),
        guard,
    }
}

pub(crate) async fn lock_write<'a, T>(
    lock: &'a RwLock<T>,
    label: &'static str,
) -> ProfiledWriteGuard<'a, T> {
    let wait_started = Instant::now();
    let guard = lock.write().await;
    ProfiledWriteGuard {
        label,
        wait_ms: wait_started.elapsed().as_millis(),
        acquired_at: Instant::now(),
        guard,
    }
}
