use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::notify::TradeExecutedEvent;

pub const KEY_LAST_RUN: &str = "matching:last_run";
pub const KEY_HAS_ACTIVE_ORDERS: &str = "matching:has_active_orders";
pub const TOPIC_TRADE_EXECUTED: &str = "trade:executed";

/// Shared key/value + pub/sub surface. Everything here is soft state: the
/// engine tolerates loss of any key and any publish failure.
#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn set_last_run(&self, at: DateTime<Utc>, ttl: Duration) -> anyhow::Result<()>;

    async fn set_active_orders(&self, active: bool, ttl: Duration) -> anyhow::Result<()>;

    async fn get_active_orders(&self) -> anyhow::Result<Option<bool>>;

    async fn publish_trade(&self, event: &TradeExecutedEvent) -> anyhow::Result<()>;
}

// ===== In-process implementation =====

#[derive(Debug, Clone)]
struct ControlEntry {
    value: String,
    expires_at_ms: i64,
}

/// Process-local control plane: TTL'd string entries plus a broadcast topic
/// for executed trades. A deployment that needs cross-process flags swaps this
/// for an implementation over its shared KV store; the engine only sees the
/// trait.
pub struct InProcessControl {
    entries: DashMap<String, ControlEntry>,
    trade_tx: broadcast::Sender<TradeExecutedEvent>,
}

impl InProcessControl {
    pub fn new() -> Self {
        let (trade_tx, _) = broadcast::channel(256);
        Self {
            entries: DashMap::new(),
            trade_tx,
        }
    }

    pub fn subscribe_trades(&self) -> broadcast::Receiver<TradeExecutedEvent> {
        self.trade_tx.subscribe()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now_ms = Utc::now().timestamp_millis();
        let entry = self.entries.get(key)?;
        if entry.expires_at_ms <= now_ms {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn put(&self, key: &str, value: String, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            ControlEntry {
                value,
                expires_at_ms: Utc::now().timestamp_millis() + ttl.as_millis() as i64,
            },
        );
    }
}

impl Default for InProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlStore for InProcessControl {
    async fn set_last_run(&self, at: DateTime<Utc>, ttl: Duration) -> anyhow::Result<()> {
        self.put(KEY_LAST_RUN, at.to_rfc3339(), ttl);
        Ok(())
    }

    async fn set_active_orders(&self, active: bool, ttl: Duration) -> anyhow::Result<()> {
        self.put(KEY_HAS_ACTIVE_ORDERS, active.to_string(), ttl);
        Ok(())
    }

    async fn get_active_orders(&self) -> anyhow::Result<Option<bool>> {
        Ok(self
            .get(KEY_HAS_ACTIVE_ORDERS)
            .map(|v| v == "true"))
    }

    async fn publish_trade(&self, event: &TradeExecutedEvent) -> anyhow::Result<()> {
        // No subscribers is fine; the topic is fire-and-forget.
        let _ = self.trade_tx.send(event.clone());
        Ok(())
    }
}
