use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::engine::{MatchType, Side};
use crate::state::PerfCounters;
use crate::store::OrderStore;

// ===== Named event payloads (realtime wire protocol) =====

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationYourTurn {
    pub asset: String,
    pub best_bid: Decimal,
    pub best_offer: Decimal,
    pub best_bid_user_id: i64,
    pub best_offer_user_id: i64,
    pub best_bid_username: String,
    pub best_offer_username: String,
    pub turn: Side,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    pub confirmation_key: String,
    pub asset: String,
    pub your_order_id: Uuid,
    pub counterparty_order_id: Uuid,
    pub your_quantity: i64,
    pub counterparty_quantity: i64,
    pub additional_quantity: i64,
    pub price: Decimal,
    pub side: Side,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialFillApproval {
    pub confirmation_key: String,
    pub asset: String,
    pub your_order_id: Uuid,
    pub counterparty_order_id: Uuid,
    pub your_quantity: i64,
    pub partial_fill_quantity: i64,
    pub price: Decimal,
    pub side: Side,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeExecutedNotice {
    pub order_id: Uuid,
    pub asset: String,
    pub price: Decimal,
    pub amount: i64,
    pub trade_id: Uuid,
    pub side: Side,
    pub is_fully_filled: bool,
    pub is_partial_fill: bool,
    pub remaining_amount: i64,
    pub original_amount: i64,
}

/// Legacy full-match notification, kept for older realtime consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMatchedNotice {
    pub order_id: Uuid,
    pub asset: String,
    pub price: Decimal,
    pub amount: i64,
    pub trade_id: Uuid,
    pub side: Side,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketUpdate {
    pub asset: String,
    pub best_bid: Decimal,
    pub best_offer: Decimal,
    pub message: String,
}

/// Bus payload published on the trade:executed topic.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeExecutedEvent {
    pub trade_id: Uuid,
    pub asset: String,
    pub price: Decimal,
    pub amount: i64,
    pub buyer_id: i64,
    pub seller_id: i64,
    pub timestamp: DateTime<Utc>,
    pub bid_fully_matched: bool,
    pub offer_fully_matched: bool,
    pub bid_order_id: Uuid,
    pub offer_order_id: Uuid,
    pub match_type: MatchType,
    pub partial_fill: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum RealtimeEvent {
    NegotiationYourTurn(NegotiationYourTurn),
    ConfirmationRequest(ConfirmationRequest),
    PartialFillApproval(PartialFillApproval),
    TradeExecuted(TradeExecutedNotice),
    OrderMatched(OrderMatchedNotice),
}

impl RealtimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RealtimeEvent::NegotiationYourTurn(_) => "negotiation:your_turn",
            RealtimeEvent::ConfirmationRequest(_) => "quantity:confirmation_request",
            RealtimeEvent::PartialFillApproval(_) => "quantity:partial_fill_approval",
            RealtimeEvent::TradeExecuted(_) => "trade:executed",
            RealtimeEvent::OrderMatched(_) => "order:matched",
        }
    }
}

// ===== Channel seams =====

/// Per-user addressed push channel. Fire-and-forget; delivery is the
/// gateway's problem.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn send_to_user(&self, user_id: i64, event: RealtimeEvent) -> anyhow::Result<()>;

    async fn broadcast(&self, update: MarketUpdate) -> anyhow::Result<()>;
}

/// Out-of-band transport to a user's registered address. Best-effort.
#[async_trait]
pub trait SecondaryChannel: Send + Sync {
    async fn send_text(&self, address: &str, body: &str) -> anyhow::Result<()>;
}

// ===== Adapter =====

/// Thin wrapper the engine talks to. Failures are counted and logged, never
/// propagated: a lost notification must not disturb committed state.
#[derive(Clone)]
pub struct Notifier {
    realtime: Arc<dyn RealtimeChannel>,
    secondary: Arc<dyn SecondaryChannel>,
    store: Arc<dyn OrderStore>,
    perf: Arc<PerfCounters>,
}

impl Notifier {
    pub(crate) fn new(
        realtime: Arc<dyn RealtimeChannel>,
        secondary: Arc<dyn SecondaryChannel>,
        store: Arc<dyn OrderStore>,
        perf: Arc<PerfCounters>,
    ) -> Self {
        Self {
            realtime,
            secondary,
            store,
            perf,
        }
    }

    pub(crate) async fn push_user(&self, user_id: i64, event: RealtimeEvent) {
        let name = event.name();
        if let Err(e) = self.realtime.send_to_user(user_id, event).await {
            self.perf.realtime_failures.fetch_add(1, Ordering::Relaxed);
            eprintln!("[notify] realtime_failed user_id={user_id} event={name} error={e}");
        }
    }

    pub(crate) async fn broadcast_market(&self, update: MarketUpdate) {
        if let Err(e) = self.realtime.broadcast(update).await {
            self.perf.realtime_failures.fetch_add(1, Ordering::Relaxed);
            eprintln!("[notify] broadcast_failed error={e}");
        }
    }

    /// Looks up the user's secondary address; a missing address or a send
    /// failure is logged and swallowed (the realtime path is independent).
    pub(crate) async fn text_user(&self, user_id: i64, body: String) {
        let contact = match self.store.find_user_by_id(user_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                self.perf.missing_contacts.fetch_add(1, Ordering::Relaxed);
                eprintln!("[notify] unknown_user user_id={user_id}");
                return;
            }
            Err(e) => {
                self.perf.secondary_failures.fetch_add(1, Ordering::Relaxed);
                eprintln!("[notify] contact_lookup_failed user_id={user_id} error={e}");
                return;
            }
        };
        let Some(address) = contact.secondary_address else {
            self.perf.missing_contacts.fetch_add(1, Ordering::Relaxed);
            eprintln!("[notify] missing_contact user_id={user_id}");
            return;
        };
        if let Err(e) = self.secondary.send_text(&address, &body).await {
            self.perf.secondary_failures.fetch_add(1, Ordering::Relaxed);
            eprintln!("[notify] secondary_failed user_id={user_id} error={e}");
        }
    }

    pub(crate) async fn username(&self, user_id: i64) -> String {
        match self.store.find_user_by_id(user_id).await {
            Ok(Some(c)) => c.username,
            _ => format!("user-{user_id}"),
        }
    }
}

// ===== In-process channel fan-out (host wiring) =====

#[derive(Debug, Clone)]
pub struct AddressedEvent {
    pub user_id: i64,
    pub event: RealtimeEvent,
}

/// Realtime channel backed by broadcast fan-out; a websocket gateway (or a
/// test) subscribes and forwards.
pub struct BroadcastRealtime {
    user_tx: broadcast::Sender<AddressedEvent>,
    market_tx: broadcast::Sender<MarketUpdate>,
}

impl BroadcastRealtime {
    pub fn new() -> Self {
        let (user_tx, _) = broadcast::channel(1024);
        let (market_tx, _) = broadcast::channel(256);
        Self { user_tx, market_tx }
    }

    pub fn subscribe_user_events(&self) -> broadcast::Receiver<AddressedEvent> {
        self.user_tx.subscribe()
    }

    pub fn subscribe_market_updates(&self) -> broadcast::Receiver<MarketUpdate> {
        self.market_tx.subscribe()
    }
}

impl Default for BroadcastRealtime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeChannel for BroadcastRealtime {
    async fn send_to_user(&self, user_id: i64, event: RealtimeEvent) -> anyhow::Result<()> {
        let _ = self.user_tx.send(AddressedEvent { user_id, event });
        Ok(())
    }

    async fn broadcast(&self, update: MarketUpdate) -> anyhow::Result<()> {
        let _ = self.market_tx.send(update);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OutboundText {
    pub address: String,
    pub body: String,
}

/// Secondary channel that hands messages to an outbox queue; the deployment's
/// transport worker drains it.
pub struct OutboxSecondary {
    tx: mpsc::UnboundedSender<OutboundText>,
}

impl OutboxSecondary {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundText>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SecondaryChannel for OutboxSecondary {
    async fn send_text(&self, address: &str, body: &str) -> anyhow::Result<()> {
        self.tx
            .send(OutboundText {
                address: address.to_string(),
                body: body.to_string(),
            })
            .map_err(|_| anyhow::anyhow!("secondary outbox closed"))
    }
}
