use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::SnapshotCache;
use crate::config::MatchingConfig;
use crate::control::ControlStore;
use crate::error::MatchResult;
use crate::notify::{Notifier, RealtimeChannel, SecondaryChannel};
use crate::orderbook::BookProjection;
use crate::state::{lock_write, EngineShared, PerfCounters};
use crate::store::OrderStore;
use crate::tasks::{run_matching_loop, run_telemetry_loop};
use crate::timer::TimerService;

pub const ORDER_ID_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Bid,
    Offer,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "BID",
            Side::Offer => "OFFER",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Bid => Side::Offer,
            Side::Offer => Side::Bid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Active,
    Matched,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Active => "ACTIVE",
            OrderStatus::Matched => "MATCHED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "ACTIVE" => Some(OrderStatus::Active),
            "MATCHED" => Some(OrderStatus::Matched),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    FullMatch,
    PartialFillBuyer,
    PartialFillSeller,
}

impl MatchType {
    pub fn is_partial(&self) -> bool {
        !matches!(self, MatchType::FullMatch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Party {
    Buyer,
    Seller,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub side: Side,
    pub asset: String,
    pub price_cents: i64,
    pub original_amount: i64,
    pub remaining: i64,
    pub matched: bool,
    pub status: OrderStatus,
    pub user_id: i64,
    pub counterparty_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn is_active(&self) -> bool {
        self.status == OrderStatus::Active && self.remaining > 0
    }

    /// Prefix used in out-of-band YES/NO replies.
    pub fn id_prefix(&self) -> String {
        let s = self.id.to_string();
        s[..ORDER_ID_PREFIX_LEN.min(s.len())].to_string()
    }

    pub fn price(&self) -> Decimal {
        Decimal::new(self.price_cents, 2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub asset: String,
    pub price_cents: i64,
    pub amount: i64,
    pub buyer_order_id: Uuid,
    pub seller_order_id: Uuid,
    pub buyer_id: i64,
    pub seller_id: i64,
    pub commission_cents: i64,
    pub created_at: DateTime<Utc>,
}

/// Identity of one quantity-confirmation interaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfirmationKey {
    pub asset: String,
    pub bid_order_id: Uuid,
    pub offer_order_id: Uuid,
}

impl ConfirmationKey {
    pub fn new(asset: &str, bid_order_id: Uuid, offer_order_id: Uuid) -> Self {
        Self {
            asset: asset.to_string(),
            bid_order_id,
            offer_order_id,
        }
    }
}

impl fmt::Display for ConfirmationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.asset, self.bid_order_id, self.offer_order_id)
    }
}

impl FromStr for ConfirmationKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Asset names may themselves contain ':', so split from the right.
        let mut it = s.rsplitn(3, ':');
        let offer = it.next().ok_or_else(|| format!("bad confirmation key: {s}"))?;
        let bid = it.next().ok_or_else(|| format!("bad confirmation key: {s}"))?;
        let asset = it.next().ok_or_else(|| format!("bad confirmation key: {s}"))?;
        Ok(Self {
            asset: asset.to_string(),
            bid_order_id: Uuid::parse_str(bid).map_err(|e| e.to_string())?,
            offer_order_id: Uuid::parse_str(offer).map_err(|e| e.to_string())?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStage {
    AwaitingSmaller,
    AwaitingLarger,
}

#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub key: ConfirmationKey,
    pub bid: Order,
    pub offer: Order,
    pub smaller_party: Party,
    pub smaller_qty: i64,
    pub larger_qty: i64,
    pub stage: ConfirmationStage,
    pub smaller_response: Option<bool>,
    pub(crate) epoch: u64,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl PendingConfirmation {
    pub fn additional_qty(&self) -> i64 {
        self.larger_qty - self.smaller_qty
    }

    pub fn smaller_order(&self) -> &Order {
        match self.smaller_party {
            Party::Buyer => &self.bid,
            Party::Seller => &self.offer,
        }
    }

    pub fn larger_order(&self) -> &Order {
        match self.smaller_party {
            Party::Buyer => &self.offer,
            Party::Seller => &self.bid,
        }
    }

    /// The user a response is currently being solicited from.
    pub fn solicited_user_id(&self) -> i64 {
        match self.stage {
            ConfirmationStage::AwaitingSmaller => self.smaller_order().user_id,
            ConfirmationStage::AwaitingLarger => self.larger_order().user_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationState {
    pub asset: String,
    pub best_bid: Order,
    pub best_offer: Order,
    pub turn: Side,
    pub(crate) epoch: u64,
    pub deadline: DateTime<Utc>,
}

impl NegotiationState {
    pub fn turn_user_id(&self) -> i64 {
        match self.turn {
            Side::Bid => self.best_bid.user_id,
            Side::Offer => self.best_offer.user_id,
        }
    }

    pub(crate) fn turn_order_id(&self) -> Uuid {
        match self.turn {
            Side::Bid => self.best_bid.id,
            Side::Offer => self.best_offer.id,
        }
    }
}

// ===== Process-local engine state (the single serialization domain) =====

pub(crate) struct EngineCore {
    pub(crate) negotiations: HashMap<String, NegotiationState>,
    pub(crate) confirmations: HashMap<ConfirmationKey, PendingConfirmation>,
    pub(crate) declined_pairs: HashSet<ConfirmationKey>,
    pub(crate) snapshot: SnapshotCache,
    pub(crate) advisory_sent_ms: HashMap<String, i64>,
}

impl EngineCore {
    pub(crate) fn new(cfg: &MatchingConfig) -> Self {
        Self {
            negotiations: HashMap::new(),
            confirmations: HashMap::new(),
            declined_pairs: HashSet::new(),
            snapshot: SnapshotCache::new(cfg.snapshot_validity),
            advisory_sent_ms: HashMap::new(),
        }
    }
}

// ===== Pure pair selection =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PairClass {
    EqualQty,
    QtyMismatch,
    Spread,
    Crossed,
}

pub(crate) fn best_bid<'a>(orders: &[&'a Order]) -> Option<&'a Order> {
    orders
        .iter()
        .copied()
        .filter(|o| o.side == Side::Bid)
        .min_by(|a, b| {
            b.price_cents
                .cmp(&a.price_cents)
                .then(a.created_at.cmp(&b.created_at))
        })
}

pub(crate) fn best_offer<'a>(orders: &[&'a Order]) -> Option<&'a Order> {
    orders
        .iter()
        .copied()
        .filter(|o| o.side == Side::Offer)
        .min_by(|a, b| {
            a.price_cents
                .cmp(&b.price_cents)
                .then(a.created_at.cmp(&b.created_at))
        })
}

pub(crate) fn classify_pair(bid: &Order, offer: &Order) -> PairClass {
    if bid.price_cents == offer.price_cents {
        if bid.remaining == offer.remaining {
            PairClass::EqualQty
        } else {
            PairClass::QtyMismatch
        }
    } else if bid.price_cents < offer.price_cents {
        PairClass::Spread
    } else {
        PairClass::Crossed
    }
}

pub(crate) fn smaller_party(bid: &Order, offer: &Order) -> Party {
    if bid.remaining < offer.remaining {
        Party::Buyer
    } else {
        Party::Seller
    }
}

pub(crate) fn classify_match(bid_original: i64, offer_original: i64) -> MatchType {
    if bid_original == offer_original {
        MatchType::FullMatch
    } else if bid_original < offer_original {
        MatchType::PartialFillBuyer
    } else {
        MatchType::PartialFillSeller
    }
}

pub(crate) fn fmt_money(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, (cents % 100).abs())
}

// ===== Public engine surface =====

#[derive(Clone)]
pub struct MatchingEngine {
    pub(crate) shared: Arc<EngineShared>,
}

impl MatchingEngine {
    pub fn new(
        cfg: MatchingConfig,
        store: Arc<dyn OrderStore>,
        control: Arc<dyn ControlStore>,
        realtime: Arc<dyn RealtimeChannel>,
        secondary: Arc<dyn SecondaryChannel>,
        projection: Arc<dyn BookProjection>,
    ) -> Self {
        let perf = Arc::new(PerfCounters::new());
        let notifier = Notifier::new(realtime, secondary, store.clone(), perf.clone());
        let core = EngineCore::new(&cfg);
        Self {
            shared: Arc::new(EngineShared {
                cfg,
                store,
                control,
                notifier,
                projection,
                core: tokio::sync::RwLock::new(core),
                timers: TimerService::new(),
                perf,
                running: std::sync::atomic::AtomicBool::new(false),
                worker_handles: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the matching loop and telemetry worker. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut handles = self
            .shared
            .worker_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        handles.push(tokio::spawn(run_matching_loop(self.clone())));
        handles.push(tokio::spawn(run_telemetry_loop(self.clone())));
        eprintln!(
            "[engine] started tick_s={} grace_s={} snapshot_s={}",
            self.shared.cfg.tick_interval.as_secs(),
            self.shared.cfg.startup_grace.as_secs(),
            self.shared.cfg.snapshot_validity.as_secs()
        );
    }

    /// Stop the loop. In-flight confirmations and negotiations are process-local
    /// and die here; the store remains the source of record.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<_> = {
            let mut guard = self
                .shared
                .worker_handles
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for h in handles {
            h.abort();
        }
        eprintln!("[engine] stopped");
    }

    /// Force an immediate per-asset pass, then invalidate the snapshot so the
    /// next tick observes any resulting writes.
    pub async fn process_asset(&self, asset: &str) -> MatchResult<()> {
        let orders = self.shared.store.find_active_orders_for_asset(asset).await?;
        let mut core = lock_write(&self.shared.core, "engine.process_asset.core_write").await;
        let out = self.run_pair_decision(&mut core, asset, &orders).await;
        core.snapshot.invalidate();
        out
    }

    /// Called by order ingestion to prime the active-orders hint flag.
    pub async fn mark_active_orders(&self) {
        if let Err(e) = self
            .shared
            .control
            .set_active_orders(true, self.shared.cfg.active_flag_expiry)
            .await
        {
            eprintln!("[engine] mark_active_orders_failed error={e}");
        }
    }

    pub fn perf_snapshot(&self) -> serde_json::Value {
        self.shared.perf.snapshot_json()
    }

    /// One decision pass over a single asset's active orders: pick the best
    /// pair and dispatch to commit, confirmation, or negotiation.
    pub(crate) async fn run_pair_decision(
        &self,
        core: &mut EngineCore,
        asset: &str,
        orders: &[Order],
    ) -> MatchResult<()> {
        self.shared.perf.assets_scanned.fetch_add(1, Ordering::Relaxed);
        let live: Vec<&Order> = orders.iter().filter(|o| o.is_active()).collect();
        let Some(bid) = best_bid(&live) else {
            return Ok(());
        };
        let Some(offer) = best_offer(&live) else {
            return Ok(());
        };

        match classify_pair(bid, offer) {
            PairClass::Spread => {
                self.send_advisories(core, asset, bid, offer);
                self.drive_negotiation(core, asset, bid, offer).await?;
            }
            PairClass::EqualQty => {
                self.drop_negotiation_superseded(core, asset);
                self.commit_pair(core, bid, offer).await?;
            }
            PairClass::Crossed => {
                // Should not occur under the invariants; treat as a price match
                // at the offer price so the book unwinds instead of wedging.
                eprintln!(
                    "[matching] crossed_book asset={} bid_cents={} offer_cents={}",
                    asset, bid.price_cents, offer.price_cents
                );
                self.drop_negotiation_superseded(core, asset);
                self.commit_pair(core, bid, offer).await?;
            }
            PairClass::QtyMismatch => {
                self.drop_negotiation_superseded(core, asset);
                let key = ConfirmationKey::new(asset, bid.id, offer.id);
                if core.declined_pairs.contains(&key) {
                    return Ok(());
                }
                if core.confirmations.contains_key(&key) {
                    return Ok(());
                }
                self.open_confirmation(core, bid, offer);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order(side: Side, price_cents: i64, remaining: i64, created_s: i64) -> Order {
        Order {
            id: Uuid::new_v4(),
            side,
            asset: "GRAIN-A".to_string(),
            price_cents,
            original_amount: remaining,
            remaining,
            matched: false,
            status: OrderStatus::Active,
            user_id: 1,
            counterparty_id: None,
            created_at: Utc.timestamp_opt(1_700_000_000 + created_s, 0).unwrap(),
        }
    }

    #[test]
    fn best_bid_prefers_price_then_age() {
        let cheap = order(Side::Bid, 9_00, 1, 0);
        let rich_late = order(Side::Bid, 10_00, 1, 50);
        let rich_early = order(Side::Bid, 10_00, 1, 10);
        let all = vec![&cheap, &rich_late, &rich_early];
        assert_eq!(best_bid(&all).unwrap().id, rich_early.id);
    }

    #[test]
    fn best_offer_prefers_price_then_age() {
        let cheap_late = order(Side::Offer, 9_00, 1, 50);
        let cheap_early = order(Side::Offer, 9_00, 1, 10);
        let rich = order(Side::Offer, 10_00, 1, 0);
        let all = vec![&rich, &cheap_late, &cheap_early];
        assert_eq!(best_offer(&all).unwrap().id, cheap_early.id);
    }

    #[test]
    fn pair_classification() {
        let bid = order(Side::Bid, 10_00, 5, 0);
        let offer_eq = order(Side::Offer, 10_00, 5, 0);
        let offer_mis = order(Side::Offer, 10_00, 7, 0);
        let offer_wide = order(Side::Offer, 11_00, 5, 0);
        let offer_crossed = order(Side::Offer, 9_00, 5, 0);
        assert_eq!(classify_pair(&bid, &offer_eq), PairClass::EqualQty);
        assert_eq!(classify_pair(&bid, &offer_mis), PairClass::QtyMismatch);
        assert_eq!(classify_pair(&bid, &offer_wide), PairClass::Spread);
        assert_eq!(classify_pair(&bid, &offer_crossed), PairClass::Crossed);
    }

    #[test]
    fn match_type_follows_original_amounts() {
        assert_eq!(classify_match(5, 5), MatchType::FullMatch);
        assert_eq!(classify_match(2, 5), MatchType::PartialFillBuyer);
        assert_eq!(classify_match(7, 5), MatchType::PartialFillSeller);
        assert!(classify_match(2, 5).is_partial());
        assert!(!classify_match(5, 5).is_partial());
    }

    #[test]
    fn confirmation_key_round_trips() {
        let key = ConfirmationKey::new("GRAIN:EU", Uuid::new_v4(), Uuid::new_v4());
        let parsed: ConfirmationKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn money_formatting_pads_cents() {
        assert_eq!(fmt_money(10_00), "$10.00");
        assert_eq!(fmt_money(9_50), "$9.50");
        assert_eq!(fmt_money(2), "$0.02");
    }
}
