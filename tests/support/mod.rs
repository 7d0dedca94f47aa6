#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use lotmatch::commission_cents;
use lotmatch::config::MatchingConfig;
use lotmatch::control::InProcessControl;
use lotmatch::error::{MatchError, MatchResult};
use lotmatch::notify::{MarketUpdate, RealtimeChannel, RealtimeEvent, SecondaryChannel};
use lotmatch::orderbook::BookProjection;
use lotmatch::store::{CommittedMatch, OrderStore, UserContact};
use lotmatch::{MatchingEngine, Order, OrderStatus, Side, Trade};

static CREATED_SEQ: AtomicI64 = AtomicI64::new(0);

pub fn make_order(side: Side, asset: &str, price_cents: i64, lots: i64, user_id: i64) -> Order {
    let seq = CREATED_SEQ.fetch_add(1, Ordering::Relaxed);
    Order {
        id: Uuid::new_v4(),
        side,
        asset: asset.to_string(),
        price_cents,
        original_amount: lots,
        remaining: lots,
        matched: false,
        status: OrderStatus::Active,
        user_id,
        counterparty_id: None,
        created_at: Utc.timestamp_opt(1_700_000_000 + seq, 0).unwrap(),
    }
}

// ===== In-memory store with the same commit semantics as the Postgres one =====

pub struct MemStore {
    orders: Mutex<HashMap<Uuid, Order>>,
    users: Mutex<HashMap<i64, UserContact>>,
    pub trades: Mutex<Vec<Trade>>,
    pub fail_listing: AtomicBool,
    pub fail_commit: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            trades: Mutex::new(Vec::new()),
            fail_listing: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
        }
    }

    pub fn add_user(&self, user_id: i64, username: &str, secondary_address: Option<&str>) {
        self.users.lock().unwrap().insert(
            user_id,
            UserContact {
                user_id,
                username: username.to_string(),
                secondary_address: secondary_address.map(|s| s.to_string()),
            },
        );
    }

    pub fn add_order(&self, order: Order) -> Uuid {
        let id = order.id;
        self.orders.lock().unwrap().insert(id, order);
        id
    }

    pub fn order(&self, id: Uuid) -> Order {
        self.orders.lock().unwrap().get(&id).cloned().unwrap()
    }

    pub fn trade_count(&self) -> usize {
        self.trades.lock().unwrap().len()
    }

    pub fn last_trade(&self) -> Trade {
        self.trades.lock().unwrap().last().cloned().unwrap()
    }

    fn active_sorted(&self, asset: Option<&str>) -> Vec<Order> {
        let mut out: Vec<Order> = self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.status == OrderStatus::Active && o.remaining > 0)
            .filter(|o| asset.map(|a| o.asset == a).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.asset
                .cmp(&b.asset)
                .then(b.price_cents.cmp(&a.price_cents))
                .then(a.created_at.cmp(&b.created_at))
        });
        out
    }
}

#[async_trait]
impl OrderStore for MemStore {
    async fn find_active_orders(&self) -> MatchResult<Vec<Order>> {
        if self.fail_listing.load(Ordering::Relaxed) {
            return Err(MatchError::Internal("listing unavailable".to_string()));
        }
        Ok(self.active_sorted(None))
    }

    async fn find_active_orders_for_asset(&self, asset: &str) -> MatchResult<Vec<Order>> {
        if self.fail_listing.load(Ordering::Relaxed) {
            return Err(MatchError::Internal("listing unavailable".to_string()));
        }
        Ok(self.active_sorted(Some(asset)))
    }

    async fn find_order_by_id(&self, id: Uuid) -> MatchResult<Option<Order>> {
        Ok(self.orders.lock().unwrap().get(&id).cloned())
    }

    async fn find_user_by_id(&self, id: i64) -> MatchResult<Option<UserContact>> {
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }

    async fn update_order_price(&self, id: Uuid, price_cents: i64) -> MatchResult<()> {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(&id).ok_or(MatchError::OrderNotFound(id))?;
        order.price_cents = price_cents;
        Ok(())
    }

    async fn update_order_amount(&self, id: Uuid, amount: i64) -> MatchResult<()> {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(&id).ok_or(MatchError::OrderNotFound(id))?;
        order.original_amount = amount;
        order.remaining = amount;
        Ok(())
    }

    async fn commit_trade(
        &self,
        bid_id: Uuid,
        offer_id: Uuid,
        rate_ppm: i64,
    ) -> MatchResult<CommittedMatch> {
        if self.fail_commit.load(Ordering::Relaxed) {
            return Err(MatchError::Internal("commit unavailable".to_string()));
        }
        let mut orders = self.orders.lock().unwrap();
        let bid = orders
            .get(&bid_id)
            .cloned()
            .ok_or(MatchError::OrderNotFound(bid_id))?;
        let offer = orders
            .get(&offer_id)
            .cloned()
            .ok_or(MatchError::OrderNotFound(offer_id))?;
        for o in [&bid, &offer] {
            if o.status != OrderStatus::Active || o.remaining <= 0 {
                return Err(MatchError::NotMatchable {
                    order_id: o.id,
                    reason: "not active",
                });
            }
        }
        if bid.price_cents < offer.price_cents {
            return Err(MatchError::NotCrossed {
                bid_cents: bid.price_cents,
                offer_cents: offer.price_cents,
            });
        }

        let amount = bid.remaining.min(offer.remaining);
        let price_cents = offer.price_cents;
        let trade = Trade {
            id: Uuid::new_v4(),
            asset: offer.asset.clone(),
            price_cents,
            amount,
            buyer_order_id: bid.id,
            seller_order_id: offer.id,
            buyer_id: bid.user_id,
            seller_id: offer.user_id,
            commission_cents: commission_cents(amount, price_cents, rate_ppm),
            created_at: Utc::now(),
        };

        let mut apply = |id: Uuid, counterparty: i64| -> Order {
            let o = orders.get_mut(&id).unwrap();
            o.remaining -= amount;
            if o.remaining == 0 {
                o.matched = true;
                o.status = OrderStatus::Matched;
                o.counterparty_id = Some(counterparty);
            }
            o.clone()
        };
        let bid_after = apply(bid_id, offer.user_id);
        let offer_after = apply(offer_id, bid.user_id);

        self.trades.lock().unwrap().push(trade.clone());
        Ok(CommittedMatch {
            trade,
            bid: bid_after,
            offer: offer_after,
        })
    }
}

// ===== Recording channel fakes =====

pub struct RecordingRealtime {
    pub user_events: Mutex<Vec<(i64, RealtimeEvent)>>,
    pub broadcasts: Mutex<Vec<MarketUpdate>>,
}

impl RecordingRealtime {
    pub fn new() -> Self {
        Self {
            user_events: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub fn events_for(&self, user_id: i64) -> Vec<RealtimeEvent> {
        self.user_events
            .lock()
            .unwrap()
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn event_names_for(&self, user_id: i64) -> Vec<&'static str> {
        self.events_for(user_id).iter().map(|e| e.name()).collect()
    }
}

#[async_trait]
impl RealtimeChannel for RecordingRealtime {
    async fn send_to_user(&self, user_id: i64, event: RealtimeEvent) -> anyhow::Result<()> {
        self.user_events.lock().unwrap().push((user_id, event));
        Ok(())
    }

    async fn broadcast(&self, update: MarketUpdate) -> anyhow::Result<()> {
        self.broadcasts.lock().unwrap().push(update);
        Ok(())
    }
}

pub struct RecordingSecondary {
    pub texts: Mutex<Vec<(String, String)>>,
}

impl RecordingSecondary {
    pub fn new() -> Self {
        Self {
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn bodies_for(&self, address: &str) -> Vec<String> {
        self.texts
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.texts.lock().unwrap().len()
    }
}

#[async_trait]
impl SecondaryChannel for RecordingSecondary {
    async fn send_text(&self, address: &str, body: &str) -> anyhow::Result<()> {
        self.texts
            .lock()
            .unwrap()
            .push((address.to_string(), body.to_string()));
        Ok(())
    }
}

pub struct RecordingProjection {
    pub refreshed: Mutex<Vec<String>>,
}

impl RecordingProjection {
    pub fn new() -> Self {
        Self {
            refreshed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BookProjection for RecordingProjection {
    async fn refresh(&self, asset: &str) -> anyhow::Result<()> {
        self.refreshed.lock().unwrap().push(asset.to_string());
        Ok(())
    }
}

// ===== Harness =====

pub struct Harness {
    pub engine: MatchingEngine,
    pub store: Arc<MemStore>,
    pub control: Arc<InProcessControl>,
    pub realtime: Arc<RecordingRealtime>,
    pub secondary: Arc<RecordingSecondary>,
    pub projection: Arc<RecordingProjection>,
}

pub fn harness() -> Harness {
    harness_with(MatchingConfig::default())
}

pub fn harness_with(cfg: MatchingConfig) -> Harness {
    let store = Arc::new(MemStore::new());
    let control = Arc::new(InProcessControl::new());
    let realtime = Arc::new(RecordingRealtime::new());
    let secondary = Arc::new(RecordingSecondary::new());
    let projection = Arc::new(RecordingProjection::new());
    store.add_user(1, "alice", Some("+15550100"));
    store.add_user(2, "bob", Some("+15550101"));
    store.add_user(3, "carol", None);
    let engine = MatchingEngine::new(
        cfg,
        store.clone(),
        control.clone(),
        realtime.clone(),
        secondary.clone(),
        projection.clone(),
    );
    Harness {
        engine,
        store,
        control,
        realtime,
        secondary,
        projection,
    }
}

/// Give spawned notification and fan-out tasks a moment to land.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
