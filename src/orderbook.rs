use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::engine::{MatchingEngine, Order, Side};
use crate::error::MatchResult;

/// Seam to the order-book projection service. The engine only ever asks it
/// to refresh one asset after a commit.
#[async_trait]
pub trait BookProjection: Send + Sync {
    async fn refresh(&self, asset: &str) -> anyhow::Result<()>;
}

pub struct NoopProjection;

#[async_trait]
impl BookProjection for NoopProjection {
    async fn refresh(&self, _asset: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookLevel {
    pub order_id: Uuid,
    pub price: Decimal,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookView {
    pub asset: String,
    pub bids: Vec<BookLevel>,
    pub offers: Vec<BookLevel>,
    pub bid_lots_total: i64,
    pub offer_lots_total: i64,
    pub generated_at: DateTime<Utc>,
}

fn level(o: &Order) -> BookLevel {
    BookLevel {
        order_id: o.id,
        price: o.price(),
        amount: o.remaining,
    }
}

impl MatchingEngine {
    /// Top-of-book view, straight from the store. Reads deliberately bypass
    /// the scan snapshot so the view is never older than the last commit.
    pub async fn order_book(&self, asset: &str) -> MatchResult<OrderBookView> {
        let depth = self.shared.cfg.book_depth;
        let orders = self.shared.store.find_active_orders_for_asset(asset).await?;

        let mut bids: Vec<&Order> = orders.iter().filter(|o| o.side == Side::Bid).collect();
        let mut offers: Vec<&Order> = orders.iter().filter(|o| o.side == Side::Offer).collect();
        // Store order is (price desc, created asc); offers need price asc.
        bids.sort_by(|a, b| {
            b.price_cents
                .cmp(&a.price_cents)
                .then(a.created_at.cmp(&b.created_at))
        });
        offers.sort_by(|a, b| {
            a.price_cents
                .cmp(&b.price_cents)
                .then(a.created_at.cmp(&b.created_at))
        });

        let bid_lots_total = bids.iter().map(|o| o.remaining).sum();
        let offer_lots_total = offers.iter().map(|o| o.remaining).sum();
        Ok(OrderBookView {
            asset: asset.to_string(),
            bids: bids.iter().take(depth).map(|o| level(o)).collect(),
            offers: offers.iter().take(depth).map(|o| level(o)).collect(),
            bid_lots_total,
            offer_lots_total,
            generated_at: Utc::now(),
        })
    }
}
