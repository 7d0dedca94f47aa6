use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::commission::commission_cents;
use crate::engine::{MatchType, Order, OrderStatus, Side, Trade};
use crate::error::{MatchError, MatchResult};

#[derive(Debug, Clone)]
pub struct UserContact {
    pub user_id: i64,
    pub username: String,
    pub secondary_address: Option<String>,
}

/// Result of one atomic trade commit: the trade plus both orders as they
/// stand after the transaction.
#[derive(Debug, Clone)]
pub struct CommittedMatch {
    pub trade: Trade,
    pub bid: Order,
    pub offer: Order,
}

impl CommittedMatch {
    pub fn match_type(&self) -> MatchType {
        crate::engine::classify_match(self.bid.original_amount, self.offer.original_amount)
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// All ACTIVE orders with remaining > 0, sorted (asset asc, price desc, created_at asc).
    async fn find_active_orders(&self) -> MatchResult<Vec<Order>>;

    async fn find_active_orders_for_asset(&self, asset: &str) -> MatchResult<Vec<Order>>;

    async fn find_order_by_id(&self, id: Uuid) -> MatchResult<Option<Order>>;

    async fn find_user_by_id(&self, id: i64) -> MatchResult<Option<UserContact>>;

    async fn update_order_price(&self, id: Uuid, price_cents: i64) -> MatchResult<()>;

    /// Sets both original_amount and remaining. Used only when the smaller
    /// party of a quantity confirmation upsizes.
    async fn update_order_amount(&self, id: Uuid, amount: i64) -> MatchResult<()>;

    /// Atomic unit: re-reads both orders, validates them, computes
    /// amount = min(remaining) and price = offer price, inserts the Trade and
    /// applies both order updates. Aborts with no visible change on failure.
    async fn commit_trade(
        &self,
        bid_id: Uuid,
        offer_id: Uuid,
        rate_ppm: i64,
    ) -> MatchResult<CommittedMatch>;
}

// ===== Postgres implementation =====

pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

const ORDER_COLUMNS: &str =
    "id, side, asset, price_cents, original_amount, remaining, matched, status, user_id, counterparty_id, created_at";

fn row_to_order(row: &PgRow) -> MatchResult<Order> {
    let side_raw: String = row.get("side");
    let status_raw: String = row.get("status");
    let side = match side_raw.as_str() {
        "BID" => Side::Bid,
        "OFFER" => Side::Offer,
        other => return Err(MatchError::internal(format!("bad side in store: {other}"))),
    };
    let status = OrderStatus::parse(&status_raw)
        .ok_or_else(|| MatchError::internal(format!("bad status in store: {status_raw}")))?;
    Ok(Order {
        id: row.get("id"),
        side,
        asset: row.get("asset"),
        price_cents: row.get("price_cents"),
        original_amount: row.get("original_amount"),
        remaining: row.get("remaining"),
        matched: row.get("matched"),
        status,
        user_id: row.get("user_id"),
        counterparty_id: row.try_get("counterparty_id").ok(),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl OrderStore for PgStore {
    async fn find_active_orders(&self) -> MatchResult<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status = 'ACTIVE' AND remaining > 0 \
             ORDER BY asset ASC, price_cents DESC, created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_order).collect()
    }

    async fn find_active_orders_for_asset(&self, asset: &str) -> MatchResult<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status = 'ACTIVE' AND remaining > 0 AND asset = $1 \
             ORDER BY price_cents DESC, created_at ASC"
        ))
        .bind(asset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_order).collect()
    }

    async fn find_order_by_id(&self, id: Uuid) -> MatchResult<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn find_user_by_id(&self, id: i64) -> MatchResult<Option<UserContact>> {
        let row = sqlx::query("SELECT id, username, secondary_address FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserContact {
            user_id: r.get("id"),
            username: r.get("username"),
            secondary_address: r.try_get("secondary_address").ok(),
        }))
    }

    async fn update_order_price(&self, id: Uuid, price_cents: i64) -> MatchResult<()> {
        let res = sqlx::query("UPDATE orders SET price_cents = $2 WHERE id = $1 AND status = 'ACTIVE'")
            .bind(id)
            .bind(price_cents)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(MatchError::OrderNotFound(id));
        }
        Ok(())
    }

    async fn update_order_amount(&self, id: Uuid, amount: i64) -> MatchResult<()> {
        let res = sqlx::query(
            "UPDATE orders SET original_amount = $2, remaining = $2 WHERE id = $1 AND status = 'ACTIVE'",
        )
        .bind(id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(MatchError::OrderNotFound(id));
        }
        Ok(())
    }

    async fn commit_trade(
        &self,
        bid_id: Uuid,
        offer_id: Uuid,
        rate_ppm: i64,
    ) -> MatchResult<CommittedMatch> {
        let mut tx = self.pool.begin().await?;

        // Row locks in sorted id order so concurrent commits cannot deadlock.
        let mut lock_order = [bid_id, offer_id];
        lock_order.sort();
        let mut locked: Vec<Order> = Vec::with_capacity(2);
        for id in lock_order {
            let row = sqlx::query(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
            ))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(MatchError::OrderNotFound(id))?;
            locked.push(row_to_order(&row)?);
        }
        let (bid, offer) = if locked[0].id == bid_id {
            (locked.remove(0), locked.remove(0))
        } else {
            let offer = locked.remove(0);
            (locked.remove(0), offer)
        };

        for o in [&bid, &offer] {
            if o.status != OrderStatus::Active {
                return Err(MatchError::NotMatchable {
                    order_id: o.id,
                    reason: "not active",
                });
            }
            if o.remaining <= 0 {
                return Err(MatchError::NotMatchable {
                    order_id: o.id,
                    reason: "nothing remaining",
                });
            }
        }
        if bid.side != Side::Bid || offer.side != Side::Offer {
            return Err(MatchError::internal("commit_trade called with wrong sides"));
        }
        if bid.price_cents < offer.price_cents {
            return Err(MatchError::NotCrossed {
                bid_cents: bid.price_cents,
                offer_cents: offer.price_cents,
            });
        }

        let amount = bid.remaining.min(offer.remaining);
        let price_cents = offer.price_cents;
        let commission = commission_cents(amount, price_cents, rate_ppm);
        let trade = Trade {
            id: Uuid::new_v4(),
            asset: offer.asset.clone(),
            price_cents,
            amount,
            buyer_order_id: bid.id,
            seller_order_id: offer.id,
            buyer_id: bid.user_id,
            seller_id: offer.user_id,
            commission_cents: commission,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO trades (id, asset, price_cents, amount, buyer_order_id, seller_order_id, \
             buyer_id, seller_id, commission_cents, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(trade.id)
        .bind(&trade.asset)
        .bind(trade.price_cents)
        .bind(trade.amount)
        .bind(trade.buyer_order_id)
        .bind(trade.seller_order_id)
        .bind(trade.buyer_id)
        .bind(trade.seller_id)
        .bind(trade.commission_cents)
        .bind(trade.created_at)
        .execute(&mut *tx)
        .await?;

        let bid_after = apply_fill(&mut tx, &bid, amount, offer.user_id).await?;
        let offer_after = apply_fill(&mut tx, &offer, amount, bid.user_id).await?;

        tx.commit().await?;
        Ok(CommittedMatch {
            trade,
            bid: bid_after,
            offer: offer_after,
        })
    }
}

async fn apply_fill(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    order: &Order,
    amount: i64,
    counterparty_id: i64,
) -> MatchResult<Order> {
    let remaining = order.remaining - amount;
    let filled = remaining == 0;
    let status = if filled {
        OrderStatus::Matched
    } else {
        order.status
    };
    sqlx::query(
        "UPDATE orders SET remaining = $2, matched = $3, status = $4, counterparty_id = $5 WHERE id = $1",
    )
    .bind(order.id)
    .bind(remaining)
    .bind(filled)
    .bind(status.as_str())
    .bind(if filled {
        Some(counterparty_id)
    } else {
        order.counterparty_id
    })
    .execute(&mut **tx)
    .await?;

    let mut after = order.clone();
    after.remaining = remaining;
    after.matched = filled;
    after.status = status;
    if filled {
        after.counterparty_id = Some(counterparty_id);
    }
    Ok(after)
}
