use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        secondary_address TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS orders (
        id UUID PRIMARY KEY,
        side TEXT NOT NULL CHECK (side IN ('BID','OFFER')),
        asset TEXT NOT NULL,
        price_cents BIGINT NOT NULL CHECK (price_cents > 0),
        original_amount BIGINT NOT NULL CHECK (original_amount > 0),
        remaining BIGINT NOT NULL CHECK (remaining >= 0 AND remaining <= original_amount),
        matched BOOLEAN NOT NULL DEFAULT false,
        status TEXT NOT NULL CHECK (status IN ('ACTIVE','MATCHED','CANCELLED','EXPIRED')),
        user_id BIGINT NOT NULL REFERENCES users(id),
        counterparty_id BIGINT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_orders_active ON orders (asset, price_cents DESC, created_at ASC) WHERE status = 'ACTIVE'",
    "CREATE TABLE IF NOT EXISTS trades (
        id UUID PRIMARY KEY,
        asset TEXT NOT NULL,
        price_cents BIGINT NOT NULL,
        amount BIGINT NOT NULL CHECK (amount > 0),
        buyer_order_id UUID NOT NULL REFERENCES orders(id),
        seller_order_id UUID NOT NULL REFERENCES orders(id),
        buyer_id BIGINT NOT NULL REFERENCES users(id),
        seller_id BIGINT NOT NULL REFERENCES users(id),
        commission_cents BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_trades_asset_time ON trades (asset, created_at DESC)",
];

#[tokio::main]
async fn main() -> Result<()> {
    let db_url = std::env::var("DATABASE_URL").map_err(|_| anyhow!("missing required env var: DATABASE_URL"))?;
    let reset = std::env::var("INIT_DB_RESET")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let seed = std::env::var("INIT_DB_SEED")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let db = PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&db_url)
        .await
        .context("connect postgres")?;

    if reset {
        for table in ["trades", "orders", "users"] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
                .execute(&db)
                .await
                .with_context(|| format!("drop table {table}"))?;
        }
    }
    for stmt in SCHEMA {
        sqlx::query(stmt)
            .execute(&db)
            .await
            .with_context(|| format!("exec schema stmt: {}", stmt.lines().next().unwrap_or("<empty>")))?;
    }

    if !seed {
        println!("initialized: schema only");
        return Ok(());
    }

    // Demo users and a small resting book so the loop has something to chew on.
    let mut user_ids = Vec::new();
    for (name, address) in [
        ("alice", Some("+15550100")),
        ("bob", Some("+15550101")),
        ("carol", None),
    ] {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO users (username, secondary_address) VALUES ($1, $2)
             ON CONFLICT (username) DO UPDATE SET secondary_address = EXCLUDED.secondary_address
             RETURNING id",
        )
        .bind(name)
        .bind(address)
        .fetch_one(&db)
        .await
        .with_context(|| format!("seed user {name}"))?;
        user_ids.push(row.0);
    }

    let seed_orders: &[(&str, &str, i64, i64, usize)] = &[
        // (asset, side, price_cents, lots, user index)
        ("GRAIN-A", "BID", 100_00, 5, 0),
        ("GRAIN-A", "OFFER", 100_00, 5, 1),
        ("GRAIN-B", "BID", 50_00, 3, 0),
        ("GRAIN-B", "OFFER", 50_00, 7, 2),
        ("TIMBER-C", "BID", 9_50, 1, 1),
        ("TIMBER-C", "OFFER", 10_00, 1, 2),
    ];
    for &(asset, side, price_cents, lots, user_idx) in seed_orders {
        sqlx::query(
            "INSERT INTO orders (id, side, asset, price_cents, original_amount, remaining, matched, status, user_id, created_at)
             VALUES ($1,$2,$3,$4,$5,$5,false,'ACTIVE',$6,$7)",
        )
        .bind(Uuid::new_v4())
        .bind(side)
        .bind(asset)
        .bind(price_cents)
        .bind(lots)
        .bind(user_ids[user_idx])
        .bind(Utc::now())
        .execute(&db)
        .await
        .with_context(|| format!("seed order {asset} {side}"))?;
    }

    println!(
        "initialized: users={} seed_orders={}",
        user_ids.len(),
        seed_orders.len()
    );
    Ok(())
}
