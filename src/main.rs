use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

use lotmatch::config::load_config;
use lotmatch::control::InProcessControl;
use lotmatch::notify::{BroadcastRealtime, OutboxSecondary};
use lotmatch::orderbook::NoopProjection;
use lotmatch::store::PgStore;
use lotmatch::MatchingEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config()?;

    let pool = PgPoolOptions::new()
        .min_connections(cfg.database.min_pool_size)
        .max_connections(cfg.database.max_pool_size)
        .acquire_timeout(Duration::from_secs(cfg.database.acquire_timeout_seconds))
        .max_lifetime(Duration::from_secs(cfg.database.max_lifetime_seconds))
        .connect(&cfg.database.url)
        .await
        .context("failed to connect to postgres")?;

    let store = Arc::new(PgStore::new(pool));
    let control = Arc::new(InProcessControl::new());
    let realtime = Arc::new(BroadcastRealtime::new());
    let (secondary, mut outbox_rx) = OutboxSecondary::new();

    // Demonstration consumers for the two channels: a real deployment points a
    // websocket gateway at the realtime feed and a transport worker at the
    // outbox. Delivery stays outside the matching core either way.
    let mut user_events = realtime.subscribe_user_events();
    tokio::spawn(async move {
        while let Ok(addressed) = user_events.recv().await {
            eprintln!(
                "[realtime] user_id={} event={}",
                addressed.user_id,
                addressed.event.name()
            );
        }
    });
    let mut market_updates = realtime.subscribe_market_updates();
    tokio::spawn(async move {
        while let Ok(update) = market_updates.recv().await {
            eprintln!("[realtime] broadcast asset={} message={}", update.asset, update.message);
        }
    });
    tokio::spawn(async move {
        while let Some(text) = outbox_rx.recv().await {
            eprintln!("[secondary] to={} body={}", text.address, text.body);
        }
    });
    let mut trade_events = control.subscribe_trades();
    tokio::spawn(async move {
        while let Ok(event) = trade_events.recv().await {
            eprintln!(
                "[bus] topic=trade:executed trade_id={} asset={} amount={}",
                event.trade_id, event.asset, event.amount
            );
        }
    });

    let engine = MatchingEngine::new(
        cfg.matching.clone(),
        store,
        control,
        realtime,
        Arc::new(secondary),
        Arc::new(NoopProjection),
    );
    engine.start();

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    eprintln!("[main] shutdown_requested");
    engine.stop().await;
    Ok(())
}
