use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::engine::{fmt_money, EngineCore, MatchingEngine, Order, Side};
use crate::error::MatchResult;
use crate::state::lock_write;

const TICK_SLOW_WARN_MS: u128 = 2_000;
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(60);

/// The matching loop. Cooperative and single-flight: a tick only starts after
/// the previous one finished, and a failure in one asset never aborts the
/// sweep over its siblings.
pub(crate) async fn run_matching_loop(engine: MatchingEngine) {
    tokio::time::sleep(engine.shared.cfg.startup_grace).await;
    loop {
        if !engine.shared.running.load(Ordering::Acquire) {
            break;
        }
        let started = Instant::now();
        if let Err(e) = run_tick(&engine).await {
            engine.shared.perf.tick_errors.fetch_add(1, Ordering::Relaxed);
            eprintln!("[matching] tick_failed error={e}");
        }
        engine.shared.perf.ticks.fetch_add(1, Ordering::Relaxed);
        let elapsed = started.elapsed().as_millis();
        if elapsed >= TICK_SLOW_WARN_MS {
            eprintln!("[matching] slow_tick elapsed_ms={elapsed}");
        }
        tokio::time::sleep(engine.shared.cfg.tick_interval).await;
    }
}

async fn run_tick(engine: &MatchingEngine) -> MatchResult<()> {
    let shared = &engine.shared;

    if let Err(e) = shared
        .control
        .set_last_run(Utc::now(), shared.cfg.heartbeat_expiry)
        .await
    {
        eprintln!("[matching] heartbeat_failed error={e}");
    }
    // The flag is only a hint for outside observers; the tick always refreshes
    // the snapshot and rewrites the flag from what it actually saw.
    let hint = shared.control.get_active_orders().await.unwrap_or(None);

    let mut core = lock_write(&shared.core, "tasks.run_tick.core_write").await;
    let orders = core.snapshot.load(shared.store.as_ref(), &shared.perf).await;
    let has_active = !orders.is_empty();
    if let Err(e) = shared
        .control
        .set_active_orders(has_active, shared.cfg.active_flag_expiry)
        .await
    {
        eprintln!("[matching] flag_write_failed error={e}");
    }
    if !has_active {
        return Ok(());
    }

    let mut by_asset: HashMap<String, Vec<Order>> = HashMap::new();
    for order in orders {
        by_asset.entry(order.asset.clone()).or_default().push(order);
    }
    // Busiest assets first.
    let mut assets: Vec<(String, usize)> = by_asset
        .iter()
        .map(|(asset, list)| (asset.clone(), list.len()))
        .collect();
    assets.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    eprintln!(
        "[matching] tick assets={} orders={} hint={:?}",
        assets.len(),
        assets.iter().map(|(_, n)| n).sum::<usize>(),
        hint
    );

    for (asset, _) in assets {
        let Some(list) = by_asset.remove(&asset) else {
            continue;
        };
        if let Err(e) = engine.run_pair_decision(&mut core, &asset, &list).await {
            shared.perf.asset_errors.fetch_add(1, Ordering::Relaxed);
            eprintln!("[matching] asset_failed asset={asset} error={e}");
        }
    }
    Ok(())
}

pub(crate) async fn run_telemetry_loop(engine: MatchingEngine) {
    loop {
        tokio::time::sleep(TELEMETRY_INTERVAL).await;
        if !engine.shared.running.load(Ordering::Acquire) {
            break;
        }
        eprintln!("[perf] {}", engine.shared.perf.snapshot_json());
    }
}

impl MatchingEngine {
    /// Informational nudge over the secondary channel while the spread is
    /// tight enough to be worth closing. Never touches orders or controller
    /// state beyond the per-asset resend stamp.
    pub(crate) fn send_advisories(
        &self,
        core: &mut EngineCore,
        asset: &str,
        bid: &Order,
        offer: &Order,
    ) {
        let spread_cents = offer.price_cents - bid.price_cents;
        if bid.price_cents <= 0 {
            return;
        }
        let spread_pct = (spread_cents as f64) / (bid.price_cents as f64) * 100.0;
        if spread_pct > self.shared.cfg.advisory_max_spread_pct {
            return;
        }
        let now_ms = Utc::now().timestamp_millis();
        let resend_ms = self.shared.cfg.advisory_resend.as_millis() as i64;
        if let Some(last) = core.advisory_sent_ms.get(asset) {
            if now_ms - *last < resend_ms {
                return;
            }
        }
        core.advisory_sent_ms.insert(asset.to_string(), now_ms);
        self.shared
            .perf
            .advisories_sent
            .fetch_add(2, Ordering::Relaxed);
        eprintln!(
            "[matching] advisory asset={asset} spread_cents={spread_cents} spread_pct={spread_pct:.2}"
        );

        let notifier = self.shared.notifier.clone();
        let asset = asset.to_string();
        let bid = bid.clone();
        let offer = offer.clone();
        tokio::spawn(async move {
            let to_bidder = format!(
                "Competitive bidding on {}: your {} at {} is {} below the best offer at {} ({:.1}% spread). Improve your price to trade.",
                asset,
                Side::Bid.as_str(),
                fmt_money(bid.price_cents),
                fmt_money(spread_cents),
                fmt_money(offer.price_cents),
                spread_pct
            );
            let to_offerer = format!(
                "Competitive bidding on {}: your {} at {} is {} above the best bid at {} ({:.1}% spread). Improve your price to trade.",
                asset,
                Side::Offer.as_str(),
                fmt_money(offer.price_cents),
                fmt_money(spread_cents),
                fmt_money(bid.price_cents),
                spread_pct
            );
            notifier.text_user(bid.user_id, to_bidder).await;
            notifier.text_user(offer.user_id, to_offerer).await;
        });
    }
}
