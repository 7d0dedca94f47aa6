use std::sync::atomic::Ordering;

use crate::engine::{fmt_money, EngineCore, MatchingEngine, Order, Side};
use crate::error::MatchResult;
use crate::notify::{
    OrderMatchedNotice, RealtimeEvent, TradeExecutedEvent, TradeExecutedNotice,
};
use crate::store::CommittedMatch;

impl MatchingEngine {
    /// Execute one match against the store. On success the snapshot is
    /// invalidated immediately and the post-commit fan-out (projection
    /// refresh, bus publish, user notifications) runs on its own task, so a
    /// failure there can neither roll back nor delay the commit.
    pub(crate) async fn commit_pair(
        &self,
        core: &mut EngineCore,
        bid: &Order,
        offer: &Order,
    ) -> MatchResult<()> {
        let committed = match self
            .shared
            .store
            .commit_trade(bid.id, offer.id, self.shared.cfg.commission_rate_ppm)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                self.shared.perf.commit_errors.fetch_add(1, Ordering::Relaxed);
                eprintln!(
                    "[committer] commit_failed asset={} bid={} offer={} error={}",
                    bid.asset, bid.id, offer.id, e
                );
                return Err(e);
            }
        };
        core.snapshot.invalidate();
        self.shared.perf.trades_committed.fetch_add(1, Ordering::Relaxed);
        eprintln!(
            "[committer] trade_committed asset={} trade_id={} amount={} price_cents={} commission_cents={} match_type={:?}",
            committed.trade.asset,
            committed.trade.id,
            committed.trade.amount,
            committed.trade.price_cents,
            committed.trade.commission_cents,
            committed.match_type()
        );
        self.spawn_post_commit(committed);
        Ok(())
    }

    fn spawn_post_commit(&self, committed: CommittedMatch) {
        let engine = self.clone();
        tokio::spawn(async move {
            let match_type = committed.match_type();
            let trade = &committed.trade;
            let event = TradeExecutedEvent {
                trade_id: trade.id,
                asset: trade.asset.clone(),
                price: rust_decimal::Decimal::new(trade.price_cents, 2),
                amount: trade.amount,
                buyer_id: trade.buyer_id,
                seller_id: trade.seller_id,
                timestamp: trade.created_at,
                bid_fully_matched: committed.bid.matched,
                offer_fully_matched: committed.offer.matched,
                bid_order_id: committed.bid.id,
                offer_order_id: committed.offer.id,
                match_type,
                partial_fill: match_type.is_partial(),
            };

            let (proj, publ) = tokio::join!(
                engine.shared.projection.refresh(&trade.asset),
                engine.shared.control.publish_trade(&event),
            );
            if let Err(e) = proj {
                eprintln!(
                    "[committer] projection_refresh_failed asset={} error={}",
                    trade.asset, e
                );
            }
            if let Err(e) = publ {
                eprintln!(
                    "[committer] publish_failed trade_id={} error={}",
                    trade.id, e
                );
            }

            for order in [&committed.bid, &committed.offer] {
                engine.notify_fill(order, &committed, match_type.is_partial()).await;
            }
        });
    }

    async fn notify_fill(&self, order: &Order, committed: &CommittedMatch, partial: bool) {
        let trade = &committed.trade;
        let notice = TradeExecutedNotice {
            order_id: order.id,
            asset: trade.asset.clone(),
            price: rust_decimal::Decimal::new(trade.price_cents, 2),
            amount: trade.amount,
            trade_id: trade.id,
            side: order.side,
            is_fully_filled: order.matched,
            is_partial_fill: partial,
            remaining_amount: order.remaining,
            original_amount: order.original_amount,
        };
        self.shared
            .notifier
            .push_user(order.user_id, RealtimeEvent::TradeExecuted(notice))
            .await;
        if order.matched {
            let legacy = OrderMatchedNotice {
                order_id: order.id,
                asset: trade.asset.clone(),
                price: rust_decimal::Decimal::new(trade.price_cents, 2),
                amount: trade.amount,
                trade_id: trade.id,
                side: order.side,
            };
            self.shared
                .notifier
                .push_user(order.user_id, RealtimeEvent::OrderMatched(legacy))
                .await;
        }

        let verb = match order.side {
            Side::Bid => "bought",
            Side::Offer => "sold",
        };
        let tail = if order.matched {
            "Your order is fully matched.".to_string()
        } else {
            format!("{} lots remain open.", order.remaining)
        };
        let body = format!(
            "Trade executed on {}: {verb} {} lots at {} (total {}). {}",
            trade.asset,
            trade.amount,
            fmt_money(trade.price_cents),
            fmt_money(trade.amount.saturating_mul(trade.price_cents)),
            tail
        );
        self.shared.notifier.text_user(order.user_id, body).await;
    }
}
