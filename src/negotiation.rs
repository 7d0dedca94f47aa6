use std::sync::atomic::Ordering;

use chrono::Utc;

use crate::engine::{EngineCore, MatchingEngine, NegotiationState, Order, Side};
use crate::error::MatchResult;
use crate::notify::{MarketUpdate, NegotiationYourTurn, RealtimeEvent};
use crate::state::lock_write;
use crate::timer::TimerKind;

impl MatchingEngine {
    /// Best bid below best offer: keep per-asset turn-taking state and nudge
    /// whichever side is being asked to close the gap. The side that did not
    /// just move is asked, so a fresh book starts on the offer's turn.
    pub(crate) async fn drive_negotiation(
        &self,
        core: &mut EngineCore,
        asset: &str,
        bid: &Order,
        offer: &Order,
    ) -> MatchResult<()> {
        match core.negotiations.get_mut(asset) {
            None => {
                let state = NegotiationState {
                    asset: asset.to_string(),
                    best_bid: bid.clone(),
                    best_offer: offer.clone(),
                    turn: Side::Offer,
                    epoch: 0,
                    deadline: Utc::now()
                        + chrono::Duration::milliseconds(
                            self.shared.cfg.negotiation_timeout.as_millis() as i64,
                        ),
                };
                core.negotiations.insert(asset.to_string(), state.clone());
                self.shared
                    .perf
                    .negotiations_opened
                    .fetch_add(1, Ordering::Relaxed);
                eprintln!(
                    "[negotiate] opened asset={} bid_cents={} offer_cents={} turn=OFFER",
                    asset, bid.price_cents, offer.price_cents
                );
                self.arm_negotiation_timer(asset, 0);
                self.spawn_turn_notice(state);
            }
            Some(state) => {
                let rearmed = if state.best_bid.id != bid.id {
                    state.best_bid = bid.clone();
                    state.best_offer = offer.clone();
                    state.turn = Side::Offer;
                    true
                } else if state.best_offer.id != offer.id {
                    state.best_offer = offer.clone();
                    state.best_bid = bid.clone();
                    state.turn = Side::Bid;
                    true
                } else {
                    // Neither best order changed; let the running timer decide.
                    false
                };
                if rearmed {
                    state.epoch += 1;
                    state.deadline = Utc::now()
                        + chrono::Duration::milliseconds(
                            self.shared.cfg.negotiation_timeout.as_millis() as i64,
                        );
                    let snapshot = state.clone();
                    eprintln!(
                        "[negotiate] best_changed asset={} turn={} epoch={}",
                        asset,
                        snapshot.turn.as_str(),
                        snapshot.epoch
                    );
                    self.arm_negotiation_timer(asset, snapshot.epoch);
                    self.spawn_turn_notice(snapshot);
                }
            }
        }
        Ok(())
    }

    /// Reply from the user whose turn it is. Anything from the other side, or
    /// for an asset with no live negotiation, is ignored.
    pub async fn handle_negotiation_response(
        &self,
        asset: &str,
        user_id: i64,
        improved: bool,
        new_price_cents: Option<i64>,
    ) -> MatchResult<()> {
        let mut core = lock_write(&self.shared.core, "negotiate.handle_response.core_write").await;
        let Some(state) = core.negotiations.get(asset) else {
            eprintln!("[negotiate] ignored_no_state asset={asset} user_id={user_id}");
            return Ok(());
        };
        if state.turn_user_id() != user_id {
            eprintln!(
                "[negotiate] ignored_wrong_side asset={asset} user_id={user_id} turn={}",
                state.turn.as_str()
            );
            return Ok(());
        }

        if !improved {
            self.close_negotiation(&mut core, asset, "pass").await;
            return Ok(());
        }

        match new_price_cents {
            Some(price_cents) => {
                let order_id = state.turn_order_id();
                self.shared
                    .store
                    .update_order_price(order_id, price_cents)
                    .await?;
                core.snapshot.invalidate();
                eprintln!(
                    "[negotiate] improved asset={asset} order_id={order_id} price_cents={price_cents}"
                );
                // Re-run the per-asset decision; this may escalate straight to
                // a commit or a quantity confirmation, or just move the book.
                let orders = self
                    .shared
                    .store
                    .find_active_orders_for_asset(asset)
                    .await?;
                self.run_pair_decision(&mut core, asset, &orders).await?;
            }
            None => {
                let Some(state) = core.negotiations.get_mut(asset) else {
                    return Ok(());
                };
                state.turn = state.turn.opposite();
                state.epoch += 1;
                state.deadline = Utc::now()
                    + chrono::Duration::milliseconds(
                        self.shared.cfg.negotiation_timeout.as_millis() as i64,
                    );
                let snapshot = state.clone();
                eprintln!(
                    "[negotiate] turn_toggled asset={asset} turn={}",
                    snapshot.turn.as_str()
                );
                self.arm_negotiation_timer(asset, snapshot.epoch);
                self.spawn_turn_notice(snapshot);
            }
        }
        Ok(())
    }

    pub(crate) async fn negotiation_timed_out(&self, asset: String, epoch: u64) {
        let mut core = lock_write(&self.shared.core, "negotiate.timeout.core_write").await;
        let live = core
            .negotiations
            .get(&asset)
            .map(|st| st.epoch == epoch)
            .unwrap_or(false);
        if !live {
            return;
        }
        eprintln!("[negotiate] timeout asset={asset}");
        self.close_negotiation(&mut core, &asset, "timeout").await;
    }

    /// Pass or timeout: broadcast where the book stands and drop the state.
    async fn close_negotiation(&self, core: &mut EngineCore, asset: &str, reason: &str) {
        let Some(state) = core.negotiations.remove(asset) else {
            return;
        };
        self.shared.timers.cancel(TimerKind::Negotiation, asset);
        self.shared
            .perf
            .negotiations_closed
            .fetch_add(1, Ordering::Relaxed);
        eprintln!(
            "[negotiate] closed asset={asset} reason={reason} bid_cents={} offer_cents={}",
            state.best_bid.price_cents, state.best_offer.price_cents
        );
        let update = MarketUpdate {
            asset: asset.to_string(),
            best_bid: state.best_bid.price(),
            best_offer: state.best_offer.price(),
            message: format!(
                "{}: bid {} / offer {}",
                asset,
                crate::engine::fmt_money(state.best_bid.price_cents),
                crate::engine::fmt_money(state.best_offer.price_cents)
            ),
        };
        let notifier = self.shared.notifier.clone();
        tokio::spawn(async move {
            notifier.broadcast_market(update).await;
        });
    }

    /// Quantity-confirmation or direct-commit path took over for this asset;
    /// the negotiation disappears without a market broadcast.
    pub(crate) fn drop_negotiation_superseded(&self, core: &mut EngineCore, asset: &str) {
        if core.negotiations.remove(asset).is_some() {
            self.shared.timers.cancel(TimerKind::Negotiation, asset);
            self.shared
                .perf
                .negotiations_closed
                .fetch_add(1, Ordering::Relaxed);
            eprintln!("[negotiate] superseded asset={asset}");
        }
    }

    fn arm_negotiation_timer(&self, asset: &str, epoch: u64) {
        let engine = self.clone();
        let fire_asset = asset.to_string();
        self.shared.timers.arm(
            TimerKind::Negotiation,
            asset.to_string(),
            self.shared.cfg.negotiation_timeout,
            async move {
                engine.negotiation_timed_out(fire_asset, epoch).await;
            },
        );
    }

    fn spawn_turn_notice(&self, state: NegotiationState) {
        let engine = self.clone();
        let timeout_s = self.shared.cfg.negotiation_timeout.as_secs();
        tokio::spawn(async move {
            let bid_username = engine.shared.notifier.username(state.best_bid.user_id).await;
            let offer_username = engine
                .shared
                .notifier
                .username(state.best_offer.user_id)
                .await;
            let message = match state.turn {
                Side::Offer => format!(
                    "Best bid on {} is {} against your offer at {}. Improve your price or pass within {}s.",
                    state.asset,
                    crate::engine::fmt_money(state.best_bid.price_cents),
                    crate::engine::fmt_money(state.best_offer.price_cents),
                    timeout_s
                ),
                Side::Bid => format!(
                    "Best offer on {} is {} against your bid at {}. Improve your price or pass within {}s.",
                    state.asset,
                    crate::engine::fmt_money(state.best_offer.price_cents),
                    crate::engine::fmt_money(state.best_bid.price_cents),
                    timeout_s
                ),
            };
            let user_id = state.turn_user_id();
            let event = NegotiationYourTurn {
                asset: state.asset.clone(),
                best_bid: state.best_bid.price(),
                best_offer: state.best_offer.price(),
                best_bid_user_id: state.best_bid.user_id,
                best_offer_user_id: state.best_offer.user_id,
                best_bid_username: bid_username,
                best_offer_username: offer_username,
                turn: state.turn,
                message,
            };
            engine
                .shared
                .notifier
                .push_user(user_id, RealtimeEvent::NegotiationYourTurn(event))
                .await;
        });
    }
}
