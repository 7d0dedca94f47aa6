use std::sync::atomic::Ordering;

use chrono::Utc;

use crate::engine::{
    fmt_money, smaller_party, ConfirmationKey, ConfirmationStage, EngineCore, MatchingEngine,
    Order, PendingConfirmation,
};
use crate::error::MatchResult;
use crate::notify::{ConfirmationRequest, PartialFillApproval, RealtimeEvent};
use crate::state::{lock_read, lock_write};
use crate::timer::TimerKind;

impl MatchingEngine {
    /// Price matched but quantities differ: open the two-step confirmation and
    /// ask the smaller party first. Caller has already ruled out declined and
    /// duplicate keys.
    pub(crate) fn open_confirmation(&self, core: &mut EngineCore, bid: &Order, offer: &Order) {
        let key = ConfirmationKey::new(&bid.asset, bid.id, offer.id);
        let party = smaller_party(bid, offer);
        let (smaller_qty, larger_qty) = if bid.remaining < offer.remaining {
            (bid.remaining, offer.remaining)
        } else {
            (offer.remaining, bid.remaining)
        };
        let now = Utc::now();
        let deadline =
            now + chrono::Duration::milliseconds(self.shared.cfg.confirmation_timeout.as_millis() as i64);
        let pending = PendingConfirmation {
            key: key.clone(),
            bid: bid.clone(),
            offer: offer.clone(),
            smaller_party: party,
            smaller_qty,
            larger_qty,
            stage: ConfirmationStage::AwaitingSmaller,
            smaller_response: None,
            epoch: 0,
            created_at: now,
            deadline,
        };
        core.confirmations.insert(key.clone(), pending.clone());
        self.shared
            .perf
            .confirmations_opened
            .fetch_add(1, Ordering::Relaxed);
        eprintln!(
            "[confirm] opened key={} smaller_party={:?} smaller_qty={} larger_qty={}",
            key, party, smaller_qty, larger_qty
        );
        self.arm_confirmation_timer(&key, ConfirmationStage::AwaitingSmaller, 0);
        self.spawn_confirmation_request(pending);
    }

    /// Response entry point for both human replies and stage timeouts.
    /// Responses for keys that are no longer pending are silently ignored.
    pub async fn handle_quantity_confirmation_response(
        &self,
        key: &ConfirmationKey,
        accepted: bool,
        new_quantity: Option<i64>,
    ) -> MatchResult<()> {
        let mut core = lock_write(&self.shared.core, "confirm.handle_response.core_write").await;
        self.resolve_confirmation(&mut core, key, accepted, new_quantity, None)
            .await
    }

    pub(crate) async fn resolve_confirmation(
        &self,
        core: &mut EngineCore,
        key: &ConfirmationKey,
        accepted: bool,
        new_quantity: Option<i64>,
        expected: Option<(ConfirmationStage, u64)>,
    ) -> MatchResult<()> {
        let Some(pending) = core.confirmations.get(key) else {
            eprintln!("[confirm] ignored_unknown key={key}");
            return Ok(());
        };
        if let Some((stage, epoch)) = expected {
            if pending.stage != stage || pending.epoch != epoch {
                return Ok(());
            }
        }
        let stage = pending.stage;

        match (stage, accepted) {
            (ConfirmationStage::AwaitingSmaller, true) => {
                // A bare YES takes the whole additional quantity; an explicit
                // number is honored verbatim even if it still leaves a mismatch.
                let target_qty = new_quantity.unwrap_or(pending.larger_qty);
                if target_qty < pending.smaller_qty {
                    eprintln!(
                        "[confirm] ignored_downsize key={key} requested={} current={}",
                        target_qty, pending.smaller_qty
                    );
                    return Ok(());
                }
                let Some(pending) = core.confirmations.remove(key) else {
                    return Ok(());
                };
                self.cancel_confirmation_timers(key);
                let smaller_id = pending.smaller_order().id;
                self.shared
                    .store
                    .update_order_amount(smaller_id, target_qty)
                    .await?;
                core.snapshot.invalidate();
                let bid = self
                    .shared
                    .store
                    .find_order_by_id(key.bid_order_id)
                    .await?
                    .ok_or(crate::error::MatchError::OrderNotFound(key.bid_order_id))?;
                let offer = self
                    .shared
                    .store
                    .find_order_by_id(key.offer_order_id)
                    .await?
                    .ok_or(crate::error::MatchError::OrderNotFound(key.offer_order_id))?;
                self.shared
                    .perf
                    .confirmations_accepted
                    .fetch_add(1, Ordering::Relaxed);
                eprintln!(
                    "[confirm] smaller_accepted key={key} new_qty={target_qty}"
                );
                self.commit_pair(core, &bid, &offer).await?;
            }
            (ConfirmationStage::AwaitingSmaller, false) => {
                let Some(pending) = core.confirmations.get_mut(key) else {
                    return Ok(());
                };
                let snapshot = {
                    pending.stage = ConfirmationStage::AwaitingLarger;
                    pending.smaller_response = Some(false);
                    pending.epoch += 1;
                    pending.deadline = Utc::now()
                        + chrono::Duration::milliseconds(
                            self.shared.cfg.confirmation_timeout.as_millis() as i64,
                        );
                    pending.clone()
                };
                self.shared.timers.cancel(TimerKind::ConfirmSmaller, &key.to_string());
                self.arm_confirmation_timer(key, ConfirmationStage::AwaitingLarger, snapshot.epoch);
                eprintln!("[confirm] awaiting_larger key={key}");
                self.spawn_partial_fill_approval(snapshot);
            }
            (ConfirmationStage::AwaitingLarger, true) => {
                let Some(pending) = core.confirmations.remove(key) else {
                    return Ok(());
                };
                self.cancel_confirmation_timers(key);
                self.shared
                    .perf
                    .confirmations_accepted
                    .fetch_add(1, Ordering::Relaxed);
                eprintln!(
                    "[confirm] larger_accepted key={key} partial_qty={}",
                    pending.smaller_qty
                );
                self.commit_pair(core, &pending.bid, &pending.offer).await?;
            }
            (ConfirmationStage::AwaitingLarger, false) => {
                core.confirmations.remove(key);
                self.cancel_confirmation_timers(key);
                core.declined_pairs.insert(key.clone());
                self.shared
                    .perf
                    .confirmations_declined
                    .fetch_add(1, Ordering::Relaxed);
                eprintln!("[confirm] declined key={key}");
            }
        }
        Ok(())
    }

    pub(crate) async fn confirmation_timed_out(
        &self,
        key: ConfirmationKey,
        stage: ConfirmationStage,
        epoch: u64,
    ) {
        let mut core = lock_write(&self.shared.core, "confirm.timeout.core_write").await;
        let live = core
            .confirmations
            .get(&key)
            .map(|pc| pc.stage == stage && pc.epoch == epoch)
            .unwrap_or(false);
        if !live {
            return;
        }
        eprintln!("[confirm] timeout key={key} stage={stage:?}");
        if let Err(e) = self
            .resolve_confirmation(&mut core, &key, false, None, Some((stage, epoch)))
            .await
        {
            eprintln!("[confirm] timeout_resolution_failed key={key} error={e}");
        }
    }

    fn arm_confirmation_timer(&self, key: &ConfirmationKey, stage: ConfirmationStage, epoch: u64) {
        let kind = match stage {
            ConfirmationStage::AwaitingSmaller => TimerKind::ConfirmSmaller,
            ConfirmationStage::AwaitingLarger => TimerKind::ConfirmLarger,
        };
        let engine = self.clone();
        let fire_key = key.clone();
        self.shared.timers.arm(
            kind,
            key.to_string(),
            self.shared.cfg.confirmation_timeout,
            async move {
                engine.confirmation_timed_out(fire_key, stage, epoch).await;
            },
        );
    }

    fn cancel_confirmation_timers(&self, key: &ConfirmationKey) {
        let id = key.to_string();
        self.shared.timers.cancel(TimerKind::ConfirmSmaller, &id);
        self.shared.timers.cancel(TimerKind::ConfirmLarger, &id);
    }

    fn spawn_confirmation_request(&self, pending: PendingConfirmation) {
        let engine = self.clone();
        let timeout_s = self.shared.cfg.confirmation_timeout.as_secs();
        tokio::spawn(async move {
            let smaller = pending.smaller_order().clone();
            let larger = pending.larger_order().clone();
            let message = format!(
                "Price matched on {} at {} but quantities differ: you have {} lots, the counterparty has {}. Increase your order by {} lots? You have {}s to respond.",
                pending.key.asset,
                fmt_money(smaller.price_cents),
                pending.smaller_qty,
                pending.larger_qty,
                pending.additional_qty(),
                timeout_s
            );
            let event = ConfirmationRequest {
                confirmation_key: pending.key.to_string(),
                asset: pending.key.asset.clone(),
                your_order_id: smaller.id,
                counterparty_order_id: larger.id,
                your_quantity: pending.smaller_qty,
                counterparty_quantity: pending.larger_qty,
                additional_quantity: pending.additional_qty(),
                price: smaller.price(),
                side: smaller.side,
                message: message.clone(),
            };
            engine
                .shared
                .notifier
                .push_user(smaller.user_id, RealtimeEvent::ConfirmationRequest(event))
                .await;
            let prefix = smaller.id_prefix();
            let text = format!(
                "Quantity mismatch on {}: your {} covers {} lots at {} but the counterparty has {}. Reply YES {} to trade all {} lots or NO {} to decline. Expires in {}s.",
                pending.key.asset,
                smaller.side.as_str(),
                pending.smaller_qty,
                fmt_money(smaller.price_cents),
                pending.larger_qty,
                prefix,
                pending.larger_qty,
                prefix,
                timeout_s
            );
            engine.shared.notifier.text_user(smaller.user_id, text).await;
        });
    }

    fn spawn_partial_fill_approval(&self, pending: PendingConfirmation) {
        let engine = self.clone();
        let timeout_s = self.shared.cfg.confirmation_timeout.as_secs();
        tokio::spawn(async move {
            let smaller = pending.smaller_order().clone();
            let larger = pending.larger_order().clone();
            let message = format!(
                "The counterparty on {} declined to grow their order. Accept a partial fill of {} of your {} lots at {}? You have {}s to respond.",
                pending.key.asset,
                pending.smaller_qty,
                pending.larger_qty,
                fmt_money(larger.price_cents),
                timeout_s
            );
            let event = PartialFillApproval {
                confirmation_key: pending.key.to_string(),
                asset: pending.key.asset.clone(),
                your_order_id: larger.id,
                counterparty_order_id: smaller.id,
                your_quantity: pending.larger_qty,
                partial_fill_quantity: pending.smaller_qty,
                price: larger.price(),
                side: larger.side,
                message: message.clone(),
            };
            engine
                .shared
                .notifier
                .push_user(larger.user_id, RealtimeEvent::PartialFillApproval(event))
                .await;
            let prefix = larger.id_prefix();
            let text = format!(
                "Partial fill available on {}: {} of your {} lots at {}. Reply YES {} to accept or NO {} to decline. Expires in {}s.",
                pending.key.asset,
                pending.smaller_qty,
                pending.larger_qty,
                fmt_money(larger.price_cents),
                prefix,
                prefix,
                timeout_s
            );
            engine.shared.notifier.text_user(larger.user_id, text).await;
        });
    }

    /// Resolve an 8-character order-id prefix from an out-of-band reply to the
    /// confirmation it belongs to.
    pub async fn resolve_order_prefix(&self, prefix: &str) -> Option<ConfirmationKey> {
        let core = lock_read(&self.shared.core, "confirm.resolve_prefix.core_read").await;
        core.confirmations
            .values()
            .find(|pc| {
                pc.bid.id_prefix().eq_ignore_ascii_case(prefix)
                    || pc.offer.id_prefix().eq_ignore_ascii_case(prefix)
            })
            .map(|pc| pc.key.clone())
    }

    /// All confirmations currently waiting on a reply from this user.
    pub async fn confirmations_soliciting(&self, user_id: i64) -> Vec<PendingConfirmation> {
        let core = lock_read(&self.shared.core, "confirm.soliciting.core_read").await;
        core.confirmations
            .values()
            .filter(|pc| pc.solicited_user_id() == user_id)
            .cloned()
            .collect()
    }
}
