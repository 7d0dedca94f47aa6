mod support;

use lotmatch::{MatchType, OrderStatus, Side};
use support::*;

#[tokio::test]
async fn exact_match_commits_immediately() {
    let h = harness();
    let bid = h.store.add_order(make_order(Side::Bid, "GRAIN-A", 100_00, 5, 1));
    let offer = h.store.add_order(make_order(Side::Offer, "GRAIN-A", 100_00, 5, 2));

    let mut bus = h.control.subscribe_trades();
    h.engine.process_asset("GRAIN-A").await.unwrap();
    settle().await;

    assert_eq!(h.store.trade_count(), 1);
    let trade = h.store.last_trade();
    assert_eq!(trade.amount, 5);
    assert_eq!(trade.price_cents, 100_00);
    assert_eq!(trade.commission_cents, 50);
    assert_eq!(trade.buyer_order_id, bid);
    assert_eq!(trade.seller_order_id, offer);

    for id in [bid, offer] {
        let o = h.store.order(id);
        assert_eq!(o.remaining, 0);
        assert!(o.matched);
        assert_eq!(o.status, OrderStatus::Matched);
    }
    let b = h.store.order(bid);
    assert_eq!(b.counterparty_id, Some(2));

    // Bus event carries the full-match classification.
    let event = bus.try_recv().expect("trade event published");
    assert_eq!(event.trade_id, trade.id);
    assert_eq!(event.match_type, MatchType::FullMatch);
    assert!(!event.partial_fill);
    assert!(event.bid_fully_matched);
    assert!(event.offer_fully_matched);

    // Both parties hear about the execution, including the legacy event.
    assert!(h.realtime.event_names_for(1).contains(&"trade:executed"));
    assert!(h.realtime.event_names_for(1).contains(&"order:matched"));
    assert!(h.realtime.event_names_for(2).contains(&"trade:executed"));
    assert_eq!(*h.projection.refreshed.lock().unwrap(), vec!["GRAIN-A"]);
}

#[tokio::test]
async fn smaller_buyer_upsize_accepted_fills_in_full() {
    let h = harness();
    let bid = h.store.add_order(make_order(Side::Bid, "GRAIN-B", 50_00, 3, 1));
    let offer = h.store.add_order(make_order(Side::Offer, "GRAIN-B", 50_00, 7, 2));

    h.engine.process_asset("GRAIN-B").await.unwrap();
    settle().await;
    assert_eq!(h.store.trade_count(), 0, "quantity mismatch must not auto-commit");

    // The smaller party (the buyer) is solicited over both channels.
    let events = h.realtime.events_for(1);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name(), "quantity:confirmation_request");
    let texts = h.secondary.bodies_for("+15550100");
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("YES"), "reply instructions present: {}", texts[0]);

    let key = h
        .engine
        .resolve_order_prefix(&h.store.order(bid).id_prefix())
        .await
        .expect("prefix resolves while pending");
    h.engine
        .handle_quantity_confirmation_response(&key, true, Some(7))
        .await
        .unwrap();
    settle().await;

    let b = h.store.order(bid);
    assert_eq!(b.original_amount, 7, "buyer upsized");
    assert_eq!(b.remaining, 0);
    assert_eq!(b.status, OrderStatus::Matched);
    let o = h.store.order(offer);
    assert_eq!(o.remaining, 0);
    assert_eq!(o.status, OrderStatus::Matched);

    assert_eq!(h.store.trade_count(), 1);
    let trade = h.store.last_trade();
    assert_eq!(trade.amount, 7);
    assert_eq!(trade.price_cents, 50_00);
    assert_eq!(trade.commission_cents, 35);
}

#[tokio::test]
async fn smaller_declines_larger_accepts_partial_fill() {
    let h = harness();
    let bid = h.store.add_order(make_order(Side::Bid, "GRAIN-C", 10_00, 2, 1));
    let offer = h.store.add_order(make_order(Side::Offer, "GRAIN-C", 10_00, 5, 2));

    h.engine.process_asset("GRAIN-C").await.unwrap();
    let key = h
        .engine
        .resolve_order_prefix(&h.store.order(bid).id_prefix())
        .await
        .unwrap();

    // Buyer says NO; the seller is then asked to approve a partial fill.
    h.engine
        .handle_quantity_confirmation_response(&key, false, None)
        .await
        .unwrap();
    settle().await;
    let seller_events = h.realtime.events_for(2);
    assert_eq!(seller_events.len(), 1);
    assert_eq!(seller_events[0].name(), "quantity:partial_fill_approval");
    assert_eq!(h.engine.confirmations_soliciting(2).await.len(), 1);
    assert!(h.engine.confirmations_soliciting(1).await.is_empty());

    // Seller says YES.
    h.engine
        .handle_quantity_confirmation_response(&key, true, None)
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.store.trade_count(), 1);
    let trade = h.store.last_trade();
    assert_eq!(trade.amount, 2);
    assert_eq!(trade.price_cents, 10_00);
    assert_eq!(trade.commission_cents, 2);

    let b = h.store.order(bid);
    assert_eq!(b.status, OrderStatus::Matched);
    let o = h.store.order(offer);
    assert_eq!(o.remaining, 3);
    assert_eq!(o.status, OrderStatus::Active);
    assert!(!o.matched);

    // Seller side was a partial fill and must not get the legacy event.
    assert!(!h.realtime.event_names_for(2).contains(&"order:matched"));
    assert!(h.realtime.event_names_for(1).contains(&"order:matched"));
}

#[tokio::test]
async fn both_decline_suppresses_retry_for_the_pair() {
    let h = harness();
    let bid = h.store.add_order(make_order(Side::Bid, "GRAIN-D", 10_00, 2, 1));
    h.store.add_order(make_order(Side::Offer, "GRAIN-D", 10_00, 5, 2));

    h.engine.process_asset("GRAIN-D").await.unwrap();
    let key = h
        .engine
        .resolve_order_prefix(&h.store.order(bid).id_prefix())
        .await
        .unwrap();
    h.engine
        .handle_quantity_confirmation_response(&key, false, None)
        .await
        .unwrap();
    h.engine
        .handle_quantity_confirmation_response(&key, false, None)
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.store.trade_count(), 0);
    assert!(h.engine.confirmations_soliciting(1).await.is_empty());
    assert!(h.engine.confirmations_soliciting(2).await.is_empty());
    let events_before = h.realtime.user_events.lock().unwrap().len();

    // The same mismatch on the next pass opens nothing new.
    h.engine.process_asset("GRAIN-D").await.unwrap();
    settle().await;
    assert_eq!(h.store.trade_count(), 0);
    assert!(h.engine.confirmations_soliciting(1).await.is_empty());
    assert_eq!(h.realtime.user_events.lock().unwrap().len(), events_before);
}

#[tokio::test]
async fn negotiation_pass_broadcasts_and_clears() {
    let h = harness();
    h.store.add_order(make_order(Side::Bid, "TIMBER-C", 9_50, 1, 1));
    h.store.add_order(make_order(Side::Offer, "TIMBER-C", 10_00, 1, 2));

    h.engine.process_asset("TIMBER-C").await.unwrap();
    settle().await;

    // Offer side is asked first.
    let seller_events = h.realtime.events_for(2);
    assert_eq!(seller_events.len(), 1);
    assert_eq!(seller_events[0].name(), "negotiation:your_turn");

    h.engine
        .handle_negotiation_response("TIMBER-C", 2, false, None)
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.store.trade_count(), 0);
    let broadcasts = h.realtime.broadcasts.lock().unwrap();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].asset, "TIMBER-C");
    assert!(broadcasts[0].message.contains("$9.50"));
    assert!(broadcasts[0].message.contains("$10.00"));
}

#[tokio::test]
async fn negotiation_improve_to_cross_commits() {
    let h = harness();
    let bid = h.store.add_order(make_order(Side::Bid, "TIMBER-D", 9_50, 1, 1));
    let offer = h.store.add_order(make_order(Side::Offer, "TIMBER-D", 10_00, 1, 2));

    h.engine.process_asset("TIMBER-D").await.unwrap();
    h.engine
        .handle_negotiation_response("TIMBER-D", 2, true, Some(9_50))
        .await
        .unwrap();
    settle().await;

    assert_eq!(h.store.trade_count(), 1);
    let trade = h.store.last_trade();
    assert_eq!(trade.amount, 1);
    assert_eq!(trade.price_cents, 9_50);
    assert_eq!(trade.commission_cents, 1);
    assert_eq!(h.store.order(bid).status, OrderStatus::Matched);
    assert_eq!(h.store.order(offer).status, OrderStatus::Matched);
}

#[tokio::test]
async fn crossed_book_commits_at_offer_price() {
    let h = harness();
    h.store.add_order(make_order(Side::Bid, "TIMBER-E", 10_50, 2, 1));
    h.store.add_order(make_order(Side::Offer, "TIMBER-E", 10_00, 2, 2));

    h.engine.process_asset("TIMBER-E").await.unwrap();
    settle().await;

    assert_eq!(h.store.trade_count(), 1);
    let trade = h.store.last_trade();
    assert_eq!(trade.price_cents, 10_00, "passive offer sets the trade price");
    assert_eq!(trade.amount, 2);
}

#[tokio::test]
async fn best_pair_selection_prefers_price_then_age() {
    let h = harness();
    h.store.add_order(make_order(Side::Bid, "GRAIN-E", 9_00, 4, 1));
    let best_bid = h.store.add_order(make_order(Side::Bid, "GRAIN-E", 10_00, 4, 1));
    h.store.add_order(make_order(Side::Offer, "GRAIN-E", 11_00, 4, 2));
    let early_offer = h.store.add_order(make_order(Side::Offer, "GRAIN-E", 10_00, 4, 2));
    h.store.add_order(make_order(Side::Offer, "GRAIN-E", 10_00, 4, 3));

    h.engine.process_asset("GRAIN-E").await.unwrap();
    settle().await;

    assert_eq!(h.store.trade_count(), 1);
    let trade = h.store.last_trade();
    assert_eq!(trade.buyer_order_id, best_bid);
    assert_eq!(
        trade.seller_order_id, early_offer,
        "price ties break by earliest createdAt"
    );
}

#[tokio::test]
async fn order_book_view_reads_straight_from_store() {
    let h = harness();
    for i in 0..12 {
        h.store
            .add_order(make_order(Side::Bid, "GRAIN-F", 9_00 - i, 2, 1));
    }
    h.store.add_order(make_order(Side::Offer, "GRAIN-F", 20_00, 3, 2));
    h.store.add_order(make_order(Side::Offer, "GRAIN-F", 19_00, 4, 2));

    let view = h.engine.order_book("GRAIN-F").await.unwrap();
    assert_eq!(view.bids.len(), 10, "depth capped at top-10");
    assert_eq!(view.offers.len(), 2);
    assert_eq!(view.bids[0].price.to_string(), "9.00");
    assert_eq!(view.offers[0].price.to_string(), "19.00");
    assert_eq!(view.bid_lots_total, 24);
    assert_eq!(view.offer_lots_total, 7);
}
