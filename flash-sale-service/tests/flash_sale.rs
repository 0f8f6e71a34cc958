use bigdecimal::BigDecimal;
use chrono::{Duration as ChronoDuration, Utc};
use flash_sale_service::ledger::StockLedger;
use flash_sale_service::sweeper::Sweeper;
use flash_sale_service::{
    EngineError, FlashSaleService, LedgerOp, ManualClock, MemoryStore, Settings, Store, StoreError, Transaction,
};
use shared::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    service: Arc<FlashSaleService<MemoryStore>>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

fn harness_with(settings: Settings) -> Harness {
    let store = Arc::new(MemoryStore::new(settings.lock_timeout));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let service = Arc::new(FlashSaleService::new(Arc::clone(&store), clock.clone(), settings));
    Harness { service, store, clock }
}

fn harness() -> Harness {
    harness_with(Settings::default())
}

async fn product(h: &Harness, price: i64, stock: i32) -> Uuid {
    h.service
        .create_product(NewProduct {
            name: "Limited sneaker".to_string(),
            description: None,
            price: BigDecimal::from(price),
            stock,
        })
        .await
        .unwrap()
        .id
}

async fn hold(h: &Harness, product_id: Uuid, quantity: i32) -> Hold {
    match h.service.create_hold(product_id, quantity).await.unwrap() {
        HoldOutcome::Created(hold) => hold,
        other => panic!("expected a hold, got {:?}", other),
    }
}

async fn order(h: &Harness, token: &str) -> Order {
    match h.service.create_order(token).await.unwrap() {
        OrderOutcome::Created(order) => order,
        other => panic!("expected an order, got {:?}", other),
    }
}

async fn view(h: &Harness, product_id: Uuid) -> ProductView {
    h.service.product(product_id).await.unwrap().unwrap()
}

fn reserved(view: &ProductView) -> i32 {
    view.stock - view.available_stock
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_holds_never_oversell() {
    let h = harness();
    let product_id = product(&h, 50, 5).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let service = Arc::clone(&h.service);
        tasks.push(tokio::spawn(async move { service.create_hold(product_id, 1).await }));
    }

    let mut created = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            HoldOutcome::Created(_) => created += 1,
            HoldOutcome::InsufficientStock { .. } => rejected += 1,
            HoldOutcome::ProductNotFound => panic!("product vanished"),
        }
    }

    assert_eq!(created, 5);
    assert_eq!(rejected, 5);
    let view = view(&h, product_id).await;
    assert_eq!(view.stock, 5);
    assert_eq!(view.available_stock, 0);
}

#[tokio::test]
async fn hold_beyond_available_stock_reports_what_is_left() {
    let h = harness();
    let product_id = product(&h, 50, 5).await;
    hold(&h, product_id, 4).await;

    match h.service.create_hold(product_id, 2).await.unwrap() {
        HoldOutcome::InsufficientStock { requested, available } => {
            assert_eq!(requested, 2);
            assert_eq!(available, 1);
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(view(&h, product_id).await.available_stock, 1);
}

#[tokio::test]
async fn hold_for_unknown_product_is_not_found() {
    let h = harness();
    let outcome = h.service.create_hold(Uuid::new_v4(), 1).await.unwrap();
    assert_eq!(outcome, HoldOutcome::ProductNotFound);
}

#[tokio::test]
async fn hold_quantity_outside_limits_is_rejected() {
    let h = harness();
    let product_id = product(&h, 50, 100).await;

    for quantity in [0, -3, 11] {
        let err = h.service.create_hold(product_id, quantity).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "quantity {}: {:?}", quantity, err);
    }
    assert_eq!(view(&h, product_id).await.available_stock, 100);
}

#[tokio::test]
async fn successful_payment_commits_reserved_units() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 3).await;
    let order = order(&h, &hold.token).await;

    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.total_amount, BigDecimal::from(30));
    assert_eq!(reserved(&view(&h, product_id).await), 3);

    let response = h
        .service
        .handle_settlement(SettlementPayload::success().for_order(order.id), "evt-1")
        .await
        .unwrap();

    assert_eq!(response.status_code, 200);
    let body = response.json().unwrap();
    assert_eq!(body["message"], "Payment processed successfully");
    assert_eq!(body["status"], "paid");
    assert_eq!(body["order_id"], order.id.to_string());

    let view = view(&h, product_id).await;
    assert_eq!(view.stock, 7);
    assert_eq!(reserved(&view), 0);
    assert_eq!(h.service.order(order.id).await.unwrap().unwrap().status, OrderStatus::Paid);
}

#[tokio::test]
async fn redelivered_notification_replays_the_first_response() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 2).await;
    let order = order(&h, &hold.token).await;
    let payload = SettlementPayload::success().for_order(order.id);

    let first = h.service.handle_settlement(payload.clone(), "evt-42").await.unwrap();
    let second = h.service.handle_settlement(payload, "evt-42").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(view(&h, product_id).await.stock, 8);
}

#[tokio::test]
async fn concurrent_redeliveries_apply_once() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 2).await;
    let order = order(&h, &hold.token).await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let service = Arc::clone(&h.service);
        let payload = SettlementPayload::success().for_order(order.id);
        tasks.push(tokio::spawn(async move { service.handle_settlement(payload, "evt-dup").await }));
    }

    let mut bodies = Vec::new();
    for task in tasks {
        bodies.push(task.await.unwrap().unwrap());
    }

    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    let view = view(&h, product_id).await;
    assert_eq!(view.stock, 8);
    assert_eq!(reserved(&view), 0);
}

#[tokio::test]
async fn settled_order_ignores_later_notifications_with_new_keys() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 1).await;
    let order = order(&h, &hold.token).await;

    h.service
        .handle_settlement(SettlementPayload::success().for_order(order.id), "evt-a")
        .await
        .unwrap();
    let late = h
        .service
        .handle_settlement(SettlementPayload::failed("timeout").for_order(order.id), "evt-b")
        .await
        .unwrap();

    assert_eq!(late.status_code, 200);
    let body = late.json().unwrap();
    assert_eq!(body["message"], "Order already processed");
    assert_eq!(body["status"], "paid");
    assert_eq!(view(&h, product_id).await.stock, 9);
}

#[tokio::test]
async fn failed_payment_returns_units_and_cancels_order() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 4).await;
    let order = order(&h, &hold.token).await;

    let response = h
        .service
        .handle_settlement(SettlementPayload::failed("card declined").for_order(order.id), "evt-fail")
        .await
        .unwrap();

    assert_eq!(response.status_code, 400);
    let body = response.json().unwrap();
    assert_eq!(body["message"], "Payment failed, order cancelled");
    assert_eq!(body["status"], "cancelled");

    let view = view(&h, product_id).await;
    assert_eq!(view.stock, 10);
    assert_eq!(view.available_stock, 10);
    assert!(h.service.hold_by_token(&hold.token).await.unwrap().unwrap().used);
    assert_eq!(h.service.order(order.id).await.unwrap().unwrap().status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn settlement_resolves_order_through_hold_token() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 1).await;
    let order = order(&h, &hold.token).await;

    let response = h
        .service
        .handle_settlement(SettlementPayload::success().for_hold(hold.token.clone()), "evt-token")
        .await
        .unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(response.json().unwrap()["order_id"], order.id.to_string());
}

#[tokio::test]
async fn early_notification_is_accepted_and_remembered() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 1).await;
    let payload = SettlementPayload::success().for_hold(hold.token.clone());

    let early = h.service.handle_settlement(payload.clone(), "evt-early").await.unwrap();
    assert_eq!(early.status_code, 202);
    assert_eq!(early.json().unwrap()["message"], "Webhook accepted, order processing");

    let order = order(&h, &hold.token).await;

    // The key stays bound to the deferred answer.
    let replay = h.service.handle_settlement(payload.clone(), "evt-early").await.unwrap();
    assert_eq!(replay, early);
    assert_eq!(h.service.order(order.id).await.unwrap().unwrap().status, OrderStatus::Pending);

    let retry = h.service.handle_settlement(payload, "evt-early-retry").await.unwrap();
    assert_eq!(retry.status_code, 200);
    assert_eq!(view(&h, product_id).await.stock, 9);
}

#[tokio::test]
async fn notification_for_unknown_order_is_deferred() {
    let h = harness();
    let response = h
        .service
        .handle_settlement(SettlementPayload::success().for_order(Uuid::new_v4()), "evt-ghost")
        .await
        .unwrap();
    assert_eq!(response.status_code, 202);
}

#[tokio::test]
async fn hold_converts_to_exactly_one_order() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 2).await;

    order(&h, &hold.token).await;
    let second = h.service.create_order(&hold.token).await.unwrap();

    assert_eq!(second, OrderOutcome::InvalidHold);
    assert_eq!(reserved(&view(&h, product_id).await), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_orders_on_one_hold_produce_one_order() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 1).await;

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let service = Arc::clone(&h.service);
        let token = hold.token.clone();
        tasks.push(tokio::spawn(async move { service.create_order(&token).await }));
    }

    let mut created = 0;
    for task in tasks {
        if let OrderOutcome::Created(_) = task.await.unwrap().unwrap() {
            created += 1;
        }
    }
    assert_eq!(created, 1);
}

#[tokio::test]
async fn unknown_or_blank_hold_tokens_are_refused() {
    let h = harness();
    assert_eq!(h.service.create_order("no-such-token").await.unwrap(), OrderOutcome::InvalidHold);
    assert!(matches!(h.service.create_order("  ").await, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn expired_hold_cannot_be_ordered_and_is_reclaimed_once() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 3).await;

    h.clock.advance(ChronoDuration::seconds(121));

    assert_eq!(h.service.create_order(&hold.token).await.unwrap(), OrderOutcome::InvalidHold);
    assert_eq!(reserved(&view(&h, product_id).await), 3);

    assert_eq!(h.service.release_expired_holds().await.unwrap(), 1);
    assert_eq!(h.service.release_expired_holds().await.unwrap(), 0);

    let view = view(&h, product_id).await;
    assert_eq!(view.available_stock, 10);
    assert!(h.service.hold_by_token(&hold.token).await.unwrap().unwrap().used);
}

#[tokio::test]
async fn hold_expires_at_its_deadline() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 1).await;

    h.clock.set(hold.expires_at);
    assert_eq!(h.service.create_order(&hold.token).await.unwrap(), OrderOutcome::InvalidHold);
}

#[tokio::test]
async fn sweep_leaves_live_and_consumed_holds_alone() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let consumed = hold(&h, product_id, 2).await;
    order(&h, &consumed.token).await;

    h.clock.advance(ChronoDuration::seconds(60));
    let live = hold(&h, product_id, 1).await;
    h.clock.advance(ChronoDuration::seconds(61));

    assert_eq!(h.service.release_expired_holds().await.unwrap(), 0);
    assert_eq!(reserved(&view(&h, product_id).await), 3);
    assert!(!h.service.hold_by_token(&live.token).await.unwrap().unwrap().used);
}

#[tokio::test]
async fn sweep_walks_every_batch() {
    let h = harness_with(Settings {
        sweep_batch_size: 2,
        ..Settings::default()
    });
    let product_id = product(&h, 10, 50).await;
    for _ in 0..5 {
        hold(&h, product_id, 1).await;
    }

    h.clock.advance(ChronoDuration::minutes(5));

    assert_eq!(h.service.release_expired_holds().await.unwrap(), 5);
    assert_eq!(view(&h, product_id).await.available_stock, 50);
}

#[tokio::test]
async fn settlement_with_missing_reservation_fails_without_side_effects() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 2).await;
    let order = order(&h, &hold.token).await;

    // Drain the reservation behind the engine's back.
    let mut tx = h.store.begin().await.unwrap();
    assert!(tx.release_stock(product_id, 2).await.unwrap());
    tx.commit().await.unwrap();

    let err = h
        .service
        .handle_settlement(SettlementPayload::success().for_order(order.id), "evt-drift")
        .await
        .unwrap_err();

    match err {
        EngineError::LedgerInvariantViolation { op, product_id: p, quantity } => {
            assert_eq!(op, LedgerOp::Commit);
            assert_eq!(p, product_id);
            assert_eq!(quantity, 2);
        }
        other => panic!("expected ledger violation, got {:?}", other),
    }
    assert_eq!(h.service.order(order.id).await.unwrap().unwrap().status, OrderStatus::Pending);
    assert_eq!(view(&h, product_id).await.stock, 10);
}

#[tokio::test]
async fn settlement_requires_an_idempotency_key() {
    let h = harness();
    let err = h
        .service
        .handle_settlement(SettlementPayload::success().for_order(Uuid::new_v4()), "")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn idempotency_records_are_purged_after_retention() {
    let h = harness_with(Settings {
        idempotency_retention: Duration::from_secs(60),
        ..Settings::default()
    });
    let payload = SettlementPayload::success().for_order(Uuid::new_v4());
    h.service.handle_settlement(payload, "evt-old").await.unwrap();

    assert_eq!(h.service.purge_expired_idempotency_records().await.unwrap(), 0);
    h.clock.advance(ChronoDuration::seconds(61));
    assert_eq!(h.service.purge_expired_idempotency_records().await.unwrap(), 1);
}

#[tokio::test]
async fn lock_contention_exhausts_retries() {
    let h = harness_with(Settings {
        lock_timeout: Duration::from_millis(20),
        transaction_attempts: 2,
        retry_backoff: Duration::from_millis(5),
        ..Settings::default()
    });
    let product_id = product(&h, 10, 10).await;

    let blocker = h.store.begin().await.unwrap();
    let err = h.service.create_hold(product_id, 1).await.unwrap_err();
    drop(blocker);

    match err {
        EngineError::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 2);
            assert!(matches!(source, StoreError::LockTimeout(_)));
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(view(&h, product_id).await.available_stock, 10);
}

#[tokio::test]
async fn transient_contention_is_retried_until_it_clears() {
    let h = harness_with(Settings {
        lock_timeout: Duration::from_millis(20),
        transaction_attempts: 10,
        retry_backoff: Duration::from_millis(10),
        ..Settings::default()
    });
    let product_id = product(&h, 10, 10).await;

    let blocker = h.store.begin().await.unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(blocker);
    });

    assert!(matches!(
        h.service.create_hold(product_id, 1).await.unwrap(),
        HoldOutcome::Created(_)
    ));
}

#[tokio::test]
async fn seeded_demo_product_is_readable() {
    let h = harness();
    let product = h.service.create_product(NewProduct::flash_sale_demo()).await.unwrap();
    let view = view(&h, product.id).await;

    assert_eq!(view.name, "Flash Sale Product");
    assert_eq!(view.stock, 100);
    assert_eq!(view.available_stock, 100);
    assert_eq!(view.price, "99.99".parse::<BigDecimal>().unwrap());
    assert!(h.service.product(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn sweeper_pass_reclaims_and_purges() {
    let h = harness_with(Settings {
        idempotency_retention: Duration::from_secs(30),
        ..Settings::default()
    });
    let product_id = product(&h, 10, 10).await;
    hold(&h, product_id, 2).await;
    h.service
        .handle_settlement(SettlementPayload::success().for_order(Uuid::new_v4()), "evt-stale")
        .await
        .unwrap();

    h.clock.advance(ChronoDuration::minutes(3));
    Sweeper::new(Arc::clone(&h.service)).sweep().await;

    assert_eq!(view(&h, product_id).await.available_stock, 10);
    assert_eq!(h.service.purge_expired_idempotency_records().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_order_id_does_not_fall_back_to_hold_token() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 2).await;
    let order = order(&h, &hold.token).await;

    let payload = SettlementPayload::success()
        .for_order(Uuid::new_v4())
        .for_hold(hold.token.clone());
    let response = h.service.handle_settlement(payload, "evt-mismatch").await.unwrap();

    assert_eq!(response.status_code, 202);
    let view = view(&h, product_id).await;
    assert_eq!(view.stock, 10);
    assert_eq!(reserved(&view), 2);
    assert_eq!(h.service.order(order.id).await.unwrap().unwrap().status, OrderStatus::Pending);
}

#[tokio::test]
async fn reused_key_with_different_payload_replays_first_outcome() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let hold = hold(&h, product_id, 1).await;
    let order = order(&h, &hold.token).await;

    let first = h
        .service
        .handle_settlement(SettlementPayload::success().for_order(order.id), "evt-reused")
        .await
        .unwrap();
    let second = h
        .service
        .handle_settlement(SettlementPayload::failed("card declined").for_order(order.id), "evt-reused")
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second.status_code, 200);
    assert_eq!(second.json().unwrap()["status"], "paid");

    let view = view(&h, product_id).await;
    assert_eq!(view.stock, 9);
    assert_eq!(reserved(&view), 0);
    assert_eq!(h.service.order(order.id).await.unwrap().unwrap().status, OrderStatus::Paid);
}

#[tokio::test]
async fn sweep_skips_a_drifted_hold_and_reclaims_the_rest() {
    let h = harness();
    let drifted_product = product(&h, 10, 5).await;
    let healthy_product = product(&h, 10, 5).await;
    let drifted = hold(&h, drifted_product, 2).await;
    let first = hold(&h, healthy_product, 1).await;
    let second = hold(&h, healthy_product, 2).await;

    // Drain the reservation behind the engine's back.
    let mut tx = h.store.begin().await.unwrap();
    assert!(tx.release_stock(drifted_product, 2).await.unwrap());
    tx.commit().await.unwrap();

    h.clock.advance(ChronoDuration::minutes(3));

    assert_eq!(h.service.release_expired_holds().await.unwrap(), 2);
    assert!(!h.service.hold_by_token(&drifted.token).await.unwrap().unwrap().used);
    assert!(h.service.hold_by_token(&first.token).await.unwrap().unwrap().used);
    assert!(h.service.hold_by_token(&second.token).await.unwrap().unwrap().used);
    assert_eq!(view(&h, healthy_product).await.available_stock, 5);
    assert_eq!(reserved(&view(&h, drifted_product).await), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn order_and_sweep_race_for_a_hold_without_double_release() {
    let h = harness();
    let product_id = product(&h, 10, 50).await;

    for _ in 0..20 {
        let hold = hold(&h, product_id, 1).await;
        let before = reserved(&view(&h, product_id).await);

        // The buyer still sees the hold as live; the sweeper already sees it expired.
        let buyer = Arc::new(FlashSaleService::new(
            Arc::clone(&h.store),
            Arc::new(ManualClock::new(hold.expires_at - ChronoDuration::milliseconds(1))),
            Settings::default(),
        ));
        let sweeper = Arc::new(FlashSaleService::new(
            Arc::clone(&h.store),
            Arc::new(ManualClock::new(hold.expires_at + ChronoDuration::seconds(1))),
            Settings::default(),
        ));

        let token = hold.token.clone();
        let ordering = tokio::spawn(async move { buyer.create_order(&token).await });
        let sweeping = tokio::spawn(async move { sweeper.release_expired_holds().await });

        let ordered = matches!(ordering.await.unwrap().unwrap(), OrderOutcome::Created(_));
        let released = sweeping.await.unwrap().unwrap();

        assert!(ordered != (released == 1), "ordered={} released={}", ordered, released);
        assert!(h.service.hold_by_token(&hold.token).await.unwrap().unwrap().used);

        let view = view(&h, product_id).await;
        let after = reserved(&view);
        assert_eq!(after, if ordered { before } else { before - 1 });
        assert!(0 <= after && after <= view.stock);
    }
}

#[tokio::test]
async fn idempotency_keys_are_compared_verbatim() {
    let h = harness();
    let product_id = product(&h, 10, 10).await;
    let first_hold = hold(&h, product_id, 1).await;
    let second_hold = hold(&h, product_id, 1).await;
    let first = order(&h, &first_hold.token).await;
    let second = order(&h, &second_hold.token).await;

    h.service
        .handle_settlement(SettlementPayload::success().for_order(first.id), "evt-7")
        .await
        .unwrap();
    let padded = h
        .service
        .handle_settlement(SettlementPayload::success().for_order(second.id), " evt-7")
        .await
        .unwrap();

    assert_eq!(padded.json().unwrap()["order_id"], second.id.to_string());
    assert_eq!(view(&h, product_id).await.stock, 8);
}
