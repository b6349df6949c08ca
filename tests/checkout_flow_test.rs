//! Integration tests for the checkout aggregate, its store and the lifecycle
//! manager, running against an in-memory SQLite database.

mod common;

use assert_matches::assert_matches;
use async_trait::async_trait;
use checkout_ledger::{
    clock::Clock,
    entities::{
        commerce::{checkout as checkout_row, CheckoutStatus},
        order, order_item,
    },
    errors::ServiceError,
    models::checkout::Checkout,
    services::commerce::{OrderConversionBridge, PaymentOutcome, SeaOrmOrderBridge},
};
use common::{address, customer, item, TestApp};
use mockall::mock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter,
    TransactionTrait,
};
use uuid::Uuid;

mock! {
    pub Bridge {}

    #[async_trait]
    impl OrderConversionBridge for Bridge {
        async fn convert(&self, txn: &DatabaseTransaction, checkout: &Checkout) -> Result<Uuid, ServiceError>;
    }
}

/// Writes the order, then bumps the checkout's version the way an edit
/// committed in the meantime would.
struct InterleavedEditBridge {
    inner: SeaOrmOrderBridge,
}

#[async_trait]
impl OrderConversionBridge for InterleavedEditBridge {
    async fn convert(&self, txn: &DatabaseTransaction, checkout: &Checkout) -> Result<Uuid, ServiceError> {
        let order_id = self.inner.convert(txn, checkout).await?;
        checkout_row::Entity::update_many()
            .col_expr(
                checkout_row::Column::Version,
                Expr::col(checkout_row::Column::Version).add(1),
            )
            .filter(checkout_row::Column::Id.eq(checkout.id))
            .exec(txn)
            .await
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        Ok(order_id)
    }
}

async fn completable(app: &TestApp, session: &str) -> Checkout {
    let svc = &app.services.checkouts;
    let checkout = svc
        .add_item_for_session(session, item(1, dec!(2500)))
        .await
        .unwrap();
    svc.set_shipping_address(checkout.id, address()).await.unwrap()
}

// ==================== Aggregate through the store ====================

#[tokio::test]
async fn totals_follow_item_changes() {
    let app = TestApp::new().await;
    let svc = &app.services.checkouts;

    let checkout = svc.get_or_create_for_session("sess-totals", Some("usd")).await.unwrap();
    assert_eq!(checkout.currency, "USD");

    let first = item(2, dec!(1000));
    let second = item(1, dec!(2000));
    svc.add_item(checkout.id, first.clone()).await.unwrap();
    let checkout = svc.add_item(checkout.id, second.clone()).await.unwrap();
    assert_eq!(checkout.total_amount, dec!(4000));

    let checkout = svc
        .remove_item(checkout.id, first.product_id, first.variant_id)
        .await
        .unwrap();
    assert_eq!(checkout.total_amount, dec!(2000));

    let reloaded = svc.get(checkout.id).await.unwrap();
    assert_eq!(reloaded.items.len(), 1);
    assert_eq!(reloaded.total_amount, dec!(2000));
    assert!(reloaded.item(first.product_id, first.variant_id).is_none());
    assert!(reloaded.item(second.product_id, second.variant_id).is_some());
}

#[tokio::test]
async fn adding_the_same_variant_merges_lines() {
    let app = TestApp::new().await;
    let svc = &app.services.checkouts;
    let line = item(1, dec!(10));

    let checkout = svc.add_item_for_session("sess-merge", line.clone()).await.unwrap();
    let checkout = svc.add_item(checkout.id, line.clone()).await.unwrap();

    assert_eq!(checkout.items.len(), 1);
    assert_eq!(checkout.items[0].quantity, 2);
    assert_eq!(svc.get(checkout.id).await.unwrap().total_amount, dec!(20));
}

#[tokio::test]
async fn clear_persists_zero_totals_and_keeps_addresses() {
    let app = TestApp::new().await;
    let svc = &app.services.checkouts;
    let checkout = completable(&app, "sess-clear").await;
    svc.apply_discount(checkout.id, "SPRING", dec!(5), None).await.unwrap();

    svc.clear(checkout.id).await.unwrap();
    let reloaded = svc.get(checkout.id).await.unwrap();

    assert!(reloaded.items.is_empty());
    assert_eq!(reloaded.total_amount, dec!(0));
    assert_eq!(reloaded.total_weight, dec!(0));
    assert_eq!(reloaded.final_amount, dec!(0));
    assert!(reloaded.shipping_address.is_some());
    assert_eq!(reloaded.applied_discount.map(|d| d.code), Some("SPRING".to_string()));
}

#[tokio::test]
async fn discount_and_shipping_feed_final_amount() {
    let app = TestApp::new().await;
    let svc = &app.services.checkouts;
    let checkout = svc
        .add_item_for_session("sess-final", item(2, dec!(50)))
        .await
        .unwrap();

    svc.set_shipping_cost(checkout.id, dec!(7.5)).await.unwrap();
    let checkout = svc.apply_discount(checkout.id, "TEN", dec!(10), None).await.unwrap();
    assert_eq!(checkout.final_amount, dec!(97.5));

    let checkout = svc.apply_discount(checkout.id, "HUGE", dec!(500), None).await.unwrap();
    assert_eq!(checkout.final_amount, dec!(0));

    let checkout = svc.remove_discount(checkout.id).await.unwrap();
    assert_eq!(checkout.final_amount, dec!(107.5));
    assert!(checkout.applied_discount.is_none());
}

#[tokio::test]
async fn unknown_item_is_reported_as_not_found() {
    let app = TestApp::new().await;
    let svc = &app.services.checkouts;
    let checkout = svc.get_or_create_for_session("sess-missing", None).await.unwrap();

    let err = svc
        .update_item(checkout.id, Uuid::new_v4(), Uuid::new_v4(), 3)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(ref msg) if msg.contains("item not in checkout"));
}

#[tokio::test]
async fn invalid_input_never_reaches_the_store() {
    let app = TestApp::new().await;
    let svc = &app.services.checkouts;
    let checkout = svc
        .add_item_for_session("sess-invalid", item(1, dec!(10)))
        .await
        .unwrap();

    assert_matches!(
        svc.add_item(checkout.id, item(-1, dec!(10))).await,
        Err(ServiceError::InvalidInput(_))
    );
    let mut bad = address();
    bad.city = "  ".to_string();
    assert_matches!(
        svc.set_shipping_address(checkout.id, bad).await,
        Err(ServiceError::InvalidInput(_))
    );
    assert_matches!(
        svc.set_customer_details(checkout.id, customer("not-an-email")).await,
        Err(ServiceError::InvalidInput(_))
    );

    let reloaded = svc.get(checkout.id).await.unwrap();
    assert_eq!(reloaded.version, checkout.version);
    assert!(reloaded.shipping_address.is_none());
}

#[tokio::test]
async fn overflowing_amounts_are_rejected_as_invalid_input() {
    let app = TestApp::new().await;
    let svc = &app.services.checkouts;
    let checkout = svc
        .add_item_for_session("sess-overflow", item(1, dec!(10)))
        .await
        .unwrap();

    let mut heavy = item(2, dec!(1));
    heavy.weight = Decimal::MAX;
    assert_matches!(svc.add_item(checkout.id, heavy).await, Err(ServiceError::InvalidInput(_)));
    assert_matches!(
        svc.set_shipping_cost(checkout.id, Decimal::MAX).await,
        Err(ServiceError::InvalidInput(_))
    );

    let reloaded = svc.get(checkout.id).await.unwrap();
    assert_eq!(reloaded.version, checkout.version);
    assert_eq!(reloaded.items.len(), 1);
    assert_eq!(reloaded.final_amount, dec!(10));
}

#[tokio::test]
async fn stale_version_is_rejected() {
    let app = TestApp::new().await;
    let checkout = app
        .services
        .checkouts
        .get_or_create_for_session("sess-lock", None)
        .await
        .unwrap();

    let mut first = app.checkout_store.get_by_id(checkout.id).await.unwrap();
    let mut second = first.clone();

    first.add_item(item(1, dec!(10)), app.clock.now()).unwrap();
    let saved = app.checkout_store.update(&first).await.unwrap();
    assert_eq!(saved.version, checkout.version + 1);

    second.add_item(item(3, dec!(99)), app.clock.now()).unwrap();
    assert_matches!(
        app.checkout_store.update(&second).await,
        Err(ServiceError::ConcurrentModification(id)) if id == checkout.id
    );

    let current = app.checkout_store.get_by_id(checkout.id).await.unwrap();
    assert_eq!(current.total_amount, dec!(10));
}

#[tokio::test]
async fn session_lookup_returns_the_latest_active_checkout() {
    let app = TestApp::new().await;
    let first = completable(&app, "sess-latest").await;
    app.services.lifecycle.abandon(first.id).await.unwrap();

    app.advance_minutes(1);
    let second = app
        .services
        .checkouts
        .get_or_create_for_session("sess-latest", None)
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    let found = app.checkout_store.get_by_session_id("sess-latest").await.unwrap();
    assert_eq!(found.id, second.id);
    assert!(app
        .checkout_store
        .get_by_session_id("sess-none")
        .await
        .unwrap_err()
        .is_not_found());
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn completing_twice_converts_once() {
    let app = TestApp::new().await;
    let checkout = completable(&app, "sess-complete").await;
    let bridge = app.services.order_bridge.clone();

    let done = app
        .services
        .lifecycle
        .complete(checkout.id, PaymentOutcome::Approved, bridge.as_ref())
        .await
        .unwrap();
    assert_eq!(done.status, CheckoutStatus::Completed);
    let order_id = done.converted_order_id.expect("order id");
    assert_eq!(done.completed_at, Some(app.clock.now()));

    let again = app
        .services
        .lifecycle
        .complete(checkout.id, PaymentOutcome::Approved, bridge.as_ref())
        .await;
    assert_matches!(again, Err(ServiceError::InvalidState(_)));

    let reloaded = app.checkout_store.get_by_id(checkout.id).await.unwrap();
    assert_eq!(reloaded.converted_order_id, Some(order_id));
    assert_eq!(order::Entity::find().count(app.db.as_ref()).await.unwrap(), 1);

    let order = order::Entity::find_by_id(order_id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.checkout_id, checkout.id);
    assert_eq!(order.final_amount, dec!(2500));
    assert!(order.order_number.starts_with("ORD-"));
}

#[tokio::test]
async fn order_bridge_is_idempotent_per_checkout() {
    let app = TestApp::new().await;
    let checkout = completable(&app, "sess-bridge").await;

    let txn = app.db.begin().await.unwrap();
    let first = app.services.order_bridge.convert(&txn, &checkout).await.unwrap();
    let second = app.services.order_bridge.convert(&txn, &checkout).await.unwrap();
    txn.commit().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(order::Entity::find().count(app.db.as_ref()).await.unwrap(), 1);
}

#[tokio::test]
async fn completion_racing_an_edit_keeps_no_order() {
    let app = TestApp::new().await;
    let checkout = completable(&app, "sess-race").await;
    let lifecycle = &app.services.lifecycle;
    let racing = InterleavedEditBridge {
        inner: app.services.order_bridge.as_ref().clone(),
    };

    assert_matches!(
        lifecycle.complete(checkout.id, PaymentOutcome::Approved, &racing).await,
        Err(ServiceError::ConcurrentModification(id)) if id == checkout.id
    );
    assert_eq!(order::Entity::find().count(app.db.as_ref()).await.unwrap(), 0);
    let reloaded = app.checkout_store.get_by_id(checkout.id).await.unwrap();
    assert_eq!(reloaded.status, CheckoutStatus::Active);
    assert_eq!(reloaded.converted_order_id, None);
    assert_eq!(reloaded.version, checkout.version);

    // The retry converts what the checkout holds now.
    let edited = app
        .services
        .checkouts
        .add_item(checkout.id, item(1, dec!(500)))
        .await
        .unwrap();
    let done = lifecycle
        .complete(checkout.id, PaymentOutcome::Approved, app.services.order_bridge.as_ref())
        .await
        .unwrap();
    let order_id = done.converted_order_id.expect("order id");
    let order = order::Entity::find_by_id(order_id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.final_amount, edited.final_amount);
    assert_eq!(order.final_amount, dec!(3000));
    let lines = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .count(app.db.as_ref())
        .await
        .unwrap();
    assert_eq!(lines, 2);
}

#[tokio::test]
async fn bridge_failure_leaves_checkout_active() {
    let app = TestApp::new().await;
    let checkout = completable(&app, "sess-bridge-fail").await;

    let mut bridge = MockBridge::new();
    bridge
        .expect_convert()
        .times(1)
        .returning(|_, _| Err(ServiceError::InternalError("order service unavailable".into())));

    let result = app
        .services
        .lifecycle
        .complete(checkout.id, PaymentOutcome::Approved, &bridge)
        .await;
    assert_matches!(result, Err(ServiceError::InternalError(_)));

    let reloaded = app.checkout_store.get_by_id(checkout.id).await.unwrap();
    assert_eq!(reloaded.status, CheckoutStatus::Active);
    assert_eq!(reloaded.converted_order_id, None);
    assert_eq!(reloaded.version, checkout.version);
}

#[tokio::test]
async fn unresolved_payment_blocks_completion() {
    let app = TestApp::new().await;
    let checkout = completable(&app, "sess-declined").await;

    let mut bridge = MockBridge::new();
    bridge.expect_convert().times(0);

    for outcome in [PaymentOutcome::Declined, PaymentOutcome::Pending] {
        assert_matches!(
            app.services.lifecycle.complete(checkout.id, outcome, &bridge).await,
            Err(ServiceError::InvalidState(_))
        );
    }
}

#[tokio::test]
async fn completion_requires_items_and_shipping_address() {
    let app = TestApp::new().await;
    let mut bridge = MockBridge::new();
    bridge.expect_convert().times(0);

    let no_address = app
        .services
        .checkouts
        .add_item_for_session("sess-no-address", item(1, dec!(10)))
        .await
        .unwrap();
    assert_matches!(
        app.services
            .lifecycle
            .complete(no_address.id, PaymentOutcome::Approved, &bridge)
            .await,
        Err(ServiceError::InvalidInput(_))
    );

    let empty = app
        .services
        .checkouts
        .get_or_create_for_session("sess-empty", None)
        .await
        .unwrap();
    let empty = app
        .services
        .checkouts
        .set_shipping_address(empty.id, address())
        .await
        .unwrap();
    assert_matches!(
        app.services
            .lifecycle
            .complete(empty.id, PaymentOutcome::Approved, &bridge)
            .await,
        Err(ServiceError::InvalidInput(_))
    );
}

#[tokio::test]
async fn terminal_checkouts_reject_mutations() {
    let app = TestApp::new().await;
    let checkout = completable(&app, "sess-terminal").await;
    app.services.lifecycle.abandon(checkout.id).await.unwrap();

    assert_matches!(
        app.services.checkouts.add_item(checkout.id, item(1, dec!(1))).await,
        Err(ServiceError::InvalidState(_))
    );
}

#[tokio::test]
async fn abandon_is_idempotent_but_not_from_completed() {
    let app = TestApp::new().await;
    let checkout = completable(&app, "sess-abandon").await;
    let lifecycle = &app.services.lifecycle;

    let first = lifecycle.abandon(checkout.id).await.unwrap();
    let second = lifecycle.abandon(checkout.id).await.unwrap();
    assert_eq!(first.status, CheckoutStatus::Abandoned);
    assert_eq!(second.version, first.version);

    let other = completable(&app, "sess-abandon-2").await;
    lifecycle
        .complete(other.id, PaymentOutcome::Approved, app.services.order_bridge.as_ref())
        .await
        .unwrap();
    assert_matches!(lifecycle.abandon(other.id).await, Err(ServiceError::InvalidState(_)));
}

#[tokio::test]
async fn expiry_follows_the_sliding_deadline() {
    let app = TestApp::new().await;
    let checkout = completable(&app, "sess-expire").await;
    let lifecycle = &app.services.lifecycle;

    assert_matches!(lifecycle.expire(checkout.id).await, Err(ServiceError::InvalidState(_)));

    let committed = lifecycle.commit_payment_session(checkout.id).await.unwrap();
    let window = app.config.checkout.expiry_window();
    assert_eq!(committed.expires_at, Some(app.clock.now() + window));

    app.advance_minutes(20);
    let touched = app
        .services
        .checkouts
        .set_customer_details(checkout.id, customer("ada@example.com"))
        .await
        .unwrap();
    assert_eq!(touched.expires_at, Some(app.clock.now() + window));
    assert_matches!(lifecycle.expire(checkout.id).await, Err(ServiceError::InvalidState(_)));

    app.advance_minutes(31);
    let expired = lifecycle.expire(checkout.id).await.unwrap();
    assert_eq!(expired.status, CheckoutStatus::Expired);
    let again = lifecycle.expire(checkout.id).await.unwrap();
    assert_eq!(again.version, expired.version);
}

#[tokio::test]
async fn guest_checkout_is_claimed_by_user() {
    let app = TestApp::new().await;
    let checkout = completable(&app, "sess-guest").await;
    let user_id = Uuid::new_v4();
    let lifecycle = &app.services.lifecycle;

    app.advance_minutes(5);
    let claimed = lifecycle
        .convert_guest_checkout_to_user_checkout("sess-guest", user_id)
        .await
        .unwrap();
    assert_eq!(claimed.user_id, Some(user_id));
    assert_eq!(claimed.status, CheckoutStatus::Active);
    assert_eq!(claimed.last_activity_at, app.clock.now());

    let by_user = app.services.checkouts.get_by_user_id(user_id).await.unwrap();
    assert_eq!(by_user.id, checkout.id);

    // Same user again is a no-op, another user finds no guest checkout.
    let again = lifecycle
        .convert_guest_checkout_to_user_checkout("sess-guest", user_id)
        .await
        .unwrap();
    assert_eq!(again.version, claimed.version);
    assert!(lifecycle
        .convert_guest_checkout_to_user_checkout("sess-guest", Uuid::new_v4())
        .await
        .unwrap_err()
        .is_not_found());
    assert!(lifecycle
        .convert_guest_checkout_to_user_checkout("sess-unknown", user_id)
        .await
        .unwrap_err()
        .is_not_found());
}
