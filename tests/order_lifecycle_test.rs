mod common;

use assert_matches::assert_matches;
use common::TestContext;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, PaginatorTrait, QueryFilter, Set,
};
use storefront_api::{
    entities::{
        cart_item, order, product, CheckoutStatus, DeliveryStatus, OrderStatus, PaymentMethod,
        PaymentStatus, ReferenceType, RefundStatus,
    },
    errors::ServiceError,
    events::Event,
    services::wallet::LedgerReference,
};
use uuid::Uuid;

#[tokio::test]
async fn cod_order_reserves_stock_and_clears_cart() {
    let mut ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(25), 10).await;
    ctx.add_to_cart(user, p.id, 4).await;
    let session = ctx.ready_session(user).await;
    ctx.drain_events();

    let details = ctx
        .services
        .orders
        .create_order(user, session.id, PaymentMethod::CashOnDelivery)
        .await
        .expect("order");

    assert_eq!(details.order.order_status, OrderStatus::Confirmed);
    assert_eq!(details.order.final_amount, dec!(100));
    assert_eq!(details.items.len(), 1);
    assert_eq!(details.items[0].unit_price, dec!(25));
    assert_eq!(details.payments.len(), 1);
    assert_eq!(details.payments[0].status, PaymentStatus::Created);

    assert_eq!(ctx.stock_of(p.id).await, 6);
    assert_eq!(cart_item::Entity::find().count(&*ctx.db).await.unwrap(), 0);
    let session = ctx.services.checkout.get_session(user, session.id).await.unwrap();
    assert_eq!(session.status, CheckoutStatus::Completed);
    assert!(session.completed_at.is_some());

    let events = ctx.drain_events();
    assert_matches!(events.first(), Some(Event::OrderCreated { .. }));
    assert_matches!(events.last(), Some(Event::OrderConfirmed(id)) if *id == details.order.id);
}

#[tokio::test]
async fn order_clears_only_the_snapshotted_cart_lines() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let ordered = ctx.product(dec!(20), 10).await;
    let later = ctx.product(dec!(15), 10).await;
    ctx.add_to_cart(user, ordered.id, 1).await;
    let session = ctx.ready_session(user).await;

    // Added after the snapshot, so not part of this order.
    ctx.add_to_cart(user, later.id, 2).await;

    let details = ctx
        .services
        .orders
        .create_order(user, session.id, PaymentMethod::CashOnDelivery)
        .await
        .expect("order");
    assert_eq!(details.items.len(), 1);
    assert_eq!(details.items[0].product_id, ordered.id);

    let remaining = cart_item::Entity::find()
        .filter(cart_item::Column::UserId.eq(user))
        .all(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].product_id, later.id);
    assert_eq!(remaining[0].quantity, 2);
    assert_eq!(ctx.stock_of(later.id).await, 10);
}

#[tokio::test]
async fn catalog_price_change_does_not_reach_placed_order() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(10), 10).await;
    ctx.add_to_cart(user, p.id, 2).await;
    let session = ctx.ready_session(user).await;
    assert_eq!(session.final_amount, dec!(20));

    let mut repriced = p.clone().into_active_model();
    repriced.price = Set(dec!(500));
    repriced.update(&*ctx.db).await.unwrap();

    let reused = ctx.services.checkout.get_or_create_session(user).await.unwrap();
    assert_eq!(reused.id, session.id);
    assert_eq!(reused.final_amount, dec!(20));

    let details = ctx
        .services
        .orders
        .create_order(user, session.id, PaymentMethod::CashOnDelivery)
        .await
        .expect("order");
    assert_eq!(details.items[0].unit_price, dec!(10));
    assert_eq!(details.items[0].subtotal, dec!(20));
    assert_eq!(details.order.total_amount, dec!(20));
    assert_eq!(details.order.final_amount, dec!(20));
    assert_eq!(details.payments[0].amount, dec!(20));

    let catalog = product::Entity::find_by_id(p.id).one(&*ctx.db).await.unwrap().unwrap();
    assert_eq!(catalog.price, dec!(500));
}

#[tokio::test]
async fn stock_shortfall_rolls_back_everything() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let plenty = ctx.product(dec!(10), 50).await;
    let scarce = ctx.product(dec!(30), 10).await;
    ctx.add_to_cart(user, plenty.id, 2).await;
    ctx.add_to_cart(user, scarce.id, 5).await;
    let session = ctx.ready_session(user).await;

    // Someone else buys most of the scarce product after checkout started.
    ctx.services.stock.decrement(scarce.id, 7).await.unwrap();
    assert_eq!(ctx.stock_of(scarce.id).await, 3);

    let err = ctx
        .services
        .orders
        .create_order(user, session.id, PaymentMethod::CashOnDelivery)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InsufficientStock { requested: 5, available: 3, .. }
    );

    assert_eq!(ctx.stock_of(plenty.id).await, 50);
    assert_eq!(ctx.stock_of(scarce.id).await, 3);
    assert_eq!(order::Entity::find().count(&*ctx.db).await.unwrap(), 0);
    assert_eq!(cart_item::Entity::find().count(&*ctx.db).await.unwrap(), 2);
    let session = ctx.services.checkout.get_session(user, session.id).await.unwrap();
    assert_eq!(session.status, CheckoutStatus::Pending);
}

#[tokio::test]
async fn session_converts_to_at_most_one_order() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(10), 10).await;
    ctx.add_to_cart(user, p.id, 1).await;
    let session = ctx.ready_session(user).await;

    ctx.services
        .orders
        .create_order(user, session.id, PaymentMethod::CashOnDelivery)
        .await
        .unwrap();
    let err = ctx
        .services
        .orders
        .create_order(user, session.id, PaymentMethod::CashOnDelivery)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));
    assert_eq!(ctx.stock_of(p.id).await, 9);
}

#[tokio::test]
async fn order_needs_a_shipping_address() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(10), 10).await;
    ctx.add_to_cart(user, p.id, 1).await;
    let session = ctx.services.checkout.get_or_create_session(user).await.unwrap();

    let err = ctx
        .services
        .orders
        .create_order(user, session.id, PaymentMethod::CashOnDelivery)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
    assert_eq!(ctx.stock_of(p.id).await, 10);
}

#[tokio::test]
async fn wallet_order_without_funds_is_all_or_nothing() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    ctx.services
        .wallet
        .credit_and_log(user, dec!(30), LedgerReference::adjustment("goodwill"))
        .await
        .unwrap();
    let p = ctx.product(dec!(20), 10).await;
    ctx.add_to_cart(user, p.id, 2).await;
    let session = ctx.ready_session(user).await;

    let err = ctx
        .services
        .orders
        .create_order(user, session.id, PaymentMethod::Wallet)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientFunds(_));
    assert_eq!(ctx.stock_of(p.id).await, 10);
    assert_eq!(ctx.services.wallet.get_balance(user).await.unwrap(), dec!(30));
    assert_eq!(order::Entity::find().count(&*ctx.db).await.unwrap(), 0);
}

#[tokio::test]
async fn wallet_order_debits_and_confirms() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    ctx.services
        .wallet
        .credit_and_log(user, dec!(100), LedgerReference::adjustment("top-up"))
        .await
        .unwrap();

    let details = ctx
        .place_order(user, dec!(30), 2, PaymentMethod::Wallet)
        .await;

    assert_eq!(details.order.order_status, OrderStatus::Confirmed);
    assert_eq!(details.payments[0].status, PaymentStatus::Paid);
    assert_eq!(ctx.services.wallet.get_balance(user).await.unwrap(), dec!(40));
    let log = ctx.services.wallet.list_transactions(user).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].amount, dec!(-60));
    assert_eq!(log[1].reference_type, ReferenceType::Order);
    assert_eq!(log[1].reference_id, Some(details.order.id));
}

#[tokio::test]
async fn ship_then_deliver_collects_cash() {
    let mut ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let details = ctx
        .place_order(user, dec!(15), 2, PaymentMethod::CashOnDelivery)
        .await;
    let order_id = details.order.id;

    let err = ctx.services.orders.deliver_order(order_id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition(_));

    let shipped = ctx.services.orders.ship_order(order_id).await.unwrap();
    assert_eq!(shipped.delivery_status, DeliveryStatus::Shipped);
    ctx.drain_events();

    let delivered = ctx.services.orders.deliver_order(order_id).await.unwrap();
    assert_eq!(delivered.order.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(delivered.collected_payment, Some(details.payments[0].id));

    let reloaded = ctx.services.orders.get_order(user, order_id).await.unwrap();
    assert_eq!(reloaded.payments[0].status, PaymentStatus::Paid);
    assert!(reloaded.payments[0].paid_at.is_some());

    let events = ctx.drain_events();
    assert_matches!(events.last(), Some(Event::OrderDelivered(id)) if *id == order_id);
}

#[tokio::test]
async fn unpaid_online_order_cannot_ship() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let details = ctx.place_order(user, dec!(15), 1, PaymentMethod::Online).await;

    let err = ctx.services.orders.ship_order(details.order.id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition(_));
}

#[tokio::test]
async fn cancelling_a_wallet_order_refunds_and_restocks() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    ctx.services
        .wallet
        .credit_and_log(user, dec!(50), LedgerReference::adjustment("top-up"))
        .await
        .unwrap();
    let p = ctx.product(dec!(20), 5).await;
    ctx.add_to_cart(user, p.id, 2).await;
    let session = ctx.ready_session(user).await;
    let details = ctx
        .services
        .orders
        .create_order(user, session.id, PaymentMethod::Wallet)
        .await
        .unwrap();
    assert_eq!(ctx.stock_of(p.id).await, 3);
    assert_eq!(ctx.services.wallet.get_balance(user).await.unwrap(), dec!(10));

    let cancelled = ctx
        .services
        .orders
        .cancel_order(user, details.order.id, "changed my mind")
        .await
        .unwrap();

    assert_eq!(cancelled.order.order_status, OrderStatus::Cancelled);
    assert_eq!(cancelled.order.refund_status, RefundStatus::Completed);
    assert!(cancelled.refund.is_some());
    assert_eq!(ctx.stock_of(p.id).await, 5);
    assert_eq!(ctx.services.wallet.get_balance(user).await.unwrap(), dec!(50));
    assert_eq!(ctx.services.wallet.verify_ledger(user).await.unwrap(), dec!(50));

    let again = ctx
        .services
        .orders
        .cancel_order(user, details.order.id, "twice")
        .await
        .unwrap_err();
    assert_matches!(again, ServiceError::InvalidTransition(_));
}

#[tokio::test]
async fn fully_discounted_wallet_order_needs_no_balance() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    ctx.coupon("FREEBIE", dec!(100), dec!(0)).await;
    let p = ctx.product(dec!(40), 5).await;
    ctx.add_to_cart(user, p.id, 1).await;
    let session = ctx.ready_session(user).await;
    let session = ctx
        .services
        .coupons
        .apply(user, session.id, "FREEBIE")
        .await
        .unwrap();
    assert_eq!(session.final_amount, dec!(0));

    let details = ctx
        .services
        .orders
        .create_order(user, session.id, PaymentMethod::Wallet)
        .await
        .expect("free order");
    assert_eq!(details.order.order_status, OrderStatus::Confirmed);
    assert_eq!(details.payments.len(), 1);
    assert_eq!(details.payments[0].status, PaymentStatus::Paid);
    assert_eq!(details.payments[0].amount, dec!(0));
    assert!(ctx.services.wallet.list_transactions(user).await.unwrap().is_empty());

    let cancelled = ctx
        .services
        .orders
        .cancel_order(user, details.order.id, "not needed")
        .await
        .unwrap();
    assert_eq!(cancelled.order.order_status, OrderStatus::Cancelled);
    assert_eq!(cancelled.order.refund_status, RefundStatus::Completed);
    assert!(cancelled.refund.is_none());
    assert_eq!(ctx.stock_of(p.id).await, 5);
    assert_eq!(ctx.services.wallet.get_balance(user).await.unwrap(), dec!(0));

    let reloaded = ctx.services.orders.get_order(user, details.order.id).await.unwrap();
    assert_eq!(reloaded.payments[0].status, PaymentStatus::Refunded);
}

#[tokio::test]
async fn shipped_orders_cannot_be_cancelled() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let details = ctx
        .place_order(user, dec!(10), 1, PaymentMethod::CashOnDelivery)
        .await;
    ctx.services.orders.ship_order(details.order.id).await.unwrap();

    let err = ctx
        .services
        .orders
        .cancel_order(user, details.order.id, "too late")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidTransition(_));
}

#[tokio::test]
async fn only_the_owner_can_cancel() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let details = ctx
        .place_order(user, dec!(10), 1, PaymentMethod::CashOnDelivery)
        .await;

    let err = ctx
        .services
        .orders
        .cancel_order(Uuid::new_v4(), details.order.id, "not mine")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Unauthorized(_));
}
