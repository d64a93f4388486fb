mod common;

use assert_matches::assert_matches;
use common::TestContext;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use storefront_api::{
    entities::{checkout_session, CheckoutStatus},
    errors::ServiceError,
    events::Event,
    services::checkout::{AddressFields, AddressInput},
};
use uuid::Uuid;

#[tokio::test]
async fn session_snapshots_cart_totals() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let shirt = ctx.product(dec!(50), 10).await;
    let mug = ctx.product(dec!(12.5), 10).await;
    ctx.add_to_cart(user, shirt.id, 2).await;
    ctx.add_to_cart(user, mug.id, 4).await;

    let session = ctx
        .services
        .checkout
        .get_or_create_session(user)
        .await
        .expect("session");

    assert_eq!(session.status, CheckoutStatus::Pending);
    assert_eq!(session.total_amount, dec!(150));
    assert_eq!(session.discount_amount, dec!(0));
    assert_eq!(session.final_amount, dec!(150));
    assert_eq!(session.item_count, 6);

    let items = ctx.services.checkout.list_items(session.id).await.unwrap();
    assert_eq!(items.len(), 2);
    let sum: Decimal = items.iter().map(|i| i.subtotal).sum();
    assert_eq!(sum, session.total_amount);
}

#[tokio::test]
async fn pending_session_is_reused() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(20), 10).await;
    ctx.add_to_cart(user, p.id, 1).await;

    let first = ctx.services.checkout.get_or_create_session(user).await.unwrap();
    ctx.add_to_cart(user, p.id, 3).await;
    let second = ctx.services.checkout.get_or_create_session(user).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.total_amount, dec!(20));
}

fn raw_session(user_id: Uuid, status: CheckoutStatus) -> checkout_session::ActiveModel {
    let now = Utc::now();
    checkout_session::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        status: Set(status),
        total_amount: Set(Decimal::ZERO),
        discount_amount: Set(Decimal::ZERO),
        final_amount: Set(Decimal::ZERO),
        item_count: Set(0),
        coupon_code: Set(None),
        coupon_applied: Set(false),
        shipping_address_id: Set(None),
        version: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        completed_at: Set(None),
    }
}

#[tokio::test]
async fn database_refuses_second_pending_session() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(20), 10).await;
    ctx.add_to_cart(user, p.id, 1).await;
    let session = ctx.services.checkout.get_or_create_session(user).await.unwrap();

    let err = raw_session(user, CheckoutStatus::Pending)
        .insert(&*ctx.db)
        .await
        .unwrap_err();
    assert!(storefront_api::services::checkout::is_unique_violation(&err), "{err}");

    // Terminal sessions are not constrained.
    raw_session(user, CheckoutStatus::Completed).insert(&*ctx.db).await.unwrap();
    raw_session(user, CheckoutStatus::Deleted).insert(&*ctx.db).await.unwrap();
    raw_session(Uuid::new_v4(), CheckoutStatus::Pending)
        .insert(&*ctx.db)
        .await
        .unwrap();

    let again = ctx.services.checkout.get_or_create_session(user).await.unwrap();
    assert_eq!(again.id, session.id);
}

#[tokio::test]
async fn empty_cart_cannot_start_checkout() {
    let ctx = TestContext::new().await;
    let err = ctx
        .services
        .checkout
        .get_or_create_session(Uuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn cart_beyond_stock_is_rejected_at_checkout() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(10), 2).await;
    ctx.add_to_cart(user, p.id, 3).await;

    let err = ctx.services.checkout.get_or_create_session(user).await.unwrap_err();
    assert_matches!(
        err,
        ServiceError::InsufficientStock { requested: 3, available: 2, .. }
    );
}

#[tokio::test]
async fn address_must_belong_to_the_user() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(10), 5).await;
    ctx.add_to_cart(user, p.id, 1).await;
    let session = ctx.services.checkout.get_or_create_session(user).await.unwrap();

    let someone_else = ctx.address(Uuid::new_v4()).await;
    let err = ctx
        .services
        .checkout
        .bind_address(
            user,
            session.id,
            AddressInput::Existing {
                address_id: someone_else.id,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Unauthorized(_));

    let unchanged = ctx.services.checkout.get_session(user, session.id).await.unwrap();
    assert!(unchanged.shipping_address_id.is_none());
}

#[tokio::test]
async fn inline_address_is_validated_then_bound() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(10), 5).await;
    ctx.add_to_cart(user, p.id, 1).await;
    let session = ctx.services.checkout.get_or_create_session(user).await.unwrap();

    let mut fields = AddressFields {
        name: "Asha Rao".into(),
        phone: "not-a-phone".into(),
        line1: "12 Market Road".into(),
        line2: None,
        city: "Pune".into(),
        state: "MH".into(),
        postal_code: "411001".into(),
        country: "IN".into(),
    };
    let err = ctx
        .services
        .checkout
        .bind_address(user, session.id, AddressInput::New(fields.clone()))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    fields.phone = "+919800012345".into();
    let bound = ctx
        .services
        .checkout
        .bind_address(user, session.id, AddressInput::New(fields))
        .await
        .expect("bind inline address");
    assert!(bound.shipping_address_id.is_some());
    assert_eq!(bound.version, session.version + 1);
}

#[tokio::test]
async fn save10_discounts_and_emits_event() {
    let mut ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(100), 5).await;
    ctx.add_to_cart(user, p.id, 2).await;
    ctx.coupon("SAVE10", dec!(10), dec!(100)).await;
    let session = ctx.services.checkout.get_or_create_session(user).await.unwrap();
    ctx.drain_events();

    let applied = ctx
        .services
        .coupons
        .apply(user, session.id, "save10")
        .await
        .expect("apply coupon");

    assert_eq!(applied.total_amount, dec!(200));
    assert_eq!(applied.discount_amount, dec!(20));
    assert_eq!(applied.final_amount, dec!(180));
    assert_eq!(applied.coupon_code.as_deref(), Some("SAVE10"));
    assert!(applied.coupon_applied);

    let events = ctx.drain_events();
    assert_matches!(
        events.as_slice(),
        [Event::CouponApplied { code, .. }] if code == "SAVE10"
    );
}

#[tokio::test]
async fn min_order_rejection_leaves_session_untouched() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(40), 5).await;
    ctx.add_to_cart(user, p.id, 2).await;
    ctx.coupon("BIGSPEND", dec!(15), dec!(100)).await;
    let before = ctx.services.checkout.get_or_create_session(user).await.unwrap();

    let err = ctx
        .services
        .coupons
        .apply(user, before.id, "BIGSPEND")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::MinOrderNotMet(_));

    let after = ctx.services.checkout.get_session(user, before.id).await.unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.final_amount, dec!(80));
    assert_eq!(after.discount_amount, dec!(0));
    assert!(after.coupon_code.is_none());
    assert!(!after.coupon_applied);
}

#[tokio::test]
async fn removing_coupon_restores_totals() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(100), 5).await;
    ctx.add_to_cart(user, p.id, 1).await;
    ctx.coupon("HALF", dec!(50), dec!(0)).await;
    let session = ctx.services.checkout.get_or_create_session(user).await.unwrap();

    let applied = ctx.services.coupons.apply(user, session.id, "HALF").await.unwrap();
    assert_eq!(applied.final_amount, dec!(50));

    let removed = ctx.services.coupons.remove(user, session.id).await.unwrap();
    assert_eq!(removed.final_amount, dec!(100));
    assert_eq!(removed.discount_amount, dec!(0));
    assert!(!removed.coupon_applied);
    assert!(removed.coupon_code.is_none());
}

#[tokio::test]
async fn abandoned_session_frees_the_user_for_a_new_one() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(10), 5).await;
    ctx.add_to_cart(user, p.id, 1).await;

    let first = ctx.services.checkout.get_or_create_session(user).await.unwrap();
    let abandoned = ctx.services.checkout.abandon(user, first.id).await.unwrap();
    assert_eq!(abandoned.status, CheckoutStatus::Deleted);

    let err = ctx
        .services
        .coupons
        .apply(user, first.id, "ANY")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));

    let second = ctx.services.checkout.get_or_create_session(user).await.unwrap();
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn another_users_session_is_not_visible() {
    let ctx = TestContext::new().await;
    let owner = Uuid::new_v4();
    let p = ctx.product(dec!(10), 5).await;
    ctx.add_to_cart(owner, p.id, 1).await;
    let session = ctx.services.checkout.get_or_create_session(owner).await.unwrap();

    let err = ctx
        .services
        .checkout
        .get_session(Uuid::new_v4(), session.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Unauthorized(_));
}
