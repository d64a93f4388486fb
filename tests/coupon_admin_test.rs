mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::TestContext;
use rust_decimal_macros::dec;
use storefront_api::{errors::ServiceError, services::coupons::NewCoupon};
use uuid::Uuid;

#[tokio::test]
async fn duplicate_code_conflicts_case_insensitively() {
    let ctx = TestContext::new().await;
    ctx.coupon("WELCOME", dec!(5), dec!(0)).await;

    let err = ctx
        .services
        .coupons
        .create_coupon(NewCoupon {
            code: " welcome ".into(),
            discount_percentage: dec!(10),
            min_order_amount: dec!(0),
            expires_at: Utc::now() + Duration::days(1),
            is_active: true,
        })
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));
}

#[tokio::test]
async fn out_of_range_percentage_is_rejected() {
    let ctx = TestContext::new().await;
    let err = ctx
        .services
        .coupons
        .create_coupon(NewCoupon {
            code: "TOOMUCH".into(),
            discount_percentage: dec!(150),
            min_order_amount: dec!(0),
            expires_at: Utc::now() + Duration::days(1),
            is_active: true,
        })
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn expired_and_inactive_coupons_fail_distinctly() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(100), 5).await;
    ctx.add_to_cart(user, p.id, 1).await;
    let session = ctx.services.checkout.get_or_create_session(user).await.unwrap();

    ctx.services
        .coupons
        .create_coupon(NewCoupon {
            code: "STALE".into(),
            discount_percentage: dec!(10),
            min_order_amount: dec!(0),
            expires_at: Utc::now() - Duration::hours(1),
            is_active: true,
        })
        .await
        .unwrap();
    let paused = ctx.coupon("PAUSED", dec!(10), dec!(0)).await;
    ctx.services.coupons.set_active(paused.id, false).await.unwrap();

    assert_matches!(
        ctx.services.coupons.apply(user, session.id, "STALE").await,
        Err(ServiceError::CouponExpired(_))
    );
    assert_matches!(
        ctx.services.coupons.apply(user, session.id, "PAUSED").await,
        Err(ServiceError::CouponInactive(_))
    );
    assert_matches!(
        ctx.services.coupons.apply(user, session.id, "NOPE").await,
        Err(ServiceError::CouponNotFound(_))
    );
}

#[tokio::test]
async fn coupon_in_use_cannot_be_renamed_or_deleted() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(100), 5).await;
    ctx.add_to_cart(user, p.id, 1).await;
    let coupon = ctx.coupon("FESTIVE", dec!(20), dec!(0)).await;
    let session = ctx.services.checkout.get_or_create_session(user).await.unwrap();

    assert!(!ctx.services.coupons.is_in_use(coupon.id).await.unwrap());
    ctx.services.coupons.apply(user, session.id, "FESTIVE").await.unwrap();
    assert!(ctx.services.coupons.is_in_use(coupon.id).await.unwrap());

    assert_matches!(
        ctx.services.coupons.rename_coupon(coupon.id, "FESTIVE2").await,
        Err(ServiceError::Conflict(_))
    );
    assert_matches!(
        ctx.services.coupons.soft_delete_coupon(coupon.id).await,
        Err(ServiceError::Conflict(_))
    );

    // Abandoned checkouts no longer pin the code.
    ctx.services.checkout.abandon(user, session.id).await.unwrap();
    let renamed = ctx
        .services
        .coupons
        .rename_coupon(coupon.id, "festive2")
        .await
        .unwrap();
    assert_eq!(renamed.code, "FESTIVE2");
    let deleted = ctx.services.coupons.soft_delete_coupon(coupon.id).await.unwrap();
    assert!(deleted.is_deleted);
    assert!(!deleted.is_active);
}

#[tokio::test]
async fn deactivated_coupon_blocks_order_creation() {
    let ctx = TestContext::new().await;
    let user = Uuid::new_v4();
    let p = ctx.product(dec!(100), 5).await;
    ctx.add_to_cart(user, p.id, 1).await;
    let coupon = ctx.coupon("FLASH", dec!(30), dec!(0)).await;
    let session = ctx.ready_session(user).await;
    ctx.services.coupons.apply(user, session.id, "FLASH").await.unwrap();

    ctx.services.coupons.set_active(coupon.id, false).await.unwrap();

    let err = ctx
        .services
        .orders
        .create_order(user, session.id, storefront_api::entities::PaymentMethod::CashOnDelivery)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::CouponInactive(_));
    assert_eq!(ctx.stock_of(p.id).await, 5);
}
