mod common;

use assert_matches::assert_matches;
use common::TestContext;
use rust_decimal_macros::dec;
use storefront_api::errors::ServiceError;
use uuid::Uuid;

#[tokio::test]
async fn concurrent_decrements_never_oversell() {
    let ctx = TestContext::new().await;
    let product = ctx.product(dec!(5), 10).await;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let stock = ctx.services.stock.clone();
        let id = product.id;
        tasks.push(tokio::spawn(async move { stock.decrement(id, 1).await }));
    }

    let mut sold = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => sold += 1,
            Err(ServiceError::InsufficientStock { .. }) => refused += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(sold, 10);
    assert_eq!(refused, 10);
    assert_eq!(ctx.services.stock.available(product.id).await.unwrap(), 0);
}

#[tokio::test]
async fn shortfall_reports_what_is_left() {
    let ctx = TestContext::new().await;
    let product = ctx.product(dec!(5), 3).await;

    let err = ctx.services.stock.decrement(product.id, 5).await.unwrap_err();
    assert_matches!(
        err,
        ServiceError::InsufficientStock { requested: 5, available: 3, product_id } if product_id == product.id
    );
    assert_eq!(ctx.stock_of(product.id).await, 3);

    ctx.services.stock.increment(product.id, 2).await.unwrap();
    ctx.services.stock.decrement(product.id, 5).await.unwrap();
    assert_eq!(ctx.stock_of(product.id).await, 0);
}

#[tokio::test]
async fn unknown_product_is_not_found() {
    let ctx = TestContext::new().await;
    let err = ctx
        .services
        .stock
        .decrement(Uuid::new_v4(), 1)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}
