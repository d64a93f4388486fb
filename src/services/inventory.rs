use crate::{
    entities::{checkout_item, order_item, product},
    errors::ServiceError,
};
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Authoritative available quantity per product.
///
/// Every write is a single guarded `UPDATE`; the `_in` functions take the
/// caller's connection so they join an enclosing transaction.
#[derive(Clone)]
pub struct StockLedger {
    db_pool: Arc<DatabaseConnection>,
}

impl StockLedger {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self))]
    pub async fn available(&self, product_id: Uuid) -> Result<i32, ServiceError> {
        let product = product::Entity::find_by_id(product_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::not_found("Product", product_id))?;
        Ok(product.stock_quantity)
    }

    #[instrument(skip(self))]
    pub async fn decrement(&self, product_id: Uuid, quantity: i32) -> Result<(), ServiceError> {
        let txn = self.db_pool.begin().await?;
        decrement_in(&txn, product_id, quantity).await?;
        txn.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn increment(&self, product_id: Uuid, quantity: i32) -> Result<(), ServiceError> {
        let txn = self.db_pool.begin().await?;
        increment_in(&txn, product_id, quantity).await?;
        txn.commit().await?;
        Ok(())
    }
}

fn ensure_positive(quantity: i32) -> Result<(), ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "quantity must be positive, got {}",
            quantity
        )));
    }
    Ok(())
}

/// Decrements stock only if at least `quantity` is available.
pub(crate) async fn decrement_in<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    ensure_positive(quantity)?;

    let result = product::Entity::update_many()
        .col_expr(
            product::Column::StockQuantity,
            Expr::col(product::Column::StockQuantity).sub(quantity),
        )
        .col_expr(
            product::Column::Version,
            Expr::col(product::Column::Version).add(1),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::IsDeleted.eq(false))
        .filter(product::Column::StockQuantity.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        let product = product::Entity::find_by_id(product_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Product", product_id))?;
        if product.is_deleted {
            return Err(ServiceError::ValidationError(format!(
                "product {} is no longer available",
                product_id
            )));
        }
        metrics::counter!("storefront.stock.shortfalls", 1);
        warn!(%product_id, requested = quantity, available = product.stock_quantity, "stock decrement refused");
        return Err(ServiceError::InsufficientStock {
            product_id,
            requested: quantity,
            available: product.stock_quantity,
        });
    }

    Ok(())
}

pub(crate) async fn increment_in<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    ensure_positive(quantity)?;

    let result = product::Entity::update_many()
        .col_expr(
            product::Column::StockQuantity,
            Expr::col(product::Column::StockQuantity).add(quantity),
        )
        .col_expr(
            product::Column::Version,
            Expr::col(product::Column::Version).add(1),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product_id))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::not_found("Product", product_id));
    }
    Ok(())
}

/// Checks every line before any write so the first shortfall is reported
/// without touching stock.
pub(crate) async fn ensure_available_in<C: ConnectionTrait>(
    conn: &C,
    items: &[checkout_item::Model],
) -> Result<(), ServiceError> {
    for item in items {
        let product = product::Entity::find_by_id(item.product_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Product", item.product_id))?;
        if product.is_deleted || product.stock_quantity < item.quantity {
            metrics::counter!("storefront.stock.shortfalls", 1);
            return Err(ServiceError::InsufficientStock {
                product_id: item.product_id,
                requested: item.quantity,
                available: if product.is_deleted {
                    0
                } else {
                    product.stock_quantity
                },
            });
        }
    }
    Ok(())
}

/// Returns every order line to stock. Inverse of order creation.
pub(crate) async fn restock_order_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<i32, ServiceError> {
    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(conn)
        .await?;

    let mut units = 0;
    for item in &items {
        increment_in(conn, item.product_id, item.quantity).await?;
        units += item.quantity;
    }
    info!(%order_id, units, lines = items.len(), "order items restocked");
    Ok(units)
}
