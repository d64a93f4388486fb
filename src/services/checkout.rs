use crate::{
    entities::{
        address, cart_item, checkout_item, checkout_session, coupon, product, shipping_address,
        CheckoutStatus, StatusTransition,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Derived amounts for a checkout session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub total_amount: Decimal,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
    pub item_count: i32,
}

/// total = Σ subtotal, discount = total × pct / 100 rounded to 2 dp,
/// final = total − discount, item_count = Σ quantity.
pub fn calculate_totals(items: &[checkout_item::Model], discount_percentage: Option<Decimal>) -> Totals {
    let total_amount: Decimal = items.iter().map(|i| i.subtotal).sum();
    let item_count = items.iter().map(|i| i.quantity).sum();
    let discount_amount = discount_for(total_amount, discount_percentage);
    Totals {
        total_amount,
        discount_amount,
        final_amount: total_amount - discount_amount,
        item_count,
    }
}

pub(crate) fn discount_for(total_amount: Decimal, discount_percentage: Option<Decimal>) -> Decimal {
    match discount_percentage {
        Some(pct) if pct > Decimal::ZERO => {
            let pct = pct.min(Decimal::ONE_HUNDRED);
            (total_amount * pct / Decimal::ONE_HUNDRED).round_dp(2)
        }
        _ => Decimal::ZERO,
    }
}

/// Where the shipping snapshot comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AddressInput {
    /// An entry already in the user's address book
    Existing { address_id: Uuid },
    /// Inline fields; saved to the address book first
    New(AddressFields),
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AddressFields {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(custom = "validate_phone")]
    pub phone: String,
    #[validate(length(min = 1, max = 200))]
    pub line1: String,
    #[validate(length(max = 200))]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 1, max = 100))]
    pub state: String,
    #[validate(length(min = 3, max = 12))]
    pub postal_code: String,
    #[validate(length(min = 2, max = 56))]
    pub country: String,
}

fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_phone"))
    }
}

/// Owns the pending cart-to-order staging area.
#[derive(Clone)]
pub struct CheckoutService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CheckoutService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Returns the user's pending session, or snapshots the cart into a new one.
    #[instrument(skip(self))]
    pub async fn get_or_create_session(
        &self,
        user_id: Uuid,
    ) -> Result<checkout_session::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;

        if let Some(existing) = find_pending_in(&txn, user_id).await? {
            txn.commit().await?;
            return Ok(existing);
        }

        let cart = cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .find_also_related(product::Entity)
            .all(&txn)
            .await?;

        if cart.is_empty() {
            return Err(ServiceError::ValidationError(
                "cannot start checkout with an empty cart".to_string(),
            ));
        }

        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let mut items = Vec::with_capacity(cart.len());
        for (line, product) in cart {
            let product = match product {
                Some(p) if !p.is_deleted => p,
                _ => {
                    return Err(ServiceError::ValidationError(format!(
                        "product {} in cart is no longer available",
                        line.product_id
                    )))
                }
            };
            if line.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "cart line {} has non-positive quantity",
                    line.id
                )));
            }
            if product.stock_quantity < line.quantity {
                return Err(ServiceError::InsufficientStock {
                    product_id: product.id,
                    requested: line.quantity,
                    available: product.stock_quantity,
                });
            }
            items.push(checkout_item::Model {
                id: Uuid::new_v4(),
                session_id,
                product_id: product.id,
                quantity: line.quantity,
                unit_price: product.price,
                subtotal: product.price * Decimal::from(line.quantity),
                created_at: now,
            });
        }

        let totals = calculate_totals(&items, None);
        let inserted = checkout_session::ActiveModel {
            id: Set(session_id),
            user_id: Set(user_id),
            status: Set(CheckoutStatus::Pending),
            total_amount: Set(totals.total_amount),
            discount_amount: Set(totals.discount_amount),
            final_amount: Set(totals.final_amount),
            item_count: Set(totals.item_count),
            coupon_code: Set(None),
            coupon_applied: Set(false),
            shipping_address_id: Set(None),
            version: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(None),
        }
        .insert(&txn)
        .await;

        // A concurrent call opened the user's pending session first
        let session = match inserted {
            Ok(session) => session,
            Err(err) if is_unique_violation(&err) => {
                txn.rollback().await?;
                warn!(%user_id, "lost race to open checkout session; returning the winner");
                return find_pending_in(&*self.db_pool, user_id)
                    .await?
                    .ok_or(ServiceError::ConcurrentModification(session_id));
            }
            Err(err) => return Err(err.into()),
        };

        for item in items {
            checkout_item::ActiveModel {
                id: Set(item.id),
                session_id: Set(item.session_id),
                product_id: Set(item.product_id),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                subtotal: Set(item.subtotal),
                created_at: Set(item.created_at),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;

        info!(session_id = %session.id, %user_id, items = session.item_count, "checkout session created");
        self.event_sender
            .send_or_log(Event::CheckoutStarted {
                session_id: session.id,
                user_id,
                item_count: session.item_count,
            })
            .await;

        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn get_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<checkout_session::Model, ServiceError> {
        load_owned_in(&*self.db_pool, user_id, session_id).await
    }

    pub async fn list_items(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<checkout_item::Model>, ServiceError> {
        Ok(items_in(&*self.db_pool, session_id).await?)
    }

    /// Binds a shipping snapshot to the session, upserting by `(user, address)`.
    #[instrument(skip(self, input))]
    pub async fn bind_address(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        input: AddressInput,
    ) -> Result<checkout_session::Model, ServiceError> {
        if let AddressInput::New(fields) = &input {
            fields.validate()?;
        }

        let txn = self.db_pool.begin().await?;
        let session = load_owned_in(&txn, user_id, session_id).await?;
        ensure_pending(&session)?;

        let now = Utc::now();
        let source = match input {
            AddressInput::Existing { address_id } => {
                let found = address::Entity::find_by_id(address_id)
                    .one(&txn)
                    .await?
                    .ok_or_else(|| ServiceError::not_found("Address", address_id))?;
                if found.user_id != user_id {
                    warn!(%user_id, %address_id, "address ownership check failed");
                    return Err(ServiceError::Unauthorized(format!(
                        "address {} does not belong to user",
                        address_id
                    )));
                }
                found
            }
            AddressInput::New(fields) => {
                address::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(user_id),
                    name: Set(fields.name),
                    phone: Set(fields.phone),
                    line1: Set(fields.line1),
                    line2: Set(fields.line2),
                    city: Set(fields.city),
                    state: Set(fields.state),
                    postal_code: Set(fields.postal_code),
                    country: Set(fields.country),
                    created_at: Set(now),
                }
                .insert(&txn)
                .await?
            }
        };

        let snapshot_id = upsert_snapshot_in(&txn, &source).await?;

        let totals = recalculated_in(&txn, &session).await?;
        let mut changes = totals_changes(totals);
        changes.shipping_address_id = Set(Some(snapshot_id));
        let updated = update_guarded_in(&txn, &session, changes).await?;

        txn.commit().await?;
        info!(%session_id, %snapshot_id, "shipping address bound");
        Ok(updated)
    }

    /// Recomputes and persists the session totals from its items and coupon.
    #[instrument(skip(self))]
    pub async fn recalculate(
        &self,
        session_id: Uuid,
    ) -> Result<checkout_session::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let session = checkout_session::Entity::find_by_id(session_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Checkout session", session_id))?;
        ensure_pending(&session)?;
        let totals = recalculated_in(&txn, &session).await?;
        let updated = update_guarded_in(&txn, &session, totals_changes(totals)).await?;
        txn.commit().await?;
        Ok(updated)
    }

    /// Cancels checkout. The cart is left untouched.
    #[instrument(skip(self))]
    pub async fn abandon(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<checkout_session::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let session = load_owned_in(&txn, user_id, session_id).await?;
        let status = session.status.transition_to(CheckoutStatus::Deleted)?;
        let updated = update_guarded_in(
            &txn,
            &session,
            checkout_session::ActiveModel {
                status: Set(status),
                ..Default::default()
            },
        )
        .await?;
        txn.commit().await?;

        info!(%session_id, "checkout session abandoned");
        self.event_sender
            .send_or_log(Event::CheckoutAbandoned(session_id))
            .await;
        Ok(updated)
    }
}

/// True when `err` is a unique-index rejection, e.g. a second pending session.
pub fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

pub(crate) async fn find_pending_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<Option<checkout_session::Model>, ServiceError> {
    Ok(checkout_session::Entity::find()
        .filter(checkout_session::Column::UserId.eq(user_id))
        .filter(checkout_session::Column::Status.eq(CheckoutStatus::Pending))
        .one(conn)
        .await?)
}

pub(crate) async fn load_owned_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    session_id: Uuid,
) -> Result<checkout_session::Model, ServiceError> {
    let session = checkout_session::Entity::find_by_id(session_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Checkout session", session_id))?;
    if session.user_id != user_id {
        return Err(ServiceError::Unauthorized(format!(
            "checkout session {} belongs to another user",
            session_id
        )));
    }
    Ok(session)
}

pub(crate) fn ensure_pending(session: &checkout_session::Model) -> Result<(), ServiceError> {
    if session.is_pending() {
        Ok(())
    } else {
        Err(ServiceError::Conflict(format!(
            "checkout session {} is {:?}",
            session.id, session.status
        )))
    }
}

pub(crate) async fn items_in<C: ConnectionTrait>(
    conn: &C,
    session_id: Uuid,
) -> Result<Vec<checkout_item::Model>, sea_orm::DbErr> {
    checkout_item::Entity::find()
        .filter(checkout_item::Column::SessionId.eq(session_id))
        .order_by_asc(checkout_item::Column::CreatedAt)
        .all(conn)
        .await
}

/// Totals for the session as stored now, using the applied coupon's percentage.
pub(crate) async fn recalculated_in<C: ConnectionTrait>(
    conn: &C,
    session: &checkout_session::Model,
) -> Result<Totals, ServiceError> {
    let items = items_in(conn, session.id).await?;
    let pct = match (&session.coupon_code, session.coupon_applied) {
        (Some(code), true) => coupon::Entity::find()
            .filter(coupon::Column::Code.eq(code.as_str()))
            .one(conn)
            .await?
            .map(|c| c.discount_percentage),
        _ => None,
    };
    Ok(calculate_totals(&items, pct))
}

pub(crate) fn totals_changes(totals: Totals) -> checkout_session::ActiveModel {
    checkout_session::ActiveModel {
        total_amount: Set(totals.total_amount),
        discount_amount: Set(totals.discount_amount),
        final_amount: Set(totals.final_amount),
        item_count: Set(totals.item_count),
        ..Default::default()
    }
}

/// Applies `changes` only if the row still carries `current.version`.
pub(crate) async fn update_guarded_in<C: ConnectionTrait>(
    conn: &C,
    current: &checkout_session::Model,
    mut changes: checkout_session::ActiveModel,
) -> Result<checkout_session::Model, ServiceError> {
    changes.version = Set(current.version + 1);
    changes.updated_at = Set(Utc::now());

    let result = checkout_session::Entity::update_many()
        .set(changes)
        .filter(checkout_session::Column::Id.eq(current.id))
        .filter(checkout_session::Column::Version.eq(current.version))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(current.id));
    }

    checkout_session::Entity::find_by_id(current.id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Checkout session", current.id))
}

/// Moves a pending session to completed inside the caller's transaction.
pub(crate) async fn complete_in<C: ConnectionTrait>(
    conn: &C,
    session: &checkout_session::Model,
) -> Result<checkout_session::Model, ServiceError> {
    let status = session.status.transition_to(CheckoutStatus::Completed)?;
    update_guarded_in(
        conn,
        session,
        checkout_session::ActiveModel {
            status: Set(status),
            completed_at: Set(Some(Utc::now())),
            ..Default::default()
        },
    )
    .await
}

async fn upsert_snapshot_in<C: ConnectionTrait>(
    conn: &C,
    source: &address::Model,
) -> Result<Uuid, ServiceError> {
    let now = Utc::now();
    let existing = shipping_address::Entity::find()
        .filter(shipping_address::Column::UserId.eq(source.user_id))
        .filter(shipping_address::Column::AddressId.eq(source.id))
        .one(conn)
        .await?;

    let fields = shipping_address::ActiveModel {
        name: Set(source.name.clone()),
        phone: Set(source.phone.clone()),
        line1: Set(source.line1.clone()),
        line2: Set(source.line2.clone()),
        city: Set(source.city.clone()),
        state: Set(source.state.clone()),
        postal_code: Set(source.postal_code.clone()),
        country: Set(source.country.clone()),
        updated_at: Set(now),
        ..Default::default()
    };

    match existing {
        Some(row) => {
            shipping_address::Entity::update_many()
                .set(fields)
                .filter(shipping_address::Column::Id.eq(row.id))
                .exec(conn)
                .await?;
            Ok(row.id)
        }
        None => {
            let inserted = shipping_address::ActiveModel {
                id: Set(Uuid::new_v4()),
                user_id: Set(source.user_id),
                address_id: Set(source.id),
                created_at: Set(now),
                ..fields
            }
            .insert(conn)
            .await?;
            Ok(inserted.id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(unit_price: Decimal, quantity: i32) -> checkout_item::Model {
        checkout_item::Model {
            id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            product_id: Uuid::new_v4(),
            quantity,
            unit_price,
            subtotal: unit_price * Decimal::from(quantity),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn save10_example() {
        let items = vec![item(dec!(250.00), 2), item(dec!(500.00), 1)];
        let totals = calculate_totals(&items, Some(dec!(10)));
        assert_eq!(totals.total_amount, dec!(1000.00));
        assert_eq!(totals.discount_amount, dec!(100.00));
        assert_eq!(totals.final_amount, dec!(900.00));
        assert_eq!(totals.item_count, 3);
    }

    #[test]
    fn discount_rounds_to_cents() {
        let totals = calculate_totals(&[item(dec!(33.33), 1)], Some(dec!(12.5)));
        assert_eq!(totals.discount_amount, dec!(4.17));
        assert_eq!(totals.final_amount, dec!(29.16));
    }

    #[test]
    fn no_coupon_means_no_discount() {
        let totals = calculate_totals(&[item(dec!(10), 4)], None);
        assert_eq!(totals.discount_amount, Decimal::ZERO);
        assert_eq!(totals.final_amount, totals.total_amount);
    }

    #[test]
    fn phone_validation() {
        assert!(validate_phone("+919876543210").is_ok());
        assert!(validate_phone("98765").is_err());
        assert!(validate_phone("98765abc12").is_err());
    }
}
