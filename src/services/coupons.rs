use crate::{
    config::CheckoutPolicy,
    entities::{checkout_session, coupon, CheckoutStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::checkout::{self, calculate_totals},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Input for creating a coupon.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewCoupon {
    #[validate(length(min = 3, max = 32), custom = "validate_code")]
    pub code: String,
    #[validate(custom = "validate_percentage")]
    pub discount_percentage: Decimal,
    #[validate(custom = "validate_non_negative")]
    pub min_order_amount: Decimal,
    pub expires_at: DateTime<Utc>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

fn validate_code(code: &str) -> Result<(), ValidationError> {
    if code
        .trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_coupon_code"))
    }
}

fn validate_percentage(pct: &Decimal) -> Result<(), ValidationError> {
    if *pct > Decimal::ZERO && *pct <= Decimal::ONE_HUNDRED {
        Ok(())
    } else {
        Err(ValidationError::new("discount_percentage_out_of_range"))
    }
}

fn validate_non_negative(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_negative() {
        Err(ValidationError::new("negative_amount"))
    } else {
        Ok(())
    }
}

/// Codes are matched case-insensitively and stored upper-case.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Whether `coupon` can discount a session totalling `total_amount` at `now`.
pub fn evaluate(
    coupon: &coupon::Model,
    total_amount: Decimal,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if coupon.is_deleted {
        return Err(ServiceError::CouponNotFound(coupon.code.clone()));
    }
    if !coupon.is_active {
        return Err(ServiceError::CouponInactive(coupon.code.clone()));
    }
    if coupon.expires_at <= now {
        return Err(ServiceError::CouponExpired(coupon.code.clone()));
    }
    if total_amount < coupon.min_order_amount {
        return Err(ServiceError::MinOrderNotMet(format!(
            "{} requires an order of at least {}, session total is {}",
            coupon.code, coupon.min_order_amount, total_amount
        )));
    }
    Ok(())
}

pub(crate) async fn find_usable_in<C: ConnectionTrait>(
    conn: &C,
    code: &str,
) -> Result<coupon::Model, ServiceError> {
    let code = normalize_code(code);
    coupon::Entity::find()
        .filter(coupon::Column::Code.eq(code.as_str()))
        .filter(coupon::Column::IsDeleted.eq(false))
        .one(conn)
        .await?
        .ok_or(ServiceError::CouponNotFound(code))
}

/// Validates and applies discount codes, and guards coupon edits.
#[derive(Clone)]
pub struct CouponService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    policy: CheckoutPolicy,
}

impl CouponService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        policy: CheckoutPolicy,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            policy,
        }
    }

    /// Applies `code` to the session, replacing any coupon already applied.
    /// On failure the session is left exactly as it was.
    #[instrument(skip(self))]
    pub async fn apply(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        code: &str,
    ) -> Result<checkout_session::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let session = checkout::load_owned_in(&txn, user_id, session_id).await?;
        checkout::ensure_pending(&session)?;

        let coupon = find_usable_in(&txn, code).await?;
        let items = checkout::items_in(&txn, session.id).await?;
        let undiscounted = calculate_totals(&items, None);
        if let Err(e) = evaluate(&coupon, undiscounted.total_amount, Utc::now()) {
            warn!(%session_id, code = %coupon.code, error = %e, "coupon rejected");
            return Err(e);
        }

        let totals = calculate_totals(&items, Some(coupon.discount_percentage));
        let mut changes = checkout::totals_changes(totals);
        changes.coupon_code = Set(Some(coupon.code.clone()));
        changes.coupon_applied = Set(true);
        let updated = checkout::update_guarded_in(&txn, &session, changes).await?;
        txn.commit().await?;

        metrics::counter!("storefront.coupons.applied", 1);
        info!(%session_id, code = %coupon.code, discount = %updated.discount_amount, "coupon applied");
        self.event_sender
            .send_or_log(Event::CouponApplied {
                session_id,
                code: coupon.code,
                discount_amount: updated.discount_amount,
            })
            .await;
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn remove(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<checkout_session::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let session = checkout::load_owned_in(&txn, user_id, session_id).await?;
        checkout::ensure_pending(&session)?;

        let items = checkout::items_in(&txn, session.id).await?;
        let mut changes = checkout::totals_changes(calculate_totals(&items, None));
        changes.coupon_code = Set(None);
        changes.coupon_applied = Set(false);
        let updated = checkout::update_guarded_in(&txn, &session, changes).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CouponRemoved(session_id))
            .await;
        Ok(updated)
    }

    /// True when a pending or completed session inside the lookback window
    /// references the coupon's code.
    #[instrument(skip(self))]
    pub async fn is_in_use(&self, coupon_id: Uuid) -> Result<bool, ServiceError> {
        let coupon = self.load(coupon_id).await?;
        self.code_in_use(&*self.db_pool, &coupon.code).await
    }

    async fn code_in_use<C: ConnectionTrait>(&self, conn: &C, code: &str) -> Result<bool, ServiceError> {
        let since = Utc::now() - self.policy.coupon_lookback();
        let count = checkout_session::Entity::find()
            .filter(checkout_session::Column::CouponCode.eq(code))
            .filter(
                checkout_session::Column::Status
                    .is_in([CheckoutStatus::Pending, CheckoutStatus::Completed]),
            )
            .filter(checkout_session::Column::CreatedAt.gte(since))
            .count(conn)
            .await?;
        Ok(count > 0)
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<coupon::Model>, ServiceError> {
        Ok(coupon::Entity::find()
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .one(&*self.db_pool)
            .await?)
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_coupon(&self, input: NewCoupon) -> Result<coupon::Model, ServiceError> {
        input.validate()?;
        let code = normalize_code(&input.code);

        let txn = self.db_pool.begin().await?;
        let exists = coupon::Entity::find()
            .filter(coupon::Column::Code.eq(code.as_str()))
            .count(&txn)
            .await?
            > 0;
        if exists {
            return Err(ServiceError::Conflict(format!("coupon code {} already exists", code)));
        }

        let now = Utc::now();
        let created = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code),
            discount_percentage: Set(input.discount_percentage),
            min_order_amount: Set(input.min_order_amount),
            is_active: Set(input.is_active),
            expires_at: Set(input.expires_at),
            is_deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        info!(coupon_id = %created.id, code = %created.code, "coupon created");
        Ok(created)
    }

    /// Refused while any recent checkout references the current code.
    #[instrument(skip(self))]
    pub async fn rename_coupon(
        &self,
        coupon_id: Uuid,
        new_code: &str,
    ) -> Result<coupon::Model, ServiceError> {
        validate_code(new_code.trim())
            .map_err(|_| ServiceError::ValidationError(format!("invalid coupon code {}", new_code)))?;
        let new_code = normalize_code(new_code);
        if !(3..=32).contains(&new_code.len()) {
            return Err(ServiceError::ValidationError(
                "coupon code must be 3 to 32 characters".to_string(),
            ));
        }

        let txn = self.db_pool.begin().await?;
        let current = load_live_in(&txn, coupon_id).await?;
        if current.code == new_code {
            return Ok(current);
        }
        if self.code_in_use(&txn, &current.code).await? {
            return Err(ServiceError::Conflict(format!(
                "coupon {} is referenced by a recent checkout",
                current.code
            )));
        }
        let taken = coupon::Entity::find()
            .filter(coupon::Column::Code.eq(new_code.as_str()))
            .count(&txn)
            .await?
            > 0;
        if taken {
            return Err(ServiceError::Conflict(format!("coupon code {} already exists", new_code)));
        }

        let mut active: coupon::ActiveModel = current.into();
        active.code = Set(new_code);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        txn.commit().await?;
        Ok(updated)
    }

    /// Refused while any recent checkout references the code.
    #[instrument(skip(self))]
    pub async fn soft_delete_coupon(&self, coupon_id: Uuid) -> Result<coupon::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let current = load_live_in(&txn, coupon_id).await?;
        if self.code_in_use(&txn, &current.code).await? {
            return Err(ServiceError::Conflict(format!(
                "coupon {} is referenced by a recent checkout",
                current.code
            )));
        }

        let mut active: coupon::ActiveModel = current.into();
        active.is_deleted = Set(true);
        active.is_active = Set(false);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&txn).await?;
        txn.commit().await?;

        info!(%coupon_id, "coupon soft-deleted");
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn set_active(&self, coupon_id: Uuid, active: bool) -> Result<coupon::Model, ServiceError> {
        let current = load_live_in(&*self.db_pool, coupon_id).await?;
        let mut model: coupon::ActiveModel = current.into();
        model.is_active = Set(active);
        model.updated_at = Set(Utc::now());
        Ok(model.update(&*self.db_pool).await?)
    }

    async fn load(&self, coupon_id: Uuid) -> Result<coupon::Model, ServiceError> {
        coupon::Entity::find_by_id(coupon_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::not_found("Coupon", coupon_id))
    }
}

async fn load_live_in<C: ConnectionTrait>(conn: &C, coupon_id: Uuid) -> Result<coupon::Model, ServiceError> {
    coupon::Entity::find_by_id(coupon_id)
        .one(conn)
        .await?
        .filter(|c| !c.is_deleted)
        .ok_or_else(|| ServiceError::not_found("Coupon", coupon_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn save10() -> coupon::Model {
        let now = Utc::now();
        coupon::Model {
            id: Uuid::new_v4(),
            code: "SAVE10".into(),
            discount_percentage: dec!(10),
            min_order_amount: dec!(500.00),
            is_active: true,
            expires_at: now + chrono::Duration::days(7),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[rstest]
    #[case(dec!(1000.00), true)]
    #[case(dec!(500.00), true)]
    #[case(dec!(499.99), false)]
    fn min_order_boundary(#[case] total: Decimal, #[case] accepted: bool) {
        assert_eq!(evaluate(&save10(), total, Utc::now()).is_ok(), accepted);
    }

    #[test]
    fn failures_are_distinct() {
        let now = Utc::now();

        let mut inactive = save10();
        inactive.is_active = false;
        assert_matches!(evaluate(&inactive, dec!(1000), now), Err(ServiceError::CouponInactive(_)));

        let mut expired = save10();
        expired.expires_at = now - chrono::Duration::seconds(1);
        assert_matches!(evaluate(&expired, dec!(1000), now), Err(ServiceError::CouponExpired(_)));

        let mut deleted = save10();
        deleted.is_deleted = true;
        assert_matches!(evaluate(&deleted, dec!(1000), now), Err(ServiceError::CouponNotFound(_)));

        assert_matches!(evaluate(&save10(), dec!(10), now), Err(ServiceError::MinOrderNotMet(_)));
    }

    #[test]
    fn new_coupon_validation() {
        let input = NewCoupon {
            code: "save 10".into(),
            discount_percentage: dec!(150),
            min_order_amount: dec!(-1),
            expires_at: Utc::now(),
            is_active: true,
        };
        let errors = input.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("code"));
        assert!(fields.contains_key("discount_percentage"));
        assert!(fields.contains_key("min_order_amount"));
    }

    #[test]
    fn codes_normalize_to_upper_case() {
        assert_eq!(normalize_code("  save10 "), "SAVE10");
    }
}
