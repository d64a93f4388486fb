use crate::{
    config::{CheckoutPolicy, PaymentGatewayConfig},
    entities::{order, payment, OrderStatus, PaymentMethod, PaymentStatus, StatusTransition},
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::{to_minor_units, GatewayOrderRequest, PaymentGateway},
    services::orders,
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const EXPIRED_REASON: &str = "payment window expired";

/// Result of a verification call. Only `Verified` performed the state flip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified(payment::Model),
    AlreadyVerified(payment::Model),
}

impl VerifyOutcome {
    pub fn payment(&self) -> &payment::Model {
        match self {
            VerifyOutcome::Verified(p) | VerifyOutcome::AlreadyVerified(p) => p,
        }
    }
}

/// Counts from one abandoned-payment sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    pub orders_cancelled: usize,
    pub payments_failed: usize,
    pub failures: usize,
}

/// Payment intents, callback verification, and the expiry sweep.
#[derive(Clone)]
pub struct PaymentService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    gateway: Arc<dyn PaymentGateway>,
    config: PaymentGatewayConfig,
    policy: CheckoutPolicy,
}

impl PaymentService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        config: PaymentGatewayConfig,
        policy: CheckoutPolicy,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            gateway,
            config,
            policy,
        }
    }

    /// Creates (or reuses) the gateway payment for a pending online order.
    #[instrument(skip(self))]
    pub async fn create_intent(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<payment::Model, ServiceError> {
        let order = orders::load_owned_in(&*self.db_pool, user_id, order_id).await?;
        if order.payment_method != PaymentMethod::Online {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is paid by {}",
                order_id, order.payment_method
            )));
        }
        if order.order_status != OrderStatus::Pending {
            return Err(ServiceError::Conflict(format!(
                "order {} is {:?}",
                order_id, order.order_status
            )));
        }

        let now = Utc::now();
        if let Some(existing) = self.reusable_intent(order_id, now).await? {
            info!(%order_id, payment_id = %existing.id, "reusing live payment intent");
            return Ok(existing);
        }

        let amount = to_minor_units(order.final_amount)?;
        // No transaction is held across the gateway call
        let remote = self
            .gateway
            .create_order(GatewayOrderRequest {
                amount,
                currency: self.config.currency.clone(),
                receipt: order_id.to_string(),
            })
            .await?;

        let txn = self.db_pool.begin().await?;
        let order = orders::load_in(&txn, order_id).await?;
        if order.order_status != OrderStatus::Pending {
            return Err(ServiceError::Conflict(format!(
                "order {} is {:?}",
                order_id, order.order_status
            )));
        }
        let now = Utc::now();
        let created = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            amount: Set(order.final_amount),
            currency: Set(self.config.currency.clone()),
            payment_method: Set(PaymentMethod::Online),
            status: Set(PaymentStatus::Created),
            gateway_order_id: Set(Some(remote.id.clone())),
            gateway_payment_id: Set(None),
            gateway_signature: Set(None),
            expires_at: Set(Some(now + self.config.intent_ttl())),
            paid_at: Set(None),
            refunded_at: Set(None),
            failure_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        info!(%order_id, payment_id = %created.id, gateway_order_id = %remote.id, "payment intent created");
        self.event_sender
            .send_or_log(Event::PaymentIntentCreated {
                payment_id: created.id,
                order_id,
                gateway_order_id: remote.id,
            })
            .await;
        Ok(created)
    }

    async fn reusable_intent(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<payment::Model>, ServiceError> {
        let payments = orders::payments_for_in(&*self.db_pool, order_id).await?;
        if payments.iter().any(|p| p.status == PaymentStatus::Paid) {
            return Err(ServiceError::Conflict(format!("order {} is already paid", order_id)));
        }
        let mut live = None;
        for p in payments.into_iter().filter(|p| p.status == PaymentStatus::Created) {
            if p.is_expired_at(now) {
                return Err(ServiceError::PaymentExpired(format!(
                    "payment window for order {} has closed",
                    order_id
                )));
            }
            live = Some(p);
        }
        Ok(live)
    }

    /// Idempotent per order: a repeated call with the same gateway payment id
    /// returns `AlreadyVerified` without touching state or emitting events.
    #[instrument(skip(self, signature))]
    pub async fn verify(
        &self,
        order_id: Uuid,
        gateway_payment_id: Option<&str>,
        signature: Option<&str>,
    ) -> Result<VerifyOutcome, ServiceError> {
        let (gateway_payment_id, signature) = match (
            gateway_payment_id.map(str::trim).filter(|s| !s.is_empty()),
            signature.map(str::trim).filter(|s| !s.is_empty()),
        ) {
            (Some(id), Some(sig)) => (id, sig),
            _ => {
                return Err(ServiceError::PaymentPending(format!(
                    "no completed payment reported for order {}",
                    order_id
                )))
            }
        };

        let payment = self.gateway_payment_for(order_id).await?;
        if let Some(outcome) = settled_outcome(&payment, gateway_payment_id)? {
            return Ok(outcome);
        }

        let now = Utc::now();
        if payment.is_expired_at(now) {
            return Err(ServiceError::PaymentExpired(format!(
                "payment {} expired at {:?}",
                payment.id, payment.expires_at
            )));
        }

        let gateway_order_id = payment.gateway_order_id.clone().unwrap_or_default();
        if !self
            .gateway
            .verify_signature(&gateway_order_id, gateway_payment_id, signature)
        {
            metrics::counter!("storefront.payments.signature_mismatch", 1);
            warn!(%order_id, payment_id = %payment.id, "payment signature mismatch");
            return Err(ServiceError::SignatureMismatch(order_id));
        }

        let txn = self.db_pool.begin().await?;
        let flipped = payment::Entity::update_many()
            .set(payment::ActiveModel {
                status: Set(PaymentStatus::Paid),
                gateway_payment_id: Set(Some(gateway_payment_id.to_string())),
                gateway_signature: Set(Some(signature.to_string())),
                paid_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Created))
            .exec(&txn)
            .await?;

        if flipped.rows_affected == 0 {
            // Another caller settled it first
            txn.rollback().await?;
            let current = self.gateway_payment_for(order_id).await?;
            return settled_outcome(&current, gateway_payment_id)?.ok_or_else(|| {
                ServiceError::Conflict(format!("payment {} changed during verification", payment.id))
            });
        }

        let order = orders::load_in(&txn, order_id).await?;
        orders::confirm_in(&txn, &order).await?;
        let verified = payment::Entity::find_by_id(payment.id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment", payment.id))?;
        txn.commit().await?;

        metrics::counter!("storefront.payments.verified", 1);
        info!(%order_id, payment_id = %verified.id, "payment verified");
        self.event_sender
            .send_or_log(Event::PaymentVerified {
                payment_id: verified.id,
                order_id,
            })
            .await;
        self.event_sender
            .send_or_log(Event::OrderConfirmed(order_id))
            .await;
        Ok(VerifyOutcome::Verified(verified))
    }

    /// Records a gateway-reported failure on the live intent. The order stays
    /// pending so the customer can retry with a fresh intent.
    #[instrument(skip(self))]
    pub async fn mark_failed(
        &self,
        order_id: Uuid,
        reason: &str,
    ) -> Result<payment::Model, ServiceError> {
        let payment = self.gateway_payment_for(order_id).await?;
        payment.status.transition_to(PaymentStatus::Failed)?;

        let now = Utc::now();
        let result = payment::Entity::update_many()
            .set(payment::ActiveModel {
                status: Set(PaymentStatus::Failed),
                failure_reason: Set(Some(reason.to_string())),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Created))
            .exec(&*self.db_pool)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(format!(
                "payment {} is no longer awaiting payment",
                payment.id
            )));
        }

        let failed = payment::Entity::find_by_id(payment.id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment", payment.id))?;

        metrics::counter!("storefront.payments.failed", 1);
        self.event_sender
            .send_or_log(Event::PaymentFailed {
                payment_id: failed.id,
                order_id,
                reason: reason.to_string(),
            })
            .await;
        Ok(failed)
    }

    /// Cancels online orders whose payment window closed: intents past
    /// `expires_at`, and orders that never got an intent within the unpaid
    /// order TTL. Each order is compensated in its own transaction.
    #[instrument(skip(self))]
    pub async fn expire_stale_payments(&self, now: DateTime<Utc>) -> Result<ExpiryReport, ServiceError> {
        let mut candidates: BTreeSet<Uuid> = payment::Entity::find()
            .filter(payment::Column::Status.eq(PaymentStatus::Created))
            .filter(payment::Column::PaymentMethod.eq(PaymentMethod::Online))
            .filter(payment::Column::ExpiresAt.lte(now))
            .all(&*self.db_pool)
            .await?
            .into_iter()
            .map(|p| p.order_id)
            .collect();

        let unpaid_cutoff = now - self.policy.unpaid_order_ttl();
        candidates.extend(
            order::Entity::find()
                .filter(order::Column::PaymentMethod.eq(PaymentMethod::Online))
                .filter(order::Column::OrderStatus.eq(OrderStatus::Pending))
                .filter(order::Column::CreatedAt.lte(unpaid_cutoff))
                .all(&*self.db_pool)
                .await?
                .into_iter()
                .map(|o| o.id),
        );

        let mut report = ExpiryReport::default();
        for order_id in candidates {
            match self.expire_order(order_id, now).await {
                Ok(Some(failed)) => {
                    report.orders_cancelled += 1;
                    report.payments_failed += failed;
                }
                Ok(None) => {}
                Err(e) => {
                    report.failures += 1;
                    error!(%order_id, error = %e, "failed to expire unpaid order");
                }
            }
        }

        if report.orders_cancelled > 0 || report.failures > 0 {
            info!(
                cancelled = report.orders_cancelled,
                payments_failed = report.payments_failed,
                failures = report.failures,
                "abandoned payment sweep finished"
            );
        }
        metrics::counter!("storefront.orders.expired", report.orders_cancelled as u64);
        Ok(report)
    }

    /// Returns the number of payments failed, or `None` when the order is
    /// still payable or already settled.
    async fn expire_order(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let order = orders::load_in(&txn, order_id).await?;
        if order.order_status != OrderStatus::Pending || order.payment_method != PaymentMethod::Online {
            return Ok(None);
        }

        let payments = orders::payments_for_in(&txn, order_id).await?;
        let open: Vec<_> = payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Created)
            .collect();
        if open.iter().any(|p| !p.is_expired_at(now)) {
            return Ok(None);
        }
        let failed = open.len();
        let payment_ids: Vec<Uuid> = open.iter().map(|p| p.id).collect();

        orders::cancel_in(&txn, &order, EXPIRED_REASON).await?;
        txn.commit().await?;

        warn!(%order_id, "unpaid order cancelled and restocked");
        for payment_id in payment_ids {
            self.event_sender
                .send_or_log(Event::PaymentFailed {
                    payment_id,
                    order_id,
                    reason: EXPIRED_REASON.to_string(),
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::OrderCancelled {
                order_id,
                reason: EXPIRED_REASON.to_string(),
            })
            .await;
        Ok(Some(failed))
    }

    /// Most recent payment on the order that went through the gateway.
    async fn gateway_payment_for(&self, order_id: Uuid) -> Result<payment::Model, ServiceError> {
        orders::payments_for_in(&*self.db_pool, order_id)
            .await?
            .into_iter()
            .filter(|p| p.gateway_order_id.is_some())
            .last()
            .ok_or_else(|| ServiceError::NotFound(format!("no gateway payment for order {}", order_id)))
    }
}

/// Outcome for a payment that is no longer `created`, or `None` if it still is.
fn settled_outcome(
    payment: &payment::Model,
    gateway_payment_id: &str,
) -> Result<Option<VerifyOutcome>, ServiceError> {
    match payment.status {
        PaymentStatus::Created => Ok(None),
        PaymentStatus::Paid | PaymentStatus::Refunded
            if payment.gateway_payment_id.as_deref() == Some(gateway_payment_id) =>
        {
            Ok(Some(VerifyOutcome::AlreadyVerified(payment.clone())))
        }
        PaymentStatus::Paid | PaymentStatus::Refunded => Err(ServiceError::Conflict(format!(
            "payment {} was settled with a different gateway payment",
            payment.id
        ))),
        PaymentStatus::Failed if payment.failure_reason.as_deref() == Some(EXPIRED_REASON) => {
            Err(ServiceError::PaymentExpired(format!(
                "payment {} expired before it was completed",
                payment.id
            )))
        }
        PaymentStatus::Failed => Err(ServiceError::InvalidTransition(format!(
            "payment {} already failed: {}",
            payment.id,
            payment.failure_reason.as_deref().unwrap_or("unknown")
        ))),
    }
}
