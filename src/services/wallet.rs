use crate::{
    entities::{
        order, payment, wallet, wallet_transaction, PaymentStatus, ReferenceType, RefundStatus,
        StatusTransition, WalletTransactionType,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// What a ledger entry is recorded against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReference {
    pub reference_type: ReferenceType,
    pub reference_id: Option<Uuid>,
    pub description: Option<String>,
}

impl LedgerReference {
    pub fn new(reference_type: ReferenceType, reference_id: Uuid) -> Self {
        Self {
            reference_type,
            reference_id: Some(reference_id),
            description: None,
        }
    }

    pub fn adjustment(description: impl Into<String>) -> Self {
        Self {
            reference_type: ReferenceType::Adjustment,
            reference_id: None,
            description: Some(description.into()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Append-only wallet ledger with a cached balance.
#[derive(Clone)]
pub struct WalletService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl WalletService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Increments the balance and appends the matching entry atomically.
    #[instrument(skip(self, reference))]
    pub async fn credit_and_log(
        &self,
        user_id: Uuid,
        amount: Decimal,
        reference: LedgerReference,
    ) -> Result<wallet_transaction::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let entry = credit_in(&txn, user_id, amount, &reference).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(credited_event(&entry)).await;
        Ok(entry)
    }

    #[instrument(skip(self, reference))]
    pub async fn debit_and_log(
        &self,
        user_id: Uuid,
        amount: Decimal,
        reference: LedgerReference,
    ) -> Result<wallet_transaction::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let entry = debit_in(&txn, user_id, amount, &reference).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(debited_event(&entry)).await;
        Ok(entry)
    }

    /// Credits the payment amount to the payer's wallet and marks the payment
    /// refunded. Only a `paid` payment qualifies, so a second call fails with
    /// `NotRefundable`.
    #[instrument(skip(self))]
    pub async fn initiate_refund(
        &self,
        payment_id: Uuid,
    ) -> Result<wallet_transaction::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let payment = payment::Entity::find_by_id(payment_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment", payment_id))?;
        let order = order::Entity::find_by_id(payment.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Order", payment.order_id))?;

        let entry = refund_payment_in(&txn, &payment, order.user_id).await?;
        if order.refund_status.can_transition_to(RefundStatus::Completed) {
            orders::update_guarded_in(
                &txn,
                &order,
                order::ActiveModel {
                    refund_status: Set(RefundStatus::Completed),
                    ..Default::default()
                },
            )
            .await?;
        }
        txn.commit().await?;

        metrics::counter!("storefront.refunds.completed", 1);
        info!(%payment_id, amount = %payment.amount, "payment refunded to wallet");
        self.event_sender
            .send_or_log(Event::PaymentRefunded(payment_id))
            .await;
        self.event_sender.send_or_log(credited_event(&entry)).await;
        Ok(entry)
    }

    /// Cached balance; zero for a user without a wallet.
    pub async fn get_balance(&self, user_id: Uuid) -> Result<Decimal, ServiceError> {
        Ok(find_wallet_in(&*self.db_pool, user_id)
            .await?
            .map(|w| w.balance)
            .unwrap_or(Decimal::ZERO))
    }

    pub async fn list_transactions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<wallet_transaction::Model>, ServiceError> {
        Ok(wallet_transaction::Entity::find()
            .filter(wallet_transaction::Column::UserId.eq(user_id))
            .order_by_asc(wallet_transaction::Column::Sequence)
            .all(&*self.db_pool)
            .await?)
    }

    /// Recomputes the balance from the log alone, checking every
    /// `balance_after` along the way.
    #[instrument(skip(self))]
    pub async fn replay_balance(&self, user_id: Uuid) -> Result<Decimal, ServiceError> {
        let entries = self.list_transactions(user_id).await?;
        replay(&entries)
    }

    /// Fails with `Conflict` when the cached balance and the log disagree.
    #[instrument(skip(self))]
    pub async fn verify_ledger(&self, user_id: Uuid) -> Result<Decimal, ServiceError> {
        let replayed = self.replay_balance(user_id).await?;
        let cached = self.get_balance(user_id).await?;
        if replayed != cached {
            warn!(%user_id, %replayed, %cached, "wallet ledger diverged from cached balance");
            return Err(ServiceError::Conflict(format!(
                "wallet for user {} caches {} but ledger sums to {}",
                user_id, cached, replayed
            )));
        }
        Ok(replayed)
    }
}

/// Running sum of `entries` in sequence order.
pub fn replay(entries: &[wallet_transaction::Model]) -> Result<Decimal, ServiceError> {
    let mut running = Decimal::ZERO;
    for entry in entries {
        running += entry.amount;
        if entry.balance_after != running {
            return Err(ServiceError::Conflict(format!(
                "ledger entry {} records balance {} but replay gives {}",
                entry.id, entry.balance_after, running
            )));
        }
    }
    Ok(running)
}

pub(crate) fn credited_event(entry: &wallet_transaction::Model) -> Event {
    Event::WalletCredited {
        user_id: entry.user_id,
        amount: entry.amount,
        reference_type: entry.reference_type,
        balance_after: entry.balance_after,
    }
}

pub(crate) fn debited_event(entry: &wallet_transaction::Model) -> Event {
    Event::WalletDebited {
        user_id: entry.user_id,
        amount: -entry.amount,
        reference_type: entry.reference_type,
        balance_after: entry.balance_after,
    }
}

async fn find_wallet_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<Option<wallet::Model>, ServiceError> {
    Ok(wallet::Entity::find()
        .filter(wallet::Column::UserId.eq(user_id))
        .one(conn)
        .await?)
}

async fn find_or_create_wallet_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<wallet::Model, ServiceError> {
    if let Some(existing) = find_wallet_in(conn, user_id).await? {
        return Ok(existing);
    }
    let now = Utc::now();
    let created = wallet::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        balance: Set(Decimal::ZERO),
        version: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;
    info!(%user_id, wallet_id = %created.id, "wallet opened");
    Ok(created)
}

fn ensure_positive(amount: Decimal) -> Result<(), ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "wallet amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

pub(crate) async fn credit_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    amount: Decimal,
    reference: &LedgerReference,
) -> Result<wallet_transaction::Model, ServiceError> {
    ensure_positive(amount)?;
    post_in(conn, user_id, amount, reference).await
}

pub(crate) async fn debit_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    amount: Decimal,
    reference: &LedgerReference,
) -> Result<wallet_transaction::Model, ServiceError> {
    ensure_positive(amount)?;
    post_in(conn, user_id, -amount, reference).await
}

/// Version-guarded balance write plus the ledger append. The entry's
/// `sequence` is the wallet version after the write, so `(wallet_id, sequence)`
/// uniqueness rejects a second writer that slipped past the guard.
async fn post_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    signed_amount: Decimal,
    reference: &LedgerReference,
) -> Result<wallet_transaction::Model, ServiceError> {
    let wallet = find_or_create_wallet_in(conn, user_id).await?;
    let balance_after = wallet.balance + signed_amount;
    if balance_after < Decimal::ZERO {
        return Err(ServiceError::InsufficientFunds(format!(
            "wallet balance {} cannot cover {}",
            wallet.balance, -signed_amount
        )));
    }

    let now = Utc::now();
    let next_version = wallet.version + 1;
    let result = wallet::Entity::update_many()
        .set(wallet::ActiveModel {
            balance: Set(balance_after),
            version: Set(next_version),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(wallet::Column::Id.eq(wallet.id))
        .filter(wallet::Column::Version.eq(wallet.version))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(wallet.id));
    }

    let transaction_type = if signed_amount.is_sign_negative() {
        WalletTransactionType::Debit
    } else {
        WalletTransactionType::Credit
    };

    let entry = wallet_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        wallet_id: Set(wallet.id),
        user_id: Set(user_id),
        amount: Set(signed_amount),
        transaction_type: Set(transaction_type),
        reference_type: Set(reference.reference_type),
        reference_id: Set(reference.reference_id),
        description: Set(reference.description.clone()),
        balance_after: Set(balance_after),
        sequence: Set(next_version),
        created_at: Set(now),
    }
    .insert(conn)
    .await?;

    info!(
        %user_id,
        amount = %signed_amount,
        %balance_after,
        reference = %reference.reference_type,
        "wallet ledger entry recorded"
    );
    Ok(entry)
}

/// Flips `paid → refunded` and credits the payer, inside the caller's transaction.
pub(crate) async fn refund_payment_in<C: ConnectionTrait>(
    conn: &C,
    payment: &payment::Model,
    user_id: Uuid,
) -> Result<wallet_transaction::Model, ServiceError> {
    mark_refunded_in(conn, payment).await?;
    credit_in(
        conn,
        user_id,
        payment.amount,
        &LedgerReference::new(ReferenceType::Payment, payment.id)
            .with_description(format!("refund of payment {}", payment.id)),
    )
    .await
}

/// Status half of a refund: `paid → refunded`, guarded on the current status.
pub(crate) async fn mark_refunded_in<C: ConnectionTrait>(
    conn: &C,
    payment: &payment::Model,
) -> Result<(), ServiceError> {
    if payment.status.transition_to(PaymentStatus::Refunded).is_err() {
        return Err(ServiceError::NotRefundable(format!(
            "payment {} is {:?}",
            payment.id, payment.status
        )));
    }

    let now = Utc::now();
    let flipped = payment::Entity::update_many()
        .set(payment::ActiveModel {
            status: Set(PaymentStatus::Refunded),
            refunded_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(payment::Column::Id.eq(payment.id))
        .filter(payment::Column::Status.eq(PaymentStatus::Paid))
        .exec(conn)
        .await?;
    if flipped.rows_affected == 0 {
        return Err(ServiceError::NotRefundable(format!(
            "payment {} was refunded concurrently",
            payment.id
        )));
    }
    Ok(())
}
