use crate::{
    commands::{
        returns::{advance_in, load_return_in},
        Command,
    },
    db::DbPool,
    entities::{
        order, payment, return_request, wallet_transaction, OrderStatus, PaymentStatus,
        ReferenceType, RefundStatus, ReturnStage, StatusTransition,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        orders,
        wallet::{self, LedgerReference},
    },
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Credits the refund to the customer's wallet and closes out the order.
///
/// The wallet credit, the payment flip to `refunded`, the order's move to
/// `returned` and the return's completion timestamp commit together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteReturnCommand {
    pub return_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteReturnResult {
    pub return_request: return_request::Model,
    pub order: order::Model,
    pub wallet_entry: wallet_transaction::Model,
    pub refunded_payment: Uuid,
}

#[async_trait::async_trait]
impl Command for CompleteReturnCommand {
    type Result = CompleteReturnResult;

    #[instrument(skip(self, db_pool, event_sender), fields(return_id = %self.return_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        let txn = db_pool.begin().await?;
        let result = self.complete_refund(&txn).await.map_err(|e| {
            error!(error = %e, "failed to complete return refund");
            e
        })?;
        txn.commit().await?;

        counter!("storefront.refunds.completed", 1, "source" => "return");
        self.log_and_trigger_event(&event_sender, &result).await;
        Ok(result)
    }
}

impl CompleteReturnCommand {
    async fn complete_refund<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<CompleteReturnResult, ServiceError> {
        let current = load_return_in(conn, self.return_id).await?;
        let order = orders::load_in(conn, current.order_id).await?;
        let amount = current.refund_amount.unwrap_or(order.final_amount);

        let paid = orders::payments_for_in(conn, order.id)
            .await?
            .into_iter()
            .find(|p| p.status == PaymentStatus::Paid)
            .ok_or_else(|| {
                ServiceError::NotRefundable(format!("order {} has no paid payment", order.id))
            })?;

        let now = Utc::now();
        let completed = advance_in(
            conn,
            &current,
            ReturnStage::RefundCompleted,
            return_request::ActiveModel {
                refund_completed_at: Set(Some(now)),
                ..Default::default()
            },
        )
        .await?;

        let flipped = payment::Entity::update_many()
            .set(payment::ActiveModel {
                status: Set(paid.status.transition_to(PaymentStatus::Refunded)?),
                refunded_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(payment::Column::Id.eq(paid.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Paid))
            .exec(conn)
            .await?;
        if flipped.rows_affected == 0 {
            return Err(ServiceError::NotRefundable(format!(
                "payment {} was refunded concurrently",
                paid.id
            )));
        }

        let wallet_entry = wallet::credit_in(
            conn,
            current.user_id,
            amount,
            &LedgerReference::new(ReferenceType::Return, current.id)
                .with_description(format!("refund for return of order {}", order.id)),
        )
        .await?;

        let order = orders::update_guarded_in(
            conn,
            &order,
            order::ActiveModel {
                order_status: Set(order.order_status.transition_to(OrderStatus::Returned)?),
                refund_status: Set(order.refund_status.transition_to(RefundStatus::Completed)?),
                ..Default::default()
            },
        )
        .await?;

        Ok(CompleteReturnResult {
            return_request: completed,
            order,
            wallet_entry,
            refunded_payment: paid.id,
        })
    }

    async fn log_and_trigger_event(&self, event_sender: &EventSender, result: &CompleteReturnResult) {
        let timestamp = result
            .return_request
            .refund_completed_at
            .unwrap_or_else(Utc::now);
        info!(
            return_id = %self.return_id,
            amount = %result.wallet_entry.amount,
            balance_after = %result.wallet_entry.balance_after,
            "Return refund completed"
        );
        event_sender
            .send_or_log(Event::PaymentRefunded(result.refunded_payment))
            .await;
        event_sender
            .send_or_log(wallet::credited_event(&result.wallet_entry))
            .await;
        event_sender
            .send_or_log(Event::RefundCompleted {
                return_id: self.return_id,
                amount: result.wallet_entry.amount,
                timestamp,
            })
            .await;
    }
}
