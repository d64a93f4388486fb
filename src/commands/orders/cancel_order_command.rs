use crate::{
    commands::Command,
    db::DbPool,
    entities::{order, wallet_transaction},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{orders, wallet},
};
use metrics::counter;
use sea_orm::TransactionTrait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CancelOrderCommand {
    pub user_id: Uuid,
    pub order_id: Uuid,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrderResult {
    pub order: order::Model,
    pub refund: Option<wallet_transaction::Model>,
}

#[async_trait::async_trait]
impl Command for CancelOrderCommand {
    type Result = CancelOrderResult;

    #[instrument(skip(self, db_pool, event_sender), fields(order_id = %self.order_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        self.validate()?;

        let txn = db_pool.begin().await?;
        let order = orders::load_owned_in(&txn, self.user_id, self.order_id).await?;
        let (order, refund) = orders::cancel_in(&txn, &order, &self.reason)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to cancel order");
                e
            })?;
        txn.commit().await?;

        counter!("storefront.orders.cancelled", 1, "source" => "customer");
        let result = CancelOrderResult { order, refund };
        self.log_and_trigger_event(&event_sender, &result).await;
        Ok(result)
    }
}

impl CancelOrderCommand {
    async fn log_and_trigger_event(&self, event_sender: &EventSender, result: &CancelOrderResult) {
        info!(
            order_id = %self.order_id,
            refunded = result.refund.is_some(),
            "Order cancelled"
        );
        event_sender
            .send_or_log(Event::OrderCancelled {
                order_id: self.order_id,
                reason: self.reason.clone(),
            })
            .await;
        if let Some(entry) = &result.refund {
            if let Some(payment_id) = entry.reference_id {
                event_sender
                    .send_or_log(Event::PaymentRefunded(payment_id))
                    .await;
            }
            event_sender.send_or_log(wallet::credited_event(entry)).await;
        }
    }
}
