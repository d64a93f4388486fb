use crate::{
    commands::{
        returns::{advance_in, load_return_in},
        Command,
    },
    db::DbPool,
    entities::{order, return_request, RefundStatus, ReturnStage, StatusTransition},
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders,
};
use sea_orm::{ConnectionTrait, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Fixes the refund amount at the order's final amount and marks the order's
/// refund as initiated. Money moves in [`super::CompleteReturnCommand`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundReturnCommand {
    pub return_id: Uuid,
}

#[async_trait::async_trait]
impl Command for RefundReturnCommand {
    type Result = return_request::Model;

    #[instrument(skip(self, db_pool, event_sender), fields(return_id = %self.return_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        let txn = db_pool.begin().await?;
        let initiated = self.initiate_refund(&txn).await?;
        txn.commit().await?;

        let amount = initiated.refund_amount.unwrap_or_default();
        info!(return_id = %self.return_id, %amount, "Return refund initiated");
        event_sender
            .send_or_log(Event::RefundInitiated {
                return_id: self.return_id,
                amount,
            })
            .await;
        Ok(initiated)
    }
}

impl RefundReturnCommand {
    async fn initiate_refund<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<return_request::Model, ServiceError> {
        let current = load_return_in(conn, self.return_id).await?;
        let order = orders::load_in(conn, current.order_id).await?;
        let refund_status = order.refund_status.transition_to(RefundStatus::Initiated)?;

        let initiated = advance_in(
            conn,
            &current,
            ReturnStage::RefundInitiated,
            return_request::ActiveModel {
                refund_initiated: Set(true),
                refund_amount: Set(Some(order.final_amount)),
                ..Default::default()
            },
        )
        .await?;

        orders::update_guarded_in(
            conn,
            &order,
            order::ActiveModel {
                refund_status: Set(refund_status),
                ..Default::default()
            },
        )
        .await?;
        Ok(initiated)
    }
}
