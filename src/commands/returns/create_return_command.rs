use crate::{
    commands::Command,
    db::DbPool,
    entities::{return_request, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders,
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Opens a return for a delivered order. One request per order.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateReturnCommand {
    pub user_id: Uuid,
    pub order_id: Uuid,
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
}

#[async_trait::async_trait]
impl Command for CreateReturnCommand {
    type Result = return_request::Model;

    #[instrument(skip(self, db_pool, event_sender), fields(order_id = %self.order_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        self.validate()?;

        let txn = db_pool.begin().await?;
        let created = self.create_return(&txn).await.map_err(|e| {
            error!(error = %e, "failed to create return request");
            e
        })?;
        txn.commit().await?;

        counter!("storefront.returns.requested", 1);
        self.log_and_trigger_event(&event_sender, &created).await;
        Ok(created)
    }
}

impl CreateReturnCommand {
    async fn create_return<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<return_request::Model, ServiceError> {
        let order = orders::load_owned_in(conn, self.user_id, self.order_id).await?;

        if order.order_status == OrderStatus::Cancelled {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} was cancelled",
                order.id
            )));
        }
        if !order.is_delivered() {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} has not been delivered",
                order.id
            )));
        }

        let existing = return_request::Entity::find()
            .filter(return_request::Column::OrderId.eq(order.id))
            .one(conn)
            .await?;
        if let Some(existing) = existing {
            return Err(ServiceError::Conflict(format!(
                "order {} already has return {}",
                order.id, existing.id
            )));
        }

        let now = Utc::now();
        Ok(return_request::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            user_id: Set(self.user_id),
            reason: Set(self.reason.trim().to_string()),
            is_approved: Set(false),
            requested_date: Set(now),
            approved_at: Set(None),
            rejected_at: Set(None),
            rejection_reason: Set(None),
            order_returned_to_seller_at: Set(None),
            is_stock_updated: Set(false),
            refund_initiated: Set(false),
            refund_amount: Set(None),
            refund_completed_at: Set(None),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?)
    }

    async fn log_and_trigger_event(&self, event_sender: &EventSender, created: &return_request::Model) {
        info!(return_id = %created.id, order_id = %self.order_id, "Return requested");
        event_sender
            .send_or_log(Event::ReturnRequested {
                return_id: created.id,
                order_id: self.order_id,
            })
            .await;
    }
}
