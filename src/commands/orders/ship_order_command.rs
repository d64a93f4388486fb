use crate::{
    commands::Command,
    db::DbPool,
    entities::{order, DeliveryStatus, OrderStatus, StatusTransition},
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders,
};
use metrics::counter;
use sea_orm::{Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipOrderCommand {
    pub order_id: Uuid,
}

#[async_trait::async_trait]
impl Command for ShipOrderCommand {
    type Result = order::Model;

    #[instrument(skip(self, db_pool, event_sender), fields(order_id = %self.order_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        let txn = db_pool.begin().await?;
        let shipped = self.ship_order(&txn).await.map_err(|e| {
            error!(error = %e, "failed to ship order");
            e
        })?;
        txn.commit().await?;

        counter!("storefront.orders.shipped", 1);
        self.log_and_trigger_event(&event_sender).await;
        Ok(shipped)
    }
}

impl ShipOrderCommand {
    async fn ship_order<C: sea_orm::ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<order::Model, ServiceError> {
        let order = orders::load_in(conn, self.order_id).await?;

        // Only orders that are paid for (or cash on delivery) leave the warehouse.
        if order.order_status != OrderStatus::Confirmed {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} is {:?}, not confirmed",
                order.id, order.order_status
            )));
        }
        let delivery = order.delivery_status.transition_to(DeliveryStatus::Shipped)?;

        orders::update_guarded_in(
            conn,
            &order,
            order::ActiveModel {
                delivery_status: Set(delivery),
                ..Default::default()
            },
        )
        .await
    }

    async fn log_and_trigger_event(&self, event_sender: &EventSender) {
        info!(order_id = %self.order_id, "Order shipped");
        event_sender
            .send_or_log(Event::OrderShipped(self.order_id))
            .await;
    }
}
