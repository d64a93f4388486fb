use crate::{
    commands::Command,
    db::DbPool,
    entities::{
        order, payment, DeliveryStatus, PaymentMethod, PaymentStatus, StatusTransition,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders,
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverOrderCommand {
    pub order_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverOrderResult {
    pub order: order::Model,
    /// Set when the delivery collected a cash-on-delivery payment.
    pub collected_payment: Option<Uuid>,
}

#[async_trait::async_trait]
impl Command for DeliverOrderCommand {
    type Result = DeliverOrderResult;

    #[instrument(skip(self, db_pool, event_sender), fields(order_id = %self.order_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        let txn = db_pool.begin().await?;
        let result = self.deliver_order(&txn).await.map_err(|e| {
            error!(error = %e, "failed to deliver order");
            e
        })?;
        txn.commit().await?;

        counter!("storefront.orders.delivered", 1);
        self.log_and_trigger_event(&event_sender, &result).await;
        Ok(result)
    }
}

impl DeliverOrderCommand {
    async fn deliver_order<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<DeliverOrderResult, ServiceError> {
        let order = orders::load_in(conn, self.order_id).await?;
        let delivery = order.delivery_status.transition_to(DeliveryStatus::Delivered)?;

        let mut collected_payment = None;
        if order.payment_method == PaymentMethod::CashOnDelivery {
            let now = Utc::now();
            for payment in orders::payments_for_in(conn, order.id).await? {
                if payment.status != PaymentStatus::Created {
                    continue;
                }
                payment.status.transition_to(PaymentStatus::Paid)?;
                let flipped = payment::Entity::update_many()
                    .set(payment::ActiveModel {
                        status: Set(PaymentStatus::Paid),
                        paid_at: Set(Some(now)),
                        updated_at: Set(now),
                        ..Default::default()
                    })
                    .filter(payment::Column::Id.eq(payment.id))
                    .filter(payment::Column::Status.eq(PaymentStatus::Created))
                    .exec(conn)
                    .await?;
                if flipped.rows_affected == 0 {
                    return Err(ServiceError::ConcurrentModification(payment.id));
                }
                collected_payment = Some(payment.id);
            }
        }

        let order = orders::update_guarded_in(
            conn,
            &order,
            order::ActiveModel {
                delivery_status: Set(delivery),
                ..Default::default()
            },
        )
        .await?;

        Ok(DeliverOrderResult {
            order,
            collected_payment,
        })
    }

    async fn log_and_trigger_event(&self, event_sender: &EventSender, result: &DeliverOrderResult) {
        info!(
            order_id = %self.order_id,
            collected_payment = ?result.collected_payment,
            "Order delivered"
        );
        if let Some(payment_id) = result.collected_payment {
            event_sender
                .send_or_log(Event::PaymentVerified {
                    payment_id,
                    order_id: self.order_id,
                })
                .await;
        }
        event_sender
            .send_or_log(Event::OrderDelivered(self.order_id))
            .await;
    }
}
