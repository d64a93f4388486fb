use crate::{
    commands::{
        returns::{advance_in, load_return_in},
        Command,
    },
    db::DbPool,
    entities::{return_request, ReturnStage},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use sea_orm::{Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Records that the parcel physically arrived back at the seller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveReturnCommand {
    pub return_id: Uuid,
}

#[async_trait::async_trait]
impl Command for ReceiveReturnCommand {
    type Result = return_request::Model;

    #[instrument(skip(self, db_pool, event_sender), fields(return_id = %self.return_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        let txn = db_pool.begin().await?;
        let current = load_return_in(&txn, self.return_id).await?;
        let received = advance_in(
            &txn,
            &current,
            ReturnStage::ReturnedToSeller,
            return_request::ActiveModel {
                order_returned_to_seller_at: Set(Some(Utc::now())),
                ..Default::default()
            },
        )
        .await?;
        txn.commit().await?;

        info!(return_id = %self.return_id, "Returned goods received by seller");
        event_sender
            .send_or_log(Event::ReturnReceived(self.return_id))
            .await;
        Ok(received)
    }
}
