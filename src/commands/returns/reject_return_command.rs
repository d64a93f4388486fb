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
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RejectReturnCommand {
    pub return_id: Uuid,
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
}

#[async_trait::async_trait]
impl Command for RejectReturnCommand {
    type Result = return_request::Model;

    #[instrument(skip(self, db_pool, event_sender), fields(return_id = %self.return_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        self.validate()?;

        let txn = db_pool.begin().await?;
        let current = load_return_in(&txn, self.return_id).await?;
        let rejected = advance_in(
            &txn,
            &current,
            ReturnStage::Rejected,
            return_request::ActiveModel {
                rejected_at: Set(Some(Utc::now())),
                rejection_reason: Set(Some(self.reason.clone())),
                ..Default::default()
            },
        )
        .await?;
        txn.commit().await?;

        info!(return_id = %self.return_id, reason = %self.reason, "Return request rejected");
        event_sender
            .send_or_log(Event::ReturnRejected(self.return_id))
            .await;
        Ok(rejected)
    }
}
