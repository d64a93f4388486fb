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
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveReturnCommand {
    pub return_id: Uuid,
}

#[async_trait::async_trait]
impl Command for ApproveReturnCommand {
    type Result = return_request::Model;

    #[instrument(skip(self, db_pool, event_sender), fields(return_id = %self.return_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        let txn = db_pool.begin().await?;
        let current = load_return_in(&txn, self.return_id).await?;
        let approved = advance_in(
            &txn,
            &current,
            ReturnStage::Approved,
            return_request::ActiveModel {
                is_approved: Set(true),
                approved_at: Set(Some(Utc::now())),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| {
            error!(error = %e, "failed to approve return");
            e
        })?;
        txn.commit().await?;

        self.log_and_trigger_event(&event_sender).await;
        Ok(approved)
    }
}

impl ApproveReturnCommand {
    async fn log_and_trigger_event(&self, event_sender: &EventSender) {
        info!(return_id = %self.return_id, "Return request approved");
        event_sender
            .send_or_log(Event::ReturnApproved(self.return_id))
            .await;
    }
}
