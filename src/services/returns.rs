use crate::{
    commands::{
        returns::{
            complete_return_command::CompleteReturnResult,
            restock_returned_items_command::RestockReturnedItemsResult, ApproveReturnCommand,
            CompleteReturnCommand, CreateReturnCommand, ReceiveReturnCommand, RefundReturnCommand,
            RejectReturnCommand, RestockReturnedItemsCommand,
        },
        Command,
    },
    db::DbPool,
    entities::{return_request, ReturnStage},
    errors::ServiceError,
    events::EventSender,
};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Service for managing returns
#[derive(Clone)]
pub struct ReturnService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
}

impl ReturnService {
    /// Creates a new return service instance
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Opens a return for a delivered order owned by `user_id`
    #[instrument(skip(self, reason))]
    pub async fn request_return(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<return_request::Model, ServiceError> {
        CreateReturnCommand {
            user_id,
            order_id,
            reason: reason.into(),
        }
        .execute(self.db_pool.clone(), self.event_sender.clone())
        .await
    }

    /// Approves a return
    #[instrument(skip(self))]
    pub async fn approve_return(
        &self,
        return_id: Uuid,
    ) -> Result<return_request::Model, ServiceError> {
        ApproveReturnCommand { return_id }
            .execute(self.db_pool.clone(), self.event_sender.clone())
            .await
    }

    /// Rejects a return
    #[instrument(skip(self, reason))]
    pub async fn reject_return(
        &self,
        return_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<return_request::Model, ServiceError> {
        RejectReturnCommand {
            return_id,
            reason: reason.into(),
        }
        .execute(self.db_pool.clone(), self.event_sender.clone())
        .await
    }

    #[instrument(skip(self))]
    pub async fn mark_returned_to_seller(
        &self,
        return_id: Uuid,
    ) -> Result<return_request::Model, ServiceError> {
        ReceiveReturnCommand { return_id }
            .execute(self.db_pool.clone(), self.event_sender.clone())
            .await
    }

    #[instrument(skip(self))]
    pub async fn restock_returned_items(
        &self,
        return_id: Uuid,
    ) -> Result<RestockReturnedItemsResult, ServiceError> {
        RestockReturnedItemsCommand { return_id }
            .execute(self.db_pool.clone(), self.event_sender.clone())
            .await
    }

    #[instrument(skip(self))]
    pub async fn initiate_refund(
        &self,
        return_id: Uuid,
    ) -> Result<return_request::Model, ServiceError> {
        RefundReturnCommand { return_id }
            .execute(self.db_pool.clone(), self.event_sender.clone())
            .await
    }

    #[instrument(skip(self))]
    pub async fn complete_refund(
        &self,
        return_id: Uuid,
    ) -> Result<CompleteReturnResult, ServiceError> {
        CompleteReturnCommand { return_id }
            .execute(self.db_pool.clone(), self.event_sender.clone())
            .await
    }

    /// Runs every remaining step after approval, starting from wherever the
    /// return currently is. Each step commits on its own, so a failure leaves
    /// the return at the last completed stage and a later call picks up there.
    #[instrument(skip(self))]
    pub async fn process_return_refund(
        &self,
        return_id: Uuid,
    ) -> Result<return_request::Model, ServiceError> {
        let mut current = self.get_return(return_id).await?;
        loop {
            let stage = current.stage();
            current = match stage {
                ReturnStage::Approved => self.mark_returned_to_seller(return_id).await?,
                ReturnStage::ReturnedToSeller => {
                    self.restock_returned_items(return_id).await?.return_request
                }
                ReturnStage::Restocked => self.initiate_refund(return_id).await?,
                ReturnStage::RefundInitiated => {
                    self.complete_refund(return_id).await?.return_request
                }
                ReturnStage::RefundCompleted => {
                    info!(%return_id, "return refund already completed");
                    return Ok(current);
                }
                ReturnStage::Requested | ReturnStage::Rejected => {
                    warn!(%return_id, %stage, "return is not approved");
                    return Err(ServiceError::InvalidTransition(format!(
                        "return {} is {}, not approved",
                        return_id, stage
                    )));
                }
            };
        }
    }

    pub async fn get_return(&self, return_id: Uuid) -> Result<return_request::Model, ServiceError> {
        crate::commands::returns::load_return_in(&*self.db_pool, return_id).await
    }

    /// Returns opened by `user_id`, newest first
    pub async fn list_returns(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<return_request::Model>, ServiceError> {
        Ok(return_request::Entity::find()
            .filter(return_request::Column::UserId.eq(user_id))
            .order_by_desc(return_request::Column::RequestedDate)
            .all(&*self.db_pool)
            .await?)
    }
}
