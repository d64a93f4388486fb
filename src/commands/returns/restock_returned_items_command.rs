use crate::{
    commands::{
        returns::{advance_in, load_return_in},
        Command,
    },
    db::DbPool,
    entities::{return_request, ReturnStage},
    errors::ServiceError,
    events::{Event, EventSender},
    services::inventory,
};
use metrics::counter;
use sea_orm::{Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestockReturnedItemsCommand {
    pub return_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestockReturnedItemsResult {
    pub return_request: return_request::Model,
    pub units_restocked: i32,
}

#[async_trait::async_trait]
impl Command for RestockReturnedItemsCommand {
    type Result = RestockReturnedItemsResult;

    #[instrument(skip(self, db_pool, event_sender), fields(return_id = %self.return_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self::Result, ServiceError> {
        let txn = db_pool.begin().await?;
        let result = self.restock(&txn).await.map_err(|e| {
            error!(error = %e, "failed to restock returned items");
            e
        })?;
        txn.commit().await?;

        counter!("storefront.returns.units_restocked", result.units_restocked as u64);
        info!(
            return_id = %self.return_id,
            units = result.units_restocked,
            "Returned items restocked"
        );
        event_sender
            .send_or_log(Event::ReturnRestocked(self.return_id))
            .await;
        Ok(result)
    }
}

impl RestockReturnedItemsCommand {
    async fn restock<C: sea_orm::ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<RestockReturnedItemsResult, ServiceError> {
        let current = load_return_in(conn, self.return_id).await?;

        // Flag first: the stage guard makes a second restock match zero rows
        // before any stock moves.
        let restocked = advance_in(
            conn,
            &current,
            ReturnStage::Restocked,
            return_request::ActiveModel {
                is_stock_updated: Set(true),
                ..Default::default()
            },
        )
        .await?;
        let units_restocked = inventory::restock_order_in(conn, current.order_id).await?;

        Ok(RestockReturnedItemsResult {
            return_request: restocked,
            units_restocked,
        })
    }
}
