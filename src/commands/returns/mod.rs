//! Post-delivery reversal. Every command advances a return exactly one stage
//! and refuses to run from any other stage.

pub mod approve_return_command;
pub mod complete_return_command;
pub mod create_return_command;
pub mod receive_return_command;
pub mod refund_return_command;
pub mod reject_return_command;
pub mod restock_returned_items_command;

pub use approve_return_command::ApproveReturnCommand;
pub use complete_return_command::CompleteReturnCommand;
pub use create_return_command::CreateReturnCommand;
pub use receive_return_command::ReceiveReturnCommand;
pub use refund_return_command::RefundReturnCommand;
pub use reject_return_command::RejectReturnCommand;
pub use restock_returned_items_command::RestockReturnedItemsCommand;

use crate::{
    entities::{return_request, ReturnStage, StatusTransition},
    errors::ServiceError,
};
use chrono::Utc;
use sea_orm::{ColumnTrait, Condition, ConnectionTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

pub(crate) async fn load_return_in<C: ConnectionTrait>(
    conn: &C,
    return_id: Uuid,
) -> Result<return_request::Model, ServiceError> {
    return_request::Entity::find_by_id(return_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("ReturnRequest", return_id))
}

/// Column filters that hold exactly while a row sits in `stage`.
fn stage_condition(stage: ReturnStage) -> Condition {
    use return_request::Column;

    let base = Condition::all().add(Column::RejectedAt.is_null());
    match stage {
        ReturnStage::Requested => base.add(Column::IsApproved.eq(false)),
        ReturnStage::Approved => base
            .add(Column::IsApproved.eq(true))
            .add(Column::OrderReturnedToSellerAt.is_null()),
        ReturnStage::ReturnedToSeller => base
            .add(Column::OrderReturnedToSellerAt.is_not_null())
            .add(Column::IsStockUpdated.eq(false)),
        ReturnStage::Restocked => base
            .add(Column::IsStockUpdated.eq(true))
            .add(Column::RefundInitiated.eq(false)),
        ReturnStage::RefundInitiated => base
            .add(Column::RefundInitiated.eq(true))
            .add(Column::RefundCompletedAt.is_null()),
        ReturnStage::RefundCompleted => base.add(Column::RefundCompletedAt.is_not_null()),
        ReturnStage::Rejected => Condition::all().add(Column::RejectedAt.is_not_null()),
    }
}

/// Moves `current` to `next`, applying `changes` only while the row is still
/// in the stage it was read in. A concurrent advance matches zero rows.
pub(crate) async fn advance_in<C: ConnectionTrait>(
    conn: &C,
    current: &return_request::Model,
    next: ReturnStage,
    mut changes: return_request::ActiveModel,
) -> Result<return_request::Model, ServiceError> {
    let stage = current.stage();
    stage.transition_to(next)?;

    changes.updated_at = Set(Utc::now());
    let result = return_request::Entity::update_many()
        .set(changes)
        .filter(return_request::Column::Id.eq(current.id))
        .filter(stage_condition(stage))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(current.id));
    }
    load_return_in(conn, current.id).await
}
