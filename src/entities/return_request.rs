use super::StatusTransition;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a return sits in the reversal pipeline, derived from the row's
/// timestamps and flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReturnStage {
    Requested,
    Approved,
    Rejected,
    ReturnedToSeller,
    Restocked,
    RefundInitiated,
    RefundCompleted,
}

impl StatusTransition for ReturnStage {
    fn can_transition_to(self, next: Self) -> bool {
        use ReturnStage::*;
        matches!(
            (self, next),
            (Requested, Approved)
                | (Requested, Rejected)
                | (Approved, ReturnedToSeller)
                | (ReturnedToSeller, Restocked)
                | (Restocked, RefundInitiated)
                | (RefundInitiated, RefundCompleted)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "return_requests")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub reason: String,
    pub is_approved: bool,
    pub requested_date: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub approved_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub rejected_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub rejection_reason: Option<String>,
    #[sea_orm(nullable)]
    pub order_returned_to_seller_at: Option<DateTime<Utc>>,
    pub is_stock_updated: bool,
    pub refund_initiated: bool,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub refund_amount: Option<Decimal>,
    #[sea_orm(nullable)]
    pub refund_completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn stage(&self) -> ReturnStage {
        if self.rejected_at.is_some() {
            ReturnStage::Rejected
        } else if self.refund_completed_at.is_some() {
            ReturnStage::RefundCompleted
        } else if self.refund_initiated {
            ReturnStage::RefundInitiated
        } else if self.is_stock_updated {
            ReturnStage::Restocked
        } else if self.order_returned_to_seller_at.is_some() {
            ReturnStage::ReturnedToSeller
        } else if self.is_approved {
            ReturnStage::Approved
        } else {
            ReturnStage::Requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requested() -> Model {
        let now = Utc::now();
        Model {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            reason: "damaged".into(),
            is_approved: false,
            requested_date: now,
            approved_at: None,
            rejected_at: None,
            rejection_reason: None,
            order_returned_to_seller_at: None,
            is_stock_updated: false,
            refund_initiated: false,
            refund_amount: None,
            refund_completed_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn stage_follows_the_pipeline() {
        let mut ret = requested();
        assert_eq!(ret.stage(), ReturnStage::Requested);

        ret.is_approved = true;
        ret.approved_at = Some(Utc::now());
        assert_eq!(ret.stage(), ReturnStage::Approved);

        ret.order_returned_to_seller_at = Some(Utc::now());
        assert_eq!(ret.stage(), ReturnStage::ReturnedToSeller);

        ret.is_stock_updated = true;
        assert_eq!(ret.stage(), ReturnStage::Restocked);

        ret.refund_initiated = true;
        assert_eq!(ret.stage(), ReturnStage::RefundInitiated);

        ret.refund_completed_at = Some(Utc::now());
        assert_eq!(ret.stage(), ReturnStage::RefundCompleted);
    }

    #[test]
    fn rejected_is_terminal() {
        let mut ret = requested();
        ret.rejected_at = Some(Utc::now());
        assert_eq!(ret.stage(), ReturnStage::Rejected);
        assert!(ret.stage().transition_to(ReturnStage::Approved).is_err());
    }

    #[test]
    fn stages_cannot_be_skipped() {
        assert!(ReturnStage::Approved
            .transition_to(ReturnStage::Restocked)
            .is_err());
        assert!(ReturnStage::Requested
            .transition_to(ReturnStage::ReturnedToSeller)
            .is_err());
    }
}
