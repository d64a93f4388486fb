use super::StatusTransition;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "deleted")]
    Deleted,
}

impl StatusTransition for CheckoutStatus {
    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (CheckoutStatus::Pending, CheckoutStatus::Completed)
                | (CheckoutStatus::Pending, CheckoutStatus::Deleted)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkout_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: CheckoutStatus,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub final_amount: Decimal,
    pub item_count: i32,
    #[sea_orm(nullable)]
    pub coupon_code: Option<String>,
    pub coupon_applied: bool,
    #[sea_orm(nullable)]
    pub shipping_address_id: Option<Uuid>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::checkout_item::Entity")]
    CheckoutItems,
    #[sea_orm(
        belongs_to = "super::shipping_address::Entity",
        from = "Column::ShippingAddressId",
        to = "super::shipping_address::Column::Id"
    )]
    ShippingAddress,
}

impl Related<super::checkout_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CheckoutItems.def()
    }
}

impl Related<super::shipping_address::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ShippingAddress.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_pending(&self) -> bool {
        self.status == CheckoutStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_reenter_pending() {
        assert!(CheckoutStatus::Pending.can_transition_to(CheckoutStatus::Completed));
        assert!(CheckoutStatus::Pending.can_transition_to(CheckoutStatus::Deleted));
        assert!(CheckoutStatus::Completed
            .transition_to(CheckoutStatus::Pending)
            .is_err());
        assert!(CheckoutStatus::Deleted
            .transition_to(CheckoutStatus::Pending)
            .is_err());
        assert!(CheckoutStatus::Completed
            .transition_to(CheckoutStatus::Deleted)
            .is_err());
    }
}
