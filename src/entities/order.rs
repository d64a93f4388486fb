use super::{payment::PaymentMethod, StatusTransition};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "confirmed")]
    Confirmed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "returned")]
    Returned,
}

impl StatusTransition for OrderStatus {
    fn can_transition_to(self, next: Self) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Returned)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
}

impl StatusTransition for DeliveryStatus {
    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (DeliveryStatus::Pending, DeliveryStatus::Shipped)
                | (DeliveryStatus::Shipped, DeliveryStatus::Delivered)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    #[sea_orm(string_value = "none")]
    NotRequested,
    #[sea_orm(string_value = "initiated")]
    Initiated,
    #[sea_orm(string_value = "completed")]
    Completed,
}

impl StatusTransition for RefundStatus {
    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (RefundStatus::NotRequested, RefundStatus::Initiated)
                | (RefundStatus::NotRequested, RefundStatus::Completed)
                | (RefundStatus::Initiated, RefundStatus::Completed)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    #[sea_orm(unique)]
    pub checkout_session_id: Uuid,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub final_amount: Decimal,
    #[sea_orm(nullable)]
    pub coupon_code: Option<String>,
    pub payment_method: PaymentMethod,
    pub order_status: OrderStatus,
    pub delivery_status: DeliveryStatus,
    pub refund_status: RefundStatus,
    pub shipping_address_id: Uuid,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(has_many = "super::payment::Entity")]
    Payments,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Cancellable by the customer until it leaves the warehouse.
    pub fn is_cancellable(&self) -> bool {
        self.order_status.can_transition_to(OrderStatus::Cancelled)
            && self.delivery_status == DeliveryStatus::Pending
    }

    pub fn is_delivered(&self) -> bool {
        self.delivery_status == DeliveryStatus::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_transition_table() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Confirmed));
        assert!(OrderStatus::Confirmed.can_transition_to(OrderStatus::Returned));
        assert!(OrderStatus::Cancelled
            .transition_to(OrderStatus::Confirmed)
            .is_err());
        assert!(OrderStatus::Pending
            .transition_to(OrderStatus::Returned)
            .is_err());
    }

    #[test]
    fn delivery_cannot_skip_shipping() {
        assert!(DeliveryStatus::Pending
            .transition_to(DeliveryStatus::Delivered)
            .is_err());
        assert_eq!(
            DeliveryStatus::Shipped
                .transition_to(DeliveryStatus::Delivered)
                .unwrap(),
            DeliveryStatus::Delivered
        );
    }
}
