use crate::{
    commands::{
        orders::{
            cancel_order_command::CancelOrderResult, deliver_order_command::DeliverOrderResult,
            CancelOrderCommand, DeliverOrderCommand, ShipOrderCommand,
        },
        Command,
    },
    config::PaymentGatewayConfig,
    entities::{
        cart_item, checkout_item, order, order_item, payment, DeliveryStatus, OrderStatus,
        PaymentMethod, PaymentStatus, ReferenceType, RefundStatus, StatusTransition,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{checkout, coupons, inventory, wallet},
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// An order with its frozen lines and payment attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payments: Vec<payment::Model>,
}

/// Converts a pending checkout session into an order.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    currency: String,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        payment_config: &PaymentGatewayConfig,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            currency: payment_config.currency.clone(),
        }
    }

    /// All-or-nothing: stock, order rows, session completion, cart clearing
    /// and any wallet debit commit together or not at all.
    #[instrument(skip(self))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        payment_method: PaymentMethod,
    ) -> Result<OrderDetails, ServiceError> {
        let result = self
            .create_order_inner(user_id, session_id, payment_method)
            .await;

        match result {
            Ok((details, wallet_entry)) => {
                metrics::counter!(
                    "storefront.orders.created",
                    1,
                    "payment_method" => payment_method.to_string()
                );
                info!(
                    order_id = %details.order.id,
                    %session_id,
                    final_amount = %details.order.final_amount,
                    "order created"
                );

                self.event_sender
                    .send_or_log(Event::OrderCreated {
                        order_id: details.order.id,
                        session_id,
                        payment_method,
                        final_amount: details.order.final_amount,
                    })
                    .await;
                if let Some(entry) = wallet_entry {
                    self.event_sender
                        .send_or_log(wallet::debited_event(&entry))
                        .await;
                }
                if details.order.order_status == OrderStatus::Confirmed {
                    self.event_sender
                        .send_or_log(Event::OrderConfirmed(details.order.id))
                        .await;
                }
                Ok(details)
            }
            Err(e) => {
                metrics::counter!("storefront.orders.failed", 1);
                error!(%session_id, error = %e, "order creation rolled back");
                Err(e)
            }
        }
    }

    async fn create_order_inner(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        payment_method: PaymentMethod,
    ) -> Result<(OrderDetails, Option<crate::entities::wallet_transaction::Model>), ServiceError>
    {
        let txn = self.db_pool.begin().await?;

        // 1. Session must be pending, owned, addressed and non-empty
        let session = checkout::load_owned_in(&txn, user_id, session_id).await?;
        checkout::ensure_pending(&session)?;
        let shipping_address_id = session.shipping_address_id.ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "checkout session {} has no shipping address",
                session_id
            ))
        })?;
        let items = checkout::items_in(&txn, session.id).await?;
        if items.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "checkout session {} has no items",
                session_id
            )));
        }

        // Coupon may have been deactivated or expired since it was applied
        let totals = checkout::calculate_totals(&items, None);
        if let (Some(code), true) = (&session.coupon_code, session.coupon_applied) {
            let coupon = coupons::find_usable_in(&txn, code).await?;
            coupons::evaluate(&coupon, totals.total_amount, Utc::now())?;
        }

        // 2-3. Check all lines first, then apply guarded decrements
        inventory::ensure_available_in(&txn, &items).await?;
        for item in &items {
            inventory::decrement_in(&txn, item.product_id, item.quantity).await?;
        }

        // 4. Order and lines at the frozen checkout prices
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let created = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id),
            checkout_session_id: Set(session.id),
            total_amount: Set(session.total_amount),
            discount_amount: Set(session.discount_amount),
            final_amount: Set(session.final_amount),
            coupon_code: Set(session.coupon_code.clone().filter(|_| session.coupon_applied)),
            payment_method: Set(payment_method),
            order_status: Set(OrderStatus::Pending),
            delivery_status: Set(DeliveryStatus::Pending),
            refund_status: Set(RefundStatus::NotRequested),
            shipping_address_id: Set(shipping_address_id),
            version: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut order_items = Vec::with_capacity(items.len());
        for item in &items {
            order_items.push(freeze_line(&txn, order_id, item).await?);
        }

        // 5. Complete the session and clear the cart lines it was built from;
        // lines added after the snapshot stay in the cart
        checkout::complete_in(&txn, &session).await?;
        cart_item::Entity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .filter(cart_item::Column::ProductId.is_in(items.iter().map(|i| i.product_id)))
            .exec(&txn)
            .await?;

        let mut wallet_entry = None;
        let mut payments = Vec::new();
        let mut placed = created;
        match payment_method {
            PaymentMethod::CashOnDelivery => {
                payments.push(
                    insert_payment_in(&txn, &placed, &self.currency, PaymentStatus::Created).await?,
                );
                placed = confirm_in(&txn, &placed).await?;
            }
            PaymentMethod::Wallet => {
                // A fully discounted order settles without touching the ledger
                if !placed.final_amount.is_zero() {
                    let entry = wallet::debit_in(
                        &txn,
                        user_id,
                        placed.final_amount,
                        &wallet::LedgerReference::new(ReferenceType::Order, order_id)
                            .with_description(format!("payment for order {}", order_id)),
                    )
                    .await?;
                    wallet_entry = Some(entry);
                }
                payments.push(
                    insert_payment_in(&txn, &placed, &self.currency, PaymentStatus::Paid).await?,
                );
                placed = confirm_in(&txn, &placed).await?;
            }
            // Stays pending until the gateway callback verifies
            PaymentMethod::Online => {}
        }

        txn.commit().await?;

        Ok((
            OrderDetails {
                order: placed,
                items: order_items,
                payments,
            },
            wallet_entry,
        ))
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, user_id: Uuid, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = load_owned_in(&*self.db_pool, user_id, order_id).await?;
        details_in(&*self.db_pool, order).await
    }

    pub async fn list_orders(&self, user_id: Uuid) -> Result<Vec<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    /// Confirmed orders only; delivery moves pending -> shipped.
    pub async fn ship_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        ShipOrderCommand { order_id }
            .execute(self.db_pool.clone(), self.event_sender.clone())
            .await
    }

    /// Collects a cash-on-delivery payment as part of the hand-over.
    pub async fn deliver_order(&self, order_id: Uuid) -> Result<DeliverOrderResult, ServiceError> {
        DeliverOrderCommand { order_id }
            .execute(self.db_pool.clone(), self.event_sender.clone())
            .await
    }

    pub async fn cancel_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<CancelOrderResult, ServiceError> {
        CancelOrderCommand {
            user_id,
            order_id,
            reason: reason.into(),
        }
        .execute(self.db_pool.clone(), self.event_sender.clone())
        .await
    }
}

async fn freeze_line<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    item: &checkout_item::Model,
) -> Result<order_item::Model, ServiceError> {
    Ok(order_item::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        product_id: Set(item.product_id),
        quantity: Set(item.quantity),
        unit_price: Set(item.unit_price),
        subtotal: Set(item.subtotal),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?)
}

async fn insert_payment_in<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
    currency: &str,
    status: PaymentStatus,
) -> Result<payment::Model, ServiceError> {
    let now = Utc::now();
    Ok(payment::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        amount: Set(order.final_amount),
        currency: Set(currency.to_string()),
        payment_method: Set(order.payment_method),
        status: Set(status),
        gateway_order_id: Set(None),
        gateway_payment_id: Set(None),
        gateway_signature: Set(None),
        expires_at: Set(None),
        paid_at: Set((status == PaymentStatus::Paid).then_some(now)),
        refunded_at: Set(None),
        failure_reason: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?)
}

pub(crate) async fn load_owned_in<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    let order = load_in(conn, order_id).await?;
    if order.user_id != user_id {
        return Err(ServiceError::Unauthorized(format!(
            "order {} belongs to another user",
            order_id
        )));
    }
    Ok(order)
}

pub(crate) async fn load_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Order", order_id))
}

pub(crate) async fn details_in<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
) -> Result<OrderDetails, ServiceError> {
    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order.id))
        .order_by_asc(order_item::Column::CreatedAt)
        .all(conn)
        .await?;
    let payments = payments_for_in(conn, order.id).await?;
    Ok(OrderDetails {
        order,
        items,
        payments,
    })
}

pub(crate) async fn payments_for_in<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<payment::Model>, ServiceError> {
    Ok(payment::Entity::find()
        .filter(payment::Column::OrderId.eq(order_id))
        .order_by_asc(payment::Column::CreatedAt)
        .all(conn)
        .await?)
}

/// Applies `changes` only if the row still carries `current.version`.
pub(crate) async fn update_guarded_in<C: ConnectionTrait>(
    conn: &C,
    current: &order::Model,
    mut changes: order::ActiveModel,
) -> Result<order::Model, ServiceError> {
    changes.version = Set(current.version + 1);
    changes.updated_at = Set(Utc::now());

    let result = order::Entity::update_many()
        .set(changes)
        .filter(order::Column::Id.eq(current.id))
        .filter(order::Column::Version.eq(current.version))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(current.id));
    }
    load_in(conn, current.id).await
}

pub(crate) async fn confirm_in<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
) -> Result<order::Model, ServiceError> {
    let status = order.order_status.transition_to(OrderStatus::Confirmed)?;
    update_guarded_in(
        conn,
        order,
        order::ActiveModel {
            order_status: Set(status),
            ..Default::default()
        },
    )
    .await
}

/// Restocks, cancels, and settles the order's payments inside the caller's
/// transaction: a paid payment is refunded to the wallet, a created one fails.
/// Returns the cancelled order and the wallet entry if a refund happened.
pub(crate) async fn cancel_in<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
    reason: &str,
) -> Result<(order::Model, Option<crate::entities::wallet_transaction::Model>), ServiceError> {
    let status = order.order_status.transition_to(OrderStatus::Cancelled)?;
    if order.delivery_status != DeliveryStatus::Pending {
        return Err(ServiceError::InvalidTransition(format!(
            "order {} already left the warehouse",
            order.id
        )));
    }

    inventory::restock_order_in(conn, order.id).await?;

    let mut refund_entry = None;
    let mut refunded = false;
    let now = Utc::now();
    for payment in payments_for_in(conn, order.id).await? {
        match payment.status {
            // Nothing to credit back for a fully discounted order
            PaymentStatus::Paid if payment.amount.is_zero() => {
                wallet::mark_refunded_in(conn, &payment).await?;
                refunded = true;
            }
            PaymentStatus::Paid => {
                refund_entry = Some(wallet::refund_payment_in(conn, &payment, order.user_id).await?);
                refunded = true;
            }
            PaymentStatus::Created => {
                payment::Entity::update_many()
                    .set(payment::ActiveModel {
                        status: Set(PaymentStatus::Failed),
                        failure_reason: Set(Some(reason.to_string())),
                        updated_at: Set(now),
                        ..Default::default()
                    })
                    .filter(payment::Column::Id.eq(payment.id))
                    .filter(payment::Column::Status.eq(PaymentStatus::Created))
                    .exec(conn)
                    .await?;
            }
            PaymentStatus::Failed | PaymentStatus::Refunded => {}
        }
    }

    let mut changes = order::ActiveModel {
        order_status: Set(status),
        ..Default::default()
    };
    if refunded {
        changes.refund_status = Set(order.refund_status.transition_to(RefundStatus::Completed)?);
    }
    let cancelled = update_guarded_in(conn, order, changes).await?;
    Ok((cancelled, refund_entry))
}
