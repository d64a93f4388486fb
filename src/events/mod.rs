use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{PaymentMethod, ReferenceType};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender and the receiver to hand to [`process_events`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends after a commit. The write already happened, so a closed channel
    /// is logged rather than surfaced to the caller.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "dropping domain event");
        }
    }
}

/// Domain events emitted after the owning transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Checkout events
    CheckoutStarted {
        session_id: Uuid,
        user_id: Uuid,
        item_count: i32,
    },
    CheckoutAbandoned(Uuid),
    CouponApplied {
        session_id: Uuid,
        code: String,
        discount_amount: Decimal,
    },
    CouponRemoved(Uuid),

    // Order events
    OrderCreated {
        order_id: Uuid,
        session_id: Uuid,
        payment_method: PaymentMethod,
        final_amount: Decimal,
    },
    OrderConfirmed(Uuid),
    OrderShipped(Uuid),
    OrderDelivered(Uuid),
    OrderCancelled {
        order_id: Uuid,
        reason: String,
    },

    // Payment events
    PaymentIntentCreated {
        payment_id: Uuid,
        order_id: Uuid,
        gateway_order_id: String,
    },
    PaymentVerified {
        payment_id: Uuid,
        order_id: Uuid,
    },
    PaymentFailed {
        payment_id: Uuid,
        order_id: Uuid,
        reason: String,
    },
    PaymentRefunded(Uuid),

    // Wallet events
    WalletCredited {
        user_id: Uuid,
        amount: Decimal,
        reference_type: ReferenceType,
        balance_after: Decimal,
    },
    WalletDebited {
        user_id: Uuid,
        amount: Decimal,
        reference_type: ReferenceType,
        balance_after: Decimal,
    },

    // Return events
    ReturnRequested {
        return_id: Uuid,
        order_id: Uuid,
    },
    ReturnApproved(Uuid),
    ReturnRejected(Uuid),
    ReturnReceived(Uuid),
    ReturnRestocked(Uuid),
    RefundInitiated {
        return_id: Uuid,
        amount: Decimal,
    },
    RefundCompleted {
        return_id: Uuid,
        amount: Decimal,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::CheckoutStarted { .. } => "checkout_started",
            Event::CheckoutAbandoned(_) => "checkout_abandoned",
            Event::CouponApplied { .. } => "coupon_applied",
            Event::CouponRemoved(_) => "coupon_removed",
            Event::OrderCreated { .. } => "order_created",
            Event::OrderConfirmed(_) => "order_confirmed",
            Event::OrderShipped(_) => "order_shipped",
            Event::OrderDelivered(_) => "order_delivered",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::PaymentIntentCreated { .. } => "payment_intent_created",
            Event::PaymentVerified { .. } => "payment_verified",
            Event::PaymentFailed { .. } => "payment_failed",
            Event::PaymentRefunded(_) => "payment_refunded",
            Event::WalletCredited { .. } => "wallet_credited",
            Event::WalletDebited { .. } => "wallet_debited",
            Event::ReturnRequested { .. } => "return_requested",
            Event::ReturnApproved(_) => "return_approved",
            Event::ReturnRejected(_) => "return_rejected",
            Event::ReturnReceived(_) => "return_received",
            Event::ReturnRestocked(_) => "return_restocked",
            Event::RefundInitiated { .. } => "refund_initiated",
            Event::RefundCompleted { .. } => "refund_completed",
        }
    }
}

/// Drains the channel, logging every event until all senders are dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        metrics::counter!("storefront.events.processed", 1, "event" => event.name());

        match &event {
            Event::OrderCreated {
                order_id,
                payment_method,
                final_amount,
                ..
            } => {
                info!(%order_id, %payment_method, %final_amount, "order created");
            }
            Event::OrderCancelled { order_id, reason } => {
                warn!(%order_id, %reason, "order cancelled");
            }
            Event::PaymentFailed {
                payment_id,
                order_id,
                reason,
            } => {
                warn!(%payment_id, %order_id, %reason, "payment failed");
            }
            Event::WalletCredited {
                user_id,
                amount,
                balance_after,
                ..
            }
            | Event::WalletDebited {
                user_id,
                amount,
                balance_after,
                ..
            } => {
                info!(%user_id, %amount, %balance_after, event = event.name(), "wallet ledger entry");
            }
            other => {
                info!(event = other.name(), payload = ?other, "domain event");
            }
        }
    }

    warn!("Event processing loop has ended");
}
