//! Persisted state owned (or read) by the checkout core.

use crate::errors::ServiceError;

// Collaborator tables: catalog, cart and address book
pub mod address;
pub mod cart_item;
pub mod product;
pub mod shipping_address;

// Checkout staging
pub mod checkout_item;
pub mod checkout_session;
pub mod coupon;

// Orders and payments
pub mod order;
pub mod order_item;
pub mod payment;

// Wallet ledger
pub mod wallet;
pub mod wallet_transaction;

// Reversal
pub mod return_request;

pub use checkout_session::CheckoutStatus;
pub use order::{DeliveryStatus, OrderStatus, RefundStatus};
pub use payment::{PaymentMethod, PaymentStatus};
pub use return_request::ReturnStage;
pub use wallet_transaction::{ReferenceType, WalletTransactionType};

/// Closed transition table for a status column.
///
/// Implementors list every legal `(from, to)` pair in `can_transition_to`;
/// anything else is rejected by `transition_to`.
pub trait StatusTransition: Copy + PartialEq + std::fmt::Debug {
    fn can_transition_to(self, next: Self) -> bool;

    fn transition_to(self, next: Self) -> Result<Self, ServiceError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ServiceError::InvalidTransition(format!(
                "{:?} -> {:?}",
                self, next
            )))
        }
    }
}
