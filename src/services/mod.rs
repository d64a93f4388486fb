//! Checkout-to-order core: session staging, coupons, order finalization,
//! payment verification, the wallet ledger and returns.

pub mod checkout;
pub mod coupons;
pub mod factory;
pub mod inventory;
pub mod orders;
pub mod payments;
pub mod returns;
pub mod wallet;
