//! Storefront API library
//!
//! Checkout-to-order core: checkout sessions, coupon evaluation, order
//! finalization with stock reservation, payment gateway intents and
//! verification, the wallet ledger and the return/refund pipeline.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod commands;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod migrator;
pub mod services;

pub mod prelude {
    pub use crate::commands::Command;
    pub use crate::db::DbPool;
    pub use crate::entities::StatusTransition;
    pub use crate::errors::ServiceError;
    pub use crate::events::{Event, EventSender};
    pub use crate::gateway::PaymentGateway;
    pub use crate::services::factory::{ServiceContainer, ServiceFactory};
}
