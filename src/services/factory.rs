use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    gateway::PaymentGateway,
    services::{
        checkout::CheckoutService, coupons::CouponService, inventory::StockLedger,
        orders::OrderService, payments::PaymentService, returns::ReturnService,
        wallet::WalletService,
    },
};

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    gateway: Arc<dyn PaymentGateway>,
    config: AppConfig,
}

impl ServiceFactory {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        config: AppConfig,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            gateway,
            config,
        }
    }

    pub fn checkout_service(&self) -> CheckoutService {
        CheckoutService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    pub fn coupon_service(&self) -> CouponService {
        CouponService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.config.policy.clone(),
        )
    }

    pub fn order_service(&self) -> OrderService {
        OrderService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            &self.config.payment,
        )
    }

    pub fn payment_service(&self) -> PaymentService {
        PaymentService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.gateway.clone(),
            self.config.payment.clone(),
            self.config.policy.clone(),
        )
    }

    pub fn wallet_service(&self) -> WalletService {
        WalletService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    pub fn return_service(&self) -> ReturnService {
        ReturnService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    pub fn stock_ledger(&self) -> StockLedger {
        StockLedger::new(self.db_pool.clone())
    }

    /// Gets a reference to the database pool
    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub checkout: Arc<CheckoutService>,
    pub coupons: Arc<CouponService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub wallet: Arc<WalletService>,
    pub returns: Arc<ReturnService>,
    pub stock: Arc<StockLedger>,
}

impl ServiceContainer {
    /// Creates a new service container with all services initialized
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            checkout: Arc::new(factory.checkout_service()),
            coupons: Arc::new(factory.coupon_service()),
            orders: Arc::new(factory.order_service()),
            payments: Arc::new(factory.payment_service()),
            wallet: Arc::new(factory.wallet_service()),
            returns: Arc::new(factory.return_service()),
            stock: Arc::new(factory.stock_ledger()),
        }
    }
}
