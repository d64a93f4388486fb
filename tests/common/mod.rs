#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use storefront_api::{
    config::AppConfig,
    db::{self, DbPool},
    entities::{address, cart_item, checkout_session, coupon, product, PaymentMethod},
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::{sign_payment, signature_matches, GatewayOrder, GatewayOrderRequest, PaymentGateway},
    services::{
        checkout::AddressInput,
        coupons::NewCoupon,
        factory::{ServiceContainer, ServiceFactory},
        orders::OrderDetails,
    },
};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const GATEWAY_SECRET: &str = "test_gateway_secret";

/// In-process stand-in for the remote gateway. Signs with [`GATEWAY_SECRET`].
pub struct FakeGateway {
    orders_created: AtomicUsize,
    fail_next: AtomicBool,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            orders_created: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.orders_created.load(Ordering::SeqCst)
    }

    /// Makes the next `create_order` time out.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn sign(&self, gateway_order_id: &str, gateway_payment_id: &str) -> String {
        sign_payment(GATEWAY_SECRET, gateway_order_id, gateway_payment_id)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_order(&self, request: GatewayOrderRequest) -> Result<GatewayOrder, ServiceError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::GatewayTimeout("fake gateway timed out".into()));
        }
        let n = self.orders_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayOrder {
            id: format!("order_fake_{n}"),
            amount: request.amount,
            currency: request.currency,
            status: "created".into(),
        })
    }

    fn verify_signature(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> bool {
        signature_matches(GATEWAY_SECRET, gateway_order_id, gateway_payment_id, signature)
    }
}

/// Services wired to a fresh in-memory SQLite database.
pub struct TestContext {
    pub db: Arc<DbPool>,
    pub services: ServiceContainer,
    pub gateway: Arc<FakeGateway>,
    pub config: AppConfig,
    events: mpsc::Receiver<Event>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        let pool = db::establish_connection_from_app_config(&config)
            .await
            .expect("connect to sqlite");
        db::run_migrations(&pool).await.expect("apply migrations");
        let db = Arc::new(pool);

        let (sender, events) = EventSender::channel(1024);
        let gateway = Arc::new(FakeGateway::new());
        let factory = ServiceFactory::new(
            db.clone(),
            Arc::new(sender),
            gateway.clone(),
            config.clone(),
        );

        Self {
            db,
            services: ServiceContainer::new(&factory),
            gateway,
            config,
            events,
        }
    }

    /// Everything emitted so far, in order.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn product(&self, price: Decimal, stock: i32) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(format!("product-{}", &Uuid::new_v4().to_string()[..8])),
            price: Set(price),
            stock_quantity: Set(stock),
            is_deleted: Set(false),
            version: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("insert product")
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .expect("query product")
            .expect("product exists")
            .stock_quantity
    }

    pub async fn add_to_cart(&self, user_id: Uuid, product_id: Uuid, quantity: i32) {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert cart item");
    }

    pub async fn address(&self, user_id: Uuid) -> address::Model {
        address::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            name: Set("Asha Rao".into()),
            phone: Set("+919800012345".into()),
            line1: Set("12 Market Road".into()),
            line2: Set(None),
            city: Set("Pune".into()),
            state: Set("MH".into()),
            postal_code: Set("411001".into()),
            country: Set("IN".into()),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert address")
    }

    pub async fn coupon(&self, code: &str, pct: Decimal, min_order: Decimal) -> coupon::Model {
        self.services
            .coupons
            .create_coupon(NewCoupon {
                code: code.into(),
                discount_percentage: pct,
                min_order_amount: min_order,
                expires_at: Utc::now() + Duration::days(30),
                is_active: true,
            })
            .await
            .expect("create coupon")
    }

    /// Session for `user_id` with the cart snapshotted and an address bound.
    pub async fn ready_session(&self, user_id: Uuid) -> checkout_session::Model {
        let session = self
            .services
            .checkout
            .get_or_create_session(user_id)
            .await
            .expect("open session");
        let address = self.address(user_id).await;
        self.services
            .checkout
            .bind_address(
                user_id,
                session.id,
                AddressInput::Existing {
                    address_id: address.id,
                },
            )
            .await
            .expect("bind address")
    }

    /// Cart of one product line, checked out with `method`.
    pub async fn place_order(
        &self,
        user_id: Uuid,
        price: Decimal,
        quantity: i32,
        method: PaymentMethod,
    ) -> OrderDetails {
        let product = self.product(price, 100).await;
        self.add_to_cart(user_id, product.id, quantity).await;
        let session = self.ready_session(user_id).await;
        self.services
            .orders
            .create_order(user_id, session.id, method)
            .await
            .expect("create order")
    }
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
    // One connection: every pooled handle must see the same in-memory database.
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg.payment.key_secret = GATEWAY_SECRET.into();
    cfg
}
