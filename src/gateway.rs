//! Remote payment gateway adapter.
//!
//! The gateway creates a payment object for an order and later calls back
//! with `(gateway_order_id, gateway_payment_id, signature)`. The signature is
//! `hex(HMAC-SHA256(key_secret, "{gateway_order_id}|{gateway_payment_id}"))`.

use crate::{config::PaymentGatewayConfig, errors::ServiceError};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayOrderRequest {
    /// Amount in the currency's minor unit (paise, cents)
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Creates the remote payment object the client pays against.
    async fn create_order(&self, request: GatewayOrderRequest) -> Result<GatewayOrder, ServiceError>;

    /// Authenticates a payment callback. Must compare in constant time.
    fn verify_signature(&self, gateway_order_id: &str, gateway_payment_id: &str, signature: &str)
        -> bool;
}

/// Converts a decimal amount into gateway minor units, rejecting non-positive
/// amounts and sub-minor-unit precision.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "payment amount must be positive, got {}",
            amount
        )));
    }
    let minor = amount * Decimal::ONE_HUNDRED;
    if minor.fract() != Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "payment amount {} has more than two decimal places",
            amount
        )));
    }
    minor
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("payment amount {} out of range", amount)))
}

/// Callback signature for a gateway order/payment pair.
pub fn sign_payment(secret: &str, gateway_order_id: &str, gateway_payment_id: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload(gateway_order_id, gateway_payment_id).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of `signature` against the expected HMAC.
pub fn signature_matches(
    secret: &str,
    gateway_order_id: &str,
    gateway_payment_id: &str,
    signature: &str,
) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload(gateway_order_id, gateway_payment_id).as_bytes());
    mac.verify_slice(&provided).is_ok()
}

fn payload(gateway_order_id: &str, gateway_payment_id: &str) -> String {
    format!("{}|{}", gateway_order_id, gateway_payment_id)
}

#[derive(Debug, Clone)]
struct Credentials {
    key_id: String,
    key_secret: String,
    /// Secret that was active before the last rotation; still accepted for callbacks
    previous_secret: Option<String>,
}

/// HTTP adapter for Razorpay-style order APIs.
pub struct RazorpayGateway {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    credentials: RwLock<Credentials>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: GatewayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    description: String,
}

impl RazorpayGateway {
    pub fn new(config: &PaymentGatewayConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ServiceError::InternalError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.request_timeout(),
            credentials: RwLock::new(Credentials {
                key_id: config.key_id.clone(),
                key_secret: config.key_secret.clone(),
                previous_secret: None,
            }),
        })
    }

    /// Swaps in new credentials. Callbacks signed with the outgoing secret keep
    /// verifying until [`RazorpayGateway::finish_rotation`] is called.
    pub fn rotate_credentials(&self, key_id: impl Into<String>, key_secret: impl Into<String>) {
        let mut creds = self
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outgoing = std::mem::replace(&mut creds.key_secret, key_secret.into());
        creds.key_id = key_id.into();
        creds.previous_secret = Some(outgoing);
        info!(key_id = %creds.key_id, "payment gateway credentials rotated");
    }

    /// Stops accepting the pre-rotation secret.
    pub fn finish_rotation(&self) {
        let mut creds = self
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        creds.previous_secret = None;
    }

    fn snapshot(&self) -> Credentials {
        self.credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn name(&self) -> &str {
        "razorpay"
    }

    #[instrument(skip(self), fields(receipt = %request.receipt))]
    async fn create_order(&self, request: GatewayOrderRequest) -> Result<GatewayOrder, ServiceError> {
        let creds = self.snapshot();
        let url = format!("{}/v1/orders", self.base_url);

        let call = self
            .client
            .post(&url)
            .basic_auth(&creds.key_id, Some(&creds.key_secret))
            .json(&request)
            .send();

        let response = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => {
                warn!("gateway order creation timed out");
                return Err(ServiceError::GatewayTimeout(format!(
                    "{} did not answer within {:?}",
                    self.name(),
                    self.timeout
                )));
            }
            Ok(Err(e)) if e.is_timeout() => {
                return Err(ServiceError::GatewayTimeout(e.to_string()));
            }
            Ok(Err(e)) => {
                error!(error = %e, "gateway request failed");
                return Err(ServiceError::ExternalServiceError(e.to_string()));
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<GatewayErrorBody>()
                .await
                .map(|body| format!("{}: {}", body.error.code, body.error.description))
                .unwrap_or_else(|_| status.to_string());
            error!(%status, %detail, "gateway rejected order creation");
            return Err(ServiceError::ExternalServiceError(format!(
                "{} returned {}",
                self.name(),
                detail
            )));
        }

        let order = response
            .json::<GatewayOrder>()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("malformed gateway response: {}", e)))?;

        if order.amount != request.amount || !order.currency.eq_ignore_ascii_case(&request.currency) {
            return Err(ServiceError::ExternalServiceError(format!(
                "gateway order {} does not match requested amount",
                order.id
            )));
        }

        info!(gateway_order_id = %order.id, "gateway order created");
        Ok(order)
    }

    fn verify_signature(
        &self,
        gateway_order_id: &str,
        gateway_payment_id: &str,
        signature: &str,
    ) -> bool {
        let creds = self.snapshot();
        signature_matches(&creds.key_secret, gateway_order_id, gateway_payment_id, signature)
            || creds.previous_secret.as_deref().map_or(false, |previous| {
                signature_matches(previous, gateway_order_id, gateway_payment_id, signature)
            })
    }
}
