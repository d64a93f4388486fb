use http::StatusCode;
use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

/// Coarse classification used by callers to decide whether a retry makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    External,
    Internal,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("Insufficient wallet balance: {0}")]
    InsufficientFunds(String),

    #[error("Coupon not found: {0}")]
    CouponNotFound(String),

    #[error("Coupon expired: {0}")]
    CouponExpired(String),

    #[error("Coupon inactive: {0}")]
    CouponInactive(String),

    #[error("Minimum order amount not met: {0}")]
    MinOrderNotMet(String),

    #[error("Payment not refundable: {0}")]
    NotRefundable(String),

    #[error("Payment signature mismatch for order {0}")]
    SignatureMismatch(Uuid),

    #[error("Payment pending: {0}")]
    PaymentPending(String),

    #[error("Payment expired: {0}")]
    PaymentExpired(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        ServiceError::NotFound(format!("{} {} not found", entity, id))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError(_)
            | Self::Unauthorized(_)
            | Self::InvalidOperation(_)
            | Self::CouponExpired(_)
            | Self::CouponInactive(_)
            | Self::MinOrderNotMet(_) => ErrorKind::Validation,
            Self::NotFound(_) | Self::CouponNotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_)
            | Self::ConcurrentModification(_)
            | Self::InvalidTransition(_)
            | Self::InsufficientStock { .. }
            | Self::InsufficientFunds(_)
            | Self::NotRefundable(_)
            | Self::PaymentPending(_)
            | Self::PaymentExpired(_) => ErrorKind::Conflict,
            Self::SignatureMismatch(_)
            | Self::GatewayTimeout(_)
            | Self::ExternalServiceError(_) => ErrorKind::External,
            Self::DatabaseError(_) | Self::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Whether repeating the same call unchanged can succeed.
    ///
    /// A signature mismatch is external but deterministic, so it is not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GatewayTimeout(_) | Self::ExternalServiceError(_) | Self::ConcurrentModification(_)
        )
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::CouponNotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::InvalidOperation(_)
            | Self::CouponExpired(_)
            | Self::CouponInactive(_)
            | Self::MinOrderNotMet(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_)
            | Self::ConcurrentModification(_)
            | Self::InvalidTransition(_)
            | Self::NotRefundable(_)
            | Self::PaymentExpired(_) => StatusCode::CONFLICT,
            Self::InsufficientStock { .. } | Self::InsufficientFunds(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::PaymentPending(_) => StatusCode::ACCEPTED,
            Self::SignatureMismatch(_) => StatusCode::PAYMENT_REQUIRED,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            Self::ConcurrentModification(id) => {
                format!("Concurrent modification for ID {}", id)
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::CouponNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::MinOrderNotMet("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Unauthorized("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ServiceError::NotRefundable("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::InsufficientStock {
                product_id: Uuid::nil(),
                requested: 5,
                available: 3
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::GatewayTimeout("x".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ServiceError::SignatureMismatch(Uuid::nil()).status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
    }

    #[test]
    fn external_errors_are_distinguishable_from_internal() {
        assert_eq!(
            ServiceError::GatewayTimeout("razorpay".into()).kind(),
            ErrorKind::External
        );
        assert_eq!(
            ServiceError::SignatureMismatch(Uuid::nil()).kind(),
            ErrorKind::External
        );
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("boom".into())).kind(),
            ErrorKind::Internal
        );
        assert!(ServiceError::GatewayTimeout("razorpay".into()).is_retryable());
        assert!(!ServiceError::SignatureMismatch(Uuid::nil()).is_retryable());
        assert!(!ServiceError::InternalError("x".into()).is_retryable());
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("password=hunter2".into()))
                .response_message(),
            "Database error"
        );
        assert_eq!(
            ServiceError::InternalError("stack".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::CouponExpired("SAVE10".into()).response_message(),
            "Coupon expired: SAVE10"
        );
    }

    #[test]
    fn insufficient_stock_names_the_product() {
        let product_id = Uuid::new_v4();
        let err = ServiceError::InsufficientStock {
            product_id,
            requested: 5,
            available: 3,
        };
        assert!(err.to_string().contains(&product_id.to_string()));
    }
}
