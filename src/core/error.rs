//! Error taxonomy and wire mapping.
//!
//! Every public operation of the core returns [`CoreResult`]. Errors carry
//! their detail fields; [`CoreError::kind`] collapses them into the stable
//! [`ErrorKind`] taxonomy that crosses process boundaries. Kind identifiers
//! and numeric codes are part of the wire contract and never change meaning.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kinds surfaced at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    InsufficientStock,
    InsufficientFunds,
    SoldOut,
    BadPow,
    RateLimited,
    DeadlineExceeded,
    Unavailable,
    Internal,
    NotActive,
    PerUserCap,
    StaleChallenge,
    PaymentDeclined,
}

/// How a failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Surfaced to the caller, never retried automatically.
    Input,
    /// Retryable with backoff.
    Transient,
    /// Bug or invariant violation; logged with full context.
    Fatal,
}

impl ErrorKind {
    /// Every kind, in wire-code order.
    pub const ALL: [ErrorKind; 15] = [
        Self::InvalidInput,
        Self::NotFound,
        Self::Conflict,
        Self::InsufficientStock,
        Self::InsufficientFunds,
        Self::SoldOut,
        Self::BadPow,
        Self::RateLimited,
        Self::DeadlineExceeded,
        Self::Unavailable,
        Self::Internal,
        Self::NotActive,
        Self::PerUserCap,
        Self::StaleChallenge,
        Self::PaymentDeclined,
    ];

    /// Stable numeric code for wire transport.
    pub const fn code(self) -> u16 {
        match self {
            Self::InvalidInput => 1,
            Self::NotFound => 2,
            Self::Conflict => 3,
            Self::InsufficientStock => 4,
            Self::InsufficientFunds => 5,
            Self::SoldOut => 6,
            Self::BadPow => 7,
            Self::RateLimited => 8,
            Self::DeadlineExceeded => 9,
            Self::Unavailable => 10,
            Self::Internal => 11,
            Self::NotActive => 12,
            Self::PerUserCap => 13,
            Self::StaleChallenge => 14,
            Self::PaymentDeclined => 15,
        }
    }

    /// Inverse of [`ErrorKind::code`].
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    /// Stable string identifier.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InsufficientStock => "insufficient_stock",
            Self::InsufficientFunds => "insufficient_funds",
            Self::SoldOut => "sold_out",
            Self::BadPow => "bad_pow",
            Self::RateLimited => "rate_limited",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
            Self::NotActive => "not_active",
            Self::PerUserCap => "per_user_cap",
            Self::StaleChallenge => "stale_challenge",
            Self::PaymentDeclined => "payment_declined",
        }
    }

    pub const fn class(self) -> ErrorClass {
        match self {
            Self::Unavailable | Self::DeadlineExceeded | Self::Conflict => ErrorClass::Transient,
            Self::Internal => ErrorClass::Fatal,
            _ => ErrorClass::Input,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures produced by the transactional core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Optimistic concurrency lost after the bounded retry budget.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// A reservation or hold already reached a terminal state.
    #[error("{entity} {id} is terminal ({state})")]
    Terminal {
        entity: &'static str,
        id: String,
        state: String,
    },

    #[error("insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        sku: String,
        requested: u64,
        available: u64,
    },

    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: u64, available: u64 },

    #[error("sale {sale_id} is sold out")]
    SoldOut { sale_id: String },

    #[error("sale {sale_id} is not active ({state})")]
    NotActive { sale_id: String, state: String },

    #[error("user {user_id} reached the per-user cap of {max_per_user} for sale {sale_id}")]
    PerUserCap {
        sale_id: String,
        user_id: String,
        max_per_user: u32,
    },

    #[error("proof of work rejected")]
    BadPow,

    #[error("challenge is stale or already redeemed")]
    StaleChallenge,

    #[error("rate limited; retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded { operation: String },

    #[error("unavailable: {message}")]
    Unavailable { message: String },

    #[error("payment declined: {reason}")]
    PaymentDeclined { reason: String },

    /// Writes on this key are refused until an operator clears it.
    #[error("{key} is quarantined after an invariant violation")]
    Quarantined { key: String },

    #[error("invariant violated on {key}: {detail}")]
    InvariantViolation { key: String, detail: String },

    #[error("storage failure: {message}")]
    Storage { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CoreError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn terminal(entity: &'static str, id: impl ToString, state: impl ToString) -> Self {
        Self::Terminal {
            entity,
            id: id.to_string(),
            state: state.to_string(),
        }
    }

    pub fn deadline(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Collapse into the stable wire taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } | Self::Terminal { .. } => ErrorKind::Conflict,
            Self::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::SoldOut { .. } => ErrorKind::SoldOut,
            Self::NotActive { .. } => ErrorKind::NotActive,
            Self::PerUserCap { .. } => ErrorKind::PerUserCap,
            Self::BadPow => ErrorKind::BadPow,
            Self::StaleChallenge => ErrorKind::StaleChallenge,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::Unavailable { .. } | Self::Storage { .. } => ErrorKind::Unavailable,
            Self::PaymentDeclined { .. } => ErrorKind::PaymentDeclined,
            Self::Quarantined { .. } | Self::InvariantViolation { .. } | Self::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if the caller may retry this operation after backoff.
    ///
    /// Rate-limit rejections carry a retry hint and count as retriable.
    /// Terminal transitions share the `conflict` kind but never succeed on
    /// retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Terminal { .. } => false,
            _ => self.kind().class() == ErrorClass::Transient,
        }
    }

    /// Retry hint for backpressure rejections.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Wire envelope for this error.
    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.kind().code(),
            kind: self.kind(),
            detail: self.to_string(),
            retry_after_ms: self.retry_after_ms(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<bincode::Error> for CoreError {
    fn from(err: bincode::Error) -> Self {
        Self::storage(format!("codec: {}", err))
    }
}

/// Result type using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

/// Serialized error shape: `{code, kind, detail}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: u16,
    pub kind: ErrorKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

// ============================================================================
// Transport-specific mapping
// ============================================================================

/// gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrpcCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

/// Trait for mapping error kinds onto a transport's status space.
pub trait WireErrorMapping {
    type Status;

    fn map_kind(kind: ErrorKind) -> Self::Status;

    fn map_error(error: &CoreError) -> Self::Status {
        Self::map_kind(error.kind())
    }
}

/// gRPC facade mapping.
pub struct GrpcErrorMapping;

impl WireErrorMapping for GrpcErrorMapping {
    type Status = GrpcCode;

    fn map_kind(kind: ErrorKind) -> GrpcCode {
        match kind {
            ErrorKind::InvalidInput | ErrorKind::BadPow | ErrorKind::StaleChallenge => {
                GrpcCode::InvalidArgument
            }
            ErrorKind::NotFound => GrpcCode::NotFound,
            ErrorKind::Conflict => GrpcCode::Aborted,
            ErrorKind::InsufficientStock
            | ErrorKind::InsufficientFunds
            | ErrorKind::NotActive
            | ErrorKind::PaymentDeclined => GrpcCode::FailedPrecondition,
            ErrorKind::SoldOut | ErrorKind::PerUserCap | ErrorKind::RateLimited => {
                GrpcCode::ResourceExhausted
            }
            ErrorKind::DeadlineExceeded => GrpcCode::DeadlineExceeded,
            ErrorKind::Unavailable => GrpcCode::Unavailable,
            ErrorKind::Internal => GrpcCode::Internal,
        }
    }
}

/// HTTP facade mapping.
pub struct HttpErrorMapping;

impl WireErrorMapping for HttpErrorMapping {
    type Status = u16;

    fn map_kind(kind: ErrorKind) -> u16 {
        match kind {
            ErrorKind::InvalidInput | ErrorKind::BadPow | ErrorKind::StaleChallenge => 400,
            ErrorKind::PaymentDeclined => 402,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::NotActive => 409,
            ErrorKind::InsufficientStock | ErrorKind::SoldOut | ErrorKind::PerUserCap => 410,
            ErrorKind::InsufficientFunds => 422,
            ErrorKind::RateLimited => 429,
            ErrorKind::Internal => 500,
            ErrorKind::Unavailable => 503,
            ErrorKind::DeadlineExceeded => 504,
        }
    }
}
