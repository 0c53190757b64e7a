use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, WalletError>;

/// Coarse classification used by whoever maps errors onto a wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself can never succeed as submitted.
    Client,
    /// Concurrent writers kept winning; the caller may retry later.
    Conflict,
    /// Storage or infrastructure failure.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WalletError {
    #[error("Invalid amount {amount}: {reason}")]
    InvalidAmount { amount: Decimal, reason: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Wallet with id '{0}' not found")]
    WalletNotFound(Uuid),

    #[error("Wallet '{0}' is inactive")]
    WalletInactive(Uuid),

    #[error(
        "Insufficient funds in wallet '{wallet_id}'. Current balance: {balance}, Required amount: {requested}"
    )]
    InsufficientFunds {
        wallet_id: Uuid,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("Wallet already exists: {0}")]
    WalletAlreadyExists(Uuid),

    #[error("Invalid currency code: {0:?}")]
    InvalidCurrency(String),

    /// Version mismatch, serialization failure or deadlock reported by the store.
    /// Never leaves the crate unless a caller drives a store directly.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Concurrent modification detected after {attempts} attempts: {last}")]
    ConcurrencyExhausted { attempts: u32, last: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WalletError {
    pub fn invalid_amount(amount: Decimal, reason: impl Into<String>) -> Self {
        WalletError::InvalidAmount {
            amount,
            reason: reason.into(),
        }
    }

    pub fn insufficient_funds(wallet_id: Uuid, balance: Decimal, requested: Decimal) -> Self {
        WalletError::InsufficientFunds {
            wallet_id,
            balance,
            requested,
        }
    }

    /// Only concurrency conflicts are worth another attempt. Business-rule
    /// failures are deterministic for a given committed state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::Conflict(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WalletError::InvalidAmount { .. }
            | WalletError::InvalidOperation(_)
            | WalletError::WalletNotFound(_)
            | WalletError::WalletInactive(_)
            | WalletError::InsufficientFunds { .. }
            | WalletError::WalletAlreadyExists(_)
            | WalletError::InvalidCurrency(_) => ErrorKind::Client,
            WalletError::Conflict(_) | WalletError::ConcurrencyExhausted { .. } => {
                ErrorKind::Conflict
            }
            WalletError::Storage(_) | WalletError::Config(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for WalletError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // serialization_failure / deadlock_detected
            if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
                return WalletError::Conflict(db.message().to_string());
            }
        }
        WalletError::Storage(err.to_string())
    }
}
