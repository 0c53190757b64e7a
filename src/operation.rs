use crate::wallet::{BALANCE_SCALE, Wallet};
use crate::{Result, WalletError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Smallest accepted amount, 0.01.
pub const MIN_AMOUNT: Decimal = Decimal::from_parts(1, 0, 0, false, 2);
/// Largest accepted amount, 1,000,000.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Deposit,
    Withdraw,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Deposit => "DEPOSIT",
            OperationType::Withdraw => "WITHDRAW",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEPOSIT" => Ok(OperationType::Deposit),
            "WITHDRAW" => Ok(OperationType::Withdraw),
            other => Err(WalletError::InvalidOperation(format!(
                "unknown operation type {other:?}"
            ))),
        }
    }
}

/// A single deposit or withdrawal against one wallet.
///
/// `reference` is carried through for the caller's own bookkeeping; it is
/// not deduplicated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub wallet_id: Uuid,
    pub operation_type: OperationType,
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl OperationRequest {
    pub fn deposit(wallet_id: Uuid, amount: Decimal) -> Self {
        Self {
            wallet_id,
            operation_type: OperationType::Deposit,
            amount,
            reference: None,
        }
    }

    pub fn withdraw(wallet_id: Uuid, amount: Decimal) -> Self {
        Self {
            wallet_id,
            operation_type: OperationType::Withdraw,
            amount,
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Range and precision checks. Anything finer than four fractional
    /// digits would be silently rounded by the storage column, so it is
    /// rejected instead.
    pub fn validate(&self) -> Result<()> {
        let amount = self.amount;
        if amount <= Decimal::ZERO {
            return Err(WalletError::invalid_amount(amount, "amount must be positive"));
        }
        if amount < MIN_AMOUNT {
            return Err(WalletError::invalid_amount(
                amount,
                format!("amount must be at least {MIN_AMOUNT}"),
            ));
        }
        if amount > MAX_AMOUNT {
            return Err(WalletError::invalid_amount(
                amount,
                format!("amount must not exceed {MAX_AMOUNT}"),
            ));
        }
        if amount.normalize().scale() > BALANCE_SCALE {
            return Err(WalletError::invalid_amount(
                amount,
                format!("at most {BALANCE_SCALE} fractional digits are supported"),
            ));
        }
        Ok(())
    }
}

/// Read-only projection returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    pub wallet_id: Uuid,
    pub balance: Decimal,
    pub currency: String,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
}

impl From<&Wallet> for WalletBalance {
    fn from(wallet: &Wallet) -> Self {
        Self {
            wallet_id: wallet.wallet_id,
            balance: wallet.balance,
            currency: wallet.currency.clone(),
            updated_at: wallet.updated_at,
            active: wallet.active,
        }
    }
}

impl From<Wallet> for WalletBalance {
    fn from(wallet: Wallet) -> Self {
        WalletBalance::from(&wallet)
    }
}
