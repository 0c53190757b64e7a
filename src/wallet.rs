use crate::{Result, WalletError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fractional digits kept for every balance, matching `NUMERIC(19,4)`.
pub const BALANCE_SCALE: u32 = 4;

pub const DEFAULT_CURRENCY: &str = "USD";

/// A wallet row.
///
/// `id` is the storage-assigned row id; `wallet_id` is the key callers use.
/// The mutators below are pure: they only touch this in-memory copy, the
/// caller decides how (and under which lock) the result is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub balance: Decimal,
    pub currency: String,
    pub version: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(wallet_id: Uuid, currency: &str) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(),
            wallet_id,
            balance: scaled(Decimal::ZERO),
            currency: normalize_currency(Some(currency))?,
            version: 0,
            active: true,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn deposit(&mut self, amount: Decimal) -> Result<()> {
        check_amount(amount)?;
        let balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| WalletError::invalid_amount(amount, "balance overflow"))?;
        self.balance = scaled(balance);
        Ok(())
    }

    pub fn withdraw(&mut self, amount: Decimal) -> Result<()> {
        check_amount(amount)?;
        if !self.has_sufficient_funds(amount) {
            return Err(WalletError::insufficient_funds(
                self.wallet_id,
                self.balance,
                amount,
            ));
        }
        self.balance = scaled(self.balance - amount);
        Ok(())
    }

    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }
}

/// Positive and representable at [`BALANCE_SCALE`] without rounding.
pub(crate) fn check_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(WalletError::invalid_amount(amount, "amount must be positive"));
    }
    if amount.normalize().scale() > BALANCE_SCALE {
        return Err(WalletError::invalid_amount(
            amount,
            format!("at most {BALANCE_SCALE} fractional digits are supported"),
        ));
    }
    Ok(())
}

pub(crate) fn scaled(mut value: Decimal) -> Decimal {
    value.rescale(BALANCE_SCALE);
    value
}

/// Three ASCII letters, upper-cased. Missing or empty falls back to USD.
pub fn normalize_currency(code: Option<&str>) -> Result<String> {
    let code = match code.map(str::trim) {
        None | Some("") => return Ok(DEFAULT_CURRENCY.to_string()),
        Some(code) => code,
    };

    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(WalletError::InvalidCurrency(code.to_string()));
    }

    Ok(code.to_ascii_uppercase())
}
