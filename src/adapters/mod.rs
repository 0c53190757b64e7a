pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{Result, Wallet};

pub use memory::MemoryAdapter;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

// -----------------------------
// Store contract
// -----------------------------

/// Durable keyed storage for wallet rows.
///
/// Everything that mutates a balance goes through a [`StoreTransaction`];
/// the methods here are autocommit reads plus wallet creation.
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>>;

    /// Latest committed state, no locking.
    async fn lookup(&self, wallet_id: Uuid) -> Result<Option<Wallet>>;

    async fn exists(&self, wallet_id: Uuid) -> Result<bool>;

    /// Insert a fresh wallet. Fails with `WalletAlreadyExists` if the
    /// wallet id is taken; uniqueness is enforced by the store itself.
    async fn insert_if_absent(&self, wallet: Wallet) -> Result<Wallet>;
}

/// One unit of atomicity. Dropping it without `commit` discards every staged
/// write and releases every row lock it holds.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn lookup(&mut self, wallet_id: Uuid) -> Result<Option<Wallet>>;

    /// Exclusive row lock held until the transaction ends.
    async fn lookup_for_exclusive_access(&mut self, wallet_id: Uuid) -> Result<Option<Wallet>>;

    async fn exists(&mut self, wallet_id: Uuid) -> Result<bool>;

    /// `balance += amount, version += 1` on an active wallet. Returns rows affected.
    async fn conditional_increment(&mut self, wallet_id: Uuid, amount: Decimal) -> Result<u64>;

    /// `balance -= amount, version += 1` on an active wallet holding at least
    /// `amount`. Zero rows means missing, inactive or short of funds.
    async fn conditional_decrement_if_sufficient(
        &mut self,
        wallet_id: Uuid,
        amount: Decimal,
    ) -> Result<u64>;

    /// Persist the full record if its version still matches the stored one.
    /// Returns the stored row with the bumped version; a mismatch is a `Conflict`.
    async fn save(&mut self, wallet: &Wallet) -> Result<Wallet>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
