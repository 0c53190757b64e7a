use crate::adapters::{IsolationLevel, StoreTransaction, WalletStore};
use crate::wallet::{check_amount, scaled};
use crate::{Result, Wallet, WalletError};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

/// A stored wallet: the last committed version plus the row lock writers
/// queue on. Readers never touch `lock`.
struct Row {
    committed: RwLock<Wallet>,
    lock: Arc<Mutex<()>>,
}

impl Row {
    fn new(wallet: Wallet) -> Self {
        Self {
            committed: RwLock::new(wallet),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn snapshot(&self) -> Result<Wallet> {
        self.committed
            .read()
            .map(|w| w.clone())
            .map_err(|e| WalletError::Storage(e.to_string()))
    }

    fn publish(&self, wallet: Wallet) -> Result<()> {
        let mut committed = self
            .committed
            .write()
            .map_err(|e| WalletError::Storage(e.to_string()))?;
        *committed = wallet;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MemoryStore {
    rows: Arc<RwLock<HashMap<Uuid, Arc<Row>>>>,
    injected_conflicts: Arc<AtomicUsize>,
    conflicts_observed: Arc<AtomicU64>,
}

impl MemoryStore {
    fn row(&self, wallet_id: Uuid) -> Result<Option<Arc<Row>>> {
        let rows = self
            .rows
            .read()
            .map_err(|e| WalletError::Storage(e.to_string()))?;
        Ok(rows.get(&wallet_id).cloned())
    }

    fn conflict(&self, msg: impl Into<String>) -> WalletError {
        self.conflicts_observed.fetch_add(1, Ordering::Relaxed);
        WalletError::Conflict(msg.into())
    }
}

/// In-process store with real row locks and transactional staging.
///
/// Cloning shares the underlying rows.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    store: MemoryStore,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a serialization conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.store.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Number of conflicts this store has reported, injected ones included.
    pub fn conflicts_observed(&self) -> u64 {
        self.store.conflicts_observed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WalletStore for MemoryAdapter {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>> {
        debug!(isolation = isolation.as_sql(), "memory transaction begin");
        Ok(Box::new(MemoryTransaction {
            store: self.store.clone(),
            guards: HashMap::new(),
            staged: HashMap::new(),
        }))
    }

    async fn lookup(&self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        match self.store.row(wallet_id)? {
            Some(row) => row.snapshot().map(Some),
            None => Ok(None),
        }
    }

    async fn exists(&self, wallet_id: Uuid) -> Result<bool> {
        Ok(self.store.row(wallet_id)?.is_some())
    }

    async fn insert_if_absent(&self, wallet: Wallet) -> Result<Wallet> {
        let mut rows = self
            .store
            .rows
            .write()
            .map_err(|e| WalletError::Storage(e.to_string()))?;

        if rows.contains_key(&wallet.wallet_id) {
            return Err(WalletError::WalletAlreadyExists(wallet.wallet_id));
        }

        rows.insert(wallet.wallet_id, Arc::new(Row::new(wallet.clone())));
        Ok(wallet)
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    guards: HashMap<Uuid, OwnedMutexGuard<()>>,
    staged: HashMap<Uuid, Wallet>,
}

impl MemoryTransaction {
    /// Take the row lock the way an UPDATE or SELECT FOR UPDATE would.
    /// Re-entrant within one transaction.
    async fn lock_row(&mut self, wallet_id: Uuid) -> Result<Option<Arc<Row>>> {
        let Some(row) = self.store.row(wallet_id)? else {
            return Ok(None);
        };

        if !self.guards.contains_key(&wallet_id) {
            let guard = Arc::clone(&row.lock).lock_owned().await;
            self.guards.insert(wallet_id, guard);
        }

        Ok(Some(row))
    }

    fn current(&self, wallet_id: Uuid, row: &Row) -> Result<Wallet> {
        match self.staged.get(&wallet_id) {
            Some(wallet) => Ok(wallet.clone()),
            None => row.snapshot(),
        }
    }

    async fn conditional_update<F>(&mut self, wallet_id: Uuid, apply: F) -> Result<u64>
    where
        F: FnOnce(&Wallet) -> Result<Option<Decimal>> + Send,
    {
        let Some(row) = self.lock_row(wallet_id).await? else {
            return Ok(0);
        };

        let mut wallet = self.current(wallet_id, &row)?;
        if !wallet.active {
            return Ok(0);
        }

        let Some(balance) = apply(&wallet)? else {
            return Ok(0);
        };

        wallet.balance = scaled(balance);
        wallet.version += 1;
        wallet.updated_at = Utc::now();
        self.staged.insert(wallet_id, wallet);
        Ok(1)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn lookup(&mut self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        match self.store.row(wallet_id)? {
            Some(row) => self.current(wallet_id, &row).map(Some),
            None => Ok(None),
        }
    }

    async fn lookup_for_exclusive_access(&mut self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        match self.lock_row(wallet_id).await? {
            Some(row) => self.current(wallet_id, &row).map(Some),
            None => Ok(None),
        }
    }

    async fn exists(&mut self, wallet_id: Uuid) -> Result<bool> {
        Ok(self.store.row(wallet_id)?.is_some())
    }

    async fn conditional_increment(&mut self, wallet_id: Uuid, amount: Decimal) -> Result<u64> {
        check_amount(amount)?;
        self.conditional_update(wallet_id, |wallet| {
            wallet
                .balance
                .checked_add(amount)
                .map(Some)
                .ok_or_else(|| WalletError::invalid_amount(amount, "balance overflow"))
        })
        .await
    }

    async fn conditional_decrement_if_sufficient(
        &mut self,
        wallet_id: Uuid,
        amount: Decimal,
    ) -> Result<u64> {
        check_amount(amount)?;
        self.conditional_update(wallet_id, |wallet| {
            if wallet.balance >= amount {
                Ok(Some(wallet.balance - amount))
            } else {
                Ok(None)
            }
        })
        .await
    }

    async fn save(&mut self, wallet: &Wallet) -> Result<Wallet> {
        let Some(row) = self.lock_row(wallet.wallet_id).await? else {
            return Err(WalletError::WalletNotFound(wallet.wallet_id));
        };

        let stored = self.current(wallet.wallet_id, &row)?;
        if stored.version != wallet.version {
            return Err(self.store.conflict(format!(
                "wallet {} changed: expected version {}, found {}",
                wallet.wallet_id, wallet.version, stored.version
            )));
        }

        let mut next = wallet.clone();
        next.balance = scaled(next.balance);
        next.version += 1;
        next.updated_at = Utc::now();
        self.staged.insert(wallet.wallet_id, next.clone());
        Ok(next)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let injected = self.store.injected_conflicts.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if injected.is_ok() {
            return Err(self
                .store
                .conflict("could not serialize access due to concurrent update"));
        }

        for (wallet_id, wallet) in &self.staged {
            if let Some(row) = self.store.row(*wallet_id)? {
                row.publish(wallet.clone())?;
            }
        }

        // guards drop here, after every staged row is visible
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    async fn seeded(balance: Decimal) -> (MemoryAdapter, Uuid) {
        let adapter = MemoryAdapter::new();
        let mut wallet = Wallet::new(Uuid::now_v7(), "USD").unwrap();
        wallet.balance = scaled(balance);
        let wallet_id = wallet.wallet_id;
        adapter.insert_if_absent(wallet).await.unwrap();
        (adapter, wallet_id)
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_wallet_id() {
        let (adapter, wallet_id) = seeded(dec!(0)).await;
        let dup = Wallet::new(wallet_id, "EUR").unwrap();
        assert_eq!(
            adapter.insert_if_absent(dup).await.unwrap_err(),
            WalletError::WalletAlreadyExists(wallet_id)
        );
        assert_eq!(adapter.lookup(wallet_id).await.unwrap().unwrap().currency, "USD");
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let (adapter, wallet_id) = seeded(dec!(10)).await;

        let mut tx = adapter.begin(IsolationLevel::ReadCommitted).await.unwrap();
        assert_eq!(tx.conditional_increment(wallet_id, dec!(5)).await.unwrap(), 1);
        assert_eq!(tx.lookup(wallet_id).await.unwrap().unwrap().balance, dec!(15));
        assert_eq!(adapter.lookup(wallet_id).await.unwrap().unwrap().balance, dec!(10));

        tx.commit().await.unwrap();
        let wallet = adapter.lookup(wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.balance, dec!(15));
        assert_eq!(wallet.version, 1);
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_writes() {
        let (adapter, wallet_id) = seeded(dec!(10)).await;

        let mut tx = adapter.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.conditional_decrement_if_sufficient(wallet_id, dec!(4))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let mut tx = adapter.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.conditional_decrement_if_sufficient(wallet_id, dec!(4))
            .await
            .unwrap();
        drop(tx);

        let wallet = adapter.lookup(wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.balance, dec!(10));
        assert_eq!(wallet.version, 0);
    }

    #[tokio::test]
    async fn test_conditional_decrement_guards_balance() {
        let (adapter, wallet_id) = seeded(dec!(3)).await;

        let mut tx = adapter.begin(IsolationLevel::Serializable).await.unwrap();
        assert_eq!(
            tx.conditional_decrement_if_sufficient(wallet_id, dec!(3.0001))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            tx.conditional_decrement_if_sufficient(Uuid::now_v7(), dec!(1))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            tx.conditional_decrement_if_sufficient(wallet_id, dec!(3))
                .await
                .unwrap(),
            1
        );
        tx.commit().await.unwrap();

        assert_eq!(adapter.lookup(wallet_id).await.unwrap().unwrap().balance, dec!(0));
    }

    #[tokio::test]
    async fn test_conditional_updates_reject_sub_scale_amounts() {
        let (adapter, wallet_id) = seeded(dec!(0.0001)).await;

        let mut tx = adapter.begin(IsolationLevel::Serializable).await.unwrap();
        assert!(matches!(
            tx.conditional_increment(wallet_id, dec!(0.00004)).await,
            Err(WalletError::InvalidAmount { .. })
        ));
        assert!(matches!(
            tx.conditional_decrement_if_sufficient(wallet_id, dec!(0.00001))
                .await,
            Err(WalletError::InvalidAmount { .. })
        ));
        tx.commit().await.unwrap();

        let wallet = adapter.lookup(wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.balance, dec!(0.0001));
        assert_eq!(wallet.version, 0);
    }

    #[tokio::test]
    async fn test_conditional_updates_skip_inactive_wallets() {
        let (adapter, wallet_id) = seeded(dec!(10)).await;

        let mut tx = adapter.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let mut wallet = tx.lookup_for_exclusive_access(wallet_id).await.unwrap().unwrap();
        wallet.active = false;
        tx.save(&wallet).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = adapter.begin(IsolationLevel::Serializable).await.unwrap();
        assert_eq!(tx.conditional_increment(wallet_id, dec!(1)).await.unwrap(), 0);
        assert_eq!(
            tx.conditional_decrement_if_sufficient(wallet_id, dec!(1))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_save_detects_stale_version() {
        let (adapter, wallet_id) = seeded(dec!(10)).await;
        let stale = adapter.lookup(wallet_id).await.unwrap().unwrap();

        let mut tx = adapter.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.conditional_increment(wallet_id, dec!(1)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = adapter.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let err = tx.save(&stale).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(adapter.conflicts_observed(), 1);
    }

    #[tokio::test]
    async fn test_exclusive_lock_blocks_second_writer_until_commit() {
        let (adapter, wallet_id) = seeded(dec!(10)).await;

        let mut first = adapter.begin(IsolationLevel::ReadCommitted).await.unwrap();
        first
            .lookup_for_exclusive_access(wallet_id)
            .await
            .unwrap()
            .unwrap();

        let contender = adapter.clone();
        let handle = tokio::spawn(async move {
            let mut second = contender.begin(IsolationLevel::ReadCommitted).await.unwrap();
            let wallet = second
                .lookup_for_exclusive_access(wallet_id)
                .await
                .unwrap()
                .unwrap();
            second.rollback().await.unwrap();
            wallet.balance
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        // unlocked readers are not blocked
        assert_eq!(adapter.lookup(wallet_id).await.unwrap().unwrap().balance, dec!(10));

        first.conditional_increment(wallet_id, dec!(5)).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(handle.await.unwrap(), dec!(15));
    }

    #[tokio::test]
    async fn test_injected_conflict_fails_commit_once() {
        let (adapter, wallet_id) = seeded(dec!(0)).await;
        adapter.inject_conflicts(1);

        let mut tx = adapter.begin(IsolationLevel::Serializable).await.unwrap();
        tx.conditional_increment(wallet_id, dec!(1)).await.unwrap();
        assert!(matches!(tx.commit().await, Err(WalletError::Conflict(_))));

        let mut tx = adapter.begin(IsolationLevel::Serializable).await.unwrap();
        tx.conditional_increment(wallet_id, dec!(1)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(adapter.lookup(wallet_id).await.unwrap().unwrap().balance, dec!(1));
    }
}
