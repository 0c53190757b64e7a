use crate::adapters::{IsolationLevel, StoreTransaction, WalletStore};
use crate::config::{EngineConfig, Strategy};
use crate::operation::{OperationRequest, OperationType, WalletBalance};
use crate::retry::retry_on_conflict;
use crate::wallet::normalize_currency;
use crate::{Result, Wallet, WalletError};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Applies deposits and withdrawals to wallets held in a [`WalletStore`].
///
/// Both mutation paths give the same observable result for the same
/// sequence of operations; they differ in how long a row lock is held.
#[derive(Clone)]
pub struct WalletService {
    store: Arc<dyn WalletStore>,
    config: EngineConfig,
}

impl WalletService {
    pub fn new(store: Arc<dyn WalletStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn WalletStore {
        self.store.as_ref()
    }

    /// Apply `request` with `strategy`, then read back the committed balance.
    pub async fn process(
        &self,
        strategy: Strategy,
        request: &OperationRequest,
    ) -> Result<WalletBalance> {
        match strategy {
            Strategy::Locked => self.process_locked(request).await.map(WalletBalance::from),
            Strategy::Conditional => {
                self.process_conditional(request).await?;
                self.balance(request.wallet_id).await
            }
        }
    }

    /// [`process`](Self::process) with the configured default strategy.
    pub async fn apply(&self, request: &OperationRequest) -> Result<WalletBalance> {
        self.process(self.config.default_strategy, request).await
    }

    /// Locked path: lock the row, mutate the record, save, commit.
    pub async fn process_locked(&self, request: &OperationRequest) -> Result<Wallet> {
        let start = Instant::now();
        let policy = self.config.retry_policy(Strategy::Locked);

        let result = retry_on_conflict(policy, "process_locked", || {
            self.locked_attempt(request)
        })
        .await;

        record_outcome(Strategy::Locked, request.operation_type, &result, start);
        result
    }

    /// Conditional path: one guarded UPDATE, then work out why it missed if it did.
    pub async fn process_conditional(&self, request: &OperationRequest) -> Result<()> {
        let start = Instant::now();
        let policy = self.config.retry_policy(Strategy::Conditional);

        let result = retry_on_conflict(policy, "process_conditional", || {
            self.conditional_attempt(request)
        })
        .await;

        record_outcome(Strategy::Conditional, request.operation_type, &result, start);
        result
    }

    pub async fn balance(&self, wallet_id: Uuid) -> Result<WalletBalance> {
        self.store
            .lookup(wallet_id)
            .await?
            .map(WalletBalance::from)
            .ok_or(WalletError::WalletNotFound(wallet_id))
    }

    /// Create an empty, active wallet. Currency defaults to USD.
    pub async fn create_wallet(&self, wallet_id: Uuid, currency: Option<&str>) -> Result<Wallet> {
        let currency = normalize_currency(currency)?;
        let wallet = self
            .store
            .insert_if_absent(Wallet::new(wallet_id, &currency)?)
            .await?;

        info!(%wallet_id, currency = %wallet.currency, "wallet created");
        Ok(wallet)
    }

    /// Flip the active flag under the row lock.
    pub async fn set_active(&self, wallet_id: Uuid, active: bool) -> Result<Wallet> {
        retry_on_conflict(&self.config.locked_retry, "set_active", || async move {
            let mut tx = self.store.begin(IsolationLevel::ReadCommitted).await?;
            let mut wallet = tx
                .lookup_for_exclusive_access(wallet_id)
                .await?
                .ok_or(WalletError::WalletNotFound(wallet_id))?;

            if wallet.active == active {
                tx.rollback().await?;
                return Ok(wallet);
            }

            wallet.active = active;
            let saved = tx.save(&wallet).await?;
            tx.commit().await?;

            info!(%wallet_id, active, "wallet activity changed");
            Ok(saved)
        })
        .await
    }

    async fn locked_attempt(&self, request: &OperationRequest) -> Result<Wallet> {
        request.validate()?;

        let mut tx = self.store.begin(IsolationLevel::ReadCommitted).await?;
        let result = locked_mutation(tx.as_mut(), request).await;
        finish(tx, result).await
    }

    async fn conditional_attempt(&self, request: &OperationRequest) -> Result<()> {
        request.validate()?;

        let mut tx = self.store.begin(IsolationLevel::Serializable).await?;
        let result = conditional_mutation(tx.as_mut(), request).await;
        finish(tx, result).await
    }
}

/// Commit on success, roll back on any error. A failed rollback is only
/// logged; the caller sees the error that caused it.
async fn finish<T>(tx: Box<dyn StoreTransaction>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

async fn locked_mutation(
    tx: &mut dyn StoreTransaction,
    request: &OperationRequest,
) -> Result<Wallet> {
    let wallet_id = request.wallet_id;
    let mut wallet = tx
        .lookup_for_exclusive_access(wallet_id)
        .await?
        .ok_or(WalletError::WalletNotFound(wallet_id))?;

    if !wallet.active {
        return Err(WalletError::WalletInactive(wallet_id));
    }

    match request.operation_type {
        OperationType::Deposit => wallet.deposit(request.amount)?,
        OperationType::Withdraw => wallet.withdraw(request.amount)?,
    }

    let saved = tx.save(&wallet).await?;
    info!(
        %wallet_id,
        operation = %request.operation_type,
        amount = %request.amount,
        balance = %saved.balance,
        reference = request.reference.as_deref(),
        "locked mutation applied"
    );
    Ok(saved)
}

async fn conditional_mutation(
    tx: &mut dyn StoreTransaction,
    request: &OperationRequest,
) -> Result<()> {
    let wallet_id = request.wallet_id;
    let amount = request.amount;

    let updated = match request.operation_type {
        OperationType::Deposit => tx.conditional_increment(wallet_id, amount).await?,
        OperationType::Withdraw => {
            tx.conditional_decrement_if_sufficient(wallet_id, amount)
                .await?
        }
    };

    if updated == 1 {
        info!(
            %wallet_id,
            operation = %request.operation_type,
            %amount,
            reference = request.reference.as_deref(),
            "conditional mutation applied"
        );
        return Ok(());
    }

    // The decision was already made by the UPDATE; this read only explains it.
    if !tx.exists(wallet_id).await? {
        return Err(WalletError::WalletNotFound(wallet_id));
    }

    let wallet = tx
        .lookup(wallet_id)
        .await?
        .ok_or(WalletError::WalletNotFound(wallet_id))?;

    if !wallet.active {
        return Err(WalletError::WalletInactive(wallet_id));
    }

    match request.operation_type {
        OperationType::Withdraw => Err(WalletError::insufficient_funds(
            wallet_id,
            wallet.balance,
            amount,
        )),
        // an active, existing wallet always accepts a deposit
        OperationType::Deposit => Err(WalletError::Conflict(format!(
            "deposit to wallet {wallet_id} matched no rows"
        ))),
    }
}

fn record_outcome<T>(
    strategy: Strategy,
    operation: OperationType,
    result: &Result<T>,
    start: Instant,
) {
    let outcome = match result {
        Ok(_) => "success",
        Err(WalletError::ConcurrencyExhausted { .. }) => "exhausted",
        Err(err) if err.kind() == crate::ErrorKind::Client => "rejected",
        Err(_) => "failed",
    };

    histogram!("wallet.operation.duration_ms",
        "strategy" => strategy.as_str(),
        "operation" => operation.as_str()
    )
    .record(start.elapsed().as_millis() as f64);

    counter!("wallet.operations.total",
        "strategy" => strategy.as_str(),
        "operation" => operation.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}
