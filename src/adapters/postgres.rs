use crate::adapters::{IsolationLevel, StoreTransaction, WalletStore};
use crate::config::DatabaseConfig;
use crate::{Result, Wallet, WalletError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const WALLET_COLUMNS: &str =
    "id, wallet_id, balance, currency, version, active, created_at, updated_at";

/// PostgreSQL store.
///
/// Balances are capped by the `NUMERIC(19,4)` column (15 integer digits); a
/// deposit past that cap fails with `Storage`, where [`super::MemoryAdapter`]
/// accepts anything `Decimal` can hold.
///
/// Schema:
/// ```sql
/// CREATE TABLE wallets (
///     id UUID PRIMARY KEY,
///     wallet_id UUID NOT NULL UNIQUE,
///     balance NUMERIC(19,4) NOT NULL DEFAULT 0 CHECK (balance >= 0),
///     currency VARCHAR(3) NOT NULL DEFAULT 'USD',
///     version BIGINT NOT NULL DEFAULT 0,
///     active BOOLEAN NOT NULL DEFAULT TRUE,
///     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// ```
#[derive(Clone)]
pub struct PostgresAdapter {
    pub(crate) pool: PgPool,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        Ok(Self::from_pool(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                id UUID PRIMARY KEY,
                wallet_id UUID NOT NULL,
                balance NUMERIC(19,4) NOT NULL DEFAULT 0 CHECK (balance >= 0),
                currency VARCHAR(3) NOT NULL DEFAULT 'USD',
                version BIGINT NOT NULL DEFAULT 0,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT wallets_wallet_id_key UNIQUE (wallet_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn wallet_from_row(row: &PgRow) -> Result<Wallet> {
    let get_err = |e: sqlx::Error| WalletError::Storage(e.to_string());

    Ok(Wallet {
        id: row.try_get("id").map_err(get_err)?,
        wallet_id: row.try_get("wallet_id").map_err(get_err)?,
        balance: row.try_get::<Decimal, _>("balance").map_err(get_err)?,
        currency: row.try_get("currency").map_err(get_err)?,
        version: row.try_get("version").map_err(get_err)?,
        active: row.try_get("active").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

#[async_trait]
impl WalletStore for PostgresAdapter {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>> {
        let mut tx = self.pool.begin().await?;

        // must be the first statement of the transaction
        let stmt = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&stmt).execute(&mut *tx).await?;
        debug!(isolation = isolation.as_sql(), "postgres transaction begin");

        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn lookup(&self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        let row = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE wallet_id = $1"
        ))
        .bind(wallet_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn exists(&self, wallet_id: Uuid) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM wallets WHERE wallet_id = $1)")
                .bind(wallet_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn insert_if_absent(&self, wallet: Wallet) -> Result<Wallet> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO wallets ({WALLET_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (wallet_id) DO NOTHING
            RETURNING {WALLET_COLUMNS}
            "#
        ))
        .bind(wallet.id)
        .bind(wallet.wallet_id)
        .bind(wallet.balance)
        .bind(&wallet.currency)
        .bind(wallet.version)
        .bind(wallet.active)
        .bind(wallet.created_at)
        .bind(wallet.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return WalletError::WalletAlreadyExists(wallet.wallet_id);
                }
            }
            WalletError::from(e)
        })?;

        match row {
            Some(row) => wallet_from_row(&row),
            None => Err(WalletError::WalletAlreadyExists(wallet.wallet_id)),
        }
    }
}

struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn lookup(&mut self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        let row = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE wallet_id = $1"
        ))
        .bind(wallet_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn lookup_for_exclusive_access(&mut self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        let row = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE wallet_id = $1 FOR UPDATE"
        ))
        .bind(wallet_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn exists(&mut self, wallet_id: Uuid) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM wallets WHERE wallet_id = $1)")
                .bind(wallet_id)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(exists)
    }

    async fn conditional_increment(&mut self, wallet_id: Uuid, amount: Decimal) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET balance = balance + $2, version = version + 1, updated_at = NOW()
            WHERE wallet_id = $1 AND active
            "#,
        )
        .bind(wallet_id)
        .bind(amount)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn conditional_decrement_if_sufficient(
        &mut self,
        wallet_id: Uuid,
        amount: Decimal,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET balance = balance - $2, version = version + 1, updated_at = NOW()
            WHERE wallet_id = $1 AND active AND balance >= $2
            "#,
        )
        .bind(wallet_id)
        .bind(amount)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn save(&mut self, wallet: &Wallet) -> Result<Wallet> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE wallets
            SET balance = $3, active = $4, version = version + 1, updated_at = NOW()
            WHERE wallet_id = $1 AND version = $2
            RETURNING {WALLET_COLUMNS}
            "#
        ))
        .bind(wallet.wallet_id)
        .bind(wallet.version)
        .bind(wallet.balance)
        .bind(wallet.active)
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some(row) = row {
            return wallet_from_row(&row);
        }

        if self.exists(wallet.wallet_id).await? {
            Err(WalletError::Conflict(format!(
                "wallet {} changed since version {}",
                wallet.wallet_id, wallet.version
            )))
        } else {
            Err(WalletError::WalletNotFound(wallet.wallet_id))
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}
