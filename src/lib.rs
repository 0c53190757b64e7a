//! # ousia-wallet
//!
//! Per-wallet balances with deposits and withdrawals that stay correct under
//! heavy concurrent access to the same wallet: no lost updates, no
//! double-spends, no negative balances.
//!
//! Two mutation paths share one contract:
//!
//! - **Locked** ([`Strategy::Locked`]): take an exclusive row lock, mutate the
//!   [`Wallet`] in memory, save it with a version check, commit.
//! - **Conditional** ([`Strategy::Conditional`]): a single guarded `UPDATE`
//!   (`balance >= amount` for withdrawals) under serializable isolation; when
//!   it matches nothing, a follow-up read tells "not found" from
//!   "insufficient funds".
//!
//! Both run inside [`retry::retry_on_conflict`], which retries only on
//! concurrency conflicts, with geometric backoff and a fixed attempt ceiling.
//!
//! Storage sits behind [`WalletStore`]; [`adapters::MemoryAdapter`] keeps
//! everything in-process, [`adapters::PostgresAdapter`] (feature `postgres`)
//! talks to PostgreSQL through sqlx.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ousia_wallet::{EngineConfig, OperationRequest, Strategy, WalletService};
//! use ousia_wallet::adapters::MemoryAdapter;
//! use rust_decimal::Decimal;
//! use uuid::Uuid;
//!
//! # async fn run() -> ousia_wallet::Result<()> {
//! let service = WalletService::new(Arc::new(MemoryAdapter::new()), EngineConfig::default());
//! let wallet_id = Uuid::now_v7();
//! service.create_wallet(wallet_id, Some("USD")).await?;
//!
//! let request = OperationRequest::deposit(wallet_id, Decimal::new(10_000, 2));
//! let balance = service.process(Strategy::Locked, &request).await?;
//! assert_eq!(balance.balance, Decimal::new(10_000, 2));
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod operation;
pub mod retry;
pub mod service;
pub mod wallet;

pub use adapters::{IsolationLevel, StoreTransaction, WalletStore};
pub use config::{DatabaseConfig, EngineConfig, Strategy};
pub use error::{ErrorKind, Result, WalletError};
pub use operation::{OperationRequest, OperationType, WalletBalance};
pub use retry::RetryPolicy;
pub use service::WalletService;
pub use wallet::Wallet;
