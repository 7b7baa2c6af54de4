//! # Relay Store - Transactional Authorization Contexts
//!
//! The only sanctioned path to persisted state. Callers get a context for the
//! duration of one transaction and never hold a connection themselves:
//!
//! - [`Database::with_unauthorized`] / [`Database::with_authorized`] open,
//!   commit or roll back, and release the connection.
//! - [`AuthorizedContext`] pushes the [`AccountId`] into a transaction-local
//!   setting so row-level security applies to every statement.
//! - [`SubscriptionContext`] outlives any single transaction and can "step up"
//!   into a fresh authorized one to read while a subscription is live.
//!
//! ## Backends
//!
//! - [`PgStore`]: Postgres via `sqlx`.
//! - [`InMemoryStore`]: executor-driven tables for tests.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod account;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod ports;
pub mod postgres;
pub mod query;
pub mod subscription;

pub use account::AccountId;
pub use config::{DatabaseConfig, DatabaseConfigError, DEFAULT_ACCOUNT_SETTING};
pub use context::{
    AfterCommitExt, AfterCommitHook, AuthorizedContext, Database, Queryable, UnauthorizedContext,
};
pub use error::StoreError;
pub use memory::{InMemoryStore, MemoryTransactionState, StoreStats};
pub use ports::{Store, StoreTransaction};
pub use postgres::PgStore;
pub use query::{QueryResult, Row, SqlParam, SqlQuery};
pub use subscription::{Publish, SubscriptionContext};
