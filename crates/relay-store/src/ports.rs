//! Store ports.
//!
//! The context layer talks to the database only through these two traits,
//! so tests can swap in [`InMemoryStore`](crate::memory::InMemoryStore) for
//! [`PgStore`](crate::postgres::PgStore).

use crate::account::AccountId;
use crate::error::StoreError;
use crate::query::{QueryResult, SqlQuery};
use async_trait::async_trait;

/// A source of database transactions backed by a connection pool.
#[async_trait]
pub trait Store: Send + Sync {
    /// Acquire a connection and open a transaction on it.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// An open transaction holding one pooled connection.
///
/// Dropping a transaction without committing rolls it back and returns the
/// connection to the pool.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn query(&mut self, query: &SqlQuery) -> Result<QueryResult, StoreError>;

    /// Set the transaction-local account setting read by row-level security.
    ///
    /// The setting must not outlive the transaction.
    async fn scope_to_account(&mut self, account: AccountId) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
