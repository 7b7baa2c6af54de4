//! In-memory store for tests.
//!
//! Statements are interpreted by a caller-supplied executor that works on a
//! private copy of the committed tables. Commit publishes the copy; rollback
//! throws it away. Transaction-local settings start empty for every
//! transaction, like `set_config(.., true)` on a pooled connection.

use crate::account::AccountId;
use crate::config::DEFAULT_ACCOUNT_SETTING;
use crate::error::StoreError;
use crate::ports::{Store, StoreTransaction};
use crate::query::{QueryResult, Row, SqlQuery};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Named tables of rows.
pub type Tables = BTreeMap<String, Vec<Row>>;

/// Interprets one statement against a transaction's working state.
pub type MemoryExecutor =
    dyn Fn(&mut MemoryTransactionState, &SqlQuery) -> Result<QueryResult, StoreError> + Send + Sync;

/// Working state visible to the executor during one transaction.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransactionState {
    tables: Tables,
    settings: HashMap<String, String>,
    account_setting: String,
}

impl MemoryTransactionState {
    pub fn table(&self, name: &str) -> &[Row] {
        self.tables.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn table_mut(&mut self, name: &str) -> &mut Vec<Row> {
        self.tables.entry(name.to_owned()).or_default()
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name).map(String::as_str)
    }

    /// Account the transaction is scoped to, if any.
    pub fn account_id(&self) -> Option<AccountId> {
        self.setting(&self.account_setting)
            .and_then(|value| value.parse().ok())
    }
}

/// Transaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
    /// Transactions currently holding a connection.
    pub open: usize,
}

struct Inner {
    committed: Mutex<Tables>,
    executor: Box<MemoryExecutor>,
    account_setting: String,
    fail_scoping: AtomicBool,
    begun: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    open: AtomicUsize,
}

/// Store that keeps its tables in memory.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new<F>(executor: F) -> Self
    where
        F: Fn(&mut MemoryTransactionState, &SqlQuery) -> Result<QueryResult, StoreError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                committed: Mutex::new(Tables::new()),
                executor: Box::new(executor),
                account_setting: DEFAULT_ACCOUNT_SETTING.to_owned(),
                fail_scoping: AtomicBool::new(false),
                begun: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
                open: AtomicUsize::new(0),
            }),
        }
    }

    /// Replace the committed contents of `table`.
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        self.inner.committed.lock().insert(table.to_owned(), rows);
    }

    /// Committed contents of `table`.
    pub fn committed(&self, table: &str) -> Vec<Row> {
        self.inner
            .committed
            .lock()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every later `scope_to_account` fail.
    pub fn fail_account_scoping(&self, fail: bool) {
        self.inner.fail_scoping.store(fail, Ordering::SeqCst);
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            begun: self.inner.begun.load(Ordering::SeqCst),
            committed: self.inner.commits.load(Ordering::SeqCst),
            rolled_back: self.inner.rollbacks.load(Ordering::SeqCst),
            open: self.inner.open.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        self.inner.begun.fetch_add(1, Ordering::SeqCst);
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        let state = MemoryTransactionState {
            tables: self.inner.committed.lock().clone(),
            settings: HashMap::new(),
            account_setting: self.inner.account_setting.clone(),
        };
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            state,
            released: false,
        }))
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    state: MemoryTransactionState,
    released: bool,
}

impl MemoryTransaction {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn query(&mut self, query: &SqlQuery) -> Result<QueryResult, StoreError> {
        (self.inner.executor)(&mut self.state, query)
    }

    async fn scope_to_account(&mut self, account: AccountId) -> Result<(), StoreError> {
        if self.inner.fail_scoping.load(Ordering::SeqCst) {
            return Err(StoreError::InsufficientPrivilege(format!(
                "permission denied to set parameter \"{}\"",
                self.inner.account_setting
            )));
        }
        self.state
            .settings
            .insert(self.inner.account_setting.clone(), account.to_string());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let tables = std::mem::take(&mut self.state.tables);
        *self.inner.committed.lock() = tables;
        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        self.release();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.release();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.release();
    }
}
