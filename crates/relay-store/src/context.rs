//! # Transaction Contexts
//!
//! Every read and write goes through one of two scoped entry points:
//!
//! - [`Database::with_unauthorized`] runs an action inside a plain transaction.
//! - [`Database::with_authorized`] first pushes the caller's [`AccountId`]
//!   into a transaction-local setting, so row-level security policies see it.
//!
//! ```text
//! begin ──► [scope_to_account] ──► action(ctx) ──┬─ Ok  ──► commit ──► after-commit hooks
//!                                                └─ Err ──► rollback (hooks dropped)
//! ```
//!
//! The context handed to the action is invalidated before the transaction
//! finishes. A handle smuggled out of the action fails every later `query`
//! with [`StoreError::ContextInvalidated`] instead of touching a connection
//! that has already gone back to the pool.

use crate::account::AccountId;
use crate::error::StoreError;
use crate::ports::{Store, StoreTransaction};
use crate::query::{QueryResult, SqlQuery};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

/// Callback run after a successful commit.
pub type AfterCommitHook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Shared state behind every clone of a context handle.
struct TransactionSlot {
    transaction: AsyncMutex<Option<Box<dyn StoreTransaction>>>,
    /// `None` once the context is invalidated.
    hooks: Mutex<Option<Vec<AfterCommitHook>>>,
    account: Option<AccountId>,
}

#[derive(Clone)]
struct TransactionHandle(Arc<TransactionSlot>);

impl TransactionHandle {
    fn new(transaction: Box<dyn StoreTransaction>, account: Option<AccountId>) -> Self {
        Self(Arc::new(TransactionSlot {
            transaction: AsyncMutex::new(Some(transaction)),
            hooks: Mutex::new(Some(Vec::new())),
            account,
        }))
    }

    async fn query(&self, query: &SqlQuery) -> Result<QueryResult, StoreError> {
        let mut guard = self.0.transaction.lock().await;
        let Some(transaction) = guard.as_mut() else {
            error!(
                account = ?self.0.account,
                sql = query.text(),
                "Query issued on a finished transaction context"
            );
            return Err(StoreError::ContextInvalidated);
        };
        debug!(account = ?self.0.account, sql = query.text(), "Executing query");
        transaction.query(query).await
    }

    fn after_commit(&self, hook: AfterCommitHook) -> Result<(), StoreError> {
        match self.0.hooks.lock().as_mut() {
            Some(hooks) => {
                hooks.push(hook);
                Ok(())
            }
            None => {
                error!(account = ?self.0.account, "After-commit hook registered on a finished context");
                Err(StoreError::ContextInvalidated)
            }
        }
    }

    fn is_active(&self) -> bool {
        self.0.hooks.lock().is_some()
    }

    /// Detach the transaction and pending hooks. Every clone is invalid afterwards.
    async fn invalidate(&self) -> (Option<Box<dyn StoreTransaction>>, Vec<AfterCommitHook>) {
        let hooks = self.0.hooks.lock().take().unwrap_or_default();
        let transaction = self.0.transaction.lock().await.take();
        (transaction, hooks)
    }
}

/// Read/write access shared by both context kinds.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Run one statement inside the context's transaction.
    async fn query(&self, query: &SqlQuery) -> Result<QueryResult, StoreError>;

    /// Register a hook that runs after the transaction commits.
    ///
    /// Hooks never run when the transaction rolls back, and their failures
    /// are logged without affecting the outcome already returned.
    fn after_commit_boxed(&self, hook: AfterCommitHook) -> Result<(), StoreError>;

    /// `false` once the transaction has committed or rolled back.
    fn is_active(&self) -> bool;
}

/// Convenience wrapper over [`Queryable::after_commit_boxed`].
pub trait AfterCommitExt: Queryable {
    fn after_commit<F, Fut>(&self, hook: F) -> Result<(), StoreError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.after_commit_boxed(Box::new(move || Box::pin(hook())))
    }
}

impl<T: Queryable + ?Sized> AfterCommitExt for T {}

/// Context for code that runs without an authenticated account.
#[derive(Clone)]
pub struct UnauthorizedContext {
    handle: TransactionHandle,
}

/// Context scoped to one account.
#[derive(Clone)]
pub struct AuthorizedContext {
    handle: TransactionHandle,
    account: AccountId,
}

impl AuthorizedContext {
    pub fn account_id(&self) -> AccountId {
        self.account
    }
}

#[async_trait]
impl Queryable for UnauthorizedContext {
    async fn query(&self, query: &SqlQuery) -> Result<QueryResult, StoreError> {
        self.handle.query(query).await
    }

    fn after_commit_boxed(&self, hook: AfterCommitHook) -> Result<(), StoreError> {
        self.handle.after_commit(hook)
    }

    fn is_active(&self) -> bool {
        self.handle.is_active()
    }
}

#[async_trait]
impl Queryable for AuthorizedContext {
    async fn query(&self, query: &SqlQuery) -> Result<QueryResult, StoreError> {
        self.handle.query(query).await
    }

    fn after_commit_boxed(&self, hook: AfterCommitHook) -> Result<(), StoreError> {
        self.handle.after_commit(hook)
    }

    fn is_active(&self) -> bool {
        self.handle.is_active()
    }
}

/// Entry point for all database access.
#[derive(Clone)]
pub struct Database {
    store: Arc<dyn Store>,
}

impl Database {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Run `action` in a transaction with no account scoping.
    ///
    /// Commits when the action returns `Ok`, rolls back otherwise. The
    /// action's error is returned unchanged.
    pub async fn with_unauthorized<T, E, F, Fut>(&self, action: F) -> Result<T, E>
    where
        F: FnOnce(UnauthorizedContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        let transaction = self.store.begin().await?;
        let handle = TransactionHandle::new(transaction, None);
        let result = action(UnauthorizedContext {
            handle: handle.clone(),
        })
        .await;
        finish(handle, result).await
    }

    /// Run `action` in a transaction scoped to `account`.
    ///
    /// The account setting is applied before the action runs; if applying it
    /// fails, the transaction is rolled back and the action never runs.
    pub async fn with_authorized<T, E, F, Fut>(&self, account: AccountId, action: F) -> Result<T, E>
    where
        F: FnOnce(AuthorizedContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        let mut transaction = self.store.begin().await?;
        if let Err(err) = transaction.scope_to_account(account).await {
            warn!(%account, error = %err, "Failed to scope transaction to account");
            if let Err(rollback) = transaction.rollback().await {
                warn!(%account, error = %rollback, "Rollback after scoping failure failed");
            }
            return Err(err.into());
        }

        let handle = TransactionHandle::new(transaction, Some(account));
        let result = action(AuthorizedContext {
            handle: handle.clone(),
            account,
        })
        .await;
        finish(handle, result).await
    }
}

async fn finish<T, E>(handle: TransactionHandle, result: Result<T, E>) -> Result<T, E>
where
    E: From<StoreError>,
{
    let account = handle.0.account;
    let (transaction, hooks) = handle.invalidate().await;
    let Some(transaction) = transaction else {
        return Err(StoreError::ContextInvalidated.into());
    };

    match result {
        Ok(value) => {
            transaction.commit().await?;
            run_hooks(account, hooks).await;
            Ok(value)
        }
        Err(err) => {
            if !hooks.is_empty() {
                debug!(?account, dropped = hooks.len(), "Discarding after-commit hooks on rollback");
            }
            if let Err(rollback) = transaction.rollback().await {
                warn!(?account, error = %rollback, "Rollback failed");
            }
            Err(err)
        }
    }
}

async fn run_hooks(account: Option<AccountId>, hooks: Vec<AfterCommitHook>) {
    if hooks.is_empty() {
        return;
    }
    let results = join_all(hooks.into_iter().map(|hook| hook())).await;
    for err in results.into_iter().filter_map(Result::err) {
        warn!(?account, error = %err, "After-commit hook failed");
    }
}
