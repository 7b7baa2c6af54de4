//! Long-lived context handed to subscription handlers.

use crate::account::AccountId;
use crate::context::{AuthorizedContext, Database};
use crate::error::StoreError;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::error;

/// Delivers one message to the subscriber.
///
/// Implementations must enqueue synchronously so that messages go out in
/// the order `publish` was called.
pub trait Publish: Send + Sync {
    fn publish(&self, message: Value);
}

/// Context bound to one subscription for the lifetime of its connection.
///
/// It never holds a connection itself. Reads go through
/// [`with_authorized`](Self::with_authorized), which opens a short
/// transaction scoped to the subscriber's account.
#[derive(Clone)]
pub struct SubscriptionContext {
    account: AccountId,
    database: Database,
    publisher: Arc<dyn Publish>,
}

impl SubscriptionContext {
    pub fn new(account: AccountId, database: Database, publisher: Arc<dyn Publish>) -> Self {
        Self {
            account,
            database,
            publisher,
        }
    }

    pub fn account_id(&self) -> AccountId {
        self.account
    }

    /// Step up into a transaction scoped to the subscriber's account.
    pub async fn with_authorized<T, E, F, Fut>(&self, action: F) -> Result<T, E>
    where
        F: FnOnce(AuthorizedContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        self.database.with_authorized(self.account, action).await
    }

    /// Send a message to the subscriber.
    pub fn publish<M: Serialize>(&self, message: &M) {
        match serde_json::to_value(message) {
            Ok(value) => self.publisher.publish(value),
            Err(err) => error!(account = %self.account, error = %err, "Failed to serialize published message"),
        }
    }
}

impl fmt::Debug for SubscriptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionContext")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}
