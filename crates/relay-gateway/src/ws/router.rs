//! Path → subscription handler routing.

use crate::domain::error::ApiError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use relay_store::SubscriptionContext;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tears down one subscription. Runs at most once.
pub struct Unsubscribe(Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ApiError>> + Send>);

impl Unsubscribe {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ApiError>> + Send + 'static,
    {
        Self(Box::new(move || f().boxed()))
    }

    /// An unsubscribe with nothing to release.
    pub fn noop() -> Self {
        Self::new(|| async { Ok(()) })
    }

    pub async fn run(self) -> Result<(), ApiError> {
        (self.0)().await
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unsubscribe")
    }
}

/// A domain subscription bound to one path.
///
/// `validate` runs synchronously while the session reserves the id;
/// `subscribe` runs on its own task afterwards.
#[async_trait]
pub trait SubscriptionHandler: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + 'static;

    fn validate(&self, _input: &Self::Input) -> Result<(), ApiError> {
        Ok(())
    }

    /// Start delivering events through `ctx.publish`, returning the teardown.
    async fn subscribe(
        &self,
        ctx: SubscriptionContext,
        input: Self::Input,
    ) -> Result<Unsubscribe, ApiError>;
}

/// Input that passed validation, waiting for a context to run in.
pub struct PreparedSubscription(
    Box<dyn FnOnce(SubscriptionContext) -> BoxFuture<'static, Result<Unsubscribe, ApiError>> + Send>,
);

impl PreparedSubscription {
    pub fn invoke(self, ctx: SubscriptionContext) -> BoxFuture<'static, Result<Unsubscribe, ApiError>> {
        (self.0)(ctx)
    }
}

trait Route: Send + Sync {
    fn prepare(&self, input: Value) -> Result<PreparedSubscription, ApiError>;
}

struct HandlerRoute<H>(Arc<H>);

impl<H: SubscriptionHandler> Route for HandlerRoute<H> {
    fn prepare(&self, input: Value) -> Result<PreparedSubscription, ApiError> {
        let input: H::Input = serde_json::from_value(input)?;
        self.0.validate(&input)?;
        let handler = Arc::clone(&self.0);
        Ok(PreparedSubscription(Box::new(move |ctx| {
            async move { handler.subscribe(ctx, input).await }.boxed()
        })))
    }
}

/// Registered subscription paths.
#[derive(Clone, Default)]
pub struct SubscriptionRouter {
    routes: HashMap<String, Arc<dyn Route>>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<H: SubscriptionHandler>(mut self, path: impl Into<String>, handler: H) -> Self {
        let path = path.into();
        debug!(path = %path, "Registered subscription route");
        if self
            .routes
            .insert(path.clone(), Arc::new(HandlerRoute(Arc::new(handler))))
            .is_some()
        {
            warn!(path = %path, "Subscription route registered twice, keeping the latest");
        }
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Resolve `path` and validate `input` against its handler.
    ///
    /// Unknown paths fail with `NOT_FOUND`, input that does not decode or
    /// validate with `BAD_INPUT`.
    pub fn prepare(&self, path: &str, input: Value) -> Result<PreparedSubscription, ApiError> {
        let route = self
            .routes
            .get(path)
            .ok_or_else(|| ApiError::not_found(format!("no subscription at `{path}`")))?;
        route.prepare(input)
    }
}

impl fmt::Debug for SubscriptionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRouter")
            .field("paths", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}
