//! Access token authentication for the WebSocket upgrade.
//!
//! Tokens have the form `<account_id>.<hex hmac-sha256(account_id)>` and are
//! read from the `access_token` query parameter (browsers cannot set headers
//! on a WebSocket upgrade) or an `Authorization: Bearer` header. On success
//! the [`AccountId`] is inserted into the request extensions.

use crate::middleware::metrics::GatewayMetrics;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use relay_store::AccountId;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Query parameter carrying the access token.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing access token")]
    Missing,
    #[error("malformed access token")]
    Malformed,
    #[error("invalid access token signature")]
    InvalidSignature,
}

/// Resolves an access token to the account it was issued for.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<AccountId, AuthError>;
}

/// HMAC-SHA256 token verifier.
#[derive(Clone)]
pub struct HmacTokenVerifier {
    key: Arc<[u8]>,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: Arc::from(secret.as_ref()),
        }
    }

    /// Produce a token for `account`.
    pub fn sign(&self, account: AccountId) -> String {
        format!("{account}.{}", hex::encode(self.tag(account)))
    }

    fn tag(&self, account: AccountId) -> Vec<u8> {
        // HMAC accepts keys of any length.
        let mut mac = match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(account.to_string().as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

impl TokenVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> Result<AccountId, AuthError> {
        let (account, signature) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let account: AccountId = account.parse().map_err(|_| AuthError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| AuthError::Malformed)?;

        let expected = self.tag(account);
        if expected.is_empty() || !bool::from(expected.ct_eq(&signature)) {
            return Err(AuthError::InvalidSignature);
        }
        Ok(account)
    }
}

/// Authentication layer
#[derive(Clone)]
pub struct AuthLayer {
    verifier: Arc<dyn TokenVerifier>,
    metrics: Arc<GatewayMetrics>,
}

impl AuthLayer {
    pub fn new(verifier: Arc<dyn TokenVerifier>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { verifier, metrics }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            verifier: Arc::clone(&self.verifier),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// Authentication service
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    verifier: Arc<dyn TokenVerifier>,
    metrics: Arc<GatewayMetrics>,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let verified = extract_token(&req)
            .ok_or(AuthError::Missing)
            .and_then(|token| self.verifier.verify(&token));

        match verified {
            Ok(account) => {
                debug!(%account, "Access token accepted");
                req.extensions_mut().insert(account);
                // Call the instance that was driven ready; leave a fresh clone behind.
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(async move { inner.call(req).await })
            }
            Err(err) => {
                warn!(error = %err, uri = %req.uri().path(), "Rejected unauthenticated upgrade");
                self.metrics.record_auth_rejected();
                Box::pin(async move { Ok((StatusCode::UNAUTHORIZED, err.to_string()).into_response()) })
            }
        }
    }
}

fn extract_token<B>(req: &Request<B>) -> Option<String> {
    let from_query = req.uri().query().and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == ACCESS_TOKEN_PARAM)
            .map(|(_, value)| value.into_owned())
    });
    if from_query.is_some() {
        return from_query;
    }

    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}
