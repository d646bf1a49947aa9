//! Authentication and authorization for the API proxy.
//!
//! Tenants keep using the credentials they already have: bearer tokens are
//! delegated to the virtual API server via TokenReview, front-proxy identity
//! comes from the request headers the aggregation CA vouches for, and
//! authorization for the redirected resources is delegated via
//! SubjectAccessReview. Everything else falls through to the embedded API
//! server, which runs its own RBAC.

mod authorizer;
mod delegating;

pub use authorizer::{
    AllowAll, Attributes, Authorizer, AuthorizerChain, Decision, DelegatingAuthorizer,
    GroupResourceVerb, ImpersonationAuthorizer, PathVerb,
};
pub use delegating::DelegatingAuthenticator;

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use tracing::debug;

use crate::error::{Error, Result};

/// The authenticated caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

/// The bearer token on a request, if any
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// One way of establishing the caller's identity. `Ok(None)` means "not my
/// kind of credential, try the next authenticator".
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Principal>>;
}

/// Front-proxy identity headers, trusted because the TLS listener verified
/// the client certificate against the request-header CA
pub struct RequestHeaderAuthenticator {
    user_header: String,
    group_header: String,
    extra_prefix: String,
}

impl Default for RequestHeaderAuthenticator {
    fn default() -> Self {
        Self {
            user_header: "x-remote-user".to_string(),
            group_header: "x-remote-group".to_string(),
            extra_prefix: "x-remote-extra-".to_string(),
        }
    }
}

impl RequestHeaderAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Authenticator for RequestHeaderAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Principal>> {
        let Some(user) = headers.get(&self.user_header).and_then(|v| v.to_str().ok()) else {
            return Ok(None);
        };

        let groups = headers
            .get_all(&self.group_header)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .collect();

        let mut extra = BTreeMap::new();
        for (name, value) in headers {
            let name = name.as_str();
            if let Some(key) = name.strip_prefix(&self.extra_prefix) {
                if let Ok(value) = value.to_str() {
                    extra
                        .entry(key.to_string())
                        .or_insert_with(Vec::new)
                        .push(value.to_string());
                }
            }
        }

        Ok(Some(Principal {
            username: user.to_string(),
            groups,
            extra,
        }))
    }
}

/// Authenticators united front to back; the first identity wins
pub struct AuthChain {
    authenticators: Vec<Box<dyn Authenticator>>,
}

impl AuthChain {
    pub fn new(authenticators: Vec<Box<dyn Authenticator>>) -> Self {
        Self { authenticators }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal> {
        let mut last_error = None;
        for authenticator in &self.authenticators {
            match authenticator.authenticate(headers).await {
                Ok(Some(principal)) => {
                    debug!(user = %principal.username, "request authenticated");
                    return Ok(principal);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, "authenticator rejected request, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Unauthorized("no credentials provided".into())))
    }
}
