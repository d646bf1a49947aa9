//! Bearer-token authentication delegated to the virtual API server.
//!
//! Tenants authenticate with the same tokens they use against the embedded
//! control plane; the proxy submits them to its TokenReview API and adopts
//! the identity it reports.

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::{Api, Client};
use tracing::debug;

use super::{extract_bearer_token, Authenticator, Principal};
use crate::error::{Error, Result};

pub struct DelegatingAuthenticator {
    client: Client,
}

impl DelegatingAuthenticator {
    /// `client` must point at the virtual API server
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn principal_from_status(status: &TokenReviewStatus) -> Result<Principal> {
        if !status.authenticated.unwrap_or(false) {
            let msg = status.error.as_deref().unwrap_or("token rejected");
            return Err(Error::Unauthorized(msg.to_string()));
        }

        let user = status
            .user
            .as_ref()
            .ok_or_else(|| Error::internal("TokenReview authenticated but carries no user"))?;
        let username = user
            .username
            .clone()
            .ok_or_else(|| Error::internal("TokenReview user has no username"))?;

        let extra: BTreeMap<String, Vec<String>> = user
            .extra
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();

        Ok(Principal {
            username,
            groups: user.groups.clone().unwrap_or_default(),
            extra,
        })
    }
}

#[async_trait]
impl Authenticator for DelegatingAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Principal>> {
        let Some(token) = extract_bearer_token(headers) else {
            return Ok(None);
        };

        let api: Api<TokenReview> = Api::all(self.client.clone());
        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: None,
            },
            status: None,
        };

        let result = api
            .create(&Default::default(), &review)
            .await
            .map_err(|e| Error::internal(format!("TokenReview request failed: {e}")))?;
        let status = result
            .status
            .ok_or_else(|| Error::internal("TokenReview returned no status"))?;

        let principal = Self::principal_from_status(&status)?;
        debug!(user = %principal.username, "token review accepted bearer token");
        Ok(Some(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::authentication::v1::UserInfo;

    #[test]
    fn authenticated_status_yields_principal() {
        let status = TokenReviewStatus {
            authenticated: Some(true),
            user: Some(UserInfo {
                username: Some("system:serviceaccount:test:default".into()),
                groups: Some(vec![
                    "system:serviceaccounts".into(),
                    "system:serviceaccounts:test".into(),
                ]),
                extra: None,
                uid: None,
            }),
            ..Default::default()
        };

        let principal = DelegatingAuthenticator::principal_from_status(&status).unwrap();
        assert_eq!(principal.username, "system:serviceaccount:test:default");
        assert_eq!(principal.groups.len(), 2);
    }

    #[test]
    fn rejected_status_is_unauthorized() {
        let status = TokenReviewStatus {
            authenticated: Some(false),
            error: Some("token expired".into()),
            ..Default::default()
        };
        let err = DelegatingAuthenticator::principal_from_status(&status).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert!(err.to_string().contains("token expired"));
    }

    #[test]
    fn authenticated_without_user_is_an_error() {
        let status = TokenReviewStatus {
            authenticated: Some(true),
            user: None,
            ..Default::default()
        };
        assert!(DelegatingAuthenticator::principal_from_status(&status).is_err());
    }
}
