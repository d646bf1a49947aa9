//! Authorization chain for the API proxy.
//!
//! Authorizers are united with first-opinion-wins semantics: `NoOpinion`
//! moves to the next authorizer, `Allow`/`Deny` are final. The terminal
//! allow-all exists because everything that reaches the embedded API server
//! is re-authorized by its own RBAC; the earlier links cover exactly the
//! requests the proxy answers itself.

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    NonResourceAttributes, ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::Principal;
use crate::error::{Error, Result};
use crate::server::request_info::RequestInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    NoOpinion,
}

/// What is being authorized, in the shape SubjectAccessReview expects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    pub verb: String,
    pub api_group: String,
    pub resource: String,
    pub subresource: String,
    pub namespace: String,
    pub name: String,
    /// Set for non-resource requests; `resource` is empty then
    pub path: String,
    pub is_resource: bool,
}

impl Attributes {
    pub fn from_request_info(info: &RequestInfo) -> Self {
        if info.is_resource_request {
            Self {
                verb: info.verb.clone(),
                api_group: info.api_group.clone(),
                resource: info.resource.clone(),
                subresource: info.subresource.clone().unwrap_or_default(),
                namespace: info.namespace.clone().unwrap_or_default(),
                name: info.name.clone().unwrap_or_default(),
                is_resource: true,
                ..Default::default()
            }
        } else {
            Self {
                verb: info.verb.clone(),
                path: info.path.clone(),
                ..Default::default()
            }
        }
    }

    /// Attributes for impersonating one identity element
    pub fn impersonate(resource: &str, name: &str, subresource: Option<&str>) -> Self {
        Self {
            verb: "impersonate".to_string(),
            resource: resource.to_string(),
            name: name.to_string(),
            subresource: subresource.unwrap_or_default().to_string(),
            is_resource: true,
            ..Default::default()
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, principal: &Principal, attributes: &Attributes)
        -> Result<Decision>;
}

/// A resource rule the delegating authorizer forwards to the virtual API
/// server. `verb: "*"` matches every verb.
#[derive(Debug, Clone)]
pub struct GroupResourceVerb {
    pub api_group: String,
    pub resource: String,
    pub subresource: String,
    pub verb: String,
}

impl GroupResourceVerb {
    pub fn new(api_group: &str, resource: &str, subresource: &str, verb: &str) -> Self {
        Self {
            api_group: api_group.to_string(),
            resource: resource.to_string(),
            subresource: subresource.to_string(),
            verb: verb.to_string(),
        }
    }

    fn matches(&self, attributes: &Attributes) -> bool {
        attributes.is_resource
            && self.api_group == attributes.api_group
            && self.resource == attributes.resource
            && self.subresource == attributes.subresource
            && (self.verb == "*" || self.verb == attributes.verb)
    }
}

/// A non-resource path rule
#[derive(Debug, Clone)]
pub struct PathVerb {
    pub path: String,
    pub verb: String,
}

impl PathVerb {
    pub fn new(path: &str, verb: &str) -> Self {
        Self {
            path: path.to_string(),
            verb: verb.to_string(),
        }
    }

    fn matches(&self, attributes: &Attributes) -> bool {
        !attributes.is_resource
            && self.path == attributes.path
            && (self.verb == "*" || self.verb == attributes.verb)
    }
}

async fn subject_access_review(
    client: &Client,
    principal: &Principal,
    resource_attributes: Option<ResourceAttributes>,
    non_resource_attributes: Option<NonResourceAttributes>,
) -> Result<Decision> {
    let api: Api<SubjectAccessReview> = Api::all(client.clone());
    let review = SubjectAccessReview {
        metadata: Default::default(),
        spec: SubjectAccessReviewSpec {
            user: Some(principal.username.clone()),
            groups: Some(principal.groups.clone()),
            extra: if principal.extra.is_empty() {
                None
            } else {
                Some(principal.extra.clone())
            },
            resource_attributes,
            non_resource_attributes,
            uid: None,
        },
        status: None,
    };

    let result = api
        .create(&Default::default(), &review)
        .await
        .map_err(|e| Error::internal(format!("SubjectAccessReview request failed: {e}")))?;
    let allowed = result.status.map(|s| s.allowed).unwrap_or(false);
    Ok(if allowed { Decision::Allow } else { Decision::Deny })
}

/// Forwards decisions for the listed resources and paths to the virtual API
/// server; everything else is no opinion.
pub struct DelegatingAuthorizer {
    client: Client,
    resources: Vec<GroupResourceVerb>,
    paths: Vec<PathVerb>,
}

impl DelegatingAuthorizer {
    pub fn new(client: Client, resources: Vec<GroupResourceVerb>, paths: Vec<PathVerb>) -> Self {
        Self {
            client,
            resources,
            paths,
        }
    }
}

#[async_trait]
impl Authorizer for DelegatingAuthorizer {
    async fn authorize(
        &self,
        principal: &Principal,
        attributes: &Attributes,
    ) -> Result<Decision> {
        if attributes.is_resource {
            if self.resources.iter().any(|r| r.matches(attributes)) {
                debug!(
                    user = %principal.username,
                    resource = %attributes.resource,
                    subresource = %attributes.subresource,
                    "delegating authorization to virtual API server"
                );
                return subject_access_review(
                    &self.client,
                    principal,
                    Some(ResourceAttributes {
                        group: Some(attributes.api_group.clone()),
                        resource: Some(attributes.resource.clone()),
                        subresource: Some(attributes.subresource.clone()),
                        namespace: Some(attributes.namespace.clone()),
                        name: Some(attributes.name.clone()),
                        verb: Some(attributes.verb.clone()),
                        ..Default::default()
                    }),
                    None,
                )
                .await;
            }
        } else if self.paths.iter().any(|p| p.matches(attributes)) {
            return subject_access_review(
                &self.client,
                principal,
                None,
                Some(NonResourceAttributes {
                    path: Some(attributes.path.clone()),
                    verb: Some(attributes.verb.clone()),
                }),
            )
            .await;
        }
        Ok(Decision::NoOpinion)
    }
}

/// Answers impersonation attribute checks via SubjectAccessReview
pub struct ImpersonationAuthorizer {
    client: Client,
}

impl ImpersonationAuthorizer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

const IMPERSONATION_RESOURCES: &[&str] = &["users", "groups", "uids", "serviceaccounts", "userextras"];

#[async_trait]
impl Authorizer for ImpersonationAuthorizer {
    async fn authorize(
        &self,
        principal: &Principal,
        attributes: &Attributes,
    ) -> Result<Decision> {
        if attributes.verb != "impersonate"
            || !IMPERSONATION_RESOURCES.contains(&attributes.resource.as_str())
        {
            return Ok(Decision::NoOpinion);
        }

        subject_access_review(
            &self.client,
            principal,
            Some(ResourceAttributes {
                resource: Some(attributes.resource.clone()),
                subresource: Some(attributes.subresource.clone()),
                name: Some(attributes.name.clone()),
                verb: Some("impersonate".to_string()),
                ..Default::default()
            }),
            None,
        )
        .await
    }
}

/// Terminal link: the embedded API server re-authorizes everything that
/// reaches it
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _: &Principal, _: &Attributes) -> Result<Decision> {
        Ok(Decision::Allow)
    }
}

/// Union of authorizers; the first Allow or Deny wins
pub struct AuthorizerChain {
    authorizers: Vec<Box<dyn Authorizer>>,
}

impl AuthorizerChain {
    pub fn new(authorizers: Vec<Box<dyn Authorizer>>) -> Self {
        Self { authorizers }
    }

    pub async fn authorize(&self, principal: &Principal, attributes: &Attributes) -> Result<()> {
        for authorizer in &self.authorizers {
            match authorizer.authorize(principal, attributes).await? {
                Decision::Allow => return Ok(()),
                Decision::Deny => {
                    return Err(Error::Forbidden(format!(
                        "user {:?} cannot {} {}",
                        principal.username,
                        attributes.verb,
                        if attributes.is_resource {
                            &attributes.resource
                        } else {
                            &attributes.path
                        },
                    )))
                }
                Decision::NoOpinion => {}
            }
        }
        Err(Error::Forbidden("no authorizer had an opinion".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use std::collections::BTreeMap;

    fn principal() -> Principal {
        Principal {
            username: "jane".into(),
            groups: vec!["dev".into()],
            extra: BTreeMap::new(),
        }
    }

    fn exec_attributes() -> Attributes {
        let info = RequestInfo::parse(
            &Method::POST,
            "/api/v1/namespaces/test/pods/web/exec",
            None,
        );
        Attributes::from_request_info(&info)
    }

    #[test]
    fn resource_rule_matching() {
        let rule = GroupResourceVerb::new("", "pods", "exec", "*");
        assert!(rule.matches(&exec_attributes()));

        let rule = GroupResourceVerb::new("", "pods", "portforward", "*");
        assert!(!rule.matches(&exec_attributes()));

        let rule = GroupResourceVerb::new("", "pods", "exec", "get");
        assert!(!rule.matches(&exec_attributes()));
    }

    #[test]
    fn path_rule_matching() {
        let info = RequestInfo::parse(&Method::GET, "/metrics/cadvisor", None);
        let attrs = Attributes::from_request_info(&info);

        assert!(PathVerb::new("/metrics/cadvisor", "*").matches(&attrs));
        assert!(!PathVerb::new("/metrics/probes", "*").matches(&attrs));
        // A resource rule never matches a non-resource request.
        assert!(!GroupResourceVerb::new("", "pods", "", "*").matches(&attrs));
    }

    #[test]
    fn impersonation_attributes() {
        let attrs = Attributes::impersonate("users", "admin", None);
        assert_eq!(attrs.verb, "impersonate");
        assert_eq!(attrs.resource, "users");
        assert_eq!(attrs.name, "admin");
    }

    #[tokio::test]
    async fn chain_stops_at_first_opinion() {
        let mut deny = MockAuthorizer::new();
        deny.expect_authorize()
            .returning(|_, _| Ok(Decision::Deny));
        let mut never_called = MockAuthorizer::new();
        never_called.expect_authorize().never();

        let chain = AuthorizerChain::new(vec![Box::new(deny), Box::new(never_called)]);
        let err = chain
            .authorize(&principal(), &exec_attributes())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn no_opinion_falls_through_to_allow_all() {
        let mut none = MockAuthorizer::new();
        none.expect_authorize()
            .returning(|_, _| Ok(Decision::NoOpinion));

        let chain = AuthorizerChain::new(vec![Box::new(none), Box::new(AllowAll)]);
        chain
            .authorize(&principal(), &exec_attributes())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_chain_fails_closed() {
        let chain = AuthorizerChain::new(vec![]);
        assert!(chain
            .authorize(&principal(), &exec_attributes())
            .await
            .is_err());
    }
}
