//! Redirect filter.
//!
//! Kubelet-style subresources (exec, attach, log, port-forward, proxy) must
//! reach a real kubelet, and the embedded API server has none. Matching
//! requests are proxied to the host API server instead, impersonating the
//! tenant identity, with the target name translated to its physical form.
//! Node names are host-real and pass through untranslated.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Uri};

use super::{Filter, FilterResult, RequestContext};
use crate::error::{Error, Result};
use crate::metrics::PROXY_REQUESTS_TOTAL;
use crate::server::upstream::{set_impersonation_headers, Upstream};
use crate::translate::Translator;

/// A `(resource, subresource)` pair served by the host API server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectResource {
    pub resource: &'static str,
    pub subresource: &'static str,
}

/// The fixed set of redirected subresources
pub fn default_redirect_resources() -> Vec<RedirectResource> {
    let mut resources = vec![RedirectResource {
        resource: "nodes",
        subresource: "proxy",
    }];
    for subresource in ["proxy", "portforward", "exec", "attach", "log"] {
        resources.push(RedirectResource {
            resource: "pods",
            subresource,
        });
    }
    resources.push(RedirectResource {
        resource: "services",
        subresource: "proxy",
    });
    resources
}

pub struct RedirectFilter {
    host_upstream: Arc<Upstream>,
    translator: Translator,
    resources: Vec<RedirectResource>,
}

impl RedirectFilter {
    pub fn new(
        host_upstream: Arc<Upstream>,
        translator: Translator,
        resources: Vec<RedirectResource>,
    ) -> Self {
        Self {
            host_upstream,
            translator,
            resources,
        }
    }

    fn matches(&self, ctx: &RequestContext) -> bool {
        let info = &ctx.info;
        if !info.is_resource_request || !info.api_group.is_empty() || info.name.is_none() {
            return false;
        }
        let Some(subresource) = info.subresource.as_deref() else {
            return false;
        };
        self.resources
            .iter()
            .any(|r| r.resource == info.resource && r.subresource == subresource)
    }

    /// The host-side path for a redirected request
    fn translate_path(&self, ctx: &RequestContext) -> Result<String> {
        let info = &ctx.info;
        let name = info
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("redirect request has no name"))?;
        let subresource = info
            .subresource
            .as_deref()
            .ok_or_else(|| Error::validation("redirect request has no subresource"))?;

        let mut path = if info.resource == "nodes" {
            format!("/api/v1/nodes/{name}/{subresource}")
        } else {
            let namespace = info
                .namespace
                .as_deref()
                .ok_or_else(|| Error::validation("redirect request has no namespace"))?;
            let physical_name = self.translator.physical_name(name, namespace);
            format!(
                "/api/v1/namespaces/{}/{}/{}/{}",
                self.translator.target_namespace(),
                info.resource,
                physical_name,
                subresource,
            )
        };
        if !info.parts.is_empty() {
            path.push('/');
            path.push_str(&info.proxy_path());
        }
        Ok(path)
    }
}

#[async_trait]
impl Filter for RedirectFilter {
    async fn handle(&self, ctx: &RequestContext, request: Request<Body>) -> Result<FilterResult> {
        if !self.matches(ctx) {
            return Ok(FilterResult::Continue(request));
        }
        PROXY_REQUESTS_TOTAL.with_label_values(&["redirect"]).inc();

        let path = self.translate_path(ctx)?;
        let uri = match request.uri().query() {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };

        let (mut parts, body) = request.into_parts();
        parts.uri = uri
            .parse::<Uri>()
            .map_err(|e| Error::internal(format!("invalid redirect uri: {e}")))?;
        set_impersonation_headers(&mut parts.headers, &ctx.principal);

        let response = self
            .host_upstream
            .forward(Request::from_parts(parts, body))
            .await?;
        Ok(FilterResult::Handled(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::request_info::RequestInfo;
    use axum::http::Method;
    use std::time::Duration;

    async fn filter() -> RedirectFilter {
        RedirectFilter::new(
            Arc::new(
                Upstream::new(
                    "https://host.invalid",
                    None,
                    None,
                    None,
                    Duration::from_secs(30),
                )
                .await
                .unwrap(),
            ),
            Translator::new("vc-host", "s1"),
            default_redirect_resources(),
        )
    }

    fn ctx(method: Method, path: &str) -> RequestContext {
        RequestContext {
            principal: Default::default(),
            info: RequestInfo::parse(&method, path, None),
        }
    }

    #[tokio::test]
    async fn matches_only_redirected_subresources() {
        let filter = filter().await;
        assert!(filter.matches(&ctx(
            Method::POST,
            "/api/v1/namespaces/test/pods/web/exec"
        )));
        assert!(filter.matches(&ctx(
            Method::GET,
            "/api/v1/namespaces/test/pods/web/log"
        )));
        assert!(filter.matches(&ctx(Method::GET, "/api/v1/nodes/node-1/proxy/stats")));
        assert!(filter.matches(&ctx(
            Method::GET,
            "/api/v1/namespaces/test/services/web/proxy"
        )));

        assert!(!filter.matches(&ctx(Method::GET, "/api/v1/namespaces/test/pods/web")));
        assert!(!filter.matches(&ctx(
            Method::GET,
            "/api/v1/namespaces/test/pods/web/status"
        )));
        assert!(!filter.matches(&ctx(Method::GET, "/metrics")));
    }

    #[tokio::test]
    async fn pod_exec_path_is_translated() {
        let filter = filter().await;
        let path = filter
            .translate_path(&ctx(
                Method::POST,
                "/api/v1/namespaces/test/pods/web/exec",
            ))
            .unwrap();
        assert_eq!(path, "/api/v1/namespaces/vc-host/pods/web-x-test-x-s1/exec");
    }

    #[tokio::test]
    async fn node_proxy_path_keeps_the_node_name() {
        let filter = filter().await;
        let path = filter
            .translate_path(&ctx(
                Method::GET,
                "/api/v1/nodes/node-1/proxy/stats/summary",
            ))
            .unwrap();
        assert_eq!(path, "/api/v1/nodes/node-1/proxy/stats/summary");
    }
}
