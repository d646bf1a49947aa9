//! Metrics filters.
//!
//! Injection: `GET /metrics` responses from the embedded API server get the
//! syncer's own registry appended, so one scrape shows both.
//!
//! Rewrite: node-proxy metrics (`/api/v1/nodes/{name}/proxy/metrics*`) come
//! from the host kubelet and talk about physical pods; their pod and
//! namespace labels are rewritten back to the tenant's names before the
//! response leaves the proxy.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};

use super::{Filter, FilterResult, RequestContext};
use crate::error::Result;
use crate::index::NameCache;
use crate::metrics::{encode_text, PROXY_REQUESTS_TOTAL};
use crate::server::upstream::{set_impersonation_headers, Upstream};

/// Appends syncer metrics to the embedded API server's `/metrics`
pub struct InjectedMetricsFilter {
    virtual_upstream: Arc<Upstream>,
}

impl InjectedMetricsFilter {
    pub fn new(virtual_upstream: Arc<Upstream>) -> Self {
        Self { virtual_upstream }
    }
}

#[async_trait]
impl Filter for InjectedMetricsFilter {
    async fn handle(&self, ctx: &RequestContext, request: Request<Body>) -> Result<FilterResult> {
        if request.method() != Method::GET || ctx.info.path != "/metrics" {
            return Ok(FilterResult::Continue(request));
        }
        PROXY_REQUESTS_TOTAL.with_label_values(&["inject"]).inc();

        let mut headers = request.headers().clone();
        set_impersonation_headers(&mut headers, &ctx.principal);

        let mut response = self
            .virtual_upstream
            .fetch_buffered(request.method(), "/metrics", &headers, Vec::new())
            .await?;
        if response.status.is_success() {
            if !response.body.ends_with(b"\n") {
                response.body.push(b'\n');
            }
            response.body.extend_from_slice(encode_text().as_bytes());
        }
        Ok(FilterResult::Handled(response.into_response()?))
    }
}

/// Rewrites physical pod names in node-proxy metrics back to virtual ones
pub struct MetricsRewriteFilter {
    host_upstream: Arc<Upstream>,
    name_cache: Arc<NameCache>,
    target_namespace: String,
}

impl MetricsRewriteFilter {
    pub fn new(
        host_upstream: Arc<Upstream>,
        name_cache: Arc<NameCache>,
        target_namespace: impl Into<String>,
    ) -> Self {
        Self {
            host_upstream,
            name_cache,
            target_namespace: target_namespace.into(),
        }
    }

    fn matches(ctx: &RequestContext) -> bool {
        let info = &ctx.info;
        info.is_resource_request
            && info.api_group.is_empty()
            && info.resource == "nodes"
            && info.subresource.as_deref() == Some("proxy")
            && info.parts.first().is_some_and(|p| p.starts_with("metrics"))
    }
}

/// Line-based label rewrite: wherever a sample names a managed physical pod,
/// the pod label becomes the virtual name and the namespace label the
/// virtual namespace.
fn rewrite_metrics(
    body: &str,
    target_namespace: &str,
    pairs: &[(String, crate::translate::refs::ResourceRef)],
) -> String {
    let mut out = String::with_capacity(body.len());
    for line in body.lines() {
        let mut line = line.to_string();
        for (physical_name, virtual_ref) in pairs {
            let physical_label = format!("pod=\"{physical_name}\"");
            if !line.contains(&physical_label) {
                continue;
            }
            line = line.replace(&physical_label, &format!("pod=\"{}\"", virtual_ref.name));
            line = line.replace(
                &format!("namespace=\"{target_namespace}\""),
                &format!("namespace=\"{}\"", virtual_ref.namespace),
            );
            break;
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[async_trait]
impl Filter for MetricsRewriteFilter {
    async fn handle(&self, ctx: &RequestContext, request: Request<Body>) -> Result<FilterResult> {
        if request.method() != Method::GET || !Self::matches(ctx) {
            return Ok(FilterResult::Continue(request));
        }
        PROXY_REQUESTS_TOTAL.with_label_values(&["rewrite"]).inc();

        let mut headers = request.headers().clone();
        set_impersonation_headers(&mut headers, &ctx.principal);

        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| ctx.info.path.clone());

        let mut response = self
            .host_upstream
            .fetch_buffered(request.method(), &path_and_query, &headers, Vec::new())
            .await?;

        if response.status.is_success() {
            let pairs = self.name_cache.pairs("Pod");
            let body = String::from_utf8_lossy(&response.body);
            response.body = rewrite_metrics(&body, &self.target_namespace, &pairs).into_bytes();
        }
        Ok(FilterResult::Handled(response.into_response()?))
    }
}
