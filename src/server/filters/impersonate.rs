//! Impersonating fallthrough.
//!
//! Everything no earlier filter claimed goes to the embedded virtual API
//! server, authenticated as the proxy itself with `Impersonate-*` headers
//! carrying the caller's identity, so the embedded RBAC sees the real
//! tenant. Always handles; this is the end of the chain.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;

use super::{Filter, FilterResult, RequestContext};
use crate::error::Result;
use crate::metrics::PROXY_REQUESTS_TOTAL;
use crate::server::upstream::{set_impersonation_headers, Upstream};

pub struct ImpersonateFilter {
    virtual_upstream: Arc<Upstream>,
}

impl ImpersonateFilter {
    pub fn new(virtual_upstream: Arc<Upstream>) -> Self {
        Self { virtual_upstream }
    }
}

#[async_trait]
impl Filter for ImpersonateFilter {
    async fn handle(&self, ctx: &RequestContext, request: Request<Body>) -> Result<FilterResult> {
        PROXY_REQUESTS_TOTAL
            .with_label_values(&["impersonate"])
            .inc();

        let (mut parts, body) = request.into_parts();
        set_impersonation_headers(&mut parts.headers, &ctx.principal);

        let response = self
            .virtual_upstream
            .forward(Request::from_parts(parts, body))
            .await?;
        Ok(FilterResult::Handled(response))
    }
}
