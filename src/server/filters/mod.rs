//! The proxy's request filters.
//!
//! Filters run in a fixed order in front of the embedded virtual API server;
//! each either produces the response itself or hands the request to the next
//! one. The impersonating fallthrough at the end always handles.

pub mod impersonate;
pub mod metrics;
pub mod redirect;
pub mod service_create;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};

use super::auth::Principal;
use super::request_info::RequestInfo;
use crate::error::Result;

/// Authenticated context every filter sees
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Principal,
    pub info: RequestInfo,
}

pub enum FilterResult {
    /// The filter produced the response
    Handled(Response<Body>),
    /// Not this filter's request; pass it on unchanged (or rewritten)
    Continue(Request<Body>),
}

#[async_trait]
pub trait Filter: Send + Sync {
    async fn handle(&self, ctx: &RequestContext, request: Request<Body>) -> Result<FilterResult>;
}
