//! HTTP forwarding to an upstream API server.
//!
//! One `Upstream` fronts either the embedded virtual API server or the host
//! API server. It authenticates with its own credential, carries the caller's
//! identity via impersonation headers, and supports the three response
//! shapes the proxy needs: buffered (for bodies the filters rewrite),
//! streaming (watches, logs), and protocol upgrades (exec, attach,
//! port-forward tunnels).
//!
//! User-supplied impersonation headers never pass through unexamined: the
//! filter chain decides what identity is forwarded.

use std::path::PathBuf;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use futures::TryStreamExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::auth::Principal;
use crate::error::{Error, Result};

/// Headers never copied verbatim to the upstream request
const SKIPPED_HEADERS: &[&str] = &["host", "authorization", "content-length"];

const IMPERSONATE_USER: &str = "impersonate-user";
const IMPERSONATE_GROUP: &str = "impersonate-group";
const IMPERSONATE_UID: &str = "impersonate-uid";
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// Whether a request carries any impersonation header
pub fn has_impersonation_headers(headers: &HeaderMap) -> bool {
    headers.keys().any(|name| {
        let name = name.as_str();
        name == IMPERSONATE_USER
            || name == IMPERSONATE_GROUP
            || name == IMPERSONATE_UID
            || name.starts_with(IMPERSONATE_EXTRA_PREFIX)
    })
}

/// Remove every impersonation header from a header map
pub fn strip_impersonation_headers(headers: &mut HeaderMap) {
    let impersonation: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let name = name.as_str();
            name == IMPERSONATE_USER
                || name == IMPERSONATE_GROUP
                || name == IMPERSONATE_UID
                || name.starts_with(IMPERSONATE_EXTRA_PREFIX)
        })
        .cloned()
        .collect();
    for name in impersonation {
        headers.remove(&name);
    }
}

/// Set impersonation headers for the given principal
pub fn set_impersonation_headers(headers: &mut HeaderMap, principal: &Principal) {
    strip_impersonation_headers(headers);
    if let Ok(value) = HeaderValue::from_str(&principal.username) {
        headers.insert(HeaderName::from_static(IMPERSONATE_USER), value);
    }
    for group in &principal.groups {
        if let Ok(value) = HeaderValue::from_str(group) {
            headers.append(HeaderName::from_static(IMPERSONATE_GROUP), value);
        }
    }
    for (key, values) in &principal.extra {
        let Ok(name) = HeaderName::try_from(format!("{IMPERSONATE_EXTRA_PREFIX}{key}")) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
}

/// A buffered upstream response, for filters that rewrite bodies
pub struct BufferedResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl BufferedResponse {
    pub fn into_response(self) -> Result<Response<Body>> {
        Response::builder()
            .status(self.status)
            .header("content-type", self.content_type)
            .body(Body::from(self.body))
            .map_err(|e| Error::internal(format!("failed to build response: {e}")))
    }
}

pub struct Upstream {
    base_url: String,
    client: reqwest::Client,
    token_path: Option<PathBuf>,
}

impl Upstream {
    /// `ca_file` verifies the upstream's serving certificate. The proxy's
    /// own credential is either a client certificate (`identity_file`, cert
    /// and key concatenated as PEM) or a bearer token (`token_path`, re-read
    /// per request since tokens rotate).
    pub async fn new(
        base_url: impl Into<String>,
        ca_file: Option<PathBuf>,
        identity_file: Option<PathBuf>,
        token_path: Option<PathBuf>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(timeout)
            // Long-lived watches and tunnels must not hit a total deadline.
            .read_timeout(timeout);

        if let Some(ca_file) = ca_file {
            let pem = tokio::fs::read(&ca_file)
                .await
                .map_err(|e| Error::config(format!("read CA {}: {e}", ca_file.display())))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(identity_file) = identity_file {
            let pem = tokio::fs::read(&identity_file).await.map_err(|e| {
                Error::config(format!("read identity {}: {e}", identity_file.display()))
            })?;
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| Error::config(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| Error::internal(format!("failed to build upstream client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            token_path,
        })
    }

    async fn bearer(&self) -> Result<Option<Zeroizing<String>>> {
        let Some(path) = &self.token_path else {
            return Ok(None);
        };
        let token = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config(format!("read token {}: {e}", path.display())))?;
        Ok(Some(Zeroizing::new(token.trim().to_string())))
    }

    fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    async fn build_request(
        &self,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<reqwest::Request> {
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|_| Error::validation(format!("invalid method {method}")))?;

        let mut builder = self.client.request(method, self.url_for(path_and_query));
        for (name, value) in headers {
            if SKIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(token) = self.bearer().await? {
            builder = builder.bearer_auth(&*token);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }
        builder
            .build()
            .map_err(|e| Error::internal(format!("failed to build upstream request: {e}")))
    }

    /// Issue a request and buffer the whole response
    pub async fn fetch_buffered(
        &self,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<BufferedResponse> {
        let request = self.build_request(method, path_and_query, headers, body).await?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| Error::proxy(format!("upstream request failed: {e}")))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::proxy(format!("failed to read upstream response: {e}")))?
            .to_vec();

        Ok(BufferedResponse {
            status,
            content_type,
            body,
        })
    }

    /// Forward a request end to end: streams the response body, and tunnels
    /// the connection when both sides agree on a protocol upgrade.
    pub async fn forward(&self, mut request: Request<Body>) -> Result<Response<Body>> {
        let on_upgrade = request.extensions_mut().remove::<OnUpgrade>();
        let (parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());

        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| Error::internal(format!("failed to read request body: {e}")))?;

        let upstream_request = self
            .build_request(&parts.method, &path_and_query, &parts.headers, body.to_vec())
            .await?;
        let response = self
            .client
            .execute(upstream_request)
            .await
            .map_err(|e| Error::proxy(format!("upstream request failed: {e}")))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status == StatusCode::SWITCHING_PROTOCOLS {
            return self.tunnel(response, on_upgrade);
        }

        let mut builder = Response::builder().status(status);
        if let Some(response_headers) = builder.headers_mut() {
            for (name, value) in response.headers() {
                if name.as_str() == "content-length" || name.as_str() == "transfer-encoding" {
                    continue;
                }
                response_headers.insert(name.clone(), value.clone());
            }
        }
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        builder
            .body(Body::from_stream(stream))
            .map_err(|e| Error::internal(format!("failed to build response: {e}")))
    }

    /// Splice the client and upstream connections together after a 101
    fn tunnel(
        &self,
        response: reqwest::Response,
        on_upgrade: Option<OnUpgrade>,
    ) -> Result<Response<Body>> {
        let Some(on_upgrade) = on_upgrade else {
            return Err(Error::proxy(
                "upstream switched protocols but the client connection cannot upgrade",
            ));
        };

        let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        if let Some(response_headers) = builder.headers_mut() {
            for (name, value) in response.headers() {
                response_headers.insert(name.clone(), value.clone());
            }
        }

        tokio::spawn(async move {
            let upstream = match response.upgrade().await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(error = %e, "upstream upgrade failed");
                    return;
                }
            };
            let client = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(error = %e, "client upgrade failed");
                    return;
                }
            };
            let mut client = TokioIo::new(client);
            let mut upstream = upstream;
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((up, down)) => {
                    debug!(bytes_up = up, bytes_down = down, "tunnel closed");
                }
                Err(e) => {
                    debug!(error = %e, "tunnel ended with error");
                }
            }
        });

        builder
            .body(Body::empty())
            .map_err(|e| Error::internal(format!("failed to build upgrade response: {e}")))
    }
}
