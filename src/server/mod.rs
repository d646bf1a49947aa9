//! The API proxy in front of the embedded virtual API server.
//!
//! Incoming HTTPS → authentication → authorization → filter chain. Filters
//! either answer the request themselves (metrics, redirects, service create)
//! or it falls through to the embedded API server with impersonation
//! headers. Failures surface as Kubernetes `Status` responses.

pub mod auth;
pub mod filters;
pub mod request_info;
pub mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::KubeCluster;
use crate::config::SyncerConfig;
use crate::error::{Error, Result};
use crate::index::NameCache;
use crate::locks::LockFactory;
use crate::translate::Translator;
use auth::{
    AllowAll, Attributes, AuthChain, AuthorizerChain, DelegatingAuthenticator,
    DelegatingAuthorizer, GroupResourceVerb, ImpersonationAuthorizer, PathVerb, Principal,
    RequestHeaderAuthenticator,
};
use filters::impersonate::ImpersonateFilter;
use filters::metrics::{InjectedMetricsFilter, MetricsRewriteFilter};
use filters::redirect::{default_redirect_resources, RedirectFilter};
use filters::service_create::ServiceCreateFilter;
use filters::{Filter, FilterResult, RequestContext};
use request_info::RequestInfo;
use upstream::{has_impersonation_headers, strip_impersonation_headers, Upstream};

/// Kubelet metrics paths whose authorization is delegated to the virtual API
/// server
const METRICS_PATHS: &[&str] = &[
    "/metrics/cadvisor",
    "/metrics/probes",
    "/metrics/resource",
    "/metrics/resource/v1alpha1",
];

pub struct ProxyState {
    authenticators: AuthChain,
    authorizers: AuthorizerChain,
    filters: Vec<Box<dyn Filter>>,
}

impl ProxyState {
    /// Wire the full chain from configuration
    pub async fn build(
        config: &SyncerConfig,
        virtual_client: kube::Client,
        physical_cluster: Arc<KubeCluster>,
        translator: Translator,
        name_cache: Arc<NameCache>,
        locks: &LockFactory,
    ) -> Result<Self> {
        let virtual_upstream = Arc::new(
            Upstream::new(
                config.virtual_server.clone(),
                config.virtual_ca_file.clone(),
                config.virtual_identity_file.clone(),
                config.virtual_token_file.clone(),
                config.request_timeout,
            )
            .await?,
        );
        let host_upstream = Arc::new(
            Upstream::new(
                config.host_server.clone(),
                Some(config.host_ca_file.clone()),
                None,
                Some(config.host_token_file.clone()),
                config.request_timeout,
            )
            .await?,
        );

        let authenticators = AuthChain::new(vec![
            Box::new(DelegatingAuthenticator::new(virtual_client.clone())),
            Box::new(RequestHeaderAuthenticator::new()),
        ]);

        let mut delegated = vec![GroupResourceVerb::new("", "services", "", "create")];
        for r in default_redirect_resources() {
            delegated.push(GroupResourceVerb::new("", r.resource, r.subresource, "*"));
        }
        let paths = METRICS_PATHS
            .iter()
            .map(|p| PathVerb::new(p, "*"))
            .collect();
        let authorizers = AuthorizerChain::new(vec![
            Box::new(DelegatingAuthorizer::new(
                virtual_client.clone(),
                delegated,
                paths,
            )),
            Box::new(ImpersonationAuthorizer::new(virtual_client)),
            Box::new(AllowAll),
        ]);

        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(InjectedMetricsFilter::new(Arc::clone(&virtual_upstream))),
            Box::new(MetricsRewriteFilter::new(
                Arc::clone(&host_upstream),
                Arc::clone(&name_cache),
                config.target_namespace.clone(),
            )),
            Box::new(RedirectFilter::new(
                Arc::clone(&host_upstream),
                translator.clone(),
                default_redirect_resources(),
            )),
            Box::new(ServiceCreateFilter::new(
                Arc::clone(&virtual_upstream),
                physical_cluster,
                translator,
                locks.get_lock("service-controller"),
                config.service_cidr.clone(),
            )),
            Box::new(ImpersonateFilter::new(virtual_upstream)),
        ];

        Ok(Self {
            authenticators,
            authorizers,
            filters,
        })
    }

    #[cfg(test)]
    fn for_tests(
        authenticators: AuthChain,
        authorizers: AuthorizerChain,
        filters: Vec<Box<dyn Filter>>,
    ) -> Self {
        Self {
            authenticators,
            authorizers,
            filters,
        }
    }

    async fn process(&self, mut request: Request<Body>) -> Result<Response<Body>> {
        let info = RequestInfo::parse(
            request.method(),
            request.uri().path(),
            request.uri().query(),
        );

        let mut principal = self.authenticators.authenticate(request.headers()).await?;

        // A caller may ask to act as someone else; each element of the
        // requested identity is authorized separately, then the request
        // proceeds as that identity.
        if has_impersonation_headers(request.headers()) {
            principal = self
                .authorize_impersonation(&principal, request.headers())
                .await?;
            strip_impersonation_headers(request.headers_mut());
            debug!(user = %principal.username, "request impersonates another identity");
        }

        self.authorizers
            .authorize(&principal, &Attributes::from_request_info(&info))
            .await?;

        let ctx = RequestContext { principal, info };
        let mut request = request;
        for filter in &self.filters {
            match filter.handle(&ctx, request).await? {
                FilterResult::Handled(response) => return Ok(response),
                FilterResult::Continue(next) => request = next,
            }
        }
        Err(Error::internal("no filter handled the request"))
    }

    async fn authorize_impersonation(
        &self,
        principal: &Principal,
        headers: &axum::http::HeaderMap,
    ) -> Result<Principal> {
        let username = headers
            .get("impersonate-user")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::validation("Impersonate-User is required to impersonate")
            })?
            .to_string();
        self.authorizers
            .authorize(principal, &Attributes::impersonate("users", &username, None))
            .await?;

        let mut groups = Vec::new();
        for value in headers.get_all("impersonate-group") {
            let group = value
                .to_str()
                .map_err(|_| Error::validation("invalid Impersonate-Group header"))?
                .to_string();
            self.authorizers
                .authorize(principal, &Attributes::impersonate("groups", &group, None))
                .await?;
            groups.push(group);
        }

        let mut extra = std::collections::BTreeMap::new();
        for (name, value) in headers {
            let Some(key) = name.as_str().strip_prefix("impersonate-extra-") else {
                continue;
            };
            let value = value
                .to_str()
                .map_err(|_| Error::validation("invalid Impersonate-Extra header"))?
                .to_string();
            self.authorizers
                .authorize(
                    principal,
                    &Attributes::impersonate("userextras", &value, Some(key)),
                )
                .await?;
            extra
                .entry(key.to_string())
                .or_insert_with(Vec::new)
                .push(value);
        }

        Ok(Principal {
            username,
            groups,
            extra,
        })
    }
}

async fn handle(
    State(state): State<Arc<ProxyState>>,
    request: Request<Body>,
) -> Response<Body> {
    match state.process(request).await {
        Ok(response) => response,
        Err(e) => status_response(&e),
    }
}

/// A Kubernetes `Status` failure document for this error
fn status_response(error: &Error) -> Response<Body> {
    let code = error.status_code();
    let body = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": error.to_string(),
        "reason": error.status_reason(),
        "code": code,
    });
    Response::builder()
        .status(StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Build the rustls server config: serving cert/key, with optional client
/// certificates verified against the tenant and aggregation CAs
async fn build_tls_config(
    cert_file: &PathBuf,
    key_file: &PathBuf,
    client_ca_files: &[&PathBuf],
) -> Result<rustls::ServerConfig> {
    let cert_pem = tokio::fs::read(cert_file)
        .await
        .map_err(|e| Error::config(format!("read cert {}: {e}", cert_file.display())))?;
    let key_pem = tokio::fs::read(key_file)
        .await
        .map_err(|e| Error::config(format!("read key {}: {e}", key_file.display())))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::config(format!("invalid serving certificate: {e}")))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| Error::config(format!("invalid serving key: {e}")))?
        .ok_or_else(|| Error::config("no private key found"))?;

    let builder = rustls::ServerConfig::builder();
    let config = if client_ca_files.is_empty() {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::config(format!("TLS config: {e}")))?
    } else {
        let mut roots = RootCertStore::empty();
        for ca_file in client_ca_files {
            let pem = tokio::fs::read(ca_file)
                .await
                .map_err(|e| Error::config(format!("read CA {}: {e}", ca_file.display())))?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert =
                    cert.map_err(|e| Error::config(format!("invalid CA certificate: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::config(format!("bad CA certificate: {e}")))?;
            }
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .allow_unauthenticated()
            .build()
            .map_err(|e| Error::config(format!("client verifier: {e}")))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| Error::config(format!("TLS config: {e}")))?
    };
    Ok(config)
}

/// Serve the proxy on the configured TLS listener until cancellation
pub async fn serve(
    config: &SyncerConfig,
    state: Arc<ProxyState>,
    token: CancellationToken,
) -> Result<()> {
    let client_cas: Vec<&PathBuf> = [&config.client_ca_file, &config.request_header_ca_file]
        .into_iter()
        .flatten()
        .collect();
    let tls = build_tls_config(&config.tls_cert_file, &config.tls_key_file, &client_cas).await?;
    let rustls_config = RustlsConfig::from_config(Arc::new(tls));

    let app = Router::new().fallback(handle).with_state(state);
    let addr: SocketAddr = format!("{}:{}", config.listen_address, config.listen_port)
        .parse()
        .map_err(|e| Error::config(format!("invalid listen address: {e}")))?;

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        let token = token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(15)));
        });
    }

    info!(addr = %addr, "starting tls proxy server");
    let mut server = axum_server::bind_rustls(addr, rustls_config);
    server
        .http_builder()
        .http2()
        .max_concurrent_streams(1000);
    server
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::internal(format!("proxy server error: {e}")))
}
