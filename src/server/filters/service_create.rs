//! Service-create redirect.
//!
//! The embedded API server allocates cluster IPs from its own range, so a
//! tenant creating a service could observe an IP the host can never route.
//! This filter creates the physical service first, under the
//! "service-controller" lock, and forwards the tenant's request with the
//! host-allocated cluster IP injected. A failure on either side rolls the
//! other back; the tenant never observes a half-created pair.
//!
//! The host service CIDR comes from configuration when set. Only when unset
//! is it probed by dry-creating a service with a manifestly invalid cluster
//! IP and parsing the validation error, which names the valid range. A probe
//! that unexpectedly succeeds is treated as "unknown": the accidentally
//! created service is deleted and a conventional default is assumed.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::{Filter, FilterResult, RequestContext};
use crate::client::Cluster;
use crate::error::{Error, Result};
use crate::metrics::PROXY_REQUESTS_TOTAL;
use crate::server::upstream::{set_impersonation_headers, Upstream};
use crate::sync::services::project_service;
use crate::translate::Translator;

/// The API server names the valid range in its validation error
const CIDR_ERROR_MARKER: &str =
    "provided IP is not in the valid range. The range of valid IPs is ";

/// Assumed when the range cannot be discovered
const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";

/// Carry the host-allocated cluster IP onto the service the tenant is about
/// to create, so their first read already shows a routable address
fn apply_allocated_cluster_ip(service: &mut Service, physical: &Service) {
    let allocated = physical
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.clone())
        .filter(|ip| !ip.is_empty());
    if let Some(allocated) = allocated {
        service.spec.get_or_insert_with(Default::default).cluster_ip = Some(allocated);
    }
}

/// Extract the service CIDR from an IP-out-of-range validation error
pub fn parse_service_cidr(message: &str) -> Option<String> {
    let rest = &message[message.find(CIDR_ERROR_MARKER)? + CIDR_ERROR_MARKER.len()..];
    let cidr = rest.split_whitespace().next()?;
    if cidr.is_empty() {
        None
    } else {
        Some(cidr.to_string())
    }
}

pub struct ServiceCreateFilter<P> {
    virtual_upstream: Arc<Upstream>,
    physical_cluster: Arc<P>,
    translator: Translator,
    lock: Arc<tokio::sync::Mutex<()>>,
    configured_cidr: Option<String>,
    discovered_cidr: OnceCell<String>,
}

impl<P: Cluster> ServiceCreateFilter<P> {
    pub fn new(
        virtual_upstream: Arc<Upstream>,
        physical_cluster: Arc<P>,
        translator: Translator,
        lock: Arc<tokio::sync::Mutex<()>>,
        configured_cidr: Option<String>,
    ) -> Self {
        Self {
            virtual_upstream,
            physical_cluster,
            translator,
            lock,
            configured_cidr,
            discovered_cidr: OnceCell::new(),
        }
    }

    fn matches(ctx: &RequestContext) -> bool {
        let info = &ctx.info;
        info.is_resource_request
            && info.api_group.is_empty()
            && info.resource == "services"
            && info.verb == "create"
            && info.namespace.is_some()
            && info.subresource.is_none()
    }

    async fn service_cidr(&self) -> String {
        if let Some(cidr) = &self.configured_cidr {
            return cidr.clone();
        }
        self.discovered_cidr
            .get_or_init(|| async {
                let cidr = self.probe_service_cidr().await;
                info!(cidr = %cidr, "host service CIDR discovered");
                cidr
            })
            .await
            .clone()
    }

    /// Ask the host by submitting an invalid cluster IP and reading the
    /// range out of the rejection
    async fn probe_service_cidr(&self) -> String {
        let name = format!("{}-cidr-probe", self.translator.suffix());
        let probe = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.translator.target_namespace().to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("4.4.4.4".to_string()),
                ports: Some(vec![ServicePort {
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        match self.physical_cluster.create(&probe).await {
            Err(e) => parse_service_cidr(&e.to_string()).unwrap_or_else(|| {
                warn!(error = %e, "could not parse service CIDR from probe rejection");
                DEFAULT_SERVICE_CIDR.to_string()
            }),
            Ok(created) => {
                // The probe was supposed to be rejected. Clean it up and fall
                // back to the conventional range.
                warn!("service CIDR probe unexpectedly succeeded, cleaning up");
                let namespace = created.namespace().unwrap_or_default();
                if let Err(e) = self
                    .physical_cluster
                    .delete::<Service>(&namespace, &created.name_any())
                    .await
                {
                    warn!(error = %e, "failed to delete CIDR probe service");
                }
                DEFAULT_SERVICE_CIDR.to_string()
            }
        }
    }

    fn validate_requested_ip(&self, service: &Service, cidr: &str) -> Result<()> {
        let Some(requested) = service.spec.as_ref().and_then(|s| s.cluster_ip.as_ref()) else {
            return Ok(());
        };
        if requested.is_empty() || requested == "None" {
            return Ok(());
        }
        let net: ipnet::IpNet = cidr
            .parse()
            .map_err(|e| Error::internal(format!("invalid service CIDR {cidr}: {e}")))?;
        let ip: std::net::IpAddr = requested
            .parse()
            .map_err(|_| Error::validation(format!("invalid cluster IP {requested:?}")))?;
        if !net.contains(&ip) {
            return Err(Error::validation(format!(
                "{CIDR_ERROR_MARKER}{net}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<P: Cluster> Filter for ServiceCreateFilter<P> {
    async fn handle(&self, ctx: &RequestContext, request: Request<Body>) -> Result<FilterResult> {
        if !Self::matches(ctx) {
            return Ok(FilterResult::Continue(request));
        }

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| Error::internal(format!("failed to read request body: {e}")))?;
        let mut service: Service = serde_json::from_slice(&body)
            .map_err(|e| Error::validation(format!("request body is not a Service: {e}")))?;
        service
            .metadata
            .namespace
            .get_or_insert_with(|| ctx.info.namespace.clone().unwrap_or_default());

        // Name-generated services cannot be pre-created under a known
        // physical name; the service reconciler projects them after the
        // virtual API server has picked a name.
        if service.metadata.name.is_none() {
            let request = Request::from_parts(parts, Body::from(body));
            return Ok(FilterResult::Continue(request));
        }
        PROXY_REQUESTS_TOTAL
            .with_label_values(&["service_create"])
            .inc();

        let _guard = self.lock.lock().await;

        let cidr = self.service_cidr().await;
        self.validate_requested_ip(&service, &cidr)?;

        // Physical first: the host allocator is the source of truth.
        let physical = self
            .physical_cluster
            .create(&project_service(&self.translator, &service))
            .await?;
        apply_allocated_cluster_ip(&mut service, &physical);

        let mut headers = parts.headers.clone();
        set_impersonation_headers(&mut headers, &ctx.principal);
        let forwarded_body = serde_json::to_vec(&service)
            .map_err(|e| Error::internal(format!("serialize service: {e}")))?;
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| ctx.info.path.clone());

        let response = self
            .virtual_upstream
            .fetch_buffered(&parts.method, &path_and_query, &headers, forwarded_body)
            .await;

        let failed = match &response {
            Ok(r) => !r.status.is_success() && r.status != StatusCode::CONFLICT,
            Err(_) => true,
        };
        if failed {
            // Leave nothing behind.
            let namespace = physical.namespace().unwrap_or_default();
            if let Err(e) = self
                .physical_cluster
                .delete::<Service>(&namespace, &physical.name_any())
                .await
            {
                warn!(error = %e, "failed to roll back physical service");
            }
        }

        Ok(FilterResult::Handled(response?.into_response()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCluster;
    use crate::server::request_info::RequestInfo;
    use axum::http::Method;
    use std::time::Duration;

    #[test]
    fn parses_cidr_from_error_message() {
        let message = format!(
            "Service \"probe\" is invalid: spec.clusterIP: Invalid value: \"4.4.4.4\": {}10.96.0.0/12",
            CIDR_ERROR_MARKER
        );
        assert_eq!(parse_service_cidr(&message), Some("10.96.0.0/12".into()));
        assert_eq!(parse_service_cidr("unrelated error"), None);
    }

    fn ctx(method: Method, path: &str) -> RequestContext {
        RequestContext {
            principal: Default::default(),
            info: RequestInfo::parse(&method, path, None),
        }
    }

    #[test]
    fn matches_only_namespaced_service_creates() {
        assert!(ServiceCreateFilter::<FakeCluster>::matches(&ctx(
            Method::POST,
            "/api/v1/namespaces/test/services"
        )));
        assert!(!ServiceCreateFilter::<FakeCluster>::matches(&ctx(
            Method::GET,
            "/api/v1/namespaces/test/services"
        )));
        assert!(!ServiceCreateFilter::<FakeCluster>::matches(&ctx(
            Method::POST,
            "/api/v1/namespaces/test/pods"
        )));
        assert!(!ServiceCreateFilter::<FakeCluster>::matches(&ctx(
            Method::POST,
            "/api/v1/services"
        )));
    }

    async fn filter(physical: &FakeCluster, cidr: Option<&str>) -> ServiceCreateFilter<FakeCluster> {
        ServiceCreateFilter::new(
            Arc::new(
                Upstream::new(
                    "https://virtual.invalid",
                    None,
                    None,
                    None,
                    Duration::from_secs(5),
                )
                .await
                .unwrap(),
            ),
            Arc::new(physical.clone()),
            Translator::new("vc-host", "s1"),
            Arc::new(tokio::sync::Mutex::new(())),
            cidr.map(|s| s.to_string()),
        )
    }

    fn service(cluster_ip: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("test".into()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: cluster_ip.map(|s| s.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn configured_cidr_wins_over_probe() {
        let physical = FakeCluster::new();
        let filter = filter(&physical, Some("10.43.0.0/16")).await;
        assert_eq!(filter.service_cidr().await, "10.43.0.0/16");
        // No probe service was created.
        assert!(physical.stored::<Service>().is_empty());
    }

    #[tokio::test]
    async fn successful_probe_is_cleaned_up() {
        let physical = FakeCluster::new();
        let filter = filter(&physical, None).await;
        // The fake cluster accepts any cluster IP, triggering the
        // unexpected-success path.
        assert_eq!(filter.service_cidr().await, DEFAULT_SERVICE_CIDR);
        assert!(physical.stored::<Service>().is_empty());
    }

    #[test]
    fn host_allocation_lands_on_the_tenant_service() {
        // The tenant submitted no cluster IP; the host allocated one. The
        // object forwarded to the virtual API server must carry it so the
        // tenant's immediate read shows the routable address.
        let mut tenant = service(None);
        let mut physical = service(None);
        physical.spec.as_mut().unwrap().cluster_ip = Some("10.96.1.23".into());

        apply_allocated_cluster_ip(&mut tenant, &physical);
        assert_eq!(
            tenant.spec.as_ref().unwrap().cluster_ip.as_deref(),
            Some("10.96.1.23")
        );

        // An empty allocation leaves the tenant object alone.
        let mut tenant = service(None);
        apply_allocated_cluster_ip(&mut tenant, &service(Some("")));
        assert!(tenant.spec.as_ref().unwrap().cluster_ip.is_none());
    }

    #[tokio::test]
    async fn out_of_range_ip_is_rejected() {
        let physical = FakeCluster::new();
        let filter = filter(&physical, Some("10.96.0.0/12")).await;

        let err = filter
            .validate_requested_ip(&service(Some("192.168.1.1")), "10.96.0.0/12")
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("valid range"));

        filter
            .validate_requested_ip(&service(Some("10.96.1.23")), "10.96.0.0/12")
            .unwrap();
        filter
            .validate_requested_ip(&service(None), "10.96.0.0/12")
            .unwrap();
        filter
            .validate_requested_ip(&service(Some("None")), "10.96.0.0/12")
            .unwrap();
    }
}
