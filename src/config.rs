//! Start-up configuration for the syncer and API proxy.
//!
//! Everything the process needs is parsed once in `main` and threaded through
//! constructors; there is no process-wide mutable state.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};

/// Command-line flags for the syncer process
#[derive(Parser, Debug, Clone)]
#[command(name = "burrow", version, about = "Virtual Kubernetes cluster syncer")]
pub struct Flags {
    /// Host namespace that receives all physical projections
    #[arg(long, env = "TARGET_NAMESPACE")]
    pub target_namespace: String,

    /// Stable per-instance identifier used for name translation and the
    /// managed-by marker
    #[arg(long, env = "SUFFIX")]
    pub suffix: String,

    /// Name of the host StatefulSet to ownerReference projections on
    #[arg(long)]
    pub owning_statefulset: Option<String>,

    /// Comma-separated kind names to exclude from syncing (e.g. "ingresses")
    #[arg(long, default_value = "")]
    pub disable_sync_resources: String,

    /// Address for the TLS listener in front of the virtual API server
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_address: String,

    /// Port for the TLS listener
    #[arg(long, default_value = "8443")]
    pub listen_port: u16,

    /// Serving certificate file
    #[arg(long)]
    pub tls_cert_file: PathBuf,

    /// Serving key file
    #[arg(long)]
    pub tls_key_file: PathBuf,

    /// CA bundle that signs tenant client certificates
    #[arg(long)]
    pub client_ca_file: Option<PathBuf>,

    /// CA bundle for the aggregation front proxy (request-header auth)
    #[arg(long)]
    pub request_header_ca_file: Option<PathBuf>,

    /// Kubeconfig for the embedded virtual API server
    #[arg(long, env = "VIRTUAL_KUBECONFIG")]
    pub virtual_kubeconfig: PathBuf,

    /// Base URL of the embedded virtual API server, used when forwarding
    /// proxied requests (e.g. "https://127.0.0.1:6443")
    #[arg(long)]
    pub virtual_server: String,

    /// CA bundle verifying the virtual API server's serving certificate
    #[arg(long)]
    pub virtual_ca_file: Option<PathBuf>,

    /// Client certificate and key (concatenated PEM) the proxy uses against
    /// the virtual API server; must be allowed to impersonate
    #[arg(long)]
    pub virtual_identity_file: Option<PathBuf>,

    /// Bearer token file for the virtual API server, alternative to the
    /// client certificate
    #[arg(long)]
    pub virtual_token_file: Option<PathBuf>,

    /// Base URL of the host API server; defaults to the in-cluster service
    #[arg(long, default_value = "https://kubernetes.default.svc")]
    pub host_server: String,

    /// CA bundle verifying the host API server
    #[arg(long, default_value = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt")]
    pub host_ca_file: PathBuf,

    /// Service-account token the syncer authenticates to the host with
    #[arg(long, default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token")]
    pub host_token_file: PathBuf,

    /// Host service CIDR; probed from the host API server when unset
    #[arg(long)]
    pub service_cidr: Option<String>,

    /// Cluster IP of the virtual DNS service, injected into pod dnsConfig
    #[arg(long)]
    pub dns_ip: Option<IpAddr>,

    /// Worker tasks per synced kind
    #[arg(long, default_value = "2")]
    pub workers: usize,

    /// Timeout for upstream API requests in seconds
    #[arg(long, default_value = "30")]
    pub request_timeout_secs: u64,
}

/// Resolved configuration shared by the sync manager and the API proxy
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    pub target_namespace: String,
    pub suffix: String,
    pub owning_statefulset: Option<String>,
    pub disabled_kinds: HashSet<String>,
    pub listen_address: String,
    pub listen_port: u16,
    pub tls_cert_file: PathBuf,
    pub tls_key_file: PathBuf,
    pub client_ca_file: Option<PathBuf>,
    pub request_header_ca_file: Option<PathBuf>,
    pub virtual_kubeconfig: PathBuf,
    pub virtual_server: String,
    pub virtual_ca_file: Option<PathBuf>,
    pub virtual_identity_file: Option<PathBuf>,
    pub virtual_token_file: Option<PathBuf>,
    pub host_server: String,
    pub host_ca_file: PathBuf,
    pub host_token_file: PathBuf,
    pub service_cidr: Option<String>,
    pub dns_ip: Option<IpAddr>,
    pub workers: usize,
    pub request_timeout: Duration,
}

impl SyncerConfig {
    /// Validate flags and build the resolved configuration
    pub fn from_flags(flags: Flags) -> Result<Self> {
        if flags.suffix.is_empty() {
            return Err(Error::config("--suffix must not be empty"));
        }
        if flags.target_namespace.is_empty() {
            return Err(Error::config("--target-namespace must not be empty"));
        }
        if flags.workers == 0 {
            return Err(Error::config("--workers must be at least 1"));
        }

        let disabled_kinds = flags
            .disable_sync_resources
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            target_namespace: flags.target_namespace,
            suffix: flags.suffix,
            owning_statefulset: flags.owning_statefulset,
            disabled_kinds,
            listen_address: flags.listen_address,
            listen_port: flags.listen_port,
            tls_cert_file: flags.tls_cert_file,
            tls_key_file: flags.tls_key_file,
            client_ca_file: flags.client_ca_file,
            request_header_ca_file: flags.request_header_ca_file,
            virtual_kubeconfig: flags.virtual_kubeconfig,
            virtual_server: flags.virtual_server,
            virtual_ca_file: flags.virtual_ca_file,
            virtual_identity_file: flags.virtual_identity_file,
            virtual_token_file: flags.virtual_token_file,
            host_server: flags.host_server,
            host_ca_file: flags.host_ca_file,
            host_token_file: flags.host_token_file,
            service_cidr: flags.service_cidr,
            dns_ip: flags.dns_ip,
            workers: flags.workers,
            request_timeout: Duration::from_secs(flags.request_timeout_secs),
        })
    }

    /// Whether a kind (lowercase plural, e.g. "ingresses") is excluded
    pub fn kind_disabled(&self, kind: &str) -> bool {
        self.disabled_kinds.contains(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_flags() -> Flags {
        Flags::parse_from([
            "burrow",
            "--target-namespace",
            "vc-test",
            "--suffix",
            "s1",
            "--tls-cert-file",
            "/certs/tls.crt",
            "--tls-key-file",
            "/certs/tls.key",
            "--virtual-kubeconfig",
            "/data/kubeconfig.yaml",
            "--virtual-server",
            "https://127.0.0.1:6443",
        ])
    }

    #[test]
    fn parses_minimal_flags() {
        let cfg = SyncerConfig::from_flags(base_flags()).unwrap();
        assert_eq!(cfg.target_namespace, "vc-test");
        assert_eq!(cfg.suffix, "s1");
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert!(cfg.disabled_kinds.is_empty());
    }

    #[test]
    fn disabled_kinds_are_split_and_normalized() {
        let mut flags = base_flags();
        flags.disable_sync_resources = "Ingresses, persistentvolumeclaims,,".into();
        let cfg = SyncerConfig::from_flags(flags).unwrap();
        assert!(cfg.kind_disabled("ingresses"));
        assert!(cfg.kind_disabled("persistentvolumeclaims"));
        assert!(!cfg.kind_disabled("secrets"));
    }

    #[test]
    fn empty_suffix_is_rejected() {
        let mut flags = base_flags();
        flags.suffix = "".into();
        assert!(SyncerConfig::from_flags(flags).is_err());
    }
}
