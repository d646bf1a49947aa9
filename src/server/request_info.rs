//! Kubernetes API request classification.
//!
//! A small parser over the `/api` and `/apis` path shapes, enough for the
//! proxy filters and the delegating authorizer to decide what a request is
//! about. Everything that does not parse as a resource request is treated as
//! a non-resource path.

use axum::http::Method;

/// What an incoming API request addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub verb: String,
    pub api_group: String,
    pub api_version: String,
    pub namespace: Option<String>,
    pub resource: String,
    pub name: Option<String>,
    pub subresource: Option<String>,
    /// Remaining path segments after the subresource (e.g. a proxied path)
    pub parts: Vec<String>,
    pub path: String,
    pub is_resource_request: bool,
}

impl RequestInfo {
    /// Classify a request by method, path and query string
    pub fn parse(method: &Method, path: &str, query: Option<&str>) -> Self {
        let mut info = RequestInfo {
            path: path.to_string(),
            ..Default::default()
        };
        Self::parse_resource(&mut info, path);

        let watch = query
            .unwrap_or("")
            .split('&')
            .any(|kv| kv == "watch=true" || kv == "watch=1");
        info.verb = if info.is_resource_request {
            match *method {
                Method::POST => "create".to_string(),
                Method::PUT => "update".to_string(),
                Method::PATCH => "patch".to_string(),
                Method::DELETE => {
                    if info.name.is_some() {
                        "delete".to_string()
                    } else {
                        "deletecollection".to_string()
                    }
                }
                _ => {
                    if watch {
                        "watch".to_string()
                    } else if info.name.is_some() {
                        "get".to_string()
                    } else {
                        "list".to_string()
                    }
                }
            }
        } else {
            // Non-resource paths use the plain lowercased method as verb.
            method.as_str().to_lowercase()
        };
        info
    }

    fn parse_resource(info: &mut RequestInfo, path: &str) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut rest: &[&str] = match segments.first() {
            Some(&"api") => {
                // Groupless core API: /api/v1/...
                match segments.get(1) {
                    Some(version) => {
                        info.api_version = version.to_string();
                        &segments[2..]
                    }
                    None => return,
                }
            }
            Some(&"apis") => match (segments.get(1), segments.get(2)) {
                (Some(group), Some(version)) => {
                    info.api_group = group.to_string();
                    info.api_version = version.to_string();
                    &segments[3..]
                }
                _ => return,
            },
            _ => return,
        };

        if rest.first() == Some(&"namespaces") {
            if let Some(namespace) = rest.get(1) {
                // "/namespaces" and "/namespaces/{name}" address the
                // namespace resource itself, not a namespaced resource.
                if rest.len() > 2 {
                    info.namespace = Some(namespace.to_string());
                    rest = &rest[2..];
                }
            }
        }

        let Some(resource) = rest.first() else {
            return;
        };
        info.is_resource_request = true;
        info.resource = resource.to_string();
        info.name = rest.get(1).map(|s| s.to_string());
        info.subresource = rest.get(2).map(|s| s.to_string());
        info.parts = rest[3.min(rest.len())..]
            .iter()
            .map(|s| s.to_string())
            .collect();
    }

    /// The remaining proxied path after `…/{name}/{subresource}/`
    pub fn proxy_path(&self) -> String {
        self.parts.join("/")
    }
}
