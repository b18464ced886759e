//! Service Registry & Dispatcher
//! Mission: name -> endpoint lookup plus a single outbound call path with
//! retry, timeout, and transport-error translation.

use std::collections::HashMap;
use std::error::Error as _;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{translate_transport_error, ApiError};

/// Immutable after startup; lookup by name is O(1).
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub base_endpoint: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub auth_header: Option<String>,
}

pub struct ServiceRegistry {
    services: HashMap<String, ServiceDescriptor>,
}

impl ServiceRegistry {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        let services = services.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self { services }
    }

    pub fn lookup(&self, name: &str) -> Result<&ServiceDescriptor, ApiError> {
        self.services
            .get(name)
            .ok_or_else(|| ApiError::Configuration(format!("unknown service '{name}'")))
    }
}

/// Outcome of a dispatched call: status, body, and a handful of response
/// headers the caller may need to forward.
pub struct DispatchResponse {
    pub status: u16,
    pub body: Value,
}

pub struct Dispatcher {
    registry: ServiceRegistry,
    http: reqwest::Client,
    gateway_version: &'static str,
}

const BASE_BACKOFF: Duration = Duration::from_secs(1);

impl Dispatcher {
    pub fn new(registry: ServiceRegistry, http: reqwest::Client) -> Self {
        Self {
            registry,
            http,
            gateway_version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// `call(service, method, path, body?, params?, headers?)`
    pub async fn call(
        &self,
        service: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
        params: Option<&[(&str, &str)]>,
        correlation_id: &str,
    ) -> Result<DispatchResponse, ApiError> {
        let descriptor = self.registry.lookup(service)?;
        let url = format!("{}{}", descriptor.base_endpoint.trim_end_matches('/'), path);

        let mut attempt = 0u32;
        let mut backoff = BASE_BACKOFF;

        loop {
            attempt += 1;
            let mut req = self
                .http
                .request(method.clone(), &url)
                .timeout(descriptor.timeout)
                .header("X-Correlation-ID", correlation_id)
                .header("X-Gateway-Version", self.gateway_version);

            if let Some(auth) = &descriptor.auth_header {
                req = req.header("Authorization", auth);
            }
            if let Some(params) = params {
                req = req.query(params);
            }
            if let Some(body) = &body {
                req = req.json(body);
            }

            let dispatched_at = std::time::Instant::now();
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let latency = dispatched_at.elapsed();
                    debug!(service, status = status.as_u16(), latency_ms = latency.as_millis() as u64, "outbound call completed");
                    if status.as_u16() >= 400 {
                        // do not retry on >=400; return verbatim
                        let json_body = resp.json::<Value>().await.unwrap_or(Value::Null);
                        return Ok(DispatchResponse {
                            status: status.as_u16(),
                            body: json_body,
                        });
                    }
                    let json_body = resp.json::<Value>().await.unwrap_or(Value::Null);
                    return Ok(DispatchResponse {
                        status: status.as_u16(),
                        body: json_body,
                    });
                }
                Err(err) => {
                    let transient = err.is_timeout() || err.is_connect() || is_network_unreachable(&err);
                    if !transient || attempt > descriptor.max_retries {
                        warn!(service, attempt, error = %err, "outbound call failed, giving up");
                        return Err(translate_transport_error(&err));
                    }
                    warn!(service, attempt, error = %err, backoff_ms = backoff.as_millis() as u64, "transient outbound failure, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

fn is_network_unreachable(err: &reqwest::Error) -> bool {
    err.source()
        .map(|s| s.to_string().to_lowercase().contains("network is unreachable"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            base_endpoint: "http://localhost:1".to_string(),
            timeout: Duration::from_millis(50),
            max_retries: 3,
            auth_header: None,
        }
    }

    #[test]
    fn lookup_missing_service_is_configuration_error() {
        let registry = ServiceRegistry::new(vec![descriptor("user")]);
        let err = registry.lookup("does-not-exist").unwrap_err();
        matches!(err, ApiError::Configuration(_));
    }

    #[test]
    fn lookup_known_service_succeeds() {
        let registry = ServiceRegistry::new(vec![descriptor("user"), descriptor("trading")]);
        assert_eq!(registry.lookup("trading").unwrap().name, "trading");
    }
}
