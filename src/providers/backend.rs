//! Messaging backend health probe
//!
//! etcd is probed with a write/read round trip through its v3 JSON gateway.
//! ActiveMQ runs next to the runtime and is covered by its deployment status.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{MessagingBackend, TribefireRuntime, DEFAULT_ETCD_URL};
use crate::Error;

/// Probes the messaging backend a runtime is configured with
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackendHealthChecker: Send + Sync {
    /// `Ok` if the backend is reachable and working
    async fn check(&self, runtime: &TribefireRuntime) -> Result<(), Error>;
}

/// Production checker
pub struct MessagingHealthChecker {
    client: reqwest::Client,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
}

#[derive(Deserialize, Default)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    #[serde(default)]
    value: String,
}

impl MessagingHealthChecker {
    /// Create a checker whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn check_etcd(&self, url: &str, runtime: &TribefireRuntime) -> Result<(), Error> {
        let url = url.trim_end_matches('/');
        let key = BASE64.encode(health_key(runtime));
        let value = Utc::now().to_rfc3339();

        self.post(
            &format!("{url}/v3/kv/put"),
            &PutRequest {
                key: key.clone(),
                value: BASE64.encode(&value),
            },
        )
        .await?;

        let response = self
            .post(&format!("{url}/v3/kv/range"), &RangeRequest { key })
            .await?;
        let range: RangeResponse = response
            .json()
            .await
            .map_err(|e| Error::backend(format!("invalid etcd range response: {e}")))?;

        verify_round_trip(&range, &value)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response, Error> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::backend(format!("etcd request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::backend(format!(
                "etcd request to {url} returned {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

/// Key written by the probe, one per runtime
fn health_key(runtime: &TribefireRuntime) -> String {
    format!(
        "/tribefire/operator/health/{}/{}",
        runtime.namespace_or_default(),
        runtime.name_any()
    )
}

fn verify_round_trip(range: &RangeResponse, expected: &str) -> Result<(), Error> {
    let stored = range
        .kvs
        .first()
        .ok_or_else(|| Error::backend("etcd returned no value for the health key"))?;
    let decoded = BASE64
        .decode(&stored.value)
        .map_err(|e| Error::backend(format!("etcd value is not base64: {e}")))?;
    if decoded != expected.as_bytes() {
        return Err(Error::backend("etcd returned a different value than written"));
    }
    Ok(())
}

#[async_trait]
impl BackendHealthChecker for MessagingHealthChecker {
    async fn check(&self, runtime: &TribefireRuntime) -> Result<(), Error> {
        match runtime.spec.backend.type_ {
            MessagingBackend::Etcd => {
                let url = runtime
                    .spec
                    .backend
                    .param("url")
                    .unwrap_or(DEFAULT_ETCD_URL);
                debug!(runtime = %runtime.name_any(), url, "probing etcd");
                self.check_etcd(url, runtime).await
            }
            MessagingBackend::ActiveMq => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::fixtures::runtime;

    fn range_with(value: &str) -> RangeResponse {
        RangeResponse {
            kvs: vec![KeyValue {
                value: BASE64.encode(value),
            }],
        }
    }

    #[test]
    fn round_trip_accepts_written_value() {
        assert!(verify_round_trip(&range_with("2024-01-01T00:00:00Z"), "2024-01-01T00:00:00Z").is_ok());
    }

    #[test]
    fn round_trip_rejects_stale_or_missing_value() {
        assert!(verify_round_trip(&range_with("old"), "new").is_err());
        assert!(verify_round_trip(&RangeResponse::default(), "new").is_err());
    }

    #[test]
    fn range_response_parses_gateway_json() {
        let json = r#"{"header":{"revision":"7"},"kvs":[{"key":"a2V5","value":"dmFsdWU=","version":"1"}],"count":"1"}"#;
        let range: RangeResponse = serde_json::from_str(json).unwrap();
        assert!(verify_round_trip(&range, "value").is_ok());
    }

    #[test]
    fn health_key_is_scoped_to_the_runtime() {
        assert_eq!(
            health_key(&runtime(vec![])),
            "/tribefire/operator/health/tf/demo"
        );
    }

    #[tokio::test]
    async fn activemq_is_not_probed() {
        let checker = MessagingHealthChecker::new(Duration::from_secs(1)).unwrap();
        let mut rt = runtime(vec![]);
        rt.spec.backend.type_ = MessagingBackend::ActiveMq;
        assert!(checker.check(&rt).await.is_ok());
    }
}
