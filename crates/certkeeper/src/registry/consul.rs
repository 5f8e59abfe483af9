//! Consul agent notifier
//!
//! Every certificate is registered as its own service instance, identified by
//! the certificate fingerprint, with a TTL health check `<service-id>-valid`.
//! A passing check means "this certificate is installed and fresh".
//!
//! Agent endpoints used:
//!
//! | Event       | Requests                                                   |
//! |-------------|------------------------------------------------------------|
//! | available   | `check/pass`, falling back to `service/register` + `check/register` |
//! | unavailable | `check/fail`, `service/deregister`, `check/deregister`      |
//! | renewed     | `check/pass?note=renewed`                                  |
//! | deregister  | `check/deregister`, `service/deregister`                   |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;
use tracing::{debug, info, warn};

use super::Notifier;
use crate::cert::Certificate;
use crate::error::NotifierError;

/// Service name certificates are registered under
pub const DEFAULT_SERVICE_NAME: &str = "tls-certs";

/// TTL of the certificate health check, five days
pub const DEFAULT_CHECK_TTL: Duration = Duration::from_secs(432_000);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Notifier backed by the Consul agent HTTP API
#[derive(Debug, Clone)]
pub struct ConsulNotifier {
    client: Client,
    base: Url,
    service_name: String,
    check_ttl: Duration,
}

impl ConsulNotifier {
    /// Connect to the agent at `address` and make sure it has a leader
    ///
    /// `address` may omit the scheme, `127.0.0.1:8500` means
    /// `http://127.0.0.1:8500`.
    pub async fn connect(
        address: &str,
        service_name: impl Into<String>,
        check_ttl: Duration,
    ) -> Result<Self, NotifierError> {
        let base = parse_address(address)?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NotifierError::InvalidAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let notifier = Self {
            client,
            base,
            service_name: service_name.into(),
            check_ttl,
        };
        notifier.ping().await?;

        info!(
            address = %notifier.base,
            service = %notifier.service_name,
            "Connected to Consul agent"
        );
        Ok(notifier)
    }

    /// Notifier for a configuration file's registry section
    pub async fn from_config(
        config: &certkeeper_config::RegistryConfig,
    ) -> Result<Self, NotifierError> {
        Self::connect(
            &config.address,
            config.service_name.clone(),
            Duration::from_secs(config.check_ttl_secs),
        )
        .await
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Service instance ID of `cert`
    pub fn service_id(cert: &Certificate) -> String {
        cert.fingerprint().to_string()
    }

    /// TTL check ID of `cert`
    pub fn check_id(cert: &Certificate) -> String {
        format!("{}-valid", Self::service_id(cert))
    }

    fn url(&self, path: &str) -> Result<Url, NotifierError> {
        self.base
            .join(path)
            .map_err(|e| NotifierError::InvalidAddress {
                address: self.base.to_string(),
                reason: e.to_string(),
            })
    }

    async fn ping(&self) -> Result<(), NotifierError> {
        let url = self.url("v1/status/leader")?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| NotifierError::Request {
                method: "GET",
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(NotifierError::Status {
                method: "GET",
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        debug!(url = %url, "Consul agent reachable");
        Ok(())
    }

    async fn put(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> Result<(), NotifierError> {
        let url = self.url(path)?;
        let mut request = self.client.put(url.clone()).query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| NotifierError::Request {
            method: "PUT",
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(NotifierError::Status {
                method: "PUT",
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn pass(&self, check_id: &str, note: &str) -> Result<(), NotifierError> {
        self.put(&format!("v1/agent/check/pass/{}", check_id), &[("note", note)], None)
            .await
    }

    async fn register(&self, cert: &Certificate) -> Result<(), NotifierError> {
        let service_id = Self::service_id(cert);
        let check_id = Self::check_id(cert);

        self.put(
            "v1/agent/service/register",
            &[],
            Some(json!({
                "ID": service_id,
                "Name": self.service_name,
                "Tags": cert.subject_names(),
                "Meta": {
                    "not_after": cert.not_after().to_rfc3339(),
                },
            })),
        )
        .await?;

        self.put(
            "v1/agent/check/register",
            &[],
            Some(json!({
                "ID": check_id,
                "Name": service_id,
                "Notes": format!("TTL check for TLS certificate {}", service_id),
                "ServiceID": service_id,
                "TTL": format!("{}s", self.check_ttl.as_secs()),
                "Status": "passing",
            })),
        )
        .await?;

        info!(service_id = %service_id, service = %self.service_name, "Registered certificate in Consul");
        Ok(())
    }

    async fn remove(&self, cert: &Certificate) -> Result<(), NotifierError> {
        let service_id = Self::service_id(cert);
        let check_id = Self::check_id(cert);

        let check = self
            .put(&format!("v1/agent/check/deregister/{}", check_id), &[], None)
            .await;
        let service = self
            .put(&format!("v1/agent/service/deregister/{}", service_id), &[], None)
            .await;

        check.and(service)?;
        info!(service_id = %service_id, "Deregistered certificate from Consul");
        Ok(())
    }
}

#[async_trait]
impl Notifier for ConsulNotifier {
    async fn notify_certs_available(&self, leaf: &Certificate) -> Result<(), NotifierError> {
        let check_id = Self::check_id(leaf);
        match self.pass(&check_id, "ok").await {
            Ok(()) => {
                debug!(check_id = %check_id, "Passed certificate TTL check");
                Ok(())
            }
            Err(e) => {
                debug!(check_id = %check_id, error = %e, "TTL check not passable, registering");
                self.register(leaf).await
            }
        }
    }

    async fn notify_certs_unavailable(&self, leaf: &Certificate) -> Result<(), NotifierError> {
        let check_id = Self::check_id(leaf);
        let failed = self
            .put(&format!("v1/agent/check/fail/{}", check_id), &[("note", "fail")], None)
            .await;
        if let Err(ref e) = failed {
            warn!(check_id = %check_id, error = %e, "Failed to fail certificate TTL check");
        }

        let removed = self.remove(leaf).await;
        failed.and(removed)
    }

    async fn notify_certs_renewed(&self, leaf: &Certificate) -> Result<(), NotifierError> {
        self.pass(&Self::check_id(leaf), "renewed").await
    }

    async fn deregister(&self, leaf: &Certificate) -> Result<(), NotifierError> {
        self.remove(leaf).await
    }
}

fn parse_address(address: &str) -> Result<Url, NotifierError> {
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };
    let mut url = Url::parse(&with_scheme).map_err(|e| NotifierError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })?;

    if url.host_str().is_none() {
        return Err(NotifierError::InvalidAddress {
            address: address.to_string(),
            reason: "missing host".to_string(),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{issue_cert, CertSpec};
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn server_with_leader() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/status/leader"))
            .respond_with(ResponseTemplate::new(200).set_body_string("\"10.0.0.1:8300\""))
            .mount(&server)
            .await;
        server
    }

    async fn notifier(server: &MockServer) -> ConsulNotifier {
        ConsulNotifier::connect(&server.uri(), DEFAULT_SERVICE_NAME, DEFAULT_CHECK_TTL)
            .await
            .unwrap()
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("127.0.0.1:8500").unwrap().as_str(),
            "http://127.0.0.1:8500/"
        );
        assert_eq!(
            parse_address("https://consul.internal").unwrap().as_str(),
            "https://consul.internal/"
        );
        assert!(parse_address("http://").is_err());
    }

    #[test]
    fn test_ids_derive_from_fingerprint() {
        let cert = issue_cert(CertSpec::valid_for_days(30));
        assert_eq!(ConsulNotifier::service_id(&cert), cert.fingerprint());
        assert_eq!(
            ConsulNotifier::check_id(&cert),
            format!("{}-valid", cert.fingerprint())
        );
    }

    #[tokio::test]
    async fn test_connect_requires_leader() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/status/leader"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = ConsulNotifier::connect(&server.uri(), "tls-certs", DEFAULT_CHECK_TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, NotifierError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_available_passes_existing_check() {
        let server = server_with_leader().await;
        let cert = issue_cert(CertSpec::valid_for_days(30));
        let check_id = ConsulNotifier::check_id(&cert);

        Mock::given(method("PUT"))
            .and(path(format!("/v1/agent/check/pass/{}", check_id)))
            .and(query_param("note", "ok"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/register"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        notifier(&server).await.notify_certs_available(&cert).await.unwrap();
    }

    #[tokio::test]
    async fn test_available_registers_unknown_check() {
        let server = server_with_leader().await;
        let cert = issue_cert(CertSpec::valid_for_days(30));
        let service_id = ConsulNotifier::service_id(&cert);
        let check_id = ConsulNotifier::check_id(&cert);

        Mock::given(method("PUT"))
            .and(path(format!("/v1/agent/check/pass/{}", check_id)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/register"))
            .and(body_partial_json(json!({"ID": service_id, "Name": "tls-certs"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/check/register"))
            .and(body_partial_json(json!({
                "ID": check_id,
                "ServiceID": service_id,
                "TTL": "432000s",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server).await.notify_certs_available(&cert).await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_fails_and_removes() {
        let server = server_with_leader().await;
        let cert = issue_cert(CertSpec::valid_for_days(5));
        let service_id = ConsulNotifier::service_id(&cert);
        let check_id = ConsulNotifier::check_id(&cert);

        for endpoint in [
            format!("/v1/agent/check/fail/{}", check_id),
            format!("/v1/agent/check/deregister/{}", check_id),
            format!("/v1/agent/service/deregister/{}", service_id),
        ] {
            Mock::given(method("PUT"))
                .and(path(endpoint))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
        }

        notifier(&server).await.notify_certs_unavailable(&cert).await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_still_removes_after_fail_error() {
        let server = server_with_leader().await;
        let cert = issue_cert(CertSpec::valid_for_days(5));
        let service_id = ConsulNotifier::service_id(&cert);
        let check_id = ConsulNotifier::check_id(&cert);

        Mock::given(method("PUT"))
            .and(path(format!("/v1/agent/check/fail/{}", check_id)))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("/v1/agent/service/deregister/{}", service_id)))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("/v1/agent/check/deregister/{}", check_id)))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let err = notifier(&server)
            .await
            .notify_certs_unavailable(&cert)
            .await
            .unwrap_err();
        assert!(matches!(err, NotifierError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_renewed_passes_with_note() {
        let server = server_with_leader().await;
        let cert = issue_cert(CertSpec::valid_for_days(90));

        Mock::given(method("PUT"))
            .and(path(format!("/v1/agent/check/pass/{}", ConsulNotifier::check_id(&cert))))
            .and(query_param("note", "renewed"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server).await.notify_certs_renewed(&cert).await.unwrap();
    }
}
