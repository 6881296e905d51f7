//! HTTP client for the regulatory ledger's package-move endpoint.
//!
//! # Request
//!
//! `POST {base_url}/packages/v1/move`
//!
//! - `Authorization: Bearer {api_key}`
//! - `Idempotency-Key: {label}@{timestamp}`, identical across retries
//! - body: `[{"licenseNumber", "packageLabel", "room", "moveDateTime"}]`
//!
//! Any 2xx is success. Other statuses map to `SubmitError::Status` and are
//! classified by `SubmitError::reason`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Serialize;

use super::{ExternalLedger, LedgerSubmission, SubmitError};

pub const MOVE_PATH: &str = "/packages/v1/move";

/// Largest response body excerpt kept in an error.
const MAX_ERROR_BODY: usize = 512;

/// API credentials for the external ledger.
#[derive(Clone)]
pub struct LedgerCredentials {
    pub api_key: String,
    pub license_number: String,
}

impl std::fmt::Debug for LedgerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerCredentials")
            .field("api_key", &"<redacted>")
            .field("license_number", &self.license_number)
            .finish()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PackageMove<'a> {
    license_number: &'a str,
    package_label: &'a str,
    room: &'a str,
    move_date_time: String,
}

#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    client: reqwest::Client,
    endpoint: String,
    credentials: LedgerCredentials,
    timeout: Duration,
}

impl HttpLedgerClient {
    pub fn new(
        base_url: &str,
        credentials: LedgerCredentials,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{MOVE_PATH}", base_url.trim_end_matches('/')),
            credentials,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ExternalLedger for HttpLedgerClient {
    async fn submit(&self, submission: &LedgerSubmission) -> Result<(), SubmitError> {
        let body = [PackageMove {
            license_number: &self.credentials.license_number,
            package_label: submission.unit_label.as_str(),
            room: submission.destination_room.as_str(),
            move_date_time: submission
                .move_timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        }];

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.credentials.api_key)
            .header("Idempotency-Key", submission.idempotency_key())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SubmitError::Timeout(self.timeout)
                } else {
                    SubmitError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        Err(SubmitError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tagtrail_core::{Location, TagId};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::retry_queue::FailureReason;

    fn client(server: &MockServer, timeout: Duration) -> HttpLedgerClient {
        HttpLedgerClient::new(
            &server.uri(),
            LedgerCredentials {
                api_key: "secret".to_string(),
                license_number: "LIC-001".to_string(),
            },
            timeout,
        )
        .unwrap()
    }

    fn submission() -> LedgerSubmission {
        LedgerSubmission {
            unit_label: TagId::new("PKG-1"),
            destination_room: Location::parse("FlowerRoom").unwrap(),
            move_timestamp: Utc.with_ymd_and_hms(2024, 5, 4, 8, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn posts_move_with_credentials_and_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/packages/v1/move"))
            .and(header("Authorization", "Bearer secret"))
            .and(header("Idempotency-Key", "PKG-1@2024-05-04T08:00:00.000000Z"))
            .and(body_json(serde_json::json!([{
                "licenseNumber": "LIC-001",
                "packageLabel": "PKG-1",
                "room": "FlowerRoom",
                "moveDateTime": "2024-05-04T08:00:00.000000Z"
            }])))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, Duration::from_secs(5))
            .submit(&submission())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_client_errors_are_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("unknown room"))
            .mount(&server)
            .await;

        let client = client(&server, Duration::from_secs(5));

        let err = client.submit(&submission()).await.unwrap_err();
        assert_eq!(err.reason(), FailureReason::Transient);

        let err = client.submit(&submission()).await.unwrap_err();
        assert_eq!(
            err,
            SubmitError::Status {
                status: 400,
                body: "unknown room".to_string()
            }
        );
        assert_eq!(err.reason(), FailureReason::Rejected);
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = client(&server, Duration::from_millis(100))
            .submit(&submission())
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::Timeout(Duration::from_millis(100)));
    }

    #[test]
    fn endpoint_joins_base_url_without_double_slash() {
        let client = HttpLedgerClient::new(
            "https://api-ma.metrc.com/",
            LedgerCredentials {
                api_key: "k".into(),
                license_number: "l".into(),
            },
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.endpoint(), "https://api-ma.metrc.com/packages/v1/move");
        assert!(!format!("{:?}", client).contains("\"k\""));
    }
}
