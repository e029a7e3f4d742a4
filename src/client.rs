//! HTTP client for the Loki push API.
//!
//! [`HttpPushClient`] performs exactly one POST per call; retrying is the
//! [`Sender`](crate::sender::Sender)'s job. The underlying reqwest client is
//! reused across calls for connection pooling.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER,
};
use reqwest::{Client, RequestBuilder};
use thiserror::Error;
use tracing::debug;

use crate::config::{Config, Credentials};
use crate::encoder::{PendingPayload, CONTENT_TYPE_JSON};
use crate::sender::{PushResponse, Transport, TransportError};

/// Path of the push endpoint relative to the server base URL.
pub const PUSH_PATH: &str = "/loki/api/v1/push";

/// Header carrying the tenant in multi-tenant deployments.
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

/// Longest response body kept for error reporting.
const MAX_ERROR_BODY_BYTES: usize = 1024;

/// Errors constructing a client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid header value for {header}")]
    InvalidHeader { header: &'static str },

    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Posts encoded payloads to a Loki push endpoint.
#[derive(Debug, Clone)]
pub struct HttpPushClient {
    client: Client,
    push_url: String,
    credentials: Credentials,
    timeout: Duration,
}

impl HttpPushClient {
    /// Build a client from the shipper configuration.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(
            config.push_url(),
            config.request_timeout,
            config.tenant_id.as_deref(),
            config.credentials.clone(),
        )
    }

    /// Build a client with explicit settings.
    pub fn with_settings(
        push_url: impl Into<String>,
        timeout: Duration,
        tenant_id: Option<&str>,
        credentials: Credentials,
    ) -> Result<Self, ClientError> {
        let client = build_http_client(timeout, tenant_id)?;

        Ok(Self {
            client,
            push_url: push_url.into(),
            credentials,
            timeout,
        })
    }

    pub fn push_url(&self) -> &str {
        &self.push_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for HttpPushClient {
    async fn push(&self, payload: &PendingPayload) -> Result<PushResponse, TransportError> {
        let mut request = self
            .client
            .post(&self.push_url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(payload.body().to_vec());

        if let Some(encoding) = payload.content_encoding().header_value() {
            request = request.header(CONTENT_ENCODING, encoding);
        }
        request = authorize(request, &self.credentials);

        debug!(
            payload_id = %payload.id(),
            bytes = payload.encoded_len(),
            url = %self.push_url,
            "Pushing payload"
        );

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_retry_after(value, Utc::now()));

        let body = if status.is_success() {
            String::new()
        } else {
            let mut body = response.text().await.unwrap_or_default();
            truncate_utf8(&mut body, MAX_ERROR_BODY_BYTES);
            body
        };

        Ok(PushResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Pooled client carrying the tenant header on every request.
pub(crate) fn build_http_client(
    timeout: Duration,
    tenant_id: Option<&str>,
) -> Result<Client, ClientError> {
    let mut headers = HeaderMap::new();
    if let Some(tenant) = tenant_id {
        let value = HeaderValue::from_str(tenant).map_err(|_| ClientError::InvalidHeader {
            header: TENANT_HEADER,
        })?;
        headers.insert(HeaderName::from_static("x-scope-orgid"), value);
    }

    Ok(Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?)
}

pub(crate) fn authorize(request: RequestBuilder, credentials: &Credentials) -> RequestBuilder {
    match credentials {
        Credentials::None => request,
        Credentials::Basic { username, password } => {
            request.basic_auth(username, password.as_deref())
        }
        Credentials::Bearer(token) => request.bearer_auth(token),
    }
}

pub(crate) fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::Invalid(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

/// Parse a `Retry-After` value given as delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&Utc) - now;
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_client_creation() {
        let config = Config::default();
        let client = HttpPushClient::new(&config).unwrap();
        assert_eq!(client.push_url(), "http://localhost:3100/loki/api/v1/push");
        assert_eq!(client.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_invalid_tenant() {
        let result = HttpPushClient::with_settings(
            "http://localhost:3100/loki/api/v1/push",
            Duration::from_secs(1),
            Some("bad\ntenant"),
            Credentials::None,
        );
        assert!(matches!(
            result,
            Err(ClientError::InvalidHeader {
                header: TENANT_HEADER
            })
        ));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(
            parse_retry_after("120", Utc::now()),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            parse_retry_after(" 3 ", Utc::now()),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        // Dates in the past mean "retry now".
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_retry_after_garbage() {
        assert_eq!(parse_retry_after("soon", Utc::now()), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let mut s = "ééé".to_string();
        truncate_utf8(&mut s, 3);
        assert_eq!(s, "é");
    }
}
