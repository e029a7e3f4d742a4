//! Read-side client for the Loki query API.
//!
//! A thin request/response wrapper: queries are sent as-is, responses are
//! deserialized into [`QueryResponse`], and nothing is retried.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::client::{authorize, build_http_client, ClientError};
use crate::config::{Config, Credentials};
use crate::entry::StreamKey;

/// Path of the range query endpoint.
pub const QUERY_RANGE_PATH: &str = "/loki/api/v1/query_range";

/// Path of the instant query endpoint.
pub const QUERY_PATH: &str = "/loki/api/v1/query";

/// Path of the ingester flush endpoint.
pub const FLUSH_PATH: &str = "/flush";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server responded {code}: {message}")]
    Status { code: u16, message: String },

    #[error("failed to parse query response: {0}")]
    Parse(String),

    #[error("timestamp {0} cannot be expressed in nanoseconds")]
    InvalidTime(DateTime<Utc>),
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::Parse(e.to_string())
    }
}

/// Order of returned log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

/// Kind of data a query produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    /// Log lines
    Streams,
    /// Range of metric samples
    Matrix,
    /// Single metric sample per series
    Vector,
}

impl ResultType {
    pub fn is_log(&self) -> bool {
        *self == ResultType::Streams
    }
}

/// A log stream and its lines as `(unix_nanos, line)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamResult {
    pub labels: BTreeMap<String, String>,
    pub entries: Vec<(u64, String)>,
}

impl StreamResult {
    pub fn key(&self) -> StreamKey {
        StreamKey::compute(self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

/// A metric series and its samples as `(unix_seconds, value)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSeries {
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Streams(Vec<StreamResult>),
    Matrix(Vec<MetricSeries>),
    /// Each series carries exactly one sample
    Vector(Vec<MetricSeries>),
}

impl QueryResult {
    pub fn result_type(&self) -> ResultType {
        match self {
            QueryResult::Streams(_) => ResultType::Streams,
            QueryResult::Matrix(_) => ResultType::Matrix,
            QueryResult::Vector(_) => ResultType::Vector,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryData {
    pub result_type: ResultType,
    pub result: QueryResult,
}

/// A decoded query response.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub status: String,
    pub data: QueryData,
}

// Wire shapes. `result` is decoded once `resultType` is known.

#[derive(Deserialize)]
struct RawResponse {
    status: String,
    data: RawData,
}

#[derive(Deserialize)]
struct RawData {
    #[serde(rename = "resultType")]
    result_type: ResultType,
    result: serde_json::Value,
}

#[derive(Deserialize)]
struct RawStream {
    stream: BTreeMap<String, String>,
    values: Vec<(String, String)>,
}

#[derive(Deserialize)]
struct RawMatrixSeries {
    metric: BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

#[derive(Deserialize)]
struct RawVectorSample {
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

impl QueryResponse {
    pub fn from_slice(body: &[u8]) -> Result<Self, QueryError> {
        let raw: RawResponse = serde_json::from_slice(body)?;
        let result = match raw.data.result_type {
            ResultType::Streams => {
                let streams: Vec<RawStream> = serde_json::from_value(raw.data.result)?;
                QueryResult::Streams(
                    streams
                        .into_iter()
                        .map(stream_result)
                        .collect::<Result<_, _>>()?,
                )
            }
            ResultType::Matrix => {
                let series: Vec<RawMatrixSeries> = serde_json::from_value(raw.data.result)?;
                QueryResult::Matrix(
                    series
                        .into_iter()
                        .map(matrix_series)
                        .collect::<Result<_, _>>()?,
                )
            }
            ResultType::Vector => {
                let samples: Vec<RawVectorSample> = serde_json::from_value(raw.data.result)?;
                QueryResult::Vector(
                    samples
                        .into_iter()
                        .map(vector_sample)
                        .collect::<Result<_, _>>()?,
                )
            }
        };

        Ok(QueryResponse {
            status: raw.status,
            data: QueryData {
                result_type: raw.data.result_type,
                result,
            },
        })
    }
}

fn stream_result(raw: RawStream) -> Result<StreamResult, QueryError> {
    let entries = raw
        .values
        .into_iter()
        .map(|(ts, line)| parse_nanos(&ts).map(|nanos| (nanos, line)))
        .collect::<Result<_, _>>()?;
    Ok(StreamResult {
        labels: raw.stream,
        entries,
    })
}

fn matrix_series(raw: RawMatrixSeries) -> Result<MetricSeries, QueryError> {
    let samples = raw
        .values
        .into_iter()
        .map(|(ts, value)| parse_sample(&value).map(|v| (ts, v)))
        .collect::<Result<_, _>>()?;
    Ok(MetricSeries {
        labels: raw.metric,
        samples,
    })
}

fn vector_sample(raw: RawVectorSample) -> Result<MetricSeries, QueryError> {
    let (ts, value) = raw.value;
    Ok(MetricSeries {
        labels: raw.metric,
        samples: vec![(ts, parse_sample(&value)?)],
    })
}

fn parse_nanos(value: &str) -> Result<u64, QueryError> {
    value
        .parse()
        .map_err(|_| QueryError::Parse(format!("invalid timestamp '{}'", value)))
}

fn parse_sample(value: &str) -> Result<f64, QueryError> {
    value
        .parse()
        .map_err(|_| QueryError::Parse(format!("invalid sample value '{}'", value)))
}

fn nanos_param(time: DateTime<Utc>) -> Result<String, QueryError> {
    time.timestamp_nanos_opt()
        .map(|nanos| nanos.to_string())
        .ok_or(QueryError::InvalidTime(time))
}

/// Client for the query endpoints of a Loki server.
#[derive(Debug, Clone)]
pub struct QueryClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl QueryClient {
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(
            config.url.clone(),
            config.request_timeout,
            config.tenant_id.as_deref(),
            config.credentials.clone(),
        )
    }

    pub fn with_settings(
        base_url: impl Into<String>,
        timeout: Duration,
        tenant_id: Option<&str>,
        credentials: Credentials,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            client: build_http_client(timeout, tenant_id)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Run a query over `[start, end]`.
    pub async fn range_query(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<u32>,
        direction: Direction,
    ) -> Result<QueryResponse, QueryError> {
        let mut params = vec![
            ("query", query.to_string()),
            ("start", nanos_param(start)?),
            ("end", nanos_param(end)?),
            ("direction", direction.as_str().to_string()),
        ];
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        self.get(QUERY_RANGE_PATH, &params).await
    }

    /// Run a query evaluated at the current time.
    pub async fn instant_query(
        &self,
        query: &str,
        limit: Option<u32>,
    ) -> Result<QueryResponse, QueryError> {
        let mut params = vec![("query", query.to_string())];
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        self.get(QUERY_PATH, &params).await
    }

    /// Whether `query` is a log or a metric expression, as reported by the
    /// server for an instant evaluation.
    pub async fn expected_result_type(&self, query: &str) -> Result<ResultType, QueryError> {
        Ok(self.instant_query(query, Some(1)).await?.data.result_type)
    }

    /// Ask the ingesters to flush in-memory chunks to storage.
    pub async fn flush(&self) -> Result<(), QueryError> {
        let url = format!("{}{}", self.base_url, FLUSH_PATH);
        let response = authorize(self.client.post(&url), &self.credentials)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn get(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<QueryResponse, QueryError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Running query");

        let response = authorize(self.client.get(&url).query(params), &self.credentials)
            .send()
            .await?;
        let body = check_status(response).await?.bytes().await?;
        QueryResponse::from_slice(&body)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, QueryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default().trim().to_string();
    Err(QueryError::Status {
        code: status.as_u16(),
        message,
    })
}
