//! Encoding of flushed batches into Loki push payloads.
//!
//! A [`Batch`] is serialized into the JSON push format
//!
//! ```text
//! {"streams":[{"stream":{"app":"foo"},"values":[["<unix ns>","<line>"]]}]}
//! ```
//!
//! and optionally gzip-compressed. Streams appear in stream-key order and
//! entries in submission order, so identical batches encode to identical
//! bytes. Compression is kept only when it actually shrinks the body.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::batcher::Batch;
use crate::entry::{LabelSet, StreamKey};

/// `Content-Type` of every push payload.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Compression state of an encoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
}

impl ContentEncoding {
    /// Value for the `Content-Encoding` header, if one should be sent.
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            ContentEncoding::Identity => None,
            ContentEncoding::Gzip => Some("gzip"),
        }
    }
}

/// Errors that make a batch impossible to encode. Never retried.
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("timestamp {timestamp} in stream {stream} is outside the representable nanosecond range")]
    TimestampOutOfRange {
        stream: StreamKey,
        timestamp: DateTime<Utc>,
    },

    #[error("failed to serialize push request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to compress push request: {0}")]
    Compress(#[from] std::io::Error),
}

/// An encoded batch awaiting delivery.
///
/// Owned by exactly one sender at a time; only the attempt bookkeeping
/// changes after encoding.
#[derive(Debug)]
pub struct PendingPayload {
    id: Uuid,
    body: Vec<u8>,
    content_encoding: ContentEncoding,
    uncompressed_len: usize,
    entries: usize,
    streams: usize,
    attempt_count: u32,
    first_attempt_at: Option<Instant>,
}

impl PendingPayload {
    /// Identifier for correlating log lines about this payload.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_encoding(&self) -> ContentEncoding {
        self.content_encoding
    }

    /// Size of the body as sent on the wire.
    pub fn encoded_len(&self) -> usize {
        self.body.len()
    }

    pub fn uncompressed_len(&self) -> usize {
        self.uncompressed_len
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn stream_count(&self) -> usize {
        self.streams
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn first_attempt_at(&self) -> Option<Instant> {
        self.first_attempt_at
    }

    pub(crate) fn record_attempt(&mut self, now: Instant) {
        self.first_attempt_at.get_or_insert(now);
        self.attempt_count += 1;
    }
}

#[derive(Serialize)]
struct PushRequest<'a> {
    streams: Vec<PushStream<'a>>,
}

#[derive(Serialize)]
struct PushStream<'a> {
    stream: &'a LabelSet,
    values: Vec<(String, &'a str)>,
}

/// Serializes batches into push payloads.
#[derive(Debug, Clone)]
pub struct Encoder {
    compression: Option<Compression>,
}

impl Encoder {
    pub fn new(compress: bool) -> Self {
        Self {
            compression: compress.then(Compression::default),
        }
    }

    /// Encode a batch into a single payload.
    pub fn encode(&self, batch: Batch) -> Result<PendingPayload, EncodingError> {
        let entries = batch.entry_count();
        let streams = batch.into_streams();

        let mut request = PushRequest {
            streams: Vec::with_capacity(streams.len()),
        };
        for buffer in &streams {
            let mut values = Vec::with_capacity(buffer.len());
            for line in buffer.entries() {
                let nanos = unix_nanos(&line.timestamp).ok_or_else(|| {
                    EncodingError::TimestampOutOfRange {
                        stream: buffer.key().clone(),
                        timestamp: line.timestamp,
                    }
                })?;
                values.push((nanos.to_string(), line.line.as_str()));
            }
            request.streams.push(PushStream {
                stream: buffer.labels(),
                values,
            });
        }

        let json = serde_json::to_vec(&request)?;
        let uncompressed_len = json.len();

        let (body, content_encoding) = match self.compression {
            Some(level) => {
                let mut gz = GzEncoder::new(Vec::with_capacity(json.len() / 4), level);
                gz.write_all(&json)?;
                let compressed = gz.finish()?;
                if compressed.len() < json.len() {
                    (compressed, ContentEncoding::Gzip)
                } else {
                    (json, ContentEncoding::Identity)
                }
            }
            None => (json, ContentEncoding::Identity),
        };

        Ok(PendingPayload {
            id: Uuid::new_v4(),
            body,
            content_encoding,
            uncompressed_len,
            entries,
            streams: request.streams.len(),
            attempt_count: 0,
            first_attempt_at: None,
        })
    }
}

/// Nanoseconds since the Unix epoch, if non-negative and within `i64`.
fn unix_nanos(timestamp: &DateTime<Utc>) -> Option<u64> {
    timestamp
        .timestamp_nanos_opt()
        .and_then(|nanos| u64::try_from(nanos).ok())
}

/// Errors decoding a push body.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to decompress push body: {0}")]
    Decompress(#[from] std::io::Error),

    #[error("failed to parse push body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp '{0}'")]
    Timestamp(String),
}

/// A stream recovered from a push body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStream {
    pub key: StreamKey,
    pub labels: BTreeMap<String, String>,
    /// `(unix nanoseconds, line)` in payload order
    pub entries: Vec<(u64, String)>,
}

#[derive(Deserialize)]
struct OwnedPushRequest {
    streams: Vec<OwnedPushStream>,
}

#[derive(Deserialize)]
struct OwnedPushStream {
    stream: BTreeMap<String, String>,
    values: Vec<(String, String)>,
}

/// Decode a push body produced by [`Encoder::encode`].
pub fn decode(body: &[u8], encoding: ContentEncoding) -> Result<Vec<DecodedStream>, DecodeError> {
    let json = match encoding {
        ContentEncoding::Identity => body.to_vec(),
        ContentEncoding::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(body).read_to_end(&mut out)?;
            out
        }
    };

    let request: OwnedPushRequest = serde_json::from_slice(&json)?;
    request
        .streams
        .into_iter()
        .map(|stream| {
            let entries = stream
                .values
                .into_iter()
                .map(|(ts, line)| {
                    ts.parse::<u64>()
                        .map(|ns| (ns, line))
                        .map_err(|_| DecodeError::Timestamp(ts))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let key = StreamKey::compute(stream.stream.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            Ok(DecodedStream {
                key,
                labels: stream.stream,
                entries,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{BatchConfig, Batcher};
    use crate::entry::Entry;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn batch_of(entries: Vec<Entry>) -> Batch {
        let now = Instant::now();
        let mut batcher = Batcher::new(BatchConfig::default(), now);
        for entry in entries {
            batcher.submit(entry, now).unwrap();
        }
        batcher.drain(now)
    }

    #[test]
    fn test_encodes_push_format() {
        let batch = batch_of(vec![
            Entry::with_timestamp(ts(1), "foo 1", [("app", "foo")]),
            Entry::with_timestamp(ts(2), "bar 1", [("app", "bar"), ("env", "prod")]),
            Entry::with_timestamp(ts(3), "foo 2", [("app", "foo")]),
        ]);

        let payload = Encoder::new(false).encode(batch).unwrap();
        assert_eq!(payload.content_encoding(), ContentEncoding::Identity);
        assert_eq!(payload.entry_count(), 3);
        assert_eq!(payload.stream_count(), 2);
        assert_eq!(payload.attempt_count(), 0);
        assert_eq!(
            std::str::from_utf8(payload.body()).unwrap(),
            concat!(
                r#"{"streams":["#,
                r#"{"stream":{"app":"bar","env":"prod"},"values":[["2000000000","bar 1"]]},"#,
                r#"{"stream":{"app":"foo"},"values":[["1000000000","foo 1"],["3000000000","foo 2"]]}"#,
                r#"]}"#
            )
        );
    }

    #[test]
    fn test_encoding_is_reproducible() {
        let make = || {
            batch_of(vec![
                Entry::with_timestamp(ts(10), "a", [("x", "1"), ("y", "2")]),
                Entry::with_timestamp(ts(11), "b", [("y", "2"), ("x", "1")]),
            ])
        };
        let encoder = Encoder::new(false);
        let first = encoder.encode(make()).unwrap();
        let second = encoder.encode(make()).unwrap();
        assert_eq!(first.body(), second.body());
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_round_trip_preserves_streams_and_order() {
        let entries: Vec<Entry> = (0..200)
            .map(|i| {
                let app = if i % 3 == 0 { "foo" } else { "bar" };
                Entry::with_timestamp(ts(1_700_000_000 + i), format!("line number {}", i), [("app", app)])
            })
            .collect();
        let batch = batch_of(entries);

        let payload = Encoder::new(true).encode(batch).unwrap();
        assert_eq!(payload.content_encoding(), ContentEncoding::Gzip);
        assert!(payload.encoded_len() < payload.uncompressed_len());

        let streams = decode(payload.body(), payload.content_encoding()).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].key.as_str(), r#"{app="bar"}"#);
        assert_eq!(streams[1].key.as_str(), r#"{app="foo"}"#);
        assert_eq!(streams[1].entries.len(), 67);
        assert_eq!(streams[1].entries[0], (1_700_000_000_000_000_000, "line number 0".to_string()));
        assert_eq!(streams[1].entries[1].1, "line number 3");
        assert!(streams[0]
            .entries
            .windows(2)
            .all(|pair| pair[0].0 < pair[1].0));
    }

    #[test]
    fn test_tiny_batch_falls_back_to_identity() {
        let batch = batch_of(vec![Entry::with_timestamp(ts(1), "x", [("a", "b")])]);
        let payload = Encoder::new(true).encode(batch).unwrap();

        assert_eq!(payload.content_encoding(), ContentEncoding::Identity);
        assert_eq!(payload.encoded_len(), payload.uncompressed_len());
        assert!(decode(payload.body(), ContentEncoding::Identity).is_ok());
    }

    #[test]
    fn test_pre_epoch_timestamp_is_encoding_failure() {
        let batch = batch_of(vec![Entry::with_timestamp(ts(-1), "old", [("app", "foo")])]);
        let err = Encoder::new(false).encode(batch).unwrap_err();
        assert!(matches!(err, EncodingError::TimestampOutOfRange { .. }));
    }

    #[test]
    fn test_content_encoding_header() {
        assert_eq!(ContentEncoding::Identity.header_value(), None);
        assert_eq!(ContentEncoding::Gzip.header_value(), Some("gzip"));
    }

    #[test]
    fn test_record_attempt_keeps_first_instant() {
        let batch = batch_of(vec![Entry::with_timestamp(ts(1), "x", [("a", "b")])]);
        let mut payload = Encoder::new(false).encode(batch).unwrap();
        let t0 = Instant::now();

        payload.record_attempt(t0);
        payload.record_attempt(t0 + std::time::Duration::from_secs(1));
        assert_eq!(payload.attempt_count(), 2);
        assert_eq!(payload.first_attempt_at(), Some(t0));
    }
}
