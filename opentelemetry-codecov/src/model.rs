//! Wire model of the raw upload.
//!
//! Only the fields listed here leave the process; everything else on the SDK
//! span is dropped.
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::Value;
use opentelemetry_sdk::trace::SpanData;
use serde::Serialize;

use crate::mapper::ProcessedCoverage;

/// Body of the second upload phase.
#[derive(Debug, Default, Serialize)]
pub(crate) struct UploadBody {
    pub(crate) spans: Vec<UploadSpan>,
    pub(crate) untracked: Vec<UploadSpan>,
}

impl UploadBody {
    pub(crate) fn is_empty(&self) -> bool {
        self.spans.is_empty() && self.untracked.is_empty()
    }
}

/// Coverage attached to a tracked span.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct CodecovPayload {
    #[serde(rename = "type")]
    kind: &'static str,
    /// base64 of `{"coverage": ProcessedCoverage}`.
    coverage: String,
}

impl CodecovPayload {
    pub(crate) fn new(coverage: &ProcessedCoverage) -> serde_json::Result<Self> {
        #[derive(Serialize)]
        struct Document<'a> {
            coverage: &'a ProcessedCoverage,
        }

        let json = serde_json::to_vec(&Document { coverage })?;
        Ok(CodecovPayload {
            kind: "bytes",
            coverage: STANDARD.encode(json),
        })
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum Kind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl From<&SpanKind> for Kind {
    fn from(kind: &SpanKind) -> Self {
        match kind {
            SpanKind::Server => Kind::Server,
            SpanKind::Client => Kind::Client,
            SpanKind::Producer => Kind::Producer,
            SpanKind::Consumer => Kind::Consumer,
            _ => Kind::Internal,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadStatus {
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<&Status> for UploadStatus {
    fn from(status: &Status) -> Self {
        match status {
            Status::Ok => UploadStatus {
                code: "OK",
                message: None,
            },
            Status::Error { description } => UploadStatus {
                code: "ERROR",
                message: Some(description.to_string()),
            },
            _ => UploadStatus {
                code: "UNSET",
                message: None,
            },
        }
    }
}

/// One span of the upload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadSpan {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: String,
    kind: Kind,
    start_time_unix_nano: u64,
    end_time_unix_nano: u64,
    attributes: BTreeMap<String, serde_json::Value>,
    status: UploadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    codecov: Option<CodecovPayload>,
}

impl UploadSpan {
    pub(crate) fn new(span: &SpanData, codecov: Option<CodecovPayload>) -> Self {
        let parent = span.parent_span_id;
        UploadSpan {
            trace_id: span.span_context.trace_id().to_string(),
            span_id: span.span_context.span_id().to_string(),
            parent_span_id: (parent != opentelemetry::trace::SpanId::INVALID)
                .then(|| parent.to_string()),
            name: span.name.to_string(),
            kind: (&span.span_kind).into(),
            start_time_unix_nano: unix_nanos(span.start_time),
            end_time_unix_nano: unix_nanos(span.end_time),
            attributes: span
                .attributes
                .iter()
                .map(|kv| (kv.key.as_str().to_string(), json_value(&kv.value)))
                .collect(),
            status: (&span.status).into(),
            codecov,
        }
    }
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::I64(i) => serde_json::Value::from(*i),
        Value::F64(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        other => serde_json::Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::KeyValue;

    #[test]
    fn payload_round_trips_through_base64() {
        let files: BTreeMap<String, BTreeMap<u32, u64>> =
            serde_json::from_str(r#"{"app.js":{"1":1,"2":7}}"#).unwrap();
        let coverage = ProcessedCoverage::from(files);

        let payload = CodecovPayload::new(&coverage).unwrap();
        assert_eq!(payload.kind, "bytes");

        let decoded = STANDARD.decode(&payload.coverage).unwrap();
        let document: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(document["coverage"]["app.js"]["2"], 7);
    }

    #[test]
    fn attribute_values_keep_their_json_type() {
        assert_eq!(json_value(&Value::Bool(true)), serde_json::json!(true));
        assert_eq!(json_value(&Value::I64(200)), serde_json::json!(200));
        assert_eq!(json_value(&Value::F64(0.5)), serde_json::json!(0.5));
        assert_eq!(json_value(&Value::F64(f64::NAN)), serde_json::Value::Null);
        assert_eq!(
            json_value(&KeyValue::new("http.route", "/users").value),
            serde_json::json!("/users")
        );
    }
}
