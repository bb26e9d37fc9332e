//! Recognition request/response cycle.
//!
//! The backend is consumed as a contract only: send an encoded frame, receive a list
//! of detections whose bounding boxes are expressed in the coordinates of the frame
//! that produced them.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub mod http;
pub mod mock;
pub mod queue;

pub use http::{HttpTransport, RecognitionTransport, ThreadDispatcher};
pub use mock::MockTransport;
pub use queue::{
    Completion, Dispatcher, EnqueueOutcome, QueueEvent, QueueStats, RequestId, RequestQueue,
    RequestTicket,
};

use crate::frame::SampledFrame;

/// Who a detection belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "token", rename_all = "snake_case")]
pub enum Identity {
    /// Registered user.
    Known(String),
    /// Transient visitor tracked by the backend.
    Visitor(String),
    Unrecognized,
}

impl Identity {
    /// Build from the backend's optional token fields. A registered user wins over a
    /// visitor token; blank tokens count as absent.
    pub fn from_tokens(user: Option<&str>, visitor: Option<&str>) -> Self {
        let clean = |token: Option<&str>| {
            token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        };
        if let Some(user) = clean(user) {
            Identity::Known(user)
        } else if let Some(visitor) = clean(visitor) {
            Identity::Visitor(visitor)
        } else {
            Identity::Unrecognized
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Identity::Known(token) | Identity::Visitor(token) => Some(token),
            Identity::Unrecognized => None,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Identity::Unrecognized)
    }
}

/// Box in sampled-frame coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub identity: Identity,
    pub bounding_box: BoundingBox,
    /// Backend score. The backend reports similarity here; it doubles as confidence.
    pub distance: Option<f64>,
}

impl Detection {
    pub fn confidence(&self) -> Option<f64> {
        self.distance
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecognitionResponse {
    pub detections: Vec<Detection>,
    /// Server-reported processing time, when provided.
    pub processing_time: Option<Duration>,
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    /// Client-side timeout aborted the call.
    Timeout,
    /// Transport-level failure (DNS, connect, reset).
    Network,
    /// Backend answered with a non-2xx status.
    Http(u16),
    /// Backend answered 2xx with a body that does not match the contract.
    InvalidResponse,
}

/// A failed recognition request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecognitionError {
    pub kind: RecognitionErrorKind,
    pub message: String,
}

impl RecognitionError {
    pub fn new(kind: RecognitionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RecognitionErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RecognitionErrorKind::Network, message)
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == RecognitionErrorKind::Timeout
    }

    pub fn is_network(&self) -> bool {
        self.kind == RecognitionErrorKind::Network
    }

    pub fn status_code(&self) -> Option<u16> {
        match self.kind {
            RecognitionErrorKind::Http(status) => Some(status),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for RecognitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RecognitionErrorKind::Timeout => write!(f, "request timed out: {}", self.message),
            RecognitionErrorKind::Network => write!(f, "network failure: {}", self.message),
            RecognitionErrorKind::Http(status) => write!(f, "http {}: {}", status, self.message),
            RecognitionErrorKind::InvalidResponse => {
                write!(f, "invalid response: {}", self.message)
            }
        }
    }
}

impl std::error::Error for RecognitionError {}

// ----------------------------------------------------------------------------
// Wire format
// ----------------------------------------------------------------------------

/// JSON request body: the frame plus deployment-specific auxiliary fields.
#[derive(Debug, Serialize)]
pub struct RecognitionRequestBody<'a> {
    pub frame: String,
    #[serde(flatten)]
    pub fields: &'a BTreeMap<String, String>,
}

impl<'a> RecognitionRequestBody<'a> {
    pub fn new(frame: &SampledFrame, fields: &'a BTreeMap<String, String>) -> Self {
        Self {
            frame: frame.to_base64(),
            fields,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRecognitionResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    results: Vec<RawDetection>,
    #[serde(default, rename = "processingTime", alias = "processing_time_ms")]
    processing_time_ms: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(default, alias = "identity_token")]
    user_id: Option<String>,
    #[serde(default)]
    visitor_id: Option<String>,
    #[serde(default)]
    distance: Option<f64>,
    bounding_box: RawBoundingBox,
}

#[derive(Debug, Deserialize)]
struct RawBoundingBox {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

/// Parse a backend response body.
pub fn parse_response(body: &[u8]) -> Result<RecognitionResponse> {
    let raw: RawRecognitionResponse =
        serde_json::from_slice(body).context("parse recognition response")?;
    if let Some(status) = raw.status.as_deref() {
        log::debug!("recognition backend status={}", status);
    }
    let detections = raw
        .results
        .into_iter()
        .map(|result| Detection {
            identity: Identity::from_tokens(
                result.user_id.as_deref(),
                result.visitor_id.as_deref(),
            ),
            bounding_box: BoundingBox::new(
                result.bounding_box.x,
                result.bounding_box.y,
                result.bounding_box.width,
                result.bounding_box.height,
            ),
            distance: result.distance,
        })
        .collect();
    let processing_time = raw
        .processing_time_ms
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_micros((ms * 1000.0) as u64));
    Ok(RecognitionResponse {
        detections,
        processing_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_results() {
        let body = br#"{
            "status": "success",
            "results": [
                {"user_id": "693ea35da92dbf184b9c7790", "distance": 0.91,
                 "bounding_box": {"x": 100, "y": 50, "width": 80, "height": 100}},
                {"user_id": null, "visitor_id": "visitor-0042", "distance": 0.4,
                 "bounding_box": {"x": 1, "y": 2, "width": 3, "height": 4}},
                {"distance": 0.2,
                 "bounding_box": {"x": 5, "y": 6, "width": 7, "height": 8}}
            ]
        }"#;
        let response = parse_response(body).expect("parse");
        assert_eq!(response.detections.len(), 3);
        assert_eq!(
            response.detections[0].identity,
            Identity::Known("693ea35da92dbf184b9c7790".into())
        );
        assert_eq!(
            response.detections[0].bounding_box,
            BoundingBox::new(100.0, 50.0, 80.0, 100.0)
        );
        assert_eq!(response.detections[0].confidence(), Some(0.91));
        assert_eq!(
            response.detections[1].identity,
            Identity::Visitor("visitor-0042".into())
        );
        assert_eq!(response.detections[2].identity, Identity::Unrecognized);
        assert!(response.processing_time.is_none());
    }

    #[test]
    fn accepts_identity_token_alias_and_empty_results() {
        let body = br#"{"results": [{"identity_token": "abc", "distance": 0.5,
            "bounding_box": {"x": 0, "y": 0, "width": 1, "height": 1}}]}"#;
        let response = parse_response(body).expect("parse");
        assert_eq!(response.detections[0].identity, Identity::Known("abc".into()));

        let empty = parse_response(br#"{"status": "success", "results": []}"#).expect("parse");
        assert!(empty.detections.is_empty());
    }

    #[test]
    fn rejects_malformed_bodies() {
        assert!(parse_response(b"not json").is_err());
        assert!(parse_response(br#"{"results": [{"distance": 1}]}"#).is_err());
    }

    #[test]
    fn blank_tokens_are_unrecognized() {
        assert_eq!(Identity::from_tokens(Some("  "), None), Identity::Unrecognized);
        assert_eq!(
            Identity::from_tokens(Some(""), Some("v1")),
            Identity::Visitor("v1".into())
        );
    }

    #[test]
    fn request_body_flattens_fields() {
        let frame = SampledFrame::new(vec![1, 2, 3], 2, 2, 2, 2, std::time::SystemTime::now());
        let mut fields = BTreeMap::new();
        fields.insert("class_id".to_string(), "IF-3A".to_string());
        let json = serde_json::to_value(RecognitionRequestBody::new(&frame, &fields)).unwrap();
        assert_eq!(json["frame"], "AQID");
        assert_eq!(json["class_id"], "IF-3A");
    }

    #[test]
    fn error_flags() {
        let err = RecognitionError::new(RecognitionErrorKind::Http(503), "unavailable");
        assert_eq!(err.status_code(), Some(503));
        assert!(!err.is_network());
        assert!(!err.is_timeout());
        assert!(RecognitionError::network("reset").is_network());
        assert!(RecognitionError::timeout("10s").is_timeout());
    }
}
