//! HTTP recognition transport.
//!
//! `HttpTransport` performs one blocking `POST {base_url}{path}` per frame with a
//! client-enforced timeout. `ThreadDispatcher` runs a transport off the caller's
//! thread and reports completions over a channel, so the orchestrator loop never
//! blocks on the network.
//!
//! Failure classification:
//! - non-2xx status: `Http(status)` (application level)
//! - timeout while connecting or reading: `Timeout`
//! - any other transport failure: `Network`
//! - 2xx with an undecodable body: `InvalidResponse` (application level)

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::queue::{Completion, Dispatcher, RequestTicket};
use super::{parse_response, RecognitionError, RecognitionErrorKind, RecognitionRequestBody, RecognitionResponse};
use crate::frame::SampledFrame;

const MAX_RESPONSE_BYTES: u64 = 4 * 1024 * 1024;

/// Something that turns an encoded frame into detections.
pub trait RecognitionTransport: Send + Sync {
    fn recognize(&self, frame: &SampledFrame) -> Result<RecognitionResponse, RecognitionError>;
}

/// Configuration for the HTTP backend.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub base_url: String,
    pub path: String,
    pub timeout: Duration,
    /// Auxiliary body fields (e.g. a class or session id).
    pub fields: BTreeMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            path: "/api/face-recognition".to_string(),
            timeout: Duration::from_secs(10),
            fields: BTreeMap::new(),
        }
    }
}

/// Blocking HTTP transport backed by a `ureq` agent.
pub struct HttpTransport {
    agent: ureq::Agent,
    endpoint: Url,
    fields: BTreeMap<String, String>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let endpoint = endpoint_url(&config.base_url, &config.path)?;
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        log::info!(
            "HttpTransport: endpoint {} (timeout {} ms)",
            endpoint,
            config.timeout.as_millis()
        );
        Ok(Self {
            agent,
            endpoint,
            fields: config.fields,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl RecognitionTransport for HttpTransport {
    fn recognize(&self, frame: &SampledFrame) -> Result<RecognitionResponse, RecognitionError> {
        let body = RecognitionRequestBody::new(frame, &self.fields);
        let response = self
            .agent
            .post(self.endpoint.as_str())
            .set("Content-Type", "application/json")
            .send_json(&body)
            .map_err(classify_error)?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_RESPONSE_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|err| classify_io(&err, "read response body"))?;
        parse_response(&bytes).map_err(|err| {
            RecognitionError::new(RecognitionErrorKind::InvalidResponse, format!("{:#}", err))
        })
    }
}

/// Join base URL and path, tolerating doubled or missing slashes.
pub fn endpoint_url(base_url: &str, path: &str) -> Result<Url> {
    let base = Url::parse(base_url).with_context(|| format!("parse backend url '{}'", base_url))?;
    match base.scheme() {
        "http" | "https" => {}
        other => {
            return Err(anyhow!(
                "unsupported backend scheme '{}'; expected http(s)",
                other
            ))
        }
    }
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).with_context(|| format!("build endpoint from '{}'", joined))
}

fn classify_error(err: ureq::Error) -> RecognitionError {
    match err {
        ureq::Error::Status(status, response) => RecognitionError::new(
            RecognitionErrorKind::Http(status),
            format!("request failed: {}", response.status_text()),
        ),
        ureq::Error::Transport(transport) => {
            let message = transport.to_string();
            let timed_out = std::error::Error::source(&transport)
                .and_then(|source| source.downcast_ref::<io::Error>())
                .is_some_and(is_timeout_io)
                || message.contains("timed out");
            if timed_out {
                RecognitionError::timeout(message)
            } else {
                RecognitionError::network(message)
            }
        }
    }
}

fn classify_io(err: &io::Error, context: &str) -> RecognitionError {
    if is_timeout_io(err) {
        RecognitionError::timeout(format!("{}: {}", context, err))
    } else {
        RecognitionError::network(format!("{}: {}", context, err))
    }
}

fn is_timeout_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

// ----------------------------------------------------------------------------
// ThreadDispatcher
// ----------------------------------------------------------------------------

/// Runs each dispatched request on its own short-lived thread.
///
/// The queue guarantees single-flight, so at most one of these threads does
/// network work at a time.
pub struct ThreadDispatcher {
    transport: Arc<dyn RecognitionTransport>,
    completions: Sender<Completion>,
}

impl ThreadDispatcher {
    pub fn new(transport: Arc<dyn RecognitionTransport>) -> (Self, Receiver<Completion>) {
        let (completions, rx) = mpsc::channel();
        (
            Self {
                transport,
                completions,
            },
            rx,
        )
    }
}

impl Dispatcher for ThreadDispatcher {
    fn dispatch(&mut self, ticket: RequestTicket) {
        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let request_id = ticket.id;
        let spawned = std::thread::Builder::new()
            .name(format!("recognition-{}", request_id))
            .spawn(move || {
                let outcome = transport.recognize(&ticket.frame);
                if completions
                    .send(Completion {
                        request_id: ticket.id,
                        outcome,
                        finished_at: Instant::now(),
                    })
                    .is_err()
                {
                    log::debug!("recognition {} finished after pipeline shut down", ticket.id);
                }
            });
        if let Err(err) = spawned {
            log::error!("failed to spawn recognition thread: {}", err);
            let _ = self.completions.send(Completion {
                request_id,
                finished_at: Instant::now(),
                outcome: Err(RecognitionError::network(format!(
                    "spawn request thread: {}",
                    err
                ))),
            });
        }
    }
}
