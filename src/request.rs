// ABOUTME: Request lifecycle driver: submit, acquire a pooled client, stream events, release once
//
// Each submitted request runs on its own task:
//   Pending -> Dispatched -> HeadersReceived -> BodyStreaming -> Terminal
// The lease is released before the terminal event is delivered, and exactly
// once, whether or not anyone is still listening.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::destination::{DestinationError, ServiceDirectory};
use crate::headers::{parse_request_headers, HeaderError, RequestHeader, ResponseHeaders};
use crate::pool::{ConnectionPoolRegistry, PoolError};
use crate::transport::{
    Connector, OutboundBody, OutboundRequest, TransportClient, TransportError,
};

// === Errors ===

/// Errors surfaced by request submission and execution
#[derive(Debug, Error)]
pub enum RequestError {
    /// Malformed header argument, rejected before any pool interaction
    #[error(transparent)]
    Header(#[from] HeaderError),

    /// Target could not be resolved
    #[error(transparent)]
    Destination(#[from] DestinationError),

    /// Pool could not provide a client
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Transport failed after the response head was delivered
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Request already failed; body writes are refused
    #[error("Request {0} was aborted")]
    Aborted(RequestToken),

    /// Body was already ended
    #[error("Request {0} body is already closed")]
    BodyClosed(RequestToken),
}

// === Token ===

/// Opaque handle tying events back to the submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestToken(pub Uuid);

impl RequestToken {
    /// Generate a new unique token
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// === Phase ===

/// Where a request is in its lifecycle; used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// Submitted, not yet holding a client
    Pending,
    /// Client leased and request issued
    Dispatched,
    /// Response head delivered
    HeadersReceived,
    /// Body chunks flowing
    BodyStreaming,
    /// Terminal event sent or about to be
    Terminal,
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::HeadersReceived => "headers_received",
            Self::BodyStreaming => "body_streaming",
            Self::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

// === Events ===

/// Status line and headers of a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseHead {
    /// HTTP status, or a negative code when the transport failed
    pub code: i32,
    /// Reason phrase, or the error text for negative codes
    pub status_text: String,
    /// Aggregated headers
    pub headers: ResponseHeaders,
}

impl ResponseHead {
    /// True for negative (transport failure / EOF-as-error) codes
    pub const fn is_error(&self) -> bool {
        self.code < 0
    }
}

/// Everything a caller observes about one request
#[derive(Debug)]
pub enum RequestEvent {
    /// A pooled client was acquired
    Ready { token: RequestToken },
    /// Response head arrived; terminal when `head.code` is negative
    Headers { token: RequestToken, head: ResponseHead },
    /// Body chunk, or `None` at end of body (terminal)
    Body {
        token: RequestToken,
        chunk: Option<Bytes>,
    },
    /// Hard failure (terminal)
    Failed {
        token: RequestToken,
        error: RequestError,
    },
}

impl RequestEvent {
    /// Request this event belongs to
    pub const fn token(&self) -> RequestToken {
        match self {
            Self::Ready { token }
            | Self::Headers { token, .. }
            | Self::Body { token, .. }
            | Self::Failed { token, .. } => *token,
        }
    }

    /// True for the last event a request produces
    pub const fn is_terminal(&self) -> bool {
        match self {
            Self::Ready { .. } => false,
            Self::Headers { head, .. } => head.is_error(),
            Self::Body { chunk, .. } => chunk.is_none(),
            Self::Failed { .. } => true,
        }
    }
}

// === Request description ===

/// An outbound request before submission
#[derive(Debug, Clone, Default)]
pub struct HttpsRequest {
    target: String,
    method: String,
    path: Option<String>,
    headers: Vec<String>,
    streaming_body: bool,
}

impl HttpsRequest {
    /// `GET` to a URL or service name
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: "GET".to_string(),
            ..Self::default()
        }
    }

    /// HTTP method, `GET` by default
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Request path; overrides the path carried by a URL target
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Add a `"name:value"` header argument
    pub fn header(mut self, raw: impl Into<String>) -> Self {
        self.headers.push(raw.into());
        self
    }

    /// Request a `BodyWriter` for streaming a request body
    pub fn with_body(mut self) -> Self {
        self.streaming_body = true;
        self
    }

    /// URL or service name the request goes to
    pub fn target(&self) -> &str {
        &self.target
    }
}

// === Body writer ===

/// Streams a request body to the transport
#[derive(Debug)]
pub struct BodyWriter {
    token: RequestToken,
    tx: Option<mpsc::Sender<Bytes>>,
    failed: Arc<AtomicBool>,
}

impl BodyWriter {
    /// Send one chunk; resolves with the number of bytes accepted
    ///
    /// # Errors
    ///
    /// `Aborted` once the request has failed or finished without reading the
    /// rest of the body, `BodyClosed` after `end()`.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<usize, RequestError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(RequestError::Aborted(self.token));
        }
        let tx = self.tx.as_ref().ok_or(RequestError::BodyClosed(self.token))?;

        let chunk = chunk.into();
        let len = chunk.len();
        tx.send(chunk)
            .await
            .map_err(|_| RequestError::Aborted(self.token))?;
        Ok(len)
    }

    /// Finish the body; a no-op if the request is already over
    pub fn end(&mut self) {
        if self.tx.take().is_some() {
            debug!(token = %self.token, "Request body ended");
        }
    }

    /// Token of the request this writer feeds
    pub const fn token(&self) -> RequestToken {
        self.token
    }
}

// === Submission ===

/// Handle returned by `submit`
#[derive(Debug)]
pub struct SubmittedRequest {
    /// Token carried by every event of this request
    pub token: RequestToken,
    /// Present when the request was built `with_body()`
    pub body: Option<BodyWriter>,
    /// Lifecycle events, closed after the terminal one
    pub events: mpsc::Receiver<RequestEvent>,
}

/// Buffered outcome of a request, for callers that do not need streaming
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedResponse {
    /// Response head; negative codes carry the transport error text
    pub head: ResponseHead,
    /// Whole body, empty for error heads
    pub body: Bytes,
}

impl SubmittedRequest {
    /// Drain events until the terminal one
    ///
    /// A negative status is returned as `Ok` so the caller can inspect it.
    ///
    /// # Errors
    ///
    /// Returns the error carried by a `Failed` event.
    pub async fn collect(mut self) -> Result<CollectedResponse, RequestError> {
        let mut head = None;
        let mut body = BytesMut::new();

        while let Some(event) = self.events.recv().await {
            match event {
                RequestEvent::Ready { .. } => {}
                // An error head is terminal; the channel closes once its client is released
                RequestEvent::Headers { head: h, .. } => head = Some(h),
                RequestEvent::Body {
                    chunk: Some(chunk), ..
                } => body.extend_from_slice(&chunk),
                RequestEvent::Body { chunk: None, .. } => break,
                RequestEvent::Failed { error, .. } => return Err(error),
            }
        }

        let head = head.ok_or(RequestError::Aborted(self.token))?;
        Ok(CollectedResponse {
            head,
            body: body.freeze(),
        })
    }
}

/// Submits requests against a registry and drives them to completion
pub struct RequestDispatcher<K: Connector> {
    registry: Arc<ConnectionPoolRegistry<K>>,
    services: Arc<ServiceDirectory>,
    event_buffer: usize,
    purge_on_http_error: bool,
}

impl<K: Connector> Clone for RequestDispatcher<K> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            services: Arc::clone(&self.services),
            event_buffer: self.event_buffer,
            purge_on_http_error: self.purge_on_http_error,
        }
    }
}

impl<K: Connector> RequestDispatcher<K> {
    /// Dispatcher over a shared registry and service directory
    pub fn new(
        registry: Arc<ConnectionPoolRegistry<K>>,
        services: Arc<ServiceDirectory>,
        config: &PoolConfig,
    ) -> Self {
        Self {
            registry,
            services,
            event_buffer: config.event_buffer.max(1),
            purge_on_http_error: config.purge_on_http_error,
        }
    }

    /// Registry holding the destination pools
    pub fn registry(&self) -> &Arc<ConnectionPoolRegistry<K>> {
        &self.registry
    }

    /// Service name -> endpoint directory used for resolution
    pub fn services(&self) -> &Arc<ServiceDirectory> {
        &self.services
    }

    /// Start a request without waiting for it
    ///
    /// Header arguments are validated here; everything else (resolution, pool
    /// construction, acquisition) happens on a spawned task and is reported
    /// through the event channel. Must be called from inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `RequestError::Header` for a malformed header argument.
    pub fn submit(&self, request: HttpsRequest) -> Result<SubmittedRequest, RequestError> {
        let headers = parse_request_headers(&request.headers)?;
        let token = RequestToken::new();
        let (event_tx, events) = mpsc::channel(self.event_buffer);
        let failed = Arc::new(AtomicBool::new(false));

        let (body, outbound_body) = if request.streaming_body {
            let (tx, rx) = mpsc::channel(self.event_buffer);
            let writer = BodyWriter {
                token,
                tx: Some(tx),
                failed: Arc::clone(&failed),
            };
            (Some(writer), OutboundBody::Streaming(rx))
        } else {
            (None, OutboundBody::Empty)
        };

        let job = Job {
            token,
            target: request.target,
            method: request.method,
            path: request.path,
            headers,
            body: outbound_body,
        };
        debug!(%token, target = %job.target, method = %job.method, phase = %RequestPhase::Pending, "Request submitted");

        let dispatcher = self.clone();
        let sink = EventSink { token, tx: event_tx };
        tokio::spawn(async move { dispatcher.drive(job, sink, failed).await });

        Ok(SubmittedRequest {
            token,
            body,
            events,
        })
    }

    async fn drive(self, job: Job, sink: EventSink, failed: Arc<AtomicBool>) {
        let metrics = Arc::clone(self.registry.metrics());
        metrics.request_started();

        let (saw_error, terminal) = match self.execute(job, &sink).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(token = %sink.token, error = %error, "Request failed");
                (
                    true,
                    Some(RequestEvent::Failed {
                        token: sink.token,
                        error,
                    }),
                )
            }
        };

        if saw_error {
            failed.store(true, Ordering::Release);
            metrics.request_error();
        } else {
            metrics.request_completed();
        }

        debug!(token = %sink.token, saw_error, phase = %RequestPhase::Terminal, "Request finished");
        if let Some(terminal) = terminal {
            sink.emit(terminal).await;
        }
    }

    /// Resolve, acquire, exchange, release; returns the terminal event still to deliver
    async fn execute(
        &self,
        job: Job,
        sink: &EventSink,
    ) -> Result<(bool, Option<RequestEvent>), RequestError> {
        let target = self.services.resolve(&job.target)?;
        let path = job
            .path
            .or(target.path)
            .unwrap_or_else(|| "/".to_string());

        let pool = self.registry.pool_for(&target.key).await?;
        let lease = pool.acquire().await?;
        debug!(
            token = %job.token,
            destination = %target.key,
            slot = lease.slot(),
            client = %lease.client_id(),
            phase = %RequestPhase::Dispatched,
            "Client acquired"
        );
        sink.emit(RequestEvent::Ready { token: job.token }).await;

        let request = OutboundRequest {
            method: job.method,
            path,
            headers: job.headers,
            body: job.body,
        };
        let (saw_error, terminal) = self.exchange(lease.client().as_ref(), request, sink).await;
        lease.release(saw_error);
        Ok((saw_error, terminal))
    }

    /// Issue over the leased client and stream the response
    ///
    /// An error head is delivered here, while the client is still leased, and
    /// leaves nothing for the caller to emit. EOF and mid-body failures are
    /// returned so they go out after the lease is released.
    async fn exchange(
        &self,
        client: &K::Client,
        request: OutboundRequest,
        sink: &EventSink,
    ) -> (bool, Option<RequestEvent>) {
        let token = sink.token;

        let response = match client.issue(request).await {
            Ok(response) => response,
            Err(error) => {
                debug!(%token, error = %error, "Transport failed before response");
                let head = ResponseHead {
                    code: error.status_code(),
                    status_text: error.to_string(),
                    headers: ResponseHeaders::new(),
                };
                sink.emit(RequestEvent::Headers { token, head }).await;
                return (true, None);
            }
        };

        let transport_error = response.is_transport_error();
        let http_error = self.purge_on_http_error && !response.is_success();
        let head = ResponseHead {
            code: response.status,
            status_text: response.status_text,
            headers: ResponseHeaders::from_pairs(response.headers),
        };
        debug!(%token, code = head.code, phase = %RequestPhase::HeadersReceived, "Response head received");

        sink.emit(RequestEvent::Headers { token, head }).await;
        // Error statuses deliver their head but get no body wiring
        if transport_error {
            return (true, None);
        }

        let mut body = response.body;
        let mut chunks = 0usize;
        while let Some(next) = body.next().await {
            match next {
                Ok(chunk) => {
                    if chunks == 0 {
                        debug!(%token, phase = %RequestPhase::BodyStreaming, "Body streaming");
                    }
                    chunks += 1;
                    sink.emit(RequestEvent::Body {
                        token,
                        chunk: Some(chunk),
                    })
                    .await;
                }
                Err(error) => {
                    return (
                        true,
                        Some(RequestEvent::Failed {
                            token,
                            error: error.into(),
                        }),
                    );
                }
            }
        }

        (http_error, Some(RequestEvent::Body { token, chunk: None }))
    }
}

impl<K: Connector> fmt::Debug for RequestDispatcher<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("registry", &self.registry)
            .field("services", &self.services.len())
            .field("event_buffer", &self.event_buffer)
            .finish_non_exhaustive()
    }
}

struct Job {
    token: RequestToken,
    target: String,
    method: String,
    path: Option<String>,
    headers: Vec<RequestHeader>,
    body: OutboundBody,
}

/// Event sender that tolerates a departed receiver
struct EventSink {
    token: RequestToken,
    tx: mpsc::Sender<RequestEvent>,
}

impl EventSink {
    async fn emit(&self, event: RequestEvent) {
        if self.tx.send(event).await.is_err() {
            debug!(token = %self.token, "Event receiver dropped, continuing");
        }
    }
}
