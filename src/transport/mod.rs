// ABOUTME: Transport seam between the client pool and the connection layer underneath it
//
// The pool never opens sockets itself. A `Connector` builds one `TransportClient`
// per pool slot; a client issues HTTP-style requests and hands back a response
// head plus a streaming body.

use std::future::Future;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::destination::DestinationKey;
use crate::headers::RequestHeader;

pub mod reqwest_transport;

pub use reqwest_transport::{ReqwestClient, ReqwestConnector};

/// Status code surfaced when the transport fails before or instead of a response
pub const STATUS_TRANSPORT_ERROR: i32 = -1;

/// Failures reported by the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Client could not be constructed or could not reach the destination
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Request was rejected before a response arrived
    #[error("Request failed: {0}")]
    Request(String),

    /// Response body stream broke mid-way
    #[error("Body stream failed: {0}")]
    Body(String),

    /// Transport gave up waiting
    #[error("Transport timeout")]
    Timeout,
}

impl TransportError {
    /// Status code used when this error is surfaced through the headers channel
    pub const fn status_code(&self) -> i32 {
        STATUS_TRANSPORT_ERROR
    }
}

/// Request body as handed to the transport
#[derive(Debug, Default)]
pub enum OutboundBody {
    /// No body
    #[default]
    Empty,
    /// Chunks written by the caller; the body ends when the sender is dropped
    Streaming(mpsc::Receiver<Bytes>),
}

/// One request to issue over a pooled client
#[derive(Debug)]
pub struct OutboundRequest {
    /// HTTP method (`GET`, `POST`, ...)
    pub method: String,
    /// Path plus optional query, starting with `/`
    pub path: String,
    /// Caller-supplied headers, already validated
    pub headers: Vec<RequestHeader>,
    /// Request body
    pub body: OutboundBody,
}

/// Streaming response body
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Response head and body stream produced by a transport client
pub struct TransportResponse {
    /// Status code; negative values mean the transport itself failed
    pub status: i32,
    /// Reason phrase or error text
    pub status_text: String,
    /// Raw headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Body chunks
    pub body: BodyStream,
}

impl TransportResponse {
    /// True when the status signals EOF/error rather than an HTTP response
    pub const fn is_transport_error(&self) -> bool {
        self.status < 0
    }

    /// True for 2xx statuses
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Builds transport clients bound to a destination
pub trait Connector: Send + Sync + 'static {
    /// Client type stored in pool slots
    type Client: TransportClient;

    /// Construct a client for `key`; may perform a handshake
    fn connect(
        &self,
        key: &DestinationKey,
    ) -> impl Future<Output = Result<Self::Client, TransportError>> + Send;
}

/// A reusable client bound to one destination
pub trait TransportClient: Send + Sync + 'static {
    /// Issue one request and wait for the response head
    fn issue(
        &self,
        request: OutboundRequest,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}
