// ABOUTME: Default HTTPS transport built on reqwest
//
// Each pool slot owns its own `reqwest::Client` restricted to a single idle
// connection, so one slot maps to one underlying TLS connection.

use futures_util::StreamExt;
use reqwest::{Body, Client, Method};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::{
    Connector, OutboundBody, OutboundRequest, TransportClient, TransportError, TransportResponse,
};
use crate::config::PoolConfig;
use crate::destination::DestinationKey;

/// Builds reqwest-backed clients using timeouts from `PoolConfig`
#[derive(Debug, Clone)]
pub struct ReqwestConnector {
    user_agent: String,
    connect_timeout: std::time::Duration,
    request_timeout: std::time::Duration,
}

impl ReqwestConnector {
    /// Connector configured from the pool settings
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
        }
    }
}

impl Connector for ReqwestConnector {
    type Client = ReqwestClient;

    async fn connect(&self, key: &DestinationKey) -> Result<ReqwestClient, TransportError> {
        let client = Client::builder()
            .user_agent(self.user_agent.as_str())
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        debug!(destination = %key, "Built HTTPS client");
        Ok(ReqwestClient {
            key: key.clone(),
            client,
        })
    }
}

/// One pooled reqwest client bound to a destination
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    key: DestinationKey,
    client: Client,
}

impl ReqwestClient {
    /// Destination this client talks to
    pub const fn destination(&self) -> &DestinationKey {
        &self.key
    }
}

impl TransportClient for ReqwestClient {
    async fn issue(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::Request(format!("invalid method: {e}")))?;

        let mut builder = self.client.request(method, self.key.url_for(&request.path));
        for header in &request.headers {
            builder = builder.header(header.name.as_str(), header.value.as_str());
        }
        if let OutboundBody::Streaming(rx) = request.body {
            let chunks = ReceiverStream::new(rx).map(Ok::<_, std::io::Error>);
            builder = builder.body(Body::wrap_stream(chunks));
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Body(e.to_string())))
            .boxed();

        Ok(TransportResponse {
            status: i32::from(status.as_u16()),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}
