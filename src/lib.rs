// ABOUTME: Library crate for overlay-https exposing the pooled request API for testing and external use

#![allow(missing_docs)]

pub mod cli;
pub mod config;
pub mod destination;
pub mod headers;
pub mod pool;
pub mod request;
pub mod transport;

pub use config::PoolConfig;
pub use destination::{DestinationKey, ServiceDirectory, ServiceEndpoint};
pub use pool::{ConnectionPoolRegistry, PoolError, PoolResult};
pub use request::{HttpsRequest, RequestDispatcher, RequestError, RequestEvent, SubmittedRequest};
pub use transport::{Connector, TransportClient, TransportError};
