// ABOUTME: Destination keys and service-name resolution for pooled HTTPS requests
//
// A destination key is the normalized `scheme://host[:port]` string that selects
// a client pool. Targets are either URLs (parsed directly) or overlay service
// names looked up in the service directory populated from control-plane events.

use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::pool::directory::{Directory, DirectoryError};

/// Errors raised while turning a target into a destination key
#[derive(Debug, Error)]
pub enum DestinationError {
    /// Target looked like a URL but could not be parsed
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// Offending input
        url: String,
        /// Parser message
        reason: String,
    },

    /// URL parsed but carries no host
    #[error("Invalid URL '{0}': no host")]
    NoHost(String),

    /// Only http and https are pooled
    #[error("Unsupported scheme '{0}'")]
    UnsupportedScheme(String),

    /// Service name has no known endpoint yet
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// Endpoint string is not `host:port`
    #[error("Invalid endpoint '{0}', expected host:port")]
    InvalidEndpoint(String),

    /// Service directory rejected the row
    #[error("Service directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// Normalized `scheme://host[:port]` identifying one client pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationKey(String);

impl DestinationKey {
    /// Build a key from its parts
    ///
    /// Scheme and host are lowercased; a port equal to the scheme default is dropped.
    pub fn new(scheme: &str, host: &str, port: Option<u16>) -> Result<Self, DestinationError> {
        let raw = match port {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        };
        Ok(parse_url(&raw)?.key)
    }

    /// Key string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full URL for a request path on this destination
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.0)
        } else {
            format!("{}/{path}", self.0)
        }
    }

    fn from_url(url: &Url) -> Result<Self, DestinationError> {
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DestinationError::NoHost(url.to_string()))?;
        let key = match url.port() {
            Some(port) => format!("{}://{}:{port}", url.scheme(), host),
            None => format!("{}://{}", url.scheme(), host),
        };
        Ok(Self(key))
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A target resolved to its destination, plus the path carried by a URL target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Pool selector
    pub key: DestinationKey,
    /// Path and query from the URL (`None` for service names)
    pub path: Option<String>,
}

/// Parse a URL target into its destination key and request path
///
/// The path keeps its query string (`/a/b?x=1`).
pub fn parse_url(raw: &str) -> Result<ResolvedTarget, DestinationError> {
    let url = Url::parse(raw).map_err(|e| DestinationError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(DestinationError::UnsupportedScheme(other.to_string())),
    }

    let key = DestinationKey::from_url(&url)?;
    let path = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    };

    Ok(ResolvedTarget {
        key,
        path: Some(path),
    })
}

/// Hostname and port an overlay service is reachable at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Hostname presented by the service
    pub host: String,
    /// Port presented by the service
    pub port: u16,
}

impl ServiceEndpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Destination key for reaching this endpoint over HTTPS
    pub fn destination_key(&self) -> Result<DestinationKey, DestinationError> {
        DestinationKey::new("https", &self.host, Some(self.port))
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServiceEndpoint {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DestinationError::InvalidEndpoint(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| DestinationError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(DestinationError::InvalidEndpoint(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

/// Service name -> endpoint table, fed by control-plane service events
#[derive(Debug)]
pub struct ServiceDirectory {
    services: RwLock<Directory<ServiceEndpoint>>,
}

impl ServiceDirectory {
    /// Create a directory with an optional capacity
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            services: RwLock::new(Directory::new(capacity)),
        }
    }

    /// Record the endpoint for a service, replacing any previous one
    pub fn upsert(&self, name: &str, endpoint: ServiceEndpoint) -> Result<(), DestinationError> {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        match services.upsert(name, endpoint.clone())? {
            Some(previous) if previous != endpoint => {
                info!(service = %name, from = %previous, to = %endpoint, "Service endpoint updated");
            }
            Some(_) => {}
            None => info!(service = %name, endpoint = %endpoint, "Service endpoint registered"),
        }
        Ok(())
    }

    /// Endpoint for a service, if known
    pub fn lookup(&self, name: &str) -> Option<ServiceEndpoint> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup_first(name)
            .cloned()
    }

    /// Number of known services
    pub fn len(&self) -> usize {
        self.services.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when no service has been registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Turn a URL or a service name into a destination
    pub fn resolve(&self, target: &str) -> Result<ResolvedTarget, DestinationError> {
        if target.contains("://") {
            return parse_url(target);
        }

        let endpoint = self
            .lookup(target)
            .ok_or_else(|| DestinationError::UnknownService(target.to_string()))?;
        let key = endpoint.destination_key()?;
        debug!(service = %target, destination = %key, "Resolved service");
        Ok(ResolvedTarget { key, path: None })
    }
}

impl Default for ServiceDirectory {
    fn default() -> Self {
        Self::new(None)
    }
}
