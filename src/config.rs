// ABOUTME: Configuration for the overlay HTTPS client pool
//
// Defines PoolConfig with all tunable parameters:
// - Pool sizing and directory capacities
// - Timeouts for acquisition, connect and whole requests
// - Event channel sizing and purge policy
// - Static service -> endpoint table
//
// Config files are TOML and are layered: local project, user, explicit path.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::destination::ServiceEndpoint;

/// Directory name used for local and user config
pub const CONFIG_DIR_NAME: &str = ".overlay-https";

/// Configuration for the overlay HTTPS pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    // === Sizing ===
    /// Clients constructed per destination
    pub pool_size: usize,

    /// Maximum number of destination pools (`None` = unbounded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_destinations: Option<usize>,

    /// Maximum number of known services (`None` = unbounded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_services: Option<usize>,

    // === Timeouts ===
    /// Give up waiting for a free client after this long (unset = wait forever)
    #[serde(with = "opt_duration_secs", skip_serializing_if = "Option::is_none")]
    pub acquire_timeout: Option<Duration>,

    /// Seconds allowed for establishing a transport connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Maximum request duration, body included (5 min default)
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    // === Request handling ===
    /// Capacity of each request's event channel
    pub event_buffer: usize,

    /// Treat non-2xx responses as errors when deciding whether to replace a client
    pub purge_on_http_error: bool,

    /// User agent sent by the default transport
    pub user_agent: String,

    // === Services ===
    /// Statically known services
    pub services: BTreeMap<String, ServiceEndpoint>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 25,
            max_destinations: Some(50),
            max_services: Some(50),

            acquire_timeout: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300), // 5 minutes

            event_buffer: 64,
            purge_on_http_error: true,
            user_agent: format!("overlay-https/{}", env!("CARGO_PKG_VERSION")),

            services: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    /// Load configuration, merging every config file that exists
    ///
    /// Order (later wins): `./.overlay-https/config.toml`,
    /// `~/.overlay-https/config.toml`, then `explicit` if given. An explicit
    /// path that does not exist is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        for path in Self::get_config_paths() {
            if path.exists() {
                config.merge_file(&path)?;
            }
        }

        if let Some(path) = explicit {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            config.merge_file(path)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a single TOML document on top of the defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse pool config")?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize pool config")
    }

    /// Reject settings the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        if self.max_destinations == Some(0) {
            bail!("max_destinations must be at least 1 when set");
        }
        if self.max_services == Some(0) {
            bail!("max_services must be at least 1 when set");
        }
        if self.event_buffer == 0 {
            bail!("event_buffer must be at least 1");
        }
        if let Some(max) = self.max_services {
            if self.services.len() > max {
                bail!(
                    "{} services configured but max_services is {max}",
                    self.services.len()
                );
            }
        }
        Ok(())
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let layer: toml::Table = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        self.merge(layer)
            .with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Overlay the keys present in `layer`; `services` tables are merged by name
    fn merge(&mut self, layer: toml::Table) -> Result<()> {
        let toml::Value::Table(mut current) =
            toml::Value::try_from(&*self).context("Failed to serialize config")?
        else {
            bail!("Config did not serialize to a table");
        };

        for (key, value) in layer {
            match (key.as_str(), current.get_mut(&key), value) {
                ("services", Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                    existing.extend(incoming);
                }
                (_, _, value) => {
                    current.insert(key, value);
                }
            }
        }

        *self = toml::Value::Table(current)
            .try_into()
            .context("Failed to apply config layer")?;
        Ok(())
    }

    /// Get configuration file paths in order of precedence (lowest first)
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![];

        // 1. Local project config
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join(CONFIG_DIR_NAME).join("config.toml"));
        }

        // 2. User config (~/.overlay-https/config.toml)
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(CONFIG_DIR_NAME).join("config.toml"));
        }

        paths
    }
}

/// Serde helper for Duration as seconds (u64)
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Option<Duration> as seconds
mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
