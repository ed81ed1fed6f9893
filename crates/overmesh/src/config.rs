//! TOML configuration for the edge and controller daemons

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::EdgeClientConfig;
use crate::error::{MeshError, Result};
use crate::peer::PeerManagerConfig;
use crate::server::RegistryConfig;
use crate::store::{Edge, Namespace};

// =============================================================================
// Default value functions for serde
// =============================================================================

fn default_tun_name() -> String {
    "om0".to_string()
}

const fn default_tun_mtu() -> i32 {
    1380
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_report_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(3)
}

const fn default_dial_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_write_timeout() -> Duration {
    Duration::from_secs(3)
}

const fn default_dial_backoff() -> Duration {
    Duration::from_secs(3)
}

const fn default_liveness_interval() -> Duration {
    Duration::from_secs(1)
}

// =============================================================================
// Edge configuration
// =============================================================================

/// Tun device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunSettings {
    /// Interface name
    #[serde(default = "default_tun_name")]
    pub name: String,
    /// Interface MTU
    #[serde(default = "default_tun_mtu")]
    pub mtu: i32,
}

impl Default for TunSettings {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            mtu: default_tun_mtu(),
        }
    }
}

/// Edge daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Edge name within its namespace
    pub name: String,
    /// Tenant namespace
    pub namespace: String,
    /// Controller address to register with
    pub controller: String,
    /// Public `ip:port` this edge serves data traffic on
    pub listen_addr: String,
    /// Registration secret
    pub secret_key: String,
    /// Publicly visible IP override, for NATed deployments where the
    /// controller sees a different source address
    #[serde(default)]
    pub public_ip: Option<String>,

    /// Tun device settings
    #[serde(default)]
    pub tun: TunSettings,

    /// Heartbeat period on the control connection
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Report period on the control connection
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,
    /// Sleep between controller reconnect attempts
    #[serde(default = "default_reconnect_backoff", with = "humantime_serde")]
    pub reconnect_backoff: Duration,
    /// Controller dial deadline
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,
    /// Per-write deadline on the control connection and peer links
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Backoff between failed peer dials
    #[serde(default = "default_dial_backoff", with = "humantime_serde")]
    pub dial_backoff: Duration,
    /// Poll period of each peer liveness checker
    #[serde(default = "default_liveness_interval", with = "humantime_serde")]
    pub liveness_interval: Duration,
}

impl EdgeConfig {
    /// Load and validate a config file
    ///
    /// # Errors
    ///
    /// Returns a config error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MeshError::config(format!("read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| MeshError::config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a config error when a required field is empty.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MeshError::config("name cannot be empty"));
        }
        if self.namespace.is_empty() {
            return Err(MeshError::config("namespace cannot be empty"));
        }
        if self.controller.is_empty() {
            return Err(MeshError::config("controller cannot be empty"));
        }
        if self.listen_addr.is_empty() {
            return Err(MeshError::config("listen_addr cannot be empty"));
        }
        if self.secret_key.is_empty() {
            return Err(MeshError::config("secret_key cannot be empty"));
        }
        if self.tun.mtu < 576 {
            return Err(MeshError::config(format!(
                "tun mtu {} is below the ipv4 minimum",
                self.tun.mtu
            )));
        }
        Ok(())
    }

    /// Control-connection settings derived from this config
    #[must_use]
    pub fn client_config(&self) -> EdgeClientConfig {
        EdgeClientConfig {
            controller: self.controller.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            secret_key: self.secret_key.clone(),
            public_ip: self.public_ip.clone(),
            heartbeat_interval: self.heartbeat_interval,
            report_interval: self.report_interval,
            reconnect_backoff: self.reconnect_backoff,
            dial_timeout: self.dial_timeout,
            write_timeout: self.write_timeout,
        }
    }

    /// Peer-lifecycle settings derived from this config
    #[must_use]
    pub fn peer_config(&self) -> PeerManagerConfig {
        PeerManagerConfig {
            dial_backoff: self.dial_backoff,
            liveness_interval: self.liveness_interval,
            write_timeout: self.write_timeout,
        }
    }
}

// =============================================================================
// Controller configuration
// =============================================================================

/// A route seeded at startup, with the namespace it belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRoute {
    /// Namespace the route belongs to
    pub namespace: String,
    /// Route name
    pub name: String,
    /// Destination subnet
    pub cidr: String,
    /// Listen address of the edge receiving the traffic
    pub nexthop: String,
}

/// Records loaded into the store at controller startup
///
/// Stands in for an external admin surface in single-node deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    /// Namespaces to create
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    /// Edges to create
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Routes to create
    #[serde(default)]
    pub routes: Vec<SeedRoute>,
}

/// Controller daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Registry server settings
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Records loaded at startup
    #[serde(default)]
    pub seed: SeedConfig,
}

impl ControllerConfig {
    /// Load and validate a config file
    ///
    /// # Errors
    ///
    /// Returns a config error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MeshError::config(format!("read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| MeshError::config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a config error when the registry settings are invalid or a
    /// seed record is incomplete.
    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        for ns in &self.seed.namespaces {
            if ns.name.is_empty() || ns.secret.is_empty() {
                return Err(MeshError::config("seed namespace needs name and secret"));
            }
        }
        for edge in &self.seed.edges {
            if edge.name.is_empty() || edge.namespace.is_empty() || edge.listen_addr.is_empty() {
                return Err(MeshError::config(format!(
                    "seed edge {:?} needs name, namespace and listen_addr",
                    edge.name
                )));
            }
        }
        for route in &self.seed.routes {
            if route.namespace.is_empty() || route.name.is_empty() || route.nexthop.is_empty() {
                return Err(MeshError::config(format!(
                    "seed route {:?} needs namespace, name and nexthop",
                    route.name
                )));
            }
        }
        Ok(())
    }
}
