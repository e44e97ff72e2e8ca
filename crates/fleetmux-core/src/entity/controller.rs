//! The controller document — one federated remote control plane.

use chrono::{DateTime, Utc};
use fleetmux_store::Document;
use serde::{Deserialize, Serialize};

use super::acl::Acl;
use super::path::EntityPath;

/// Collection name for [`Controller`] documents.
pub const CONTROLLERS: &str = "controllers";

/// Visibility scope of a controller address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AddressScope {
    /// Reachable from anywhere.
    Public,
    /// Reachable only from within the controller's cloud.
    CloudLocal,
    /// Reachable only from the controller's own machine.
    MachineLocal,
    /// Scope not reported by the controller.
    #[default]
    Unknown,
}

/// A dialable controller address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub scope: AddressScope,
}

impl HostPort {
    /// Render as `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when the address is usable from outside the controller's cloud.
    #[must_use]
    pub fn is_public(&self) -> bool {
        matches!(self.scope, AddressScope::Public | AddressScope::Unknown)
    }
}

/// Where a controller itself runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub cloud: String,
    #[serde(default)]
    pub region: String,
}

/// Aggregate entity counts maintained by the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    #[serde(default)]
    pub model_count: u64,
    #[serde(default)]
    pub machine_count: u64,
    #[serde(default)]
    pub application_count: u64,
    #[serde(default)]
    pub unit_count: u64,
}

/// A federated remote controller.
///
/// The lease tuple (`monitor_lease_owner`, `monitor_lease_expiry`) is either
/// both-set or both-unset; it is mutated only through the conditional update
/// in the database layer. `unavailable_since` is sticky: the first observed
/// unavailability timestamp survives until the controller is seen healthy
/// again.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Controller {
    pub path: EntityPath,
    /// UUID assigned by the remote controller itself.
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub addresses: Vec<HostPort>,
    #[serde(default)]
    pub ca_cert: String,
    #[serde(default)]
    pub admin_user: String,
    #[serde(default)]
    pub admin_password: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub unavailable_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_lease_owner: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub monitor_lease_expiry: Option<DateTime<Utc>>,
    /// Credential paths with a pending push to this controller.
    #[serde(default)]
    pub update_credentials: Vec<String>,
    #[serde(default)]
    pub acl: Acl,
    #[serde(default)]
    pub stats: ControllerStats,
}

impl Controller {
    /// A controller at the given path; remaining fields default.
    #[must_use]
    pub fn with_path(path: EntityPath) -> Self {
        Self {
            path,
            ..Self::default()
        }
    }

    /// True when the monitor has not flagged the controller unavailable.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.unavailable_since.is_none()
    }

    /// The public (or unscoped) `host:port` addresses.
    #[must_use]
    pub fn public_addresses(&self) -> Vec<String> {
        self.addresses
            .iter()
            .filter(|hp| hp.is_public())
            .map(HostPort::address)
            .collect()
    }
}

impl Document for Controller {
    fn collection() -> &'static str {
        CONTROLLERS
    }

    fn key(&self) -> String {
        self.path.to_string()
    }
}
