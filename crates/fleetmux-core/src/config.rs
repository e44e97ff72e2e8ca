//! Broker configuration.
//!
//! A plain struct with serde support so the (out-of-scope) process bootstrap
//! can deserialize it from whatever source it likes. Defaults are usable for
//! tests and development.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for a broker instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Distinguished admin principal (a user or group name). Members may
    /// add and force-delete controllers.
    pub controller_admin: String,
    /// Bound on dialing a remote controller session.
    pub dial_timeout_secs: u64,
    /// How long a monitor lease is valid once acquired.
    pub monitor_lease_duration_secs: u64,
    /// Pause between monitor passes. Must leave slack before the lease
    /// expiry: `interval + slack < lease duration`.
    pub monitor_interval_secs: u64,
    /// How long resolved group memberships are served from cache.
    pub group_cache_ttl_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            controller_admin: "controller-admin".to_owned(),
            dial_timeout_secs: 30,
            monitor_lease_duration_secs: 60,
            monitor_interval_secs: 20,
            group_cache_ttl_secs: 60,
        }
    }
}

impl BrokerConfig {
    /// The dial timeout as a [`Duration`].
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// The monitor lease duration as a [`Duration`].
    #[must_use]
    pub fn monitor_lease_duration(&self) -> Duration {
        Duration::from_secs(self.monitor_lease_duration_secs)
    }

    /// The monitor pass interval as a [`Duration`].
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    /// The group-cache TTL as a [`Duration`].
    #[must_use]
    pub fn group_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.group_cache_ttl_secs)
    }
}
