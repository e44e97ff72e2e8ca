//! Cloud-region documents — the placement targets the broker knows about.

use fleetmux_store::Document;
use serde::{Deserialize, Serialize};

use super::acl::Acl;

/// Collection name for [`CloudRegion`] documents.
pub const CLOUD_REGIONS: &str = "cloudregions";

/// One cloud region (or, with an empty region, the cloud itself).
///
/// `primary_controllers` and `secondary_controllers` are non-owning
/// back-references: they say which controllers can host workloads here, and
/// are kept consistent by the controller add/delete paths. They are never a
/// source of truth for controller lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudRegion {
    pub cloud: String,
    /// Empty string denotes the cloud row itself.
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub provider_type: String,
    #[serde(default)]
    pub auth_types: Vec<String>,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub identity_endpoint: String,
    #[serde(default)]
    pub storage_endpoint: String,
    #[serde(default)]
    pub ca_certificates: Vec<String>,
    /// Controller paths that primarily host this cloud/region.
    #[serde(default)]
    pub primary_controllers: Vec<String>,
    /// Controller paths that can also host here.
    #[serde(default)]
    pub secondary_controllers: Vec<String>,
    #[serde(default)]
    pub acl: Acl,
}

impl CloudRegion {
    /// The key for a given cloud and region.
    #[must_use]
    pub fn key_for(cloud: &str, region: &str) -> String {
        format!("{cloud}/{region}")
    }

    /// True when this is the cloud row rather than a concrete region.
    #[must_use]
    pub fn is_cloud_row(&self) -> bool {
        self.region.is_empty()
    }
}

impl Document for CloudRegion {
    fn collection() -> &'static str {
        CLOUD_REGIONS
    }

    fn key(&self) -> String {
        Self::key_for(&self.cloud, &self.region)
    }
}
