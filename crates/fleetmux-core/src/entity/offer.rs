//! Application-offer documents — exported relation endpoints consumable
//! across models.

use std::collections::BTreeMap;

use fleetmux_store::Document;
use serde::{Deserialize, Serialize};

use super::acl::{EVERYONE, Permission};
use super::path::{EntityPath, OfferUrl};

/// Collection name for [`ApplicationOffer`] documents.
pub const APPLICATION_OFFERS: &str = "applicationoffers";

/// One endpoint exported by an offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferEndpoint {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub limit: i64,
}

/// A network space an offer's endpoints live in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferSpace {
    pub name: String,
    #[serde(default)]
    pub provider_id: String,
}

/// A live cross-model relation against an offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferConnection {
    #[serde(default)]
    pub source_model_uuid: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub relation_id: i64,
    #[serde(default)]
    pub endpoint: String,
}

/// An exported relation endpoint of a model.
///
/// Keyed by the controller-assigned offer UUID; the offer URL is the
/// alternate human key. `users` is the permission map — the level of the
/// pseudo-user [`EVERYONE`] represents public access.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationOffer {
    pub uuid: String,
    pub url: OfferUrl,
    /// Path of the controller owning the model.
    pub controller: EntityPath,
    #[serde(default)]
    pub model_uuid: String,
    #[serde(default)]
    pub model_name: String,
    /// Owner user name (the model owner).
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub offer_name: String,
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub application_description: String,
    #[serde(default)]
    pub endpoints: Vec<OfferEndpoint>,
    #[serde(default)]
    pub spaces: Vec<OfferSpace>,
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
    #[serde(default)]
    pub users: BTreeMap<String, Permission>,
    #[serde(default)]
    pub connections: Vec<OfferConnection>,
}

impl ApplicationOffer {
    /// The effective permission of a caller, taking the best of the caller's
    /// own entry, any group entry, and the [`EVERYONE`] entry.
    #[must_use]
    pub fn access_for(&self, user: &str, groups: &[String]) -> Permission {
        let mut best = self
            .users
            .get(user)
            .copied()
            .unwrap_or(Permission::None)
            .max(
                self.users
                    .get(EVERYONE)
                    .copied()
                    .unwrap_or(Permission::None),
            );
        for group in groups {
            best = best.max(self.users.get(group).copied().unwrap_or(Permission::None));
        }
        best
    }
}

impl Document for ApplicationOffer {
    fn collection() -> &'static str {
        APPLICATION_OFFERS
    }

    fn key(&self) -> String {
        self.uuid.clone()
    }
}
