//! Catalog entities.
//!
//! Every type here is a [`fleetmux_store::Document`]: it names its
//! collection and derives its key from its path fields. The collection set
//! is fixed — the catalog is not a general ORM.

mod acl;
mod audit;
mod cloud;
mod controller;
mod credential;
mod machine;
mod model;
mod offer;
mod path;

pub use acl::{Acl, EVERYONE, Permission};
pub use audit::{AUDITS, AuditContent, AuditEntry};
pub use cloud::{CLOUD_REGIONS, CloudRegion};
pub use controller::{
    AddressScope, CONTROLLERS, Controller, ControllerStats, HostPort, Location,
};
pub use credential::{CREDENTIALS, Credential};
pub use machine::{
    APPLICATIONS, Application, ApplicationInfo, MACHINES, Machine, MachineInfo, ResourceStatus,
};
pub use model::{
    COUNT_APPLICATIONS, COUNT_MACHINES, COUNT_UNITS, Count, Life, MODELS, Model, ModelInfo,
    ModelStatus,
};
pub use offer::{
    APPLICATION_OFFERS, ApplicationOffer, OfferConnection, OfferEndpoint, OfferSpace,
};
pub use path::{CredentialPath, EntityPath, OfferUrl, valid_name};

use fleetmux_store::IndexSpec;

/// All collections the broker owns.
pub const COLLECTIONS: [&str; 8] = [
    CONTROLLERS,
    CLOUD_REGIONS,
    CREDENTIALS,
    MODELS,
    APPLICATION_OFFERS,
    MACHINES,
    APPLICATIONS,
    AUDITS,
];

/// The secondary indexes the catalog relies on.
pub const INDEXES: [IndexSpec; 5] = [
    IndexSpec {
        collection: CONTROLLERS,
        name: "controllers_uuid",
        fields: &["uuid"],
        unique: false,
    },
    IndexSpec {
        collection: MODELS,
        name: "models_uuid",
        fields: &["uuid"],
        unique: true,
    },
    IndexSpec {
        collection: MACHINES,
        name: "machines_model_uuid",
        fields: &["info.model_uuid"],
        unique: false,
    },
    IndexSpec {
        collection: APPLICATIONS,
        name: "applications_model_uuid",
        fields: &["info.model_uuid"],
        unique: false,
    },
    IndexSpec {
        collection: CREDENTIALS,
        name: "credentials_user_cloud",
        fields: &["path.user", "path.cloud"],
        unique: false,
    },
];
