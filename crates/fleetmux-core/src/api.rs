//! The remote controller API seam.
//!
//! [`ControllerApi`] names every call the broker core issues against a
//! remote controller; [`ApiDialer`] turns a controller document into a live
//! authenticated session. The concrete wire protocol (RPC framing, auth
//! handshake, version negotiation) belongs to the external controller
//! client — this crate only depends on these traits, and its tests use an
//! in-memory fake.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entity::{
    ApplicationInfo, Controller, HostPort, Life, MachineInfo, OfferConnection, OfferEndpoint,
    OfferSpace, Permission,
};
use crate::error::Error;

/// Remote error code for entity-not-found.
pub const CODE_NOT_FOUND: &str = "not found";
/// Remote error code for entity-already-exists.
pub const CODE_ALREADY_EXISTS: &str = "already exists";
/// Remote error code for permission-denied.
pub const CODE_UNAUTHORIZED: &str = "unauthorized access";

/// An error reported by a remote controller. The remote text is preserved
/// verbatim; `code` is the controller's machine-readable category, possibly
/// empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    pub code: String,
}

impl RemoteError {
    /// An error with a message and no code.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: String::new(),
        }
    }

    /// An error with a message and code.
    #[must_use]
    pub fn with_code(message: impl Into<String>, code: &str) -> Self {
        Self {
            message: message.into(),
            code: code.to_owned(),
        }
    }

    /// True when the remote reports the entity does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == CODE_NOT_FOUND
    }

    /// True when the remote reports the entity already exists. Also matched
    /// by message substring: some controller versions return the offer
    /// collision as a plain error text.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.code == CODE_ALREADY_EXISTS || self.message.contains("application offer already exists")
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Error::Api { message: e.message }
    }
}

/// Result alias for remote controller calls.
pub type ApiResult<T> = Result<T, RemoteError>;

/// Parameters for creating an application offer on a controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddOfferParams {
    pub model_uuid: String,
    pub offer_name: String,
    pub application_name: String,
    #[serde(default)]
    pub application_description: String,
    /// Relation endpoint name → alias.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    pub owner: String,
}

/// One row of an offer's user list as the controller reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferUserDetails {
    pub user: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub access: Permission,
}

/// Full details of an application offer as the controller reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfferDetails {
    pub offer_uuid: String,
    pub offer_url: String,
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
    pub users: Vec<OfferUserDetails>,
    #[serde(default)]
    pub connections: Vec<OfferConnection>,
}

/// Controller connection info attached to consume details.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub uuid: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub addrs: Vec<String>,
    #[serde(default)]
    pub ca_cert: String,
}

/// Everything a consumer needs to relate to an offer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumeOfferDetails {
    pub offer: OfferDetails,
    /// Opaque discharge material minted by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<serde_json::Value>,
    pub controller_info: ControllerInfo,
}

/// A cloud definition as exchanged with controllers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudDefinition {
    #[serde(default, rename = "type")]
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
    #[serde(default)]
    pub regions: Vec<CloudRegionDefinition>,
    /// For hosted clouds: the `cloud/region` the cloud runs on.
    #[serde(default)]
    pub host_cloud_region: String,
}

/// A region within a cloud definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudRegionDefinition {
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub identity_endpoint: String,
    #[serde(default)]
    pub storage_endpoint: String,
}

/// Parameters for creating a model on a controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateModelParams {
    pub name: String,
    pub owner: String,
    pub cloud: String,
    #[serde(default)]
    pub region: String,
    /// Credential path string (`cloud/user/name`).
    #[serde(default)]
    pub credential: String,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

/// A model as reported by a controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDetails {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub life: Life,
    #[serde(default, rename = "type")]
    pub model_type: String,
    #[serde(default)]
    pub cloud: String,
    #[serde(default)]
    pub region: String,
}

/// Per-model snapshot delivered by the controller's summary poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSummary {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub life: Life,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub application_count: u64,
    #[serde(default)]
    pub machine_count: u64,
    #[serde(default)]
    pub unit_count: u64,
    #[serde(default)]
    pub machines: Vec<MachineInfo>,
    #[serde(default)]
    pub applications: Vec<ApplicationInfo>,
}

/// Credential material pushed to a controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialUpdate {
    /// Credential path string (`cloud/user/name`).
    pub path: String,
    #[serde(default, rename = "type")]
    pub auth_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// An authenticated session to one remote controller.
///
/// Every method maps to one remote call; implementations own retry-free
/// transport semantics, the broker owns orchestration and ordering.
#[async_trait::async_trait]
pub trait ControllerApi: Send + Sync + 'static {
    // ── Offers ───────────────────────────────────────────────────────

    async fn offer(&self, params: AddOfferParams) -> ApiResult<()>;
    async fn get_application_offer(&self, url: &str) -> ApiResult<OfferDetails>;
    async fn get_application_offer_consume_details(
        &self,
        user: &str,
        url: &str,
        bakery_version: u8,
    ) -> ApiResult<ConsumeOfferDetails>;
    async fn get_application_offers(&self, urls: &[String]) -> ApiResult<Vec<OfferDetails>>;
    async fn grant_application_offer_access(
        &self,
        url: &str,
        user: &str,
        level: Permission,
    ) -> ApiResult<()>;
    async fn revoke_application_offer_access(
        &self,
        url: &str,
        user: &str,
        level: Permission,
    ) -> ApiResult<()>;
    async fn destroy_application_offer(&self, url: &str, force: bool) -> ApiResult<()>;

    // ── Clouds ───────────────────────────────────────────────────────

    async fn clouds(&self) -> ApiResult<BTreeMap<String, CloudDefinition>>;
    async fn cloud(&self, name: &str) -> ApiResult<CloudDefinition>;
    async fn add_cloud(&self, name: &str, def: &CloudDefinition) -> ApiResult<()>;
    async fn remove_cloud(&self, name: &str) -> ApiResult<()>;
    async fn grant_cloud_access(&self, cloud: &str, user: &str, access: &str) -> ApiResult<()>;
    async fn revoke_cloud_access(&self, cloud: &str, user: &str, access: &str) -> ApiResult<()>;

    // ── Models ───────────────────────────────────────────────────────

    async fn create_model(&self, params: CreateModelParams) -> ApiResult<ModelDetails>;
    async fn destroy_model(&self, uuid: &str, force: bool) -> ApiResult<()>;
    async fn grant_model_access(&self, uuid: &str, user: &str, access: &str) -> ApiResult<()>;
    async fn revoke_model_access(&self, uuid: &str, user: &str, access: &str) -> ApiResult<()>;
    async fn validate_model_upgrade(&self, uuid: &str, force: bool) -> ApiResult<()>;

    // ── Credentials ──────────────────────────────────────────────────

    async fn update_credential(&self, update: &CredentialUpdate) -> ApiResult<()>;
    async fn revoke_credential(&self, path: &str) -> ApiResult<()>;

    // ── Controller ───────────────────────────────────────────────────

    async fn controller_uuid(&self) -> ApiResult<String>;
    async fn server_version(&self) -> ApiResult<String>;
    async fn api_host_ports(&self) -> ApiResult<Vec<HostPort>>;
    async fn model_summaries(&self) -> ApiResult<Vec<ModelSummary>>;
    async fn ping(&self) -> ApiResult<()>;

    /// True when the underlying transport has died. Checked by the
    /// connection cache for lazy eviction; must not block.
    fn is_broken(&self) -> bool;

    /// Tear the session down. Idempotent.
    async fn close(&self);
}

/// Dials authenticated controller sessions.
#[async_trait::async_trait]
pub trait ApiDialer: Send + Sync + 'static {
    /// Open a session to the controller described by `controller`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ApiConnection`] when the controller cannot be
    /// reached or refuses the admin credentials.
    async fn dial(&self, controller: &Controller) -> Result<Arc<dyn ControllerApi>, Error>;
}
