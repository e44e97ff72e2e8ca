//! Test doubles for the external collaborators.
//!
//! [`FakeApi`] is an in-memory controller: it hands out UUIDs, keeps offers,
//! models, clouds and pushed credentials, records every call, and can be
//! told to fail specific methods or report a broken transport. [`FakeDialer`]
//! maps controller paths to fakes and counts dials. [`StaticIdentity`]
//! resolves groups from a fixed table.
//!
//! These exist for this crate's own tests (and anyone embedding the broker
//! who wants to test against it without a fleet of real controllers).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::api::{
    AddOfferParams, ApiDialer, ApiResult, CloudDefinition, ConsumeOfferDetails, ControllerApi,
    ControllerInfo, CreateModelParams, CredentialUpdate, CODE_ALREADY_EXISTS, CODE_NOT_FOUND,
    ModelDetails, ModelSummary, OfferDetails, OfferUserDetails, RemoteError,
};
use crate::auth::IdentityProvider;
use crate::entity::{Controller, HostPort, Permission};
use crate::error::Error;

/// Mutable state of a fake controller.
#[derive(Debug, Default)]
pub struct FakeControllerState {
    pub uuid: String,
    pub version: String,
    pub host_ports: Vec<HostPort>,
    pub clouds: BTreeMap<String, CloudDefinition>,
    /// Offers by URL.
    pub offers: BTreeMap<String, OfferDetails>,
    /// Models by UUID.
    pub models: BTreeMap<String, ModelDetails>,
    pub summaries: Vec<ModelSummary>,
    /// Credentials pushed to this controller, by path.
    pub credentials: BTreeMap<String, CredentialUpdate>,
    /// Credential paths revoked on this controller.
    pub revoked_credentials: Vec<String>,
    /// Method names in invocation order.
    pub calls: Vec<String>,
    /// Methods forced to fail with the given error.
    pub failures: HashMap<String, RemoteError>,
    next_id: u64,
}

impl FakeControllerState {
    fn next_uuid(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }
}

/// An in-memory [`ControllerApi`] implementation.
pub struct FakeApi {
    state: Mutex<FakeControllerState>,
    broken: AtomicBool,
    closed: AtomicBool,
}

impl FakeApi {
    /// A fake controller with the given UUID.
    #[must_use]
    pub fn new(uuid: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeControllerState {
                uuid: uuid.to_owned(),
                version: "3.2.1".to_owned(),
                host_ports: vec![HostPort {
                    host: format!("{uuid}.example.com"),
                    port: 17070,
                    scope: crate::entity::AddressScope::Public,
                }],
                ..FakeControllerState::default()
            }),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Inspect or mutate the fake's state.
    ///
    /// # Panics
    ///
    /// Panics if the state mutex is poisoned (a test already panicked).
    #[allow(clippy::unwrap_used)]
    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeControllerState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Force `method` to fail with `err` until cleared.
    pub fn fail(&self, method: &str, err: RemoteError) {
        self.with_state(|s| {
            s.failures.insert(method.to_owned(), err);
        });
    }

    /// Clear a forced failure.
    pub fn clear_failure(&self, method: &str) {
        self.with_state(|s| {
            s.failures.remove(method);
        });
    }

    /// Mark the transport dead or alive.
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    /// True once [`ControllerApi::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The recorded call log.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    fn enter(&self, method: &str) -> ApiResult<()> {
        self.with_state(|s| {
            s.calls.push(method.to_owned());
            match s.failures.get(method) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }

    fn not_found(what: &str) -> RemoteError {
        RemoteError::with_code(format!("{what} not found"), CODE_NOT_FOUND)
    }
}

#[async_trait::async_trait]
impl ControllerApi for FakeApi {
    async fn offer(&self, params: AddOfferParams) -> ApiResult<()> {
        self.enter("offer")?;
        self.with_state(|s| {
            let model_name = s
                .models
                .get(&params.model_uuid)
                .map_or_else(|| "model".to_owned(), |m| m.name.clone());
            let url = format!("{}/{}.{}", params.owner, model_name, params.offer_name);
            if s.offers.contains_key(&url) {
                return Err(RemoteError::with_code(
                    "application offer already exists",
                    CODE_ALREADY_EXISTS,
                ));
            }
            let uuid = s.next_uuid("offer");
            s.offers.insert(
                url.clone(),
                OfferDetails {
                    offer_uuid: uuid,
                    offer_url: url,
                    offer_name: params.offer_name,
                    application_name: params.application_name,
                    application_description: params.application_description,
                    users: vec![OfferUserDetails {
                        user: params.owner,
                        display_name: String::new(),
                        access: Permission::Admin,
                    }],
                    ..OfferDetails::default()
                },
            );
            Ok(())
        })
    }

    async fn get_application_offer(&self, url: &str) -> ApiResult<OfferDetails> {
        self.enter("get_application_offer")?;
        self.with_state(|s| {
            s.offers
                .get(url)
                .cloned()
                .ok_or_else(|| Self::not_found("application offer"))
        })
    }

    async fn get_application_offer_consume_details(
        &self,
        user: &str,
        url: &str,
        _bakery_version: u8,
    ) -> ApiResult<ConsumeOfferDetails> {
        self.enter("get_application_offer_consume_details")?;
        self.with_state(|s| {
            let offer = s
                .offers
                .get(url)
                .cloned()
                .ok_or_else(|| Self::not_found("application offer"))?;
            Ok(ConsumeOfferDetails {
                offer,
                auth_token: Some(serde_json::json!({"for": user})),
                controller_info: ControllerInfo {
                    uuid: s.uuid.clone(),
                    alias: String::new(),
                    addrs: vec!["controller-internal:17070".to_owned()],
                    ca_cert: "fake-ca".to_owned(),
                },
            })
        })
    }

    async fn get_application_offers(&self, urls: &[String]) -> ApiResult<Vec<OfferDetails>> {
        self.enter("get_application_offers")?;
        self.with_state(|s| {
            urls.iter()
                .map(|url| {
                    s.offers
                        .get(url)
                        .cloned()
                        .ok_or_else(|| Self::not_found("application offer"))
                })
                .collect()
        })
    }

    async fn grant_application_offer_access(
        &self,
        url: &str,
        user: &str,
        level: Permission,
    ) -> ApiResult<()> {
        self.enter("grant_application_offer_access")?;
        self.with_state(|s| {
            let offer = s
                .offers
                .get_mut(url)
                .ok_or_else(|| Self::not_found("application offer"))?;
            match offer.users.iter_mut().find(|u| u.user == user) {
                Some(entry) => entry.access = entry.access.max(level),
                None => offer.users.push(OfferUserDetails {
                    user: user.to_owned(),
                    display_name: String::new(),
                    access: level,
                }),
            }
            Ok(())
        })
    }

    async fn revoke_application_offer_access(
        &self,
        url: &str,
        user: &str,
        level: Permission,
    ) -> ApiResult<()> {
        self.enter("revoke_application_offer_access")?;
        self.with_state(|s| {
            let offer = s
                .offers
                .get_mut(url)
                .ok_or_else(|| Self::not_found("application offer"))?;
            if let Some(entry) = offer.users.iter_mut().find(|u| u.user == user) {
                entry.access = entry.access.min(level.below());
            }
            Ok(())
        })
    }

    async fn destroy_application_offer(&self, url: &str, _force: bool) -> ApiResult<()> {
        self.enter("destroy_application_offer")?;
        self.with_state(|s| {
            s.offers
                .remove(url)
                .map(|_| ())
                .ok_or_else(|| Self::not_found("application offer"))
        })
    }

    async fn clouds(&self) -> ApiResult<BTreeMap<String, CloudDefinition>> {
        self.enter("clouds")?;
        Ok(self.with_state(|s| s.clouds.clone()))
    }

    async fn cloud(&self, name: &str) -> ApiResult<CloudDefinition> {
        self.enter("cloud")?;
        self.with_state(|s| {
            s.clouds
                .get(name)
                .cloned()
                .ok_or_else(|| Self::not_found("cloud"))
        })
    }

    async fn add_cloud(&self, name: &str, def: &CloudDefinition) -> ApiResult<()> {
        self.enter("add_cloud")?;
        self.with_state(|s| {
            if s.clouds.contains_key(name) {
                return Err(RemoteError::with_code(
                    "cloud already exists",
                    CODE_ALREADY_EXISTS,
                ));
            }
            s.clouds.insert(name.to_owned(), def.clone());
            Ok(())
        })
    }

    async fn remove_cloud(&self, name: &str) -> ApiResult<()> {
        self.enter("remove_cloud")?;
        self.with_state(|s| {
            s.clouds
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Self::not_found("cloud"))
        })
    }

    async fn grant_cloud_access(&self, cloud: &str, user: &str, access: &str) -> ApiResult<()> {
        self.enter(&format!("grant_cloud_access:{cloud}:{user}:{access}"))?;
        Ok(())
    }

    async fn revoke_cloud_access(&self, cloud: &str, user: &str, access: &str) -> ApiResult<()> {
        self.enter(&format!("revoke_cloud_access:{cloud}:{user}:{access}"))?;
        Ok(())
    }

    async fn create_model(&self, params: CreateModelParams) -> ApiResult<ModelDetails> {
        self.enter("create_model")?;
        self.with_state(|s| {
            let exists = s
                .models
                .values()
                .any(|m| m.owner == params.owner && m.name == params.name);
            if exists {
                return Err(RemoteError::with_code(
                    "model already exists",
                    CODE_ALREADY_EXISTS,
                ));
            }
            let uuid = s.next_uuid("model");
            let details = ModelDetails {
                uuid: uuid.clone(),
                name: params.name,
                owner: params.owner,
                cloud: params.cloud,
                region: params.region,
                ..ModelDetails::default()
            };
            s.models.insert(uuid, details.clone());
            Ok(details)
        })
    }

    async fn destroy_model(&self, uuid: &str, _force: bool) -> ApiResult<()> {
        self.enter("destroy_model")?;
        self.with_state(|s| {
            s.models
                .remove(uuid)
                .map(|_| ())
                .ok_or_else(|| Self::not_found("model"))
        })
    }

    async fn grant_model_access(&self, uuid: &str, user: &str, access: &str) -> ApiResult<()> {
        self.enter(&format!("grant_model_access:{uuid}:{user}:{access}"))?;
        Ok(())
    }

    async fn revoke_model_access(&self, uuid: &str, user: &str, access: &str) -> ApiResult<()> {
        self.enter(&format!("revoke_model_access:{uuid}:{user}:{access}"))?;
        Ok(())
    }

    async fn validate_model_upgrade(&self, uuid: &str, _force: bool) -> ApiResult<()> {
        self.enter(&format!("validate_model_upgrade:{uuid}"))?;
        Ok(())
    }

    async fn update_credential(&self, update: &CredentialUpdate) -> ApiResult<()> {
        self.enter("update_credential")?;
        self.with_state(|s| {
            s.credentials.insert(update.path.clone(), update.clone());
        });
        Ok(())
    }

    async fn revoke_credential(&self, path: &str) -> ApiResult<()> {
        self.enter("revoke_credential")?;
        self.with_state(|s| {
            s.credentials.remove(path);
            s.revoked_credentials.push(path.to_owned());
        });
        Ok(())
    }

    async fn controller_uuid(&self) -> ApiResult<String> {
        self.enter("controller_uuid")?;
        Ok(self.with_state(|s| s.uuid.clone()))
    }

    async fn server_version(&self) -> ApiResult<String> {
        self.enter("server_version")?;
        Ok(self.with_state(|s| s.version.clone()))
    }

    async fn api_host_ports(&self) -> ApiResult<Vec<HostPort>> {
        self.enter("api_host_ports")?;
        Ok(self.with_state(|s| s.host_ports.clone()))
    }

    async fn model_summaries(&self) -> ApiResult<Vec<ModelSummary>> {
        self.enter("model_summaries")?;
        Ok(self.with_state(|s| s.summaries.clone()))
    }

    async fn ping(&self) -> ApiResult<()> {
        self.enter("ping")
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for FakeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeApi").finish_non_exhaustive()
    }
}

/// Dials [`FakeApi`] sessions by controller path.
#[derive(Default)]
pub struct FakeDialer {
    apis: Mutex<HashMap<String, Arc<FakeApi>>>,
    failing: Mutex<HashSet<String>>,
    dials: AtomicUsize,
    /// Artificial dial latency, for single-flight tests.
    pub dial_delay: Option<Duration>,
}

impl FakeDialer {
    /// A dialer with no registered controllers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fake controller under the given path.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex is poisoned (a test already panicked).
    #[allow(clippy::unwrap_used)]
    pub fn register(&self, path: &str, api: Arc<FakeApi>) {
        self.apis.lock().unwrap().insert(path.to_owned(), api);
    }

    /// Make dials to `path` fail (or succeed again).
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex is poisoned (a test already panicked).
    #[allow(clippy::unwrap_used)]
    pub fn set_unreachable(&self, path: &str, unreachable: bool) {
        let mut failing = self.failing.lock().unwrap();
        if unreachable {
            failing.insert(path.to_owned());
        } else {
            failing.remove(path);
        }
    }

    /// How many dials have been attempted.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ApiDialer for FakeDialer {
    #[allow(clippy::unwrap_used)]
    async fn dial(&self, controller: &Controller) -> Result<Arc<dyn ControllerApi>, Error> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.dial_delay {
            tokio::time::sleep(delay).await;
        }
        let path = controller.path.to_string();
        if self.failing.lock().unwrap().contains(&path) {
            return Err(Error::ApiConnection {
                controller: path,
                reason: "connection refused".to_owned(),
            });
        }
        let api = self.apis.lock().unwrap().get(&path).cloned();
        api.map(|a| a as Arc<dyn ControllerApi>)
            .ok_or(Error::ApiConnection {
                controller: path,
                reason: "no such controller".to_owned(),
            })
    }
}

impl std::fmt::Debug for FakeDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeDialer").finish_non_exhaustive()
    }
}

/// An [`IdentityProvider`] answering from a fixed user → groups table.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    groups: HashMap<String, Vec<String>>,
}

impl StaticIdentity {
    /// An empty table: every user has no groups.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user with the given groups.
    #[must_use]
    pub fn with_user(mut self, user: &str, groups: &[&str]) -> Self {
        self.groups.insert(
            user.to_owned(),
            groups.iter().map(|g| (*g).to_owned()).collect(),
        );
        self
    }
}

#[async_trait::async_trait]
impl IdentityProvider for StaticIdentity {
    async fn groups_for_user(&self, user: &str) -> Result<Vec<String>, Error> {
        Ok(self.groups.get(user).cloned().unwrap_or_default())
    }
}
