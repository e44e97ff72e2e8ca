//! Model lifecycle and access.
//!
//! Creation needs the controller-assigned UUID, so the remote create runs
//! first and the local insert tolerates a replay (`AlreadyExists` means an
//! earlier attempt got as far as the catalog). Grants go remote-first;
//! revokes go local-first.

use std::collections::BTreeMap;

use fleetmux_store::{Query, Sort, Update};
use tracing::{info, warn};

use crate::api::CreateModelParams;
use crate::auth::Identity;
use crate::entity::{
    AuditContent, Controller, CredentialPath, EntityPath, Life, Model,
};
use crate::error::Error;

use super::Broker;

/// Model access levels a user can be granted.
const MODEL_ACCESS_LEVELS: [&str; 3] = ["read", "write", "admin"];

/// What a caller supplies to create a model.
#[derive(Debug, Clone)]
pub struct CreateModelRequest {
    pub path: EntityPath,
    /// Explicit controller; otherwise one serving `cloud`/`region` is
    /// chosen.
    pub controller: Option<EntityPath>,
    pub cloud: String,
    pub region: String,
    pub credential: CredentialPath,
    pub config: BTreeMap<String, serde_json::Value>,
}

impl Broker {
    /// Create a model on a controller serving the requested cloud/region.
    ///
    /// The model's credential is pushed to the chosen controller before the
    /// create, and the credential's holder set gains that controller.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] when the caller is not the model owner or
    ///   may not place workloads on the region.
    /// - [`Error::NotFound`] for an unknown cloud/region or credential.
    /// - [`Error::BadRequest`] for a revoked credential.
    /// - [`Error::AlreadyExists`] when the model exists.
    pub async fn create_model(&self, id: &Identity, req: &CreateModelRequest) -> Result<Model, Error> {
        self.auth().check_is_user(id, &req.path.user).await?;

        let credential = self.db().credential(&req.credential).await?;
        if credential.revoked {
            return Err(Error::bad_request(format!(
                "credential {} is revoked",
                req.credential
            )));
        }

        let region_row = self.db().cloud_region(&req.cloud, &req.region).await?;
        self.auth().check_acl(id, &region_row.acl.write).await?;

        let controller = match &req.controller {
            Some(path) => self.db().controller(path).await?,
            None => self.pick_region_controller(&region_row).await?,
        };
        let handle = self.conns().open_from_doc(&controller).await?;

        // The controller needs the credential before it can create the
        // model with it.
        let material = self.credential_material(&credential).await?;
        handle.update_credential(&material).await?;
        self.db()
            .credential_add_controller(&req.credential, &controller.path)
            .await?;

        let details = handle
            .create_model(CreateModelParams {
                name: req.path.name.clone(),
                owner: req.path.user.clone(),
                cloud: req.cloud.clone(),
                region: req.region.clone(),
                credential: req.credential.to_string(),
                config: req.config.clone(),
            })
            .await
            .map_err(|e| {
                if e.is_already_exists() {
                    Error::already_exists(format!("model {}", req.path))
                } else {
                    e.into()
                }
            })?;

        let model = Model {
            path: req.path.clone(),
            uuid: details.uuid,
            controller: controller.path.clone(),
            cloud: req.cloud.clone(),
            cloud_region: if details.region.is_empty() {
                req.region.clone()
            } else {
                details.region
            },
            credential: req.credential.clone(),
            model_type: details.model_type,
            ..Model::default()
        };
        match self.db().store().insert(&model).await {
            Ok(()) => {}
            // A previous attempt already recorded it; the remote create was
            // the authoritative step.
            Err(fleetmux_store::StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        info!(model = %model.path, uuid = %model.uuid, controller = %controller.path, "model created");
        if let Err(err) = self
            .db()
            .append_audit(AuditContent::ModelCreated {
                model: model.path.to_string(),
                controller: controller.path.to_string(),
            })
            .await
        {
            warn!(error = %err, "audit append failed");
        }
        Ok(model)
    }

    async fn pick_region_controller(
        &self,
        region: &crate::entity::CloudRegion,
    ) -> Result<Controller, Error> {
        let candidates = region
            .primary_controllers
            .iter()
            .chain(region.secondary_controllers.iter());
        for candidate in candidates {
            let Ok(path) = candidate.parse::<EntityPath>() else {
                continue;
            };
            let Ok(controller) = self.db().controller(&path).await else {
                continue;
            };
            if !controller.deprecated && controller.is_available() {
                return Ok(controller);
            }
        }
        Err(Error::not_found(format!(
            "no usable controller for cloud region {}/{}",
            region.cloud, region.region
        )))
    }

    /// Fetch a model the caller may read. Hidden models are reported as not
    /// found.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent or hidden.
    pub async fn model(&self, id: &Identity, path: &EntityPath) -> Result<Model, Error> {
        let model = self.db().model(path).await?;
        self.check_can_read_or_hide(
            id,
            &format!("model {path}"),
            false,
            &model.path.user,
            &model.acl,
        )
        .await?;
        Ok(model)
    }

    /// Every model the caller may read, ordered by path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn models(&self, id: &Identity) -> Result<Vec<Model>, Error> {
        let mut all = Vec::new();
        self.db()
            .store()
            .for_each::<Model, Error, _>(
                &Query::All,
                &Sort::by("path.user").then("path.name"),
                |model| {
                    all.push(model);
                    Ok(())
                },
            )
            .await?;
        let mut visible = Vec::new();
        for model in all {
            if self
                .auth()
                .check_can_read(id, &model.path.user, &model.acl.read)
                .await
                .is_ok()
            {
                visible.push(model);
            }
        }
        Ok(visible)
    }

    /// Grant a user model access: on the controller first, then the local
    /// ACL.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when absent or hidden.
    /// - [`Error::Unauthorized`] when the caller is not a model admin.
    /// - [`Error::BadRequest`] for an invalid access level or user.
    pub async fn grant_model(
        &self,
        id: &Identity,
        path: &EntityPath,
        user: &str,
        access: &str,
    ) -> Result<(), Error> {
        let (model, user) = self.model_access_preflight(id, path, user, access).await?;

        let (_, handle) = self.open_controller(&model.controller).await?;
        handle
            .grant_model_access(&model.uuid, user.id(), access)
            .await?;

        let mut update = Update::new().add_to_set("acl.read", user.id());
        if access == "write" || access == "admin" {
            update = update.add_to_set("acl.write", user.id());
        }
        if access == "admin" {
            update = update.add_to_set("acl.admin", user.id());
        }
        self.db().store().update(&model, &update, false).await?;
        Ok(())
    }

    /// Revoke a user's model access at `access` and above: locally first,
    /// then on the controller.
    ///
    /// # Errors
    ///
    /// Same categories as [`Broker::grant_model`].
    pub async fn revoke_model(
        &self,
        id: &Identity,
        path: &EntityPath,
        user: &str,
        access: &str,
    ) -> Result<(), Error> {
        let (model, user) = self.model_access_preflight(id, path, user, access).await?;

        let mut update = Update::new().pull("acl.admin", user.id());
        if access == "read" || access == "write" {
            update = update.pull("acl.write", user.id());
        }
        if access == "read" {
            update = update.pull("acl.read", user.id());
        }
        self.db().store().update(&model, &update, false).await?;

        let (_, handle) = self.open_controller(&model.controller).await?;
        handle
            .revoke_model_access(&model.uuid, user.id(), access)
            .await?;
        Ok(())
    }

    async fn model_access_preflight(
        &self,
        id: &Identity,
        path: &EntityPath,
        user: &str,
        access: &str,
    ) -> Result<(Model, Identity), Error> {
        if !MODEL_ACCESS_LEVELS.contains(&access) {
            return Err(Error::bad_request(format!(
                "invalid model access '{access}'"
            )));
        }
        let user = Identity::new(user)?;
        let model = self.model(id, path).await?;
        self.check_admin(id, &model.path.user, &model.acl).await?;
        Ok((model, user))
    }

    /// Destroy a model.
    ///
    /// The remote destroy runs first; locally the model only moves to
    /// `dying` — the monitor removes it from the catalog once the
    /// controller reports it dead.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when absent or hidden.
    /// - [`Error::Unauthorized`] when the caller is not a model admin.
    pub async fn destroy_model(&self, id: &Identity, path: &EntityPath, force: bool) -> Result<(), Error> {
        let model = self.model(id, path).await?;
        self.check_admin(id, &model.path.user, &model.acl).await?;

        let (_, handle) = self.open_controller(&model.controller).await?;
        match handle.destroy_model(&model.uuid, force).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let update = Update::new().set("info.life", serde_json::json!(Life::Dying));
        match self.db().store().update(&model, &update, false).await {
            Ok(()) | Err(fleetmux_store::StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        info!(model = %path, force, "model destroy requested");
        if let Err(err) = self
            .db()
            .append_audit(AuditContent::ModelDestroyed {
                model: path.to_string(),
            })
            .await
        {
            warn!(error = %err, "audit append failed");
        }
        Ok(())
    }

    /// Ask the owning controller whether a model can upgrade.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when absent or hidden.
    /// - [`Error::Api`] when the controller rejects the upgrade.
    pub async fn validate_model_upgrade(
        &self,
        id: &Identity,
        path: &EntityPath,
        force: bool,
    ) -> Result<(), Error> {
        let model = self.model(id, path).await?;
        let (_, handle) = self.open_controller(&model.controller).await?;
        handle.validate_model_upgrade(&model.uuid, force).await?;
        Ok(())
    }
}
