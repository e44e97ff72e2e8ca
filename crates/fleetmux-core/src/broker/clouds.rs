//! Hosted-cloud lifecycle and cloud access control.

use fleetmux_store::{Document, Query, Sort, Update};
use tracing::{info, warn};

use crate::api::CloudDefinition;
use crate::auth::Identity;
use crate::entity::{
    Acl, AuditContent, CloudRegion, EntityPath, Model, valid_name,
};
use crate::error::Error;

use super::Broker;

/// Cloud access levels a user can be granted.
const CLOUD_ACCESS_LEVELS: [&str; 2] = ["add-model", "admin"];

impl Broker {
    /// Create a hosted cloud on one of the controllers serving its host
    /// region.
    ///
    /// The remote `add_cloud` runs first; the local rows are only written
    /// after the hosting controller has accepted the definition, so a remote
    /// failure leaves no local record.
    ///
    /// # Errors
    ///
    /// - [`Error::BadRequest`] for an invalid cloud name.
    /// - [`Error::CloudRegionRequired`] when the definition has no regions
    ///   or no host cloud/region.
    /// - [`Error::IncompatibleClouds`] when a cloud of the same name exists
    ///   with a different provider type.
    /// - [`Error::AlreadyExists`] when the cloud already exists.
    /// - [`Error::Unauthorized`] when the caller may not host workloads on
    ///   the host region.
    pub async fn create_cloud(
        &self,
        id: &Identity,
        name: &str,
        def: &CloudDefinition,
    ) -> Result<(), Error> {
        if !valid_name(name) {
            return Err(Error::bad_request(format!("invalid cloud name '{name}'")));
        }
        if def.regions.is_empty() {
            return Err(Error::CloudRegionRequired);
        }
        let (host_cloud, host_region) = def
            .host_cloud_region
            .split_once('/')
            .ok_or(Error::CloudRegionRequired)?;

        match self.db().cloud_region(name, "").await {
            Ok(existing) => {
                return Err(if existing.provider_type == def.provider_type {
                    Error::already_exists(format!("cloud {name}"))
                } else {
                    Error::IncompatibleClouds {
                        reason: format!(
                            "cloud {name} exists with provider type '{}'",
                            existing.provider_type
                        ),
                    }
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let host = self.db().cloud_region(host_cloud, host_region).await?;
        self.check_can_read_or_hide(
            id,
            &format!("cloud {host_cloud}"),
            host.acl.read.iter().any(|e| e == crate::entity::EVERYONE),
            &host.acl.admin.first().cloned().unwrap_or_default(),
            &host.acl,
        )
        .await?;
        // Hosting a cloud means placing workloads on the region.
        self.auth().check_acl(id, &host.acl.write).await?;

        let (controller_path, handle) = self.open_region_controller(&host).await?;
        handle.add_cloud(name, def).await.map_err(|e| {
            if e.is_already_exists() {
                Error::already_exists(format!("cloud {name}"))
            } else {
                e.into()
            }
        })?;

        // Prefer the controller's canonical view of what it created.
        let canonical = match handle.cloud(name).await {
            Ok(c) => c,
            Err(_) => def.clone(),
        };
        self.insert_cloud_rows(id, name, &canonical, &controller_path)
            .await?;

        info!(cloud = %name, controller = %controller_path, "hosted cloud created");
        if let Err(err) = self
            .db()
            .append_audit(AuditContent::CloudCreated {
                cloud: name.to_owned(),
                controller: controller_path.to_string(),
            })
            .await
        {
            warn!(error = %err, "audit append failed");
        }
        Ok(())
    }

    /// Dial the first usable controller hosting a region: available, not
    /// deprecated, primaries before secondaries.
    async fn open_region_controller(
        &self,
        region: &CloudRegion,
    ) -> Result<(EntityPath, crate::conns::ApiHandle), Error> {
        let candidates = region
            .primary_controllers
            .iter()
            .chain(region.secondary_controllers.iter());
        for candidate in candidates {
            let path: EntityPath = match candidate.parse() {
                Ok(p) => p,
                Err(_) => continue,
            };
            let controller = match self.db().controller(&path).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            if controller.deprecated || !controller.is_available() {
                continue;
            }
            match self.conns().open_from_doc(&controller).await {
                Ok(handle) => return Ok((path, handle)),
                Err(err) => {
                    warn!(controller = %path, error = %err, "skipping unreachable region controller");
                }
            }
        }
        Err(Error::not_found(format!(
            "no usable controller for cloud region {}/{}",
            region.cloud, region.region
        )))
    }

    async fn insert_cloud_rows(
        &self,
        id: &Identity,
        name: &str,
        def: &CloudDefinition,
        controller: &EntityPath,
    ) -> Result<(), Error> {
        let acl = Acl {
            read: vec![id.id().to_owned()],
            write: vec![id.id().to_owned()],
            admin: vec![id.id().to_owned()],
        };
        let mut regions: Vec<String> = def.regions.iter().map(|r| r.name.clone()).collect();
        regions.insert(0, String::new());
        for region in regions {
            let row = CloudRegion {
                cloud: name.to_owned(),
                region,
                provider_type: def.provider_type.clone(),
                auth_types: def.auth_types.clone(),
                endpoint: def.endpoint.clone(),
                identity_endpoint: def.identity_endpoint.clone(),
                storage_endpoint: def.storage_endpoint.clone(),
                ca_certificates: def.ca_certificates.clone(),
                primary_controllers: vec![controller.to_string()],
                secondary_controllers: Vec::new(),
                acl: acl.clone(),
            };
            // Reentrancy: a second create of the same cloud is a no-op row
            // by row.
            match self.db().store().insert(&row).await {
                Ok(()) | Err(fleetmux_store::StoreError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// The rows of one cloud, region rows included, if the caller may read
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent or hidden.
    pub async fn cloud(&self, id: &Identity, name: &str) -> Result<Vec<CloudRegion>, Error> {
        let mut rows = Vec::new();
        self.db()
            .store()
            .for_each::<CloudRegion, Error, _>(
                &Query::eq("cloud", name),
                &Sort::by("region"),
                |row| {
                    rows.push(row);
                    Ok(())
                },
            )
            .await?;
        let Some(cloud_row) = rows.iter().find(|r| r.is_cloud_row()).cloned() else {
            return Err(Error::not_found(format!("cloud {name}")));
        };
        self.check_can_read_or_hide(
            id,
            &format!("cloud {name}"),
            false,
            &cloud_row.acl.admin.first().cloned().unwrap_or_default(),
            &cloud_row.acl,
        )
        .await?;
        Ok(rows)
    }

    /// Every cloud row the caller may read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn clouds(&self, id: &Identity) -> Result<Vec<CloudRegion>, Error> {
        let mut rows = Vec::new();
        self.db()
            .store()
            .for_each::<CloudRegion, Error, _>(
                &Query::All,
                &Sort::by("cloud").then("region"),
                |row| {
                    rows.push(row);
                    Ok(())
                },
            )
            .await?;
        let mut visible = Vec::new();
        for row in rows {
            let owner = row.acl.admin.first().cloned().unwrap_or_default();
            if self
                .auth()
                .check_can_read(id, &owner, &row.acl.read)
                .await
                .is_ok()
            {
                visible.push(row);
            }
        }
        Ok(visible)
    }

    /// Remove a hosted cloud.
    ///
    /// The model-in-use check is advisory — a model can appear between the
    /// check and the removal — so the hosting controller's own rejection is
    /// the authoritative failure. Remote removal runs first on every
    /// referenced controller; local rows are only dropped after all remotes
    /// succeed.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when absent or hidden.
    /// - [`Error::Unauthorized`] when the caller is not a cloud admin.
    pub async fn remove_cloud(&self, id: &Identity, name: &str) -> Result<(), Error> {
        let rows = self.cloud(id, name).await?;
        let cloud_row = rows
            .iter()
            .find(|r| r.is_cloud_row())
            .ok_or_else(|| Error::not_found(format!("cloud {name}")))?;
        let owner = cloud_row.acl.admin.first().cloned().unwrap_or_default();
        self.check_admin(id, &owner, &cloud_row.acl).await?;

        // Advisory only: a model can appear (or vanish) between this count
        // and the removal, so the controller's rejection is authoritative.
        let in_use = self
            .db()
            .store()
            .count::<Model>(&Query::eq("cloud", name))
            .await?;
        if in_use > 0 {
            warn!(cloud = %name, models = in_use, "removing cloud still referenced by models");
        }

        for controller in Self::referenced_controllers(&rows) {
            let (_, handle) = self.open_controller(&controller).await?;
            match handle.remove_cloud(name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.db()
            .store()
            .remove_all::<CloudRegion>(&Query::eq("cloud", name))
            .await?;

        info!(cloud = %name, "cloud removed");
        if let Err(err) = self
            .db()
            .append_audit(AuditContent::CloudRemoved {
                cloud: name.to_owned(),
            })
            .await
        {
            warn!(error = %err, "audit append failed");
        }
        Ok(())
    }

    fn referenced_controllers(rows: &[CloudRegion]) -> Vec<EntityPath> {
        let mut paths = Vec::new();
        for row in rows {
            for candidate in row
                .primary_controllers
                .iter()
                .chain(row.secondary_controllers.iter())
            {
                if let Ok(path) = candidate.parse::<EntityPath>() {
                    if !paths.contains(&path) {
                        paths.push(path);
                    }
                }
            }
        }
        paths
    }

    /// Grant a user access to a cloud: remote first on every hosting
    /// controller, then the local ACL.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when absent or hidden.
    /// - [`Error::Unauthorized`] when the caller is not a cloud admin.
    /// - [`Error::BadRequest`] for an invalid access level or user.
    pub async fn grant_cloud(
        &self,
        id: &Identity,
        name: &str,
        user: &str,
        access: &str,
    ) -> Result<(), Error> {
        let (rows, user) = self.cloud_access_preflight(id, name, user, access).await?;

        for controller in Self::referenced_controllers(&rows) {
            let (_, handle) = self.open_controller(&controller).await?;
            handle.grant_cloud_access(name, user.id(), access).await?;
        }

        let field = if access == "admin" { "acl.admin" } else { "acl.write" };
        let update = Update::new()
            .add_to_set(field, user.id())
            .add_to_set("acl.read", user.id());
        for row in &rows {
            self.db()
                .store()
                .update_key::<CloudRegion>(&row.key(), &update, false)
                .await?;
        }
        Ok(())
    }

    /// Revoke a user's cloud access: local ACL first, then the hosting
    /// controllers, so the broker never advertises access the controller
    /// has already dropped.
    ///
    /// # Errors
    ///
    /// Same categories as [`Broker::grant_cloud`].
    pub async fn revoke_cloud(
        &self,
        id: &Identity,
        name: &str,
        user: &str,
        access: &str,
    ) -> Result<(), Error> {
        let (rows, user) = self.cloud_access_preflight(id, name, user, access).await?;

        let update = match access {
            // Revoking add-model also revokes admin (admin implies it).
            "add-model" => Update::new()
                .pull("acl.read", user.id())
                .pull("acl.write", user.id())
                .pull("acl.admin", user.id()),
            _ => Update::new().pull("acl.admin", user.id()),
        };
        for row in &rows {
            self.db()
                .store()
                .update_key::<CloudRegion>(&row.key(), &update, false)
                .await?;
        }

        for controller in Self::referenced_controllers(&rows) {
            let (_, handle) = self.open_controller(&controller).await?;
            handle.revoke_cloud_access(name, user.id(), access).await?;
        }
        Ok(())
    }

    async fn cloud_access_preflight(
        &self,
        id: &Identity,
        name: &str,
        user: &str,
        access: &str,
    ) -> Result<(Vec<CloudRegion>, Identity), Error> {
        if !CLOUD_ACCESS_LEVELS.contains(&access) {
            return Err(Error::bad_request(format!(
                "invalid cloud access '{access}'"
            )));
        }
        let user = Identity::new(user)?;
        let rows = self.cloud(id, name).await?;
        let cloud_row = rows
            .iter()
            .find(|r| r.is_cloud_row())
            .ok_or_else(|| Error::not_found(format!("cloud {name}")))?;
        let owner = cloud_row.acl.admin.first().cloned().unwrap_or_default();
        self.check_admin(id, &owner, &cloud_row.acl).await?;
        Ok((rows, user))
    }
}
