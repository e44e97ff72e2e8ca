//! Controller lifecycle: registration, reads, deprecation, deletion.

use fleetmux_store::{Query, Sort, Update};
use tracing::{info, warn};

use crate::auth::Identity;
use crate::entity::{
    Acl, AuditContent, CloudRegion, Controller, EntityPath, EVERYONE, HostPort, Location,
};
use crate::error::Error;

use super::Broker;

/// What a caller supplies to register a controller.
#[derive(Debug, Clone)]
pub struct AddControllerParams {
    pub path: EntityPath,
    /// Must be true: private controllers are not accepted.
    pub public: bool,
    /// Bootstrap addresses used for the first dial; replaced by the
    /// controller's own reported host:ports once connected.
    pub addresses: Vec<HostPort>,
    pub ca_cert: String,
    pub admin_user: String,
    pub admin_password: String,
    pub location: Location,
}

impl Broker {
    /// Register a remote controller in the catalog.
    ///
    /// Dials the controller first: its UUID, version, and host:ports are
    /// authoritative. The dialed session was cached under the empty UUID the
    /// document had before connecting, so it is evicted once the real UUID
    /// is known. Every cloud the controller reports gains a region row
    /// referencing it.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] unless the caller is the controller admin.
    /// - [`Error::Forbidden`] for a non-public controller.
    /// - [`Error::ApiConnection`] when the controller cannot be dialed.
    /// - [`Error::AlreadyExists`] on a path collision.
    pub async fn add_controller(
        &self,
        id: &Identity,
        params: AddControllerParams,
    ) -> Result<Controller, Error> {
        self.auth().check_controller_admin(id).await?;
        if !params.public {
            return Err(Error::forbidden("cannot add a private controller"));
        }

        let mut controller = Controller {
            path: params.path.clone(),
            addresses: params.addresses,
            ca_cert: params.ca_cert,
            admin_user: params.admin_user,
            admin_password: params.admin_password,
            location: params.location,
            public: true,
            acl: Acl {
                read: vec![EVERYONE.to_owned()],
                ..Acl::default()
            },
            ..Controller::default()
        };

        let handle = self.conns().open_from_doc(&controller).await?;
        let result = self.register_dialed_controller(&mut controller, &handle).await;
        // The session was cached under the empty UUID; drop it either way.
        handle.evict().await;
        result?;

        info!(controller = %controller.path, uuid = %controller.uuid, "controller added");
        if let Err(err) = self
            .db()
            .append_audit(AuditContent::ControllerAdded {
                controller: controller.path.to_string(),
            })
            .await
        {
            warn!(error = %err, "audit append failed");
        }
        Ok(controller)
    }

    async fn register_dialed_controller(
        &self,
        controller: &mut Controller,
        handle: &crate::conns::ApiHandle,
    ) -> Result<(), Error> {
        handle.ping().await?;
        controller.uuid = handle.controller_uuid().await?;
        controller.version = Some(handle.server_version().await?);
        let reported = handle.api_host_ports().await?;
        if !reported.is_empty() {
            controller.addresses = reported;
        }

        self.db().store().insert(controller).await.map_err(|e| {
            if matches!(e, fleetmux_store::StoreError::AlreadyExists { .. }) {
                Error::already_exists(format!("controller {}", controller.path))
            } else {
                e.into()
            }
        })?;

        let clouds = handle.clouds().await?;
        for (cloud_name, def) in clouds {
            self.register_cloud_rows(controller, &cloud_name, &def).await?;
        }
        Ok(())
    }

    /// Upsert the cloud row and one row per region, adding the controller to
    /// the primary set for its home cloud and the secondary set elsewhere.
    async fn register_cloud_rows(
        &self,
        controller: &Controller,
        cloud_name: &str,
        def: &crate::api::CloudDefinition,
    ) -> Result<(), Error> {
        let home = controller.location.cloud == cloud_name;
        let mut regions: Vec<String> = def.regions.iter().map(|r| r.name.clone()).collect();
        // The cloud row itself is the empty region.
        regions.insert(0, String::new());

        for region in regions {
            let primary = home
                && (region.is_empty()
                    || controller.location.region.is_empty()
                    || controller.location.region == region);
            let list = if primary {
                "primary_controllers"
            } else {
                "secondary_controllers"
            };
            let update = Update::new()
                .set("cloud", cloud_name)
                .set("region", region.as_str())
                .set("provider_type", def.provider_type.as_str())
                .set("auth_types", serde_json::json!(def.auth_types))
                .set("endpoint", def.endpoint.as_str())
                .add_to_set(list, controller.path.to_string());
            self.db()
                .store()
                .update_key::<CloudRegion>(
                    &CloudRegion::key_for(cloud_name, &region),
                    &update,
                    true,
                )
                .await?;
        }
        Ok(())
    }

    /// Fetch a controller the caller may read. Hidden controllers are
    /// reported as not found.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent or hidden.
    pub async fn controller(&self, id: &Identity, path: &EntityPath) -> Result<Controller, Error> {
        let controller = self.db().controller(path).await?;
        self.check_can_read_or_hide(
            id,
            &format!("controller {path}"),
            controller.public,
            &controller.path.user,
            &controller.acl,
        )
        .await?;
        Ok(controller)
    }

    /// All controllers the caller may read, ordered by path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn controllers(&self, id: &Identity) -> Result<Vec<Controller>, Error> {
        let mut all = Vec::new();
        self.db()
            .store()
            .for_each::<Controller, Error, _>(
                &Query::All,
                &Sort::by("path.user").then("path.name"),
                |ctl| {
                    all.push(ctl);
                    Ok(())
                },
            )
            .await?;
        let mut visible = Vec::new();
        for ctl in all {
            let readable = ctl.public
                || self
                    .auth()
                    .check_can_read(id, &ctl.path.user, &ctl.acl.read)
                    .await
                    .is_ok();
            if readable {
                visible.push(ctl);
            }
        }
        Ok(visible)
    }

    /// Mark or unmark a controller as deprecated for new workloads.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when absent or hidden from the caller.
    /// - [`Error::Unauthorized`] when the caller is not the controller
    ///   admin.
    pub async fn set_controller_deprecated(
        &self,
        id: &Identity,
        path: &EntityPath,
        deprecated: bool,
    ) -> Result<(), Error> {
        let controller = self.controller(id, path).await?;
        self.auth().check_controller_admin(id).await?;
        let update = Update::new().set("deprecated", deprecated);
        self.db()
            .store()
            .update(&controller, &update, false)
            .await?;
        Ok(())
    }

    /// Remove a controller and everything that references it.
    ///
    /// A healthy controller is only removed with `force`; otherwise the
    /// caller is told it is still alive and can retry once the monitor has
    /// flagged it unavailable (or with force).
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when absent or hidden from the caller.
    /// - [`Error::Unauthorized`] when the caller is not the controller
    ///   admin.
    /// - [`Error::StillAlive`] when healthy and `force` is false.
    pub async fn delete_controller(
        &self,
        id: &Identity,
        path: &EntityPath,
        force: bool,
    ) -> Result<(), Error> {
        let controller = self.controller(id, path).await?;
        self.auth().check_controller_admin(id).await?;
        if !force && controller.is_available() {
            return Err(Error::StillAlive {
                controller: path.to_string(),
            });
        }

        self.conns().evict(&controller.uuid).await;
        self.db().remove_controller(path).await?;

        info!(controller = %path, force, "controller deleted");
        if let Err(err) = self
            .db()
            .append_audit(AuditContent::ControllerRemoved {
                controller: path.to_string(),
            })
            .await
        {
            warn!(error = %err, "audit append failed");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use crate::testing::{FakeApi, FakeDialer, StaticIdentity};
    use crate::api::CloudDefinition;
    use fleetmux_store::{MemoryStore, Store};
    use std::sync::Arc;

    async fn broker_with(dialer: FakeDialer, identity: StaticIdentity) -> Arc<Broker> {
        Broker::new(
            Store::new(Arc::new(MemoryStore::new())),
            Arc::new(dialer),
            Arc::new(identity),
            None,
            BrokerConfig::default(),
        )
        .await
        .unwrap()
    }

    fn admin_identity() -> StaticIdentity {
        StaticIdentity::new().with_user("bob", &["controller-admin"])
    }

    fn add_params(path: &str) -> AddControllerParams {
        AddControllerParams {
            path: path.parse().unwrap(),
            public: true,
            addresses: vec![],
            ca_cert: "ca".into(),
            admin_user: "admin".into(),
            admin_password: "hunter2".into(),
            location: Location {
                cloud: "aws".into(),
                region: "eu-west-1".into(),
            },
        }
    }

    fn fake_with_cloud(uuid: &str) -> Arc<FakeApi> {
        let api = FakeApi::new(uuid);
        api.with_state(|s| {
            s.clouds.insert(
                "aws".into(),
                CloudDefinition {
                    provider_type: "ec2".into(),
                    regions: vec![crate::api::CloudRegionDefinition {
                        name: "eu-west-1".into(),
                        ..crate::api::CloudRegionDefinition::default()
                    }],
                    ..CloudDefinition::default()
                },
            );
        });
        api
    }

    #[tokio::test]
    async fn add_controller_fetches_uuid_and_registers_regions() {
        let dialer = FakeDialer::new();
        dialer.register("bob/prod", fake_with_cloud("ctl-uuid"));
        let broker = broker_with(dialer, admin_identity()).await;
        let bob = Identity::new("bob").unwrap();

        let ctl = broker.add_controller(&bob, add_params("bob/prod")).await.unwrap();
        assert_eq!(ctl.uuid, "ctl-uuid");
        assert_eq!(ctl.version.as_deref(), Some("3.2.1"));
        assert!(!ctl.addresses.is_empty());

        let row = broker.db().cloud_region("aws", "eu-west-1").await.unwrap();
        assert_eq!(row.primary_controllers, vec!["bob/prod"]);
        let cloud_row = broker.db().cloud_region("aws", "").await.unwrap();
        assert_eq!(cloud_row.primary_controllers, vec!["bob/prod"]);
        assert_eq!(cloud_row.provider_type, "ec2");
    }

    #[tokio::test]
    async fn add_controller_requires_admin_and_public() {
        let dialer = FakeDialer::new();
        dialer.register("eve/prod", fake_with_cloud("x"));
        let broker = broker_with(dialer, admin_identity()).await;

        let eve = Identity::new("eve").unwrap();
        assert!(matches!(
            broker.add_controller(&eve, add_params("eve/prod")).await,
            Err(Error::Unauthorized)
        ));

        let bob = Identity::new("bob").unwrap();
        let mut params = add_params("bob/prod");
        params.public = false;
        assert!(matches!(
            broker.add_controller(&bob, params).await,
            Err(Error::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn add_controller_twice_collides() {
        let dialer = FakeDialer::new();
        dialer.register("bob/prod", fake_with_cloud("ctl-uuid"));
        let broker = broker_with(dialer, admin_identity()).await;
        let bob = Identity::new("bob").unwrap();

        broker.add_controller(&bob, add_params("bob/prod")).await.unwrap();
        let err = broker
            .add_controller(&bob, add_params("bob/prod"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn public_controller_readable_by_anyone() {
        let dialer = FakeDialer::new();
        dialer.register("bob/prod", fake_with_cloud("ctl-uuid"));
        let broker = broker_with(dialer, admin_identity()).await;
        let bob = Identity::new("bob").unwrap();
        broker.add_controller(&bob, add_params("bob/prod")).await.unwrap();

        let eve = Identity::new("eve").unwrap();
        let ctl = broker.controller(&eve, &"bob/prod".parse().unwrap()).await.unwrap();
        assert_eq!(ctl.uuid, "ctl-uuid");
        assert_eq!(broker.controllers(&eve).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hidden_controller_probe_proof() {
        let broker = broker_with(FakeDialer::new(), admin_identity()).await;
        // A private controller inserted directly (not via add_controller).
        let ctl = Controller {
            uuid: "u".into(),
            public: false,
            ..Controller::with_path("bob/secret".parse().unwrap())
        };
        broker.db().store().insert(&ctl).await.unwrap();

        let eve = Identity::new("eve").unwrap();
        let err = broker
            .controller(&eve, &"bob/secret".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(broker.controllers(&eve).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_requires_force_while_healthy() {
        let dialer = FakeDialer::new();
        dialer.register("bob/prod", fake_with_cloud("ctl-uuid"));
        let broker = broker_with(dialer, admin_identity()).await;
        let bob = Identity::new("bob").unwrap();
        broker.add_controller(&bob, add_params("bob/prod")).await.unwrap();
        let path: EntityPath = "bob/prod".parse().unwrap();

        let err = broker.delete_controller(&bob, &path, false).await.unwrap_err();
        assert!(matches!(err, Error::StillAlive { .. }));

        broker.delete_controller(&bob, &path, true).await.unwrap();
        assert!(broker.db().controller(&path).await.unwrap_err().is_not_found());
        // Cloud-region rows no longer reference it.
        let row = broker.db().cloud_region("aws", "eu-west-1").await.unwrap();
        assert!(row.primary_controllers.is_empty());
    }

    #[tokio::test]
    async fn delete_without_force_after_unavailable() {
        let dialer = FakeDialer::new();
        dialer.register("bob/prod", fake_with_cloud("ctl-uuid"));
        let broker = broker_with(dialer, admin_identity()).await;
        let bob = Identity::new("bob").unwrap();
        broker.add_controller(&bob, add_params("bob/prod")).await.unwrap();
        let path: EntityPath = "bob/prod".parse().unwrap();

        broker
            .db()
            .set_controller_unavailable_at(&path, chrono::Utc::now())
            .await
            .unwrap();
        broker.delete_controller(&bob, &path, false).await.unwrap();
    }

    #[tokio::test]
    async fn deprecate_flag_roundtrip() {
        let dialer = FakeDialer::new();
        dialer.register("bob/prod", fake_with_cloud("ctl-uuid"));
        let broker = broker_with(dialer, admin_identity()).await;
        let bob = Identity::new("bob").unwrap();
        broker.add_controller(&bob, add_params("bob/prod")).await.unwrap();
        let path: EntityPath = "bob/prod".parse().unwrap();

        broker.set_controller_deprecated(&bob, &path, true).await.unwrap();
        assert!(broker.db().controller(&path).await.unwrap().deprecated);
        broker.set_controller_deprecated(&bob, &path, false).await.unwrap();
        assert!(!broker.db().controller(&path).await.unwrap().deprecated);
    }
}
