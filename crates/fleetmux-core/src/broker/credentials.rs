//! Credential management.
//!
//! The ordering contract: the local record (and the vault, when configured)
//! is written first so the canonical material is durable, then the material
//! is pushed to every controller holding a copy. Push failures never fail
//! the request — the controller is queued in its `update_credentials` list
//! and drained with at-least-once semantics on its next fresh connection.

use fleetmux_store::Update;
use tracing::{info, warn};

use crate::api::{ControllerApi, CredentialUpdate};
use crate::auth::Identity;
use crate::entity::{Controller, Credential, CredentialPath, EntityPath};
use crate::error::Error;

use super::Broker;

impl Broker {
    /// Create or replace a credential.
    ///
    /// With a vault configured, the attribute material goes to the vault and
    /// the catalog document only records the redirection. The set of
    /// controllers holding a copy is preserved across updates and each gets
    /// a best-effort push of the new material.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] when the caller is not the credential's
    ///   user.
    /// - [`Error::Vault`] when the vault write fails.
    pub async fn update_credential(&self, id: &Identity, cred: &Credential) -> Result<(), Error> {
        self.auth().check_is_user(id, &cred.path.user).await?;

        let existing = match self.db().credential(&cred.path).await {
            Ok(existing) => Some(existing),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let mut doc = cred.clone();
        doc.revoked = false;
        if let Some(vault) = &self.vault {
            vault.write(&doc.vault_path(), &doc.attributes).await?;
            doc.attributes_in_vault = true;
            doc.attributes.clear();
        } else {
            doc.attributes_in_vault = false;
        }

        let update = Update::new()
            .set("path", to_value(&doc.path)?)
            .set("type", doc.auth_type.as_str())
            .set("label", doc.label.as_str())
            .set("attributes", to_value(&doc.attributes)?)
            .set("attributes_in_vault", doc.attributes_in_vault)
            .set("revoked", false)
            .set("acl", to_value(&doc.acl)?);
        self.db().store().update(&doc, &update, true).await?;
        info!(credential = %doc.path, in_vault = doc.attributes_in_vault, "credential updated");

        let material = self.credential_material(&doc).await?;
        let holders = existing.map(|e| e.controllers).unwrap_or_default();
        for holder in holders {
            let Ok(path) = holder.parse::<EntityPath>() else {
                continue;
            };
            self.push_credential(&path, &material, &doc.path).await;
        }
        Ok(())
    }

    async fn push_credential(
        &self,
        controller: &EntityPath,
        material: &CredentialUpdate,
        cred: &CredentialPath,
    ) {
        let result = async {
            let (_, handle) = self.open_controller(controller).await?;
            handle.update_credential(material).await?;
            Ok::<(), Error>(())
        }
        .await;
        match result {
            Ok(()) => {}
            Err(err) => {
                warn!(
                    controller = %controller,
                    credential = %cred,
                    error = %err,
                    "credential push failed, queueing for retry"
                );
                if let Err(err) = self.db().queue_credential_update(controller, cred).await {
                    warn!(controller = %controller, error = %err, "failed to queue credential update");
                }
            }
        }
    }

    /// Fetch credential metadata the caller may see. Attribute material is
    /// returned only when stored inline; use
    /// [`Broker::fill_credential_attributes`] to resolve vault material.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent or hidden from the caller.
    pub async fn credential(
        &self,
        id: &Identity,
        path: &CredentialPath,
    ) -> Result<Credential, Error> {
        let cred = self.db().credential(path).await?;
        self.check_can_read_or_hide(
            id,
            &format!("credential {path}"),
            false,
            &cred.path.user,
            &cred.acl,
        )
        .await?;
        Ok(cred)
    }

    /// Materialize a credential's attributes from the vault when they are
    /// redirected there.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Vault`] when no vault is configured or the read
    /// fails.
    pub async fn fill_credential_attributes(&self, cred: &mut Credential) -> Result<(), Error> {
        if !cred.attributes_in_vault || !cred.attributes.is_empty() {
            return Ok(());
        }
        let vault = self.vault.as_ref().ok_or_else(|| Error::Vault {
            reason: "credential attributes are in the vault but no vault is configured".to_owned(),
        })?;
        cred.attributes = vault.read(&cred.vault_path()).await?.unwrap_or_default();
        Ok(())
    }

    /// Revoke a credential.
    ///
    /// The local record is marked first (revoked, material dropped from
    /// both catalog and vault), then each holding controller gets a
    /// best-effort remote revocation, queued for retry on failure.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] when the caller is not the credential's
    ///   user.
    /// - [`Error::NotFound`] when absent.
    /// - [`Error::BadRequest`] while models still use the credential.
    pub async fn revoke_credential(&self, id: &Identity, path: &CredentialPath) -> Result<(), Error> {
        self.auth().check_is_user(id, &path.user).await?;
        let cred = self.db().credential(path).await?;

        let in_use = self.db().models_using_credential(path).await?;
        if in_use > 0 {
            return Err(Error::bad_request(format!(
                "credential {path} is used by {in_use} model(s)"
            )));
        }

        let update = Update::new()
            .set("revoked", true)
            .set("attributes", serde_json::json!({}))
            .set("attributes_in_vault", false);
        self.db().store().update(&cred, &update, false).await?;
        if let Some(vault) = &self.vault {
            if let Err(err) = vault.delete(&cred.vault_path()).await {
                warn!(credential = %path, error = %err, "vault delete failed during revoke");
            }
        }
        info!(credential = %path, "credential revoked");

        for holder in &cred.controllers {
            let Ok(controller) = holder.parse::<EntityPath>() else {
                continue;
            };
            let result = async {
                let (_, handle) = self.open_controller(&controller).await?;
                handle.revoke_credential(&path.to_string()).await?;
                Ok::<(), Error>(())
            }
            .await;
            if let Err(err) = result {
                warn!(
                    controller = %controller,
                    credential = %path,
                    error = %err,
                    "remote revoke failed, queueing for retry"
                );
                if let Err(err) = self.db().queue_credential_update(&controller, path).await {
                    warn!(controller = %controller, error = %err, "failed to queue credential revoke");
                }
            }
        }
        Ok(())
    }

    /// Drain a controller's pending credential pushes over an open session.
    ///
    /// Invoked on each fresh monitor connection. Each entry is cleared only
    /// after its push (or revoke, for revoked credentials) succeeds, so a
    /// failure leaves the entry for the next reconnect — at-least-once.
    pub async fn controller_update_credentials(
        &self,
        controller: &Controller,
        api: &dyn ControllerApi,
    ) {
        for entry in &controller.update_credentials {
            let Ok(path) = entry.parse::<CredentialPath>() else {
                warn!(controller = %controller.path, entry = %entry, "dropping unparsable pending credential");
                let _ = self
                    .clear_entry(&controller.path, entry)
                    .await;
                continue;
            };
            let cred = match self.db().credential(&path).await {
                Ok(cred) => cred,
                Err(e) if e.is_not_found() => {
                    let _ = self.db().clear_credential_update(&controller.path, &path).await;
                    continue;
                }
                Err(e) => {
                    warn!(credential = %path, error = %e, "pending credential lookup failed");
                    continue;
                }
            };

            let result = if cred.revoked {
                api.revoke_credential(&path.to_string())
                    .await
                    .map_err(Error::from)
            } else {
                match self.credential_material(&cred).await {
                    Ok(material) => api.update_credential(&material).await.map_err(Error::from),
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(()) => {
                    if let Err(err) = self.db().clear_credential_update(&controller.path, &path).await
                    {
                        warn!(credential = %path, error = %err, "failed to clear pending credential");
                    }
                }
                Err(err) => {
                    warn!(
                        controller = %controller.path,
                        credential = %path,
                        error = %err,
                        "pending credential push failed, will retry on next connection"
                    );
                }
            }
        }
    }

    async fn clear_entry(&self, controller: &EntityPath, entry: &str) -> Result<(), Error> {
        let update = Update::new().pull("update_credentials", entry);
        self.db()
            .store()
            .update_key::<Controller>(&controller.to_string(), &update, false)
            .await
            .map_err(Error::from)
    }

    /// The wire payload for pushing a credential, with vault material
    /// resolved.
    pub(crate) async fn credential_material(
        &self,
        cred: &Credential,
    ) -> Result<CredentialUpdate, Error> {
        let mut resolved = cred.clone();
        self.fill_credential_attributes(&mut resolved).await?;
        Ok(CredentialUpdate {
            path: resolved.path.to_string(),
            auth_type: resolved.auth_type,
            attributes: resolved.attributes,
        })
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value).map_err(|e| {
        Error::Store(fleetmux_store::StoreError::BadDocument {
            collection: String::new(),
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use crate::testing::{FakeApi, FakeDialer, StaticIdentity};
    use crate::vault::{MemoryVault, SecretVault};
    use fleetmux_store::{MemoryStore, Store};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct Setup {
        broker: Arc<Broker>,
        api: Arc<FakeApi>,
        vault: Arc<MemoryVault>,
    }

    async fn setup() -> Setup {
        let api = FakeApi::new("ctl-uuid");
        let dialer = FakeDialer::new();
        dialer.register("bob/prod", Arc::clone(&api));
        let vault = Arc::new(MemoryVault::new());
        let broker = Broker::new(
            Store::new(Arc::new(MemoryStore::new())),
            Arc::new(dialer),
            Arc::new(StaticIdentity::new()),
            Some(Arc::clone(&vault) as Arc<dyn SecretVault>),
            BrokerConfig::default(),
        )
        .await
        .unwrap();
        // The controller the credential will be pushed to.
        let ctl = Controller {
            uuid: "ctl-uuid".into(),
            public: true,
            ..Controller::with_path("bob/prod".parse().unwrap())
        };
        broker.db().store().insert(&ctl).await.unwrap();
        Setup { broker, api, vault }
    }

    fn cred(attrs: &[(&str, &str)]) -> Credential {
        Credential {
            auth_type: "access-key".into(),
            attributes: attrs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            ..Credential::with_path("aws/bob/default".parse().unwrap())
        }
    }

    #[tokio::test]
    async fn update_redirects_material_to_vault() {
        let s = setup().await;
        let bob = Identity::new("bob").unwrap();
        s.broker
            .update_credential(&bob, &cred(&[("access-key", "abc")]))
            .await
            .unwrap();

        let stored = s
            .broker
            .db()
            .credential(&"aws/bob/default".parse().unwrap())
            .await
            .unwrap();
        assert!(stored.attributes_in_vault);
        assert!(stored.attributes.is_empty());
        assert_eq!(
            s.vault.read("creds/aws/bob/default").await.unwrap(),
            Some(BTreeMap::from([("access-key".to_owned(), "abc".to_owned())]))
        );
    }

    #[tokio::test]
    async fn credential_round_trip_through_vault() {
        let s = setup().await;
        let bob = Identity::new("bob").unwrap();
        let original = cred(&[("access-key", "abc"), ("secret-key", "xyz")]);
        s.broker.update_credential(&bob, &original).await.unwrap();

        let mut fetched = s
            .broker
            .credential(&bob, &"aws/bob/default".parse().unwrap())
            .await
            .unwrap();
        assert!(fetched.attributes.is_empty());
        s.broker.fill_credential_attributes(&mut fetched).await.unwrap();
        assert_eq!(fetched.attributes, original.attributes);
    }

    #[tokio::test]
    async fn only_owner_updates_or_reads() {
        let s = setup().await;
        let eve = Identity::new("eve").unwrap();
        assert!(matches!(
            s.broker.update_credential(&eve, &cred(&[])).await,
            Err(Error::Unauthorized)
        ));

        let bob = Identity::new("bob").unwrap();
        s.broker.update_credential(&bob, &cred(&[])).await.unwrap();
        let err = s
            .broker
            .credential(&eve, &"aws/bob/default".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn update_pushes_to_holding_controllers() {
        let s = setup().await;
        let bob = Identity::new("bob").unwrap();
        let path: CredentialPath = "aws/bob/default".parse().unwrap();
        s.broker
            .update_credential(&bob, &cred(&[("access-key", "v1")]))
            .await
            .unwrap();
        s.broker
            .db()
            .credential_add_controller(&path, &"bob/prod".parse().unwrap())
            .await
            .unwrap();

        s.broker
            .update_credential(&bob, &cred(&[("access-key", "v2")]))
            .await
            .unwrap();
        let pushed = s
            .api
            .with_state(|st| st.credentials.get("aws/bob/default").cloned())
            .unwrap();
        assert_eq!(pushed.attributes.get("access-key").map(String::as_str), Some("v2"));
        // The holder list survived the update.
        let stored = s.broker.db().credential(&path).await.unwrap();
        assert_eq!(stored.controllers, vec!["bob/prod"]);
    }

    #[tokio::test]
    async fn failed_push_queues_and_drain_clears() {
        let s = setup().await;
        let bob = Identity::new("bob").unwrap();
        let path: CredentialPath = "aws/bob/default".parse().unwrap();
        let ctl_path: EntityPath = "bob/prod".parse().unwrap();
        s.broker
            .update_credential(&bob, &cred(&[("access-key", "v1")]))
            .await
            .unwrap();
        s.broker
            .db()
            .credential_add_controller(&path, &ctl_path)
            .await
            .unwrap();

        s.api.fail("update_credential", crate::api::RemoteError::new("busy"));
        // Push failure is not surfaced.
        s.broker
            .update_credential(&bob, &cred(&[("access-key", "v2")]))
            .await
            .unwrap();
        let ctl = s.broker.db().controller(&ctl_path).await.unwrap();
        assert_eq!(ctl.update_credentials, vec!["aws/bob/default"]);

        // Drain on the next (fresh) connection succeeds and clears the entry.
        s.api.clear_failure("update_credential");
        s.broker
            .controller_update_credentials(&ctl, s.api.as_ref())
            .await;
        let ctl = s.broker.db().controller(&ctl_path).await.unwrap();
        assert!(ctl.update_credentials.is_empty());
        assert!(s.api.with_state(|st| st.credentials.contains_key("aws/bob/default")));
    }

    #[tokio::test]
    async fn drain_leaves_entry_on_failure() {
        let s = setup().await;
        let bob = Identity::new("bob").unwrap();
        let path: CredentialPath = "aws/bob/default".parse().unwrap();
        let ctl_path: EntityPath = "bob/prod".parse().unwrap();
        s.broker.update_credential(&bob, &cred(&[])).await.unwrap();
        s.broker.db().queue_credential_update(&ctl_path, &path).await.unwrap();

        s.api.fail("update_credential", crate::api::RemoteError::new("busy"));
        let ctl = s.broker.db().controller(&ctl_path).await.unwrap();
        s.broker
            .controller_update_credentials(&ctl, s.api.as_ref())
            .await;
        let ctl = s.broker.db().controller(&ctl_path).await.unwrap();
        assert_eq!(ctl.update_credentials, vec!["aws/bob/default"]);
    }

    #[tokio::test]
    async fn revoke_blocked_while_in_use() {
        let s = setup().await;
        let bob = Identity::new("bob").unwrap();
        let path: CredentialPath = "aws/bob/default".parse().unwrap();
        s.broker.update_credential(&bob, &cred(&[])).await.unwrap();

        let model = crate::entity::Model {
            uuid: "m".into(),
            controller: "bob/prod".parse().unwrap(),
            credential: path.clone(),
            ..crate::entity::Model::with_path("bob/m1".parse().unwrap())
        };
        s.broker.db().store().insert(&model).await.unwrap();

        let err = s.broker.revoke_credential(&bob, &path).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[tokio::test]
    async fn revoke_marks_local_and_pushes_revocation() {
        let s = setup().await;
        let bob = Identity::new("bob").unwrap();
        let path: CredentialPath = "aws/bob/default".parse().unwrap();
        s.broker
            .update_credential(&bob, &cred(&[("access-key", "abc")]))
            .await
            .unwrap();
        s.broker
            .db()
            .credential_add_controller(&path, &"bob/prod".parse().unwrap())
            .await
            .unwrap();

        s.broker.revoke_credential(&bob, &path).await.unwrap();
        let stored = s.broker.db().credential(&path).await.unwrap();
        assert!(stored.revoked);
        assert!(!stored.attributes_in_vault);
        assert_eq!(s.vault.read("creds/aws/bob/default").await.unwrap(), None);
        assert!(
            s.api
                .with_state(|st| st.revoked_credentials.contains(&"aws/bob/default".to_owned()))
        );
    }

    #[tokio::test]
    async fn drain_revokes_revoked_credentials() {
        let s = setup().await;
        let bob = Identity::new("bob").unwrap();
        let path: CredentialPath = "aws/bob/default".parse().unwrap();
        let ctl_path: EntityPath = "bob/prod".parse().unwrap();
        s.broker.update_credential(&bob, &cred(&[])).await.unwrap();
        s.broker
            .db()
            .credential_add_controller(&path, &ctl_path)
            .await
            .unwrap();

        // Revocation fails remotely and is queued.
        s.api.fail("revoke_credential", crate::api::RemoteError::new("busy"));
        s.broker.revoke_credential(&bob, &path).await.unwrap();
        let ctl = s.broker.db().controller(&ctl_path).await.unwrap();
        assert_eq!(ctl.update_credentials, vec!["aws/bob/default"]);

        s.api.clear_failure("revoke_credential");
        s.broker
            .controller_update_credentials(&ctl, s.api.as_ref())
            .await;
        assert!(
            s.api
                .with_state(|st| st.revoked_credentials.contains(&"aws/bob/default".to_owned()))
        );
        let ctl = s.broker.db().controller(&ctl_path).await.unwrap();
        assert!(ctl.update_credentials.is_empty());
    }

    #[tokio::test]
    async fn no_vault_stores_attributes_inline() {
        let api = FakeApi::new("ctl-uuid");
        let dialer = FakeDialer::new();
        dialer.register("bob/prod", api);
        let broker = Broker::new(
            Store::new(Arc::new(MemoryStore::new())),
            Arc::new(dialer),
            Arc::new(StaticIdentity::new()),
            None,
            BrokerConfig::default(),
        )
        .await
        .unwrap();

        let bob = Identity::new("bob").unwrap();
        broker
            .update_credential(&bob, &cred(&[("access-key", "abc")]))
            .await
            .unwrap();
        let stored = broker
            .db()
            .credential(&"aws/bob/default".parse().unwrap())
            .await
            .unwrap();
        assert!(!stored.attributes_in_vault);
        assert_eq!(stored.attributes.get("access-key").map(String::as_str), Some("abc"));
    }
}
