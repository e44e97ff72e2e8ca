//! Typed catalog operations.
//!
//! One method per query the broker and monitor perform, in the style of a
//! repository layer: each wraps the store's raw contract with entity types,
//! maps store categories onto caller-facing errors, and owns the conditional
//! predicates that make concurrent mutation safe.
//!
//! Monitor-driven setters are deliberately idempotent: a `NotFound` from a
//! conditional update means either the controller disappeared under us or a
//! sticky first-write already happened — both convert to success so the
//! monitor never churns on races it cannot win.

use chrono::{DateTime, Utc};
use fleetmux_store::{Document, Query, Sort, Store, StoreError, Update};
use serde_json::Value;

use crate::entity::{
    Application, ApplicationOffer, AuditContent, AuditEntry, CloudRegion, Controller,
    ControllerStats, Count, Credential, CredentialPath, EntityPath, Life, Machine, Model,
    ModelInfo, OfferUrl, COLLECTIONS, INDEXES,
};
use crate::error::Error;

/// How often a counts CAS retries before giving up as contended.
const COUNTS_CAS_ATTEMPTS: usize = 10;

/// The broker's catalog.
#[derive(Clone, Debug)]
pub struct Database {
    store: Store,
}

impl Database {
    /// Wrap a store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create collections and indexes. Idempotent; called once at startup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the backend fails.
    pub async fn initialize(&self) -> Result<(), Error> {
        self.store.ensure_collections(&COLLECTIONS, &INDEXES).await?;
        Ok(())
    }

    /// Raw store access for composed queries.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    // ── Typed getters ────────────────────────────────────────────────

    /// Fetch a controller by path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn controller(&self, path: &EntityPath) -> Result<Controller, Error> {
        let mut ctl = Controller::with_path(path.clone());
        self.store
            .get(&mut ctl)
            .await
            .map_err(not_found_as(format!("controller {path}")))?;
        Ok(ctl)
    }

    /// Fetch a cloud-region row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn cloud_region(&self, cloud: &str, region: &str) -> Result<CloudRegion, Error> {
        let mut row = CloudRegion {
            cloud: cloud.to_owned(),
            region: region.to_owned(),
            ..CloudRegion::default()
        };
        self.store
            .get(&mut row)
            .await
            .map_err(not_found_as(format!("cloud {cloud}")))?;
        Ok(row)
    }

    /// Fetch a credential by path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn credential(&self, path: &CredentialPath) -> Result<Credential, Error> {
        let mut cred = Credential::with_path(path.clone());
        self.store
            .get(&mut cred)
            .await
            .map_err(not_found_as(format!("credential {path}")))?;
        Ok(cred)
    }

    /// Fetch a model by path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn model(&self, path: &EntityPath) -> Result<Model, Error> {
        let mut model = Model::with_path(path.clone());
        self.store
            .get(&mut model)
            .await
            .map_err(not_found_as(format!("model {path}")))?;
        Ok(model)
    }

    /// Fetch a model by its controller-assigned UUID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn model_from_uuid(&self, uuid: &str) -> Result<Model, Error> {
        self.store
            .find_one(&Query::eq("uuid", uuid), &Sort::none())
            .await
            .map_err(not_found_as(format!("model uuid {uuid}")))
    }

    /// Fetch an offer by UUID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn offer(&self, uuid: &str) -> Result<ApplicationOffer, Error> {
        self.store
            .find_one(&Query::eq("uuid", uuid), &Sort::none())
            .await
            .map_err(not_found_as(format!("application offer {uuid}")))
    }

    /// Fetch an offer by URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when absent.
    pub async fn offer_by_url(&self, url: &OfferUrl) -> Result<ApplicationOffer, Error> {
        self.store
            .find_one(&Query::eq("url", url.to_string()), &Sort::none())
            .await
            .map_err(not_found_as(format!("application offer {url}")))
    }

    // ── Monitor lease ────────────────────────────────────────────────

    /// Atomically move a controller's monitor lease from
    /// `(old_owner, old_expiry)` to `(new_owner, new_expiry)`.
    ///
    /// An absent lease is represented as `None` on both sides. Passing
    /// `new_owner = None` releases the lease. Returns the new expiry
    /// (`None` after a release).
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when the controller has been removed.
    /// - [`Error::LeaseUnavailable`] when the stored lease does not match
    ///   `(old_owner, old_expiry)` — someone else holds it.
    pub async fn acquire_monitor_lease(
        &self,
        path: &EntityPath,
        old_expiry: Option<DateTime<Utc>>,
        old_owner: Option<&str>,
        new_expiry: DateTime<Utc>,
        new_owner: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let query = Query::and(vec![
            Query::eq("path.user", path.user.as_str()),
            Query::eq("path.name", path.name.as_str()),
            Query::Eq("monitor_lease_owner".into(), owner_value(old_owner)),
            Query::Eq("monitor_lease_expiry".into(), time_value(old_expiry)),
        ]);
        let update = match new_owner {
            Some(owner) => Update::new()
                .set("monitor_lease_owner", owner)
                .set("monitor_lease_expiry", new_expiry.timestamp_millis()),
            None => Update::new()
                .unset("monitor_lease_owner")
                .unset("monitor_lease_expiry"),
        };

        match self
            .store
            .update_query::<Controller>(&query, &Sort::none(), &update)
            .await
        {
            Ok(()) => Ok(new_owner.map(|_| new_expiry)),
            Err(StoreError::NotFound { .. }) => {
                // Disambiguate: removed controller vs. foreign lease.
                let current = self.controller(path).await.map_err(|e| {
                    if e.is_not_found() {
                        Error::not_found(format!("controller {path} removed"))
                    } else {
                        e
                    }
                })?;
                Err(Error::LeaseUnavailable {
                    owner: current.monitor_lease_owner.unwrap_or_default(),
                    expiry: current
                        .monitor_lease_expiry
                        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Monitor-driven controller updates (idempotent) ───────────────

    /// Record fresh aggregate stats for a controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure; a vanished controller is
    /// success.
    pub async fn set_controller_stats(
        &self,
        path: &EntityPath,
        stats: &ControllerStats,
    ) -> Result<(), Error> {
        let update = Update::new().set("stats", to_value(stats)?);
        ignore_not_found(
            self.store
                .update_key::<Controller>(&path.to_string(), &update, false)
                .await,
        )
    }

    /// Record the server version reported by a controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure; a vanished controller is
    /// success.
    pub async fn set_controller_version(&self, path: &EntityPath, version: &str) -> Result<(), Error> {
        let update = Update::new().set("version", version);
        ignore_not_found(
            self.store
                .update_key::<Controller>(&path.to_string(), &update, false)
                .await,
        )
    }

    /// Record the first observed unavailability time. Sticky: once set, the
    /// timestamp survives until [`Database::set_controller_available`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure; an already-set timestamp
    /// or vanished controller is success.
    pub async fn set_controller_unavailable_at(
        &self,
        path: &EntityPath,
        when: DateTime<Utc>,
    ) -> Result<(), Error> {
        let query = Query::and(vec![
            Query::eq("path.user", path.user.as_str()),
            Query::eq("path.name", path.name.as_str()),
            Query::exists("unavailable_since", false),
        ]);
        let update = Update::new().set("unavailable_since", when.timestamp_millis());
        ignore_not_found(
            self.store
                .update_query::<Controller>(&query, &Sort::none(), &update)
                .await,
        )
    }

    /// Clear the unavailability marker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure; a vanished controller is
    /// success.
    pub async fn set_controller_available(&self, path: &EntityPath) -> Result<(), Error> {
        let update = Update::new().unset("unavailable_since");
        ignore_not_found(
            self.store
                .update_key::<Controller>(&path.to_string(), &update, false)
                .await,
        )
    }

    // ── Model updates ────────────────────────────────────────────────

    /// Record a model's info snapshot. A dead model is removed from the
    /// catalog instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure; an unknown model is
    /// success (it belongs to a controller the broker does not federate).
    pub async fn set_model_info(
        &self,
        controller: &EntityPath,
        uuid: &str,
        info: &ModelInfo,
    ) -> Result<(), Error> {
        if info.life.is_dead() {
            return self.remove_model_by_uuid(controller, uuid).await;
        }
        let update = Update::new().set("info", to_value(info)?);
        ignore_not_found(
            self.store
                .update_query::<Model>(&model_query(controller, uuid), &Sort::none(), &update)
                .await,
        )
    }

    /// Record a model's life phase; dead models are removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure; an unknown model is
    /// success.
    pub async fn set_model_life(
        &self,
        controller: &EntityPath,
        uuid: &str,
        life: Life,
    ) -> Result<(), Error> {
        if life.is_dead() {
            return self.remove_model_by_uuid(controller, uuid).await;
        }
        let update = Update::new().set("info.life", to_value(&life)?);
        ignore_not_found(
            self.store
                .update_query::<Model>(&model_query(controller, uuid), &Sort::none(), &update)
                .await,
        )
    }

    async fn remove_model_by_uuid(&self, controller: &EntityPath, uuid: &str) -> Result<(), Error> {
        self.store
            .remove_all::<Model>(&model_query(controller, uuid))
            .await?;
        // A dead model takes its denormalized machine and application
        // snapshots with it.
        let entities = Query::and(vec![
            Query::eq("controller.user", controller.user.as_str()),
            Query::eq("controller.name", controller.name.as_str()),
            Query::eq("info.model_uuid", uuid),
        ]);
        self.store.remove_all::<Machine>(&entities).await?;
        self.store.remove_all::<Application>(&entities).await?;
        Ok(())
    }

    /// Fold fresh per-kind count observations into a model's statistics.
    ///
    /// Runs under the model document's CAS: the fold is computed from a
    /// snapshot and written back only if the stored counts are unchanged,
    /// retrying on interleaving.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when no model with that UUID exists on the
    ///   controller.
    /// - [`Error::Store`] with a transient category when the CAS stays
    ///   contended.
    pub async fn update_model_counts(
        &self,
        controller: &EntityPath,
        uuid: &str,
        now: DateTime<Utc>,
        values: &[(&str, u64)],
    ) -> Result<(), Error> {
        for _ in 0..COUNTS_CAS_ATTEMPTS {
            let model: Model = self
                .store
                .find_one(&model_query(controller, uuid), &Sort::none())
                .await
                .map_err(not_found_as(format!("model uuid {uuid}")))?;

            let mut counts = model.counts.clone();
            for (kind, value) in values {
                counts
                    .entry((*kind).to_owned())
                    .and_modify(|count| count.observe(now, *value))
                    .or_insert_with(|| Count::first(now, *value));
            }

            let query = Query::and(vec![
                model_query(controller, uuid),
                Query::Eq("counts".into(), to_value(&model.counts)?),
            ]);
            let update = Update::new().set("counts", to_value(&counts)?);
            match self
                .store
                .update_query::<Model>(&query, &Sort::none(), &update)
                .await
            {
                Ok(()) => return Ok(()),
                // Either the counts moved under us or the model vanished;
                // the re-read at the top of the loop settles which.
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Store(StoreError::Transient {
            reason: format!("count update for model {uuid} stayed contended"),
        }))
    }

    // ── Machine / application snapshots ──────────────────────────────

    /// Upsert a machine snapshot, or remove it when its life is dead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn update_machine_info(&self, machine: &Machine) -> Result<(), Error> {
        if machine.info.life.is_dead() {
            return ignore_not_found(self.store.remove(machine).await);
        }
        let update = Update::new()
            .set("controller", to_value(&machine.controller)?)
            .set("cloud", machine.cloud.as_str())
            .set("region", machine.region.as_str())
            .set("info", to_value(&machine.info)?);
        self.store.update(machine, &update, true).await?;
        Ok(())
    }

    /// Upsert an application snapshot, or remove it when its life is dead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn update_application_info(&self, application: &Application) -> Result<(), Error> {
        if application.info.life.is_dead() {
            return ignore_not_found(self.store.remove(application).await);
        }
        let update = Update::new()
            .set("controller", to_value(&application.controller)?)
            .set("cloud", application.cloud.as_str())
            .set("region", application.region.as_str())
            .set("info", to_value(&application.info)?);
        self.store.update(application, &update, true).await?;
        Ok(())
    }

    // ── Credential back-references ───────────────────────────────────

    /// Record that a controller holds a copy of a credential.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the credential is absent.
    pub async fn credential_add_controller(
        &self,
        cred: &CredentialPath,
        controller: &EntityPath,
    ) -> Result<(), Error> {
        let update = Update::new().add_to_set("controllers", controller.to_string());
        self.store
            .update_key::<Credential>(&cred.to_string(), &update, false)
            .await
            .map_err(not_found_as(format!("credential {cred}")))
    }

    /// Queue a credential for push to a controller on its next fresh
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure; a vanished controller is
    /// success.
    pub async fn queue_credential_update(
        &self,
        controller: &EntityPath,
        cred: &CredentialPath,
    ) -> Result<(), Error> {
        let update = Update::new().add_to_set("update_credentials", cred.to_string());
        ignore_not_found(
            self.store
                .update_key::<Controller>(&controller.to_string(), &update, false)
                .await,
        )
    }

    /// Clear a pending credential push after it succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure; a vanished controller is
    /// success.
    pub async fn clear_credential_update(
        &self,
        controller: &EntityPath,
        cred: &CredentialPath,
    ) -> Result<(), Error> {
        let update = Update::new().pull("update_credentials", cred.to_string());
        ignore_not_found(
            self.store
                .update_key::<Controller>(&controller.to_string(), &update, false)
                .await,
        )
    }

    /// How many models currently reference a credential.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn models_using_credential(&self, cred: &CredentialPath) -> Result<u64, Error> {
        let count = self
            .store
            .count::<Model>(&Query::Eq("credential".into(), to_value(cred)?))
            .await?;
        Ok(count)
    }

    // ── Controller removal cascade ───────────────────────────────────

    /// Remove a controller and every reference to it, in fixed order:
    /// credentials drop their back-reference, cloud-region rows drop it from
    /// their controller sets, then its models, machines, applications,
    /// offers, and finally the controller document itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the controller is absent.
    pub async fn remove_controller(&self, path: &EntityPath) -> Result<(), Error> {
        let path_str = path.to_string();
        let path_value = to_value(path)?;

        let mut credential_keys = Vec::new();
        self.store
            .for_each::<Credential, Error, _>(
                &Query::eq("controllers", path_str.as_str()),
                &Sort::none(),
                |cred| {
                    credential_keys.push(cred.key());
                    Ok(())
                },
            )
            .await?;
        for key in credential_keys {
            let update = Update::new().pull("controllers", path_str.as_str());
            ignore_not_found(
                self.store
                    .update_key::<Credential>(&key, &update, false)
                    .await,
            )?;
        }

        let region_query = Query::or(vec![
            Query::eq("primary_controllers", path_str.as_str()),
            Query::eq("secondary_controllers", path_str.as_str()),
        ]);
        let mut region_keys = Vec::new();
        self.store
            .for_each::<CloudRegion, Error, _>(&region_query, &Sort::none(), |row| {
                region_keys.push(row.key());
                Ok(())
            })
            .await?;
        for key in region_keys {
            let update = Update::new()
                .pull("primary_controllers", path_str.as_str())
                .pull("secondary_controllers", path_str.as_str());
            ignore_not_found(
                self.store
                    .update_key::<CloudRegion>(&key, &update, false)
                    .await,
            )?;
        }

        let by_controller = Query::Eq("controller".into(), path_value);
        self.store.remove_all::<Model>(&by_controller).await?;
        self.store.remove_all::<Machine>(&by_controller).await?;
        self.store.remove_all::<Application>(&by_controller).await?;
        self.store
            .remove_all::<ApplicationOffer>(&by_controller)
            .await?;

        self.store
            .remove_key::<Controller>(&path_str)
            .await
            .map_err(not_found_as(format!("controller {path}")))
    }

    // ── Audit ────────────────────────────────────────────────────────

    /// Append an audit entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn append_audit(&self, content: AuditContent) -> Result<(), Error> {
        let entry = AuditEntry::new(Utc::now(), content);
        self.store.insert(&entry).await?;
        Ok(())
    }

    /// All audit entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn audit_log(&self) -> Result<Vec<AuditEntry>, Error> {
        let mut entries = Vec::new();
        self.store
            .for_each::<AuditEntry, Error, _>(&Query::All, &Sort::by("created"), |entry| {
                entries.push(entry);
                Ok(())
            })
            .await?;
        Ok(entries)
    }
}

fn model_query(controller: &EntityPath, uuid: &str) -> Query {
    Query::and(vec![
        Query::eq("controller.user", controller.user.as_str()),
        Query::eq("controller.name", controller.name.as_str()),
        Query::eq("uuid", uuid),
    ])
}

fn owner_value(owner: Option<&str>) -> Value {
    match owner {
        Some(o) if !o.is_empty() => Value::from(o),
        _ => Value::Null,
    }
}

fn time_value(time: Option<DateTime<Utc>>) -> Value {
    match time {
        Some(t) => Value::from(t.timestamp_millis()),
        None => Value::Null,
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|e| {
        Error::Store(StoreError::BadDocument {
            collection: String::new(),
            reason: e.to_string(),
        })
    })
}

fn not_found_as(what: String) -> impl FnOnce(StoreError) -> Error {
    move |e| match e {
        StoreError::NotFound { .. } => Error::NotFound { what },
        other => Error::Store(other),
    }
}

fn ignore_not_found(result: Result<(), StoreError>) -> Result<(), Error> {
    match result {
        Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
