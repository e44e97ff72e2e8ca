//! The background monitor.
//!
//! The broker runs as N replicas; each replica runs one [`Monitor`]. On
//! every pass the monitor scans all controllers and, for each one whose
//! lease it holds (or can take), refreshes the catalog: availability,
//! version, aggregate stats, model info and counts, machine and application
//! snapshots, and the controller's pending credential pushes.
//!
//! Mutual exclusion is the lease tuple on the controller document, moved
//! only through the catalog's conditional update. A replica never takes
//! over a foreign lease before its expiry passes — a crashed holder is
//! replaced only once its lease lapses. Holding replicas renew on every
//! pass, so the pass interval plus slack must stay below the lease
//! duration.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleetmux_store::{Query, Sort};
use lru::LruCache;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::api::ModelSummary;
use crate::broker::Broker;
use crate::entity::{
    Application, Controller, ControllerStats, EntityPath, Machine, ModelInfo, ModelStatus,
    COUNT_APPLICATIONS, COUNT_MACHINES, COUNT_UNITS,
};
use crate::error::Error;

/// Capacity of the (controller, model-uuid) → (cloud, region) cache used to
/// denormalize machine and application snapshots.
const LOCATION_CACHE_SIZE: usize = 1024;

/// One replica's monitor.
pub struct Monitor {
    broker: Arc<Broker>,
    owner: String,
    lease_duration: ChronoDuration,
    interval: std::time::Duration,
    /// Leases this replica currently holds, by controller path, with their
    /// latest expiry. Used to release cleanly at shutdown.
    held: Mutex<HashMap<String, (EntityPath, DateTime<Utc>)>>,
    locations: Mutex<LruCache<(String, String), (String, String)>>,
}

impl Monitor {
    /// A monitor for this replica, identified by `owner` in lease tuples.
    ///
    /// # Panics
    ///
    /// Never panics: the cache capacity is a non-zero constant.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn new(broker: Arc<Broker>, owner: &str) -> Self {
        let config = broker.config();
        let lease_duration = ChronoDuration::from_std(config.monitor_lease_duration())
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        let interval = config.monitor_interval();
        Self {
            broker,
            owner: owner.to_owned(),
            lease_duration,
            interval,
            held: Mutex::new(HashMap::new()),
            locations: Mutex::new(LruCache::new(NonZeroUsize::new(LOCATION_CACHE_SIZE).unwrap())),
        }
    }

    /// Run passes until `shutdown` flips, then release every held lease.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(owner = %self.owner, "monitor started");
        loop {
            self.tick(Utc::now()).await;
            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }
        self.release_all().await;
        info!(owner = %self.owner, "monitor stopped");
    }

    /// One monitoring pass over all controllers.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let mut controllers = Vec::new();
        let scan = self
            .broker
            .db()
            .store()
            .for_each::<Controller, Error, _>(&Query::All, &Sort::none(), |ctl| {
                controllers.push(ctl);
                Ok(())
            })
            .await;
        if let Err(err) = scan {
            warn!(error = %err, "controller scan failed");
            return;
        }
        for controller in controllers {
            self.update_controller(&controller, now).await;
        }
    }

    async fn update_controller(&self, controller: &Controller, now: DateTime<Utc>) {
        if self.ensure_lease(controller, now).await.is_none() {
            return;
        }

        let handle = match self.broker.conns().open_from_doc(controller).await {
            Ok(handle) => handle,
            Err(Error::ApiConnection { reason, .. }) => {
                debug!(controller = %controller.path, reason = %reason, "controller unreachable");
                if let Err(err) = self
                    .broker
                    .db()
                    .set_controller_unavailable_at(&controller.path, now)
                    .await
                {
                    warn!(controller = %controller.path, error = %err, "recording unavailability failed");
                }
                return;
            }
            Err(err) => {
                warn!(controller = %controller.path, error = %err, "controller open failed");
                return;
            }
        };
        if let Err(err) = self
            .broker
            .db()
            .set_controller_available(&controller.path)
            .await
        {
            warn!(controller = %controller.path, error = %err, "recording availability failed");
        }

        // A fresh connection drains the controller's pending credential
        // pushes before anything else relies on them.
        if handle.was_dialed() {
            self.broker
                .controller_update_credentials(controller, &**handle.api())
                .await;
        }

        match handle.server_version().await {
            Ok(version) => {
                if let Err(err) = self
                    .broker
                    .db()
                    .set_controller_version(&controller.path, &version)
                    .await
                {
                    warn!(controller = %controller.path, error = %err, "recording version failed");
                }
            }
            Err(err) => warn!(controller = %controller.path, error = %err, "version query failed"),
        }

        let summaries = match handle.model_summaries().await {
            Ok(summaries) => summaries,
            Err(err) => {
                warn!(controller = %controller.path, error = %err, "model summary query failed");
                return;
            }
        };

        let mut stats = ControllerStats {
            model_count: summaries.len() as u64,
            ..ControllerStats::default()
        };
        for summary in summaries {
            stats.machine_count += summary.machine_count;
            stats.application_count += summary.application_count;
            stats.unit_count += summary.unit_count;
            self.ingest_summary(&controller.path, summary, now).await;
        }
        if let Err(err) = self
            .broker
            .db()
            .set_controller_stats(&controller.path, &stats)
            .await
        {
            warn!(controller = %controller.path, error = %err, "recording stats failed");
        }
    }

    /// Acquire or renew the lease for a controller. Returns the held expiry,
    /// or `None` when another replica holds an unexpired lease (or the
    /// controller vanished).
    async fn ensure_lease(
        &self,
        controller: &Controller,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if let (Some(owner), Some(expiry)) = (
            controller.monitor_lease_owner.as_deref(),
            controller.monitor_lease_expiry,
        ) {
            if owner != self.owner && expiry > now {
                debug!(controller = %controller.path, owner = %owner, "foreign lease active");
                return None;
            }
        }

        let new_expiry = now + self.lease_duration;
        let result = self
            .broker
            .db()
            .acquire_monitor_lease(
                &controller.path,
                controller.monitor_lease_expiry,
                controller.monitor_lease_owner.as_deref(),
                new_expiry,
                Some(&self.owner),
            )
            .await;
        match result {
            Ok(expiry) => {
                let mut held = self.held.lock().await;
                if let Some(expiry) = expiry {
                    held.insert(
                        controller.path.to_string(),
                        (controller.path.clone(), expiry),
                    );
                }
                expiry
            }
            Err(Error::LeaseUnavailable { owner, .. }) => {
                debug!(controller = %controller.path, owner = %owner, "lost lease race");
                None
            }
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                warn!(controller = %controller.path, error = %err, "lease acquisition failed");
                None
            }
        }
    }

    async fn ingest_summary(
        &self,
        controller: &EntityPath,
        summary: ModelSummary,
        now: DateTime<Utc>,
    ) {
        let info = ModelInfo {
            life: summary.life,
            status: ModelStatus {
                status: summary.status.clone(),
                message: summary.status_message.clone(),
                since: Some(now),
            },
        };
        // Dead models are purged here, snapshots included.
        if let Err(err) = self
            .broker
            .db()
            .set_model_info(controller, &summary.uuid, &info)
            .await
        {
            warn!(model = %summary.uuid, error = %err, "recording model info failed");
        }
        if summary.life.is_dead() {
            return;
        }

        let counts = [
            (COUNT_APPLICATIONS, summary.application_count),
            (COUNT_MACHINES, summary.machine_count),
            (COUNT_UNITS, summary.unit_count),
        ];
        match self
            .broker
            .db()
            .update_model_counts(controller, &summary.uuid, now, &counts)
            .await
        {
            Ok(()) => {}
            // Models the broker does not federate are not an error.
            Err(err) if err.is_not_found() => {
                debug!(model = %summary.uuid, "skipping counts for unfederated model");
            }
            Err(err) => warn!(model = %summary.uuid, error = %err, "recording counts failed"),
        }

        // Machines and applications of unfederated models are silently
        // ignored — there is no model row to denormalize from.
        let Some((cloud, region)) = self.model_location(controller, &summary.uuid).await else {
            return;
        };
        for info in summary.machines {
            let machine = Machine {
                controller: controller.clone(),
                cloud: cloud.clone(),
                region: region.clone(),
                info,
            };
            if let Err(err) = self.broker.db().update_machine_info(&machine).await {
                warn!(model = %summary.uuid, error = %err, "recording machine failed");
            }
        }
        for info in summary.applications {
            let application = Application {
                controller: controller.clone(),
                cloud: cloud.clone(),
                region: region.clone(),
                info,
            };
            if let Err(err) = self.broker.db().update_application_info(&application).await {
                warn!(model = %summary.uuid, error = %err, "recording application failed");
            }
        }
    }

    /// The cloud/region a model lives in, via a small LRU over catalog
    /// lookups. `None` when the model is not in the catalog.
    async fn model_location(&self, controller: &EntityPath, uuid: &str) -> Option<(String, String)> {
        let key = (controller.to_string(), uuid.to_owned());
        {
            let mut cache = self.locations.lock().await;
            if let Some(location) = cache.get(&key) {
                return Some(location.clone());
            }
        }
        let model = self.broker.db().model_from_uuid(uuid).await.ok()?;
        if model.controller != *controller {
            return None;
        }
        let location = (model.cloud.clone(), model.cloud_region.clone());
        self.locations.lock().await.put(key, location.clone());
        Some(location)
    }

    /// Release every lease this replica holds.
    pub async fn release_all(&self) {
        let held: Vec<(EntityPath, DateTime<Utc>)> = {
            let mut guard = self.held.lock().await;
            guard.drain().map(|(_, v)| v).collect()
        };
        for (path, expiry) in held {
            let result = self
                .broker
                .db()
                .acquire_monitor_lease(&path, Some(expiry), Some(&self.owner), Utc::now(), None)
                .await;
            match result {
                Ok(_) => debug!(controller = %path, "lease released"),
                Err(err) => {
                    warn!(controller = %path, error = %err, "lease release failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
