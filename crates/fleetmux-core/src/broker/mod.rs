//! The federation engine.
//!
//! [`Broker`] is the single per-process pool object: it owns the catalog,
//! the controller connection cache, the access checker, and the optional
//! secret vault, and exposes every externally-facing operation. Its
//! lifecycle is `new → N concurrent calls → close`.
//!
//! Every mutation follows the same preflight: resolve the entity from the
//! catalog, check the caller's access, connect to the owning controller,
//! execute remotely, then reconcile the local record. The per-operation
//! ordering rules (remote-first creates and destroys, remote-first grants,
//! local-first revokes, local-first credential writes) live in the domain
//! submodules.
//!
//! The broker holds no long-lived locks. Atomicity comes from
//! single-document compare-and-update in the catalog and from the
//! connection cache's per-UUID single-flight; operations on distinct
//! entities are unordered.

mod clouds;
mod controllers;
mod credentials;
mod models;
mod offers;

pub use controllers::AddControllerParams;
pub use models::CreateModelRequest;
pub use offers::{EndpointFilter, OfferFilter, OfferParams};

use std::sync::Arc;

use fleetmux_store::Store;

use crate::api::ApiDialer;
use crate::auth::{Authenticator, Identity, IdentityProvider};
use crate::config::BrokerConfig;
use crate::conns::{ApiCache, ApiHandle};
use crate::db::Database;
use crate::entity::{Acl, Controller, EntityPath};
use crate::error::Error;
use crate::vault::SecretVault;

/// The broker's shared state and operation surface.
pub struct Broker {
    db: Database,
    conns: Arc<ApiCache>,
    auth: Authenticator,
    vault: Option<Arc<dyn SecretVault>>,
    config: BrokerConfig,
}

impl Broker {
    /// Assemble a broker and prepare its catalog collections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when collection setup fails.
    pub async fn new(
        store: Store,
        dialer: Arc<dyn ApiDialer>,
        identity: Arc<dyn IdentityProvider>,
        vault: Option<Arc<dyn SecretVault>>,
        config: BrokerConfig,
    ) -> Result<Arc<Self>, Error> {
        let db = Database::new(store);
        db.initialize().await?;
        let auth = Authenticator::new(identity, &config.controller_admin, config.group_cache_ttl());
        let conns = ApiCache::new(dialer, config.dial_timeout());
        Ok(Arc::new(Self {
            db,
            conns,
            auth,
            vault,
            config,
        }))
    }

    /// The catalog.
    #[must_use]
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// The access checker.
    #[must_use]
    pub fn auth(&self) -> &Authenticator {
        &self.auth
    }

    /// The connection cache.
    #[must_use]
    pub fn conns(&self) -> &Arc<ApiCache> {
        &self.conns
    }

    /// The configuration the broker was built with.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Drain all controller sessions. Called once at shutdown.
    pub async fn close(&self) {
        self.conns.close().await;
    }

    /// Resolve a controller and open a session to it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when the controller is not in the catalog.
    /// - [`Error::ApiConnection`] when dialing fails.
    pub(crate) async fn open_controller(
        &self,
        path: &EntityPath,
    ) -> Result<(Controller, ApiHandle), Error> {
        let controller = self.db.controller(path).await?;
        let handle = self.conns.open_from_doc(&controller).await?;
        Ok((controller, handle))
    }

    /// Probe-proof read guard: the caller may read when the entity is
    /// public, they are the owner, or they appear in the read ACL. Failure
    /// is reported as [`Error::NotFound`] so hidden entities cannot be
    /// probed.
    pub(crate) async fn check_can_read_or_hide(
        &self,
        id: &Identity,
        what: &str,
        public: bool,
        owner: &str,
        acl: &Acl,
    ) -> Result<(), Error> {
        if public {
            return Ok(());
        }
        match self.auth.check_can_read(id, owner, &acl.read).await {
            Ok(()) => Ok(()),
            Err(Error::Unauthorized) => Err(Error::not_found(what)),
            Err(e) => Err(e),
        }
    }

    /// Write/admin guard for ACL entities: the owner and the ACL's admin
    /// list qualify; the distinguished controller admin always qualifies.
    pub(crate) async fn check_admin(
        &self,
        id: &Identity,
        owner: &str,
        acl: &Acl,
    ) -> Result<(), Error> {
        let mut allowed = Vec::with_capacity(acl.admin.len() + 1);
        allowed.push(owner.to_owned());
        allowed.extend_from_slice(&acl.admin);
        if self.auth.check_acl(id, &allowed).await.is_ok() {
            return Ok(());
        }
        self.auth.check_controller_admin(id).await
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}
