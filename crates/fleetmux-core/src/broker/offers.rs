//! Application-offer management.
//!
//! Offers are the one entity whose access is a permission map rather than an
//! ACL. Every operation converts the caller's effective level the same way:
//! no access reads as not-found (so hidden offers cannot be probed),
//! read/consume access fails admin-gated operations as unauthorized, admin
//! proceeds.
//!
//! Ordering: create and destroy run on the controller first (the controller
//! assigns the offer UUID); grants run remote-first; revokes run local-first
//! so the broker never advertises a permission the controller has already
//! dropped.

use std::collections::BTreeMap;

use fleetmux_store::{Query, Sort, Update};
use tracing::{info, warn};

use crate::api::{AddOfferParams, ConsumeOfferDetails, ControllerInfo, OfferDetails, OfferUserDetails};
use crate::auth::Identity;
use crate::entity::{
    ApplicationOffer, EntityPath, EVERYONE, OfferUrl, Permission, valid_name, AuditContent,
};
use crate::error::Error;

use super::Broker;

/// What a caller supplies to export an offer.
#[derive(Debug, Clone, Default)]
pub struct OfferParams {
    pub offer_name: String,
    pub application_name: String,
    pub application_description: String,
    /// Relation endpoint name → alias.
    pub endpoints: BTreeMap<String, String>,
}

/// One endpoint constraint within an [`OfferFilter`].
#[derive(Debug, Clone, Default)]
pub struct EndpointFilter {
    pub name: Option<String>,
    pub interface: Option<String>,
    pub role: Option<String>,
}

/// One clause of an offer query. Clauses are OR-ed together; the fields
/// within a clause are AND-ed.
#[derive(Debug, Clone, Default)]
pub struct OfferFilter {
    pub owner_name: Option<String>,
    pub model_name: Option<String>,
    pub application_name: Option<String>,
    /// Regular expression matched against the offer name.
    pub offer_name: Option<String>,
    /// Regular expression matched against the application description.
    pub description: Option<String>,
    pub endpoints: Vec<EndpointFilter>,
    /// Users that must hold at least consume access. An unparsable name
    /// poisons this clause (it can never match) without failing the query.
    pub allowed_consumers: Vec<String>,
}

impl OfferFilter {
    fn clause(&self) -> Query {
        let mut parts = Vec::new();
        if let Some(owner) = &self.owner_name {
            parts.push(Query::eq("owner", owner.as_str()));
        }
        if let Some(model) = &self.model_name {
            parts.push(Query::eq("model_name", model.as_str()));
        }
        if let Some(application) = &self.application_name {
            parts.push(Query::eq("application_name", application.as_str()));
        }
        if let Some(pattern) = &self.offer_name {
            parts.push(Query::contains("offer_name", pattern.as_str()));
        }
        if let Some(pattern) = &self.description {
            parts.push(Query::contains("application_description", pattern.as_str()));
        }
        for endpoint in &self.endpoints {
            let mut sub = Vec::new();
            if let Some(name) = &endpoint.name {
                sub.push(Query::eq("name", name.as_str()));
            }
            if let Some(interface) = &endpoint.interface {
                sub.push(Query::eq("interface", interface.as_str()));
            }
            if let Some(role) = &endpoint.role {
                sub.push(Query::eq("role", role.as_str()));
            }
            if !sub.is_empty() {
                parts.push(Query::ElemMatch("endpoints".into(), sub));
            }
        }
        for consumer in &self.allowed_consumers {
            match Identity::new(consumer) {
                Ok(user) => parts.push(Query::gte(
                    format!("users.{}", user.id()),
                    Permission::Consume,
                )),
                // Not a federated user name: this clause can never match.
                Err(_) => parts.push(Query::Nothing),
            }
        }
        Query::and(parts)
    }
}

impl Broker {
    /// Export an application offer from a model.
    ///
    /// The controller creates the offer (and assigns its UUID) first; the
    /// local insert tolerates both a remote "already exists" and a local
    /// collision, so replays and concurrent creates converge on one row.
    /// After the local insert the creator is granted admin on the remote
    /// offer so the two views stay aligned.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when the model is absent or hidden.
    /// - [`Error::Unauthorized`] when the caller is not a model admin.
    /// - [`Error::Api`] when the controller rejects the offer.
    pub async fn offer(
        &self,
        id: &Identity,
        model_path: &EntityPath,
        params: OfferParams,
    ) -> Result<OfferUrl, Error> {
        let model = self.model(id, model_path).await?;
        self.check_admin(id, &model.path.user, &model.acl).await?;
        let url = OfferUrl::new(&model.path.user, &model.path.name, &params.offer_name)?;

        let (_, handle) = self.open_controller(&model.controller).await?;
        let add = AddOfferParams {
            model_uuid: model.uuid.clone(),
            offer_name: params.offer_name.clone(),
            application_name: params.application_name.clone(),
            application_description: params.application_description.clone(),
            endpoints: params.endpoints.clone(),
            owner: model.path.user.clone(),
        };
        match handle.offer(add).await {
            Ok(()) => {}
            // Tolerated: fetch the canonical details below either way.
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }

        let details = handle.get_application_offer(&url.to_string()).await?;
        let mut users = permission_map(&details.users);
        users.insert(model.path.user.clone(), Permission::Admin);
        let doc = ApplicationOffer {
            uuid: details.offer_uuid.clone(),
            url: url.clone(),
            controller: model.controller.clone(),
            model_uuid: model.uuid.clone(),
            model_name: model.path.name.clone(),
            owner: model.path.user.clone(),
            offer_name: details.offer_name.clone(),
            application_name: details.application_name.clone(),
            application_description: details.application_description.clone(),
            endpoints: details.endpoints.clone(),
            spaces: details.spaces.clone(),
            bindings: details.bindings.clone(),
            users,
            connections: details.connections.clone(),
        };
        match self.db().store().insert(&doc).await {
            Ok(()) => {}
            Err(fleetmux_store::StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        if let Err(err) = handle
            .grant_application_offer_access(&url.to_string(), id.id(), Permission::Admin)
            .await
        {
            warn!(offer = %url, error = %err, "aligning creator admin on remote offer failed");
        }

        info!(offer = %url, uuid = %doc.uuid, "application offer created");
        if let Err(err) = self
            .db()
            .append_audit(AuditContent::OfferCreated {
                offer_url: url.to_string(),
            })
            .await
        {
            warn!(error = %err, "audit append failed");
        }
        Ok(url)
    }

    /// Resolve an offer and the caller's effective level; no access at all
    /// reads as not-found.
    async fn offer_with_access(
        &self,
        id: &Identity,
        url: &OfferUrl,
    ) -> Result<(ApplicationOffer, Permission), Error> {
        let hidden = || Error::not_found(format!("application offer {url}"));
        let offer = match self.db().offer_by_url(url).await {
            Ok(offer) => offer,
            Err(e) if e.is_not_found() => return Err(hidden()),
            Err(e) => return Err(e),
        };
        let groups = self.auth().groups(id).await;
        let level = offer.access_for(id.id(), &groups);
        if level == Permission::None {
            return Err(hidden());
        }
        Ok((offer, level))
    }

    /// Fetch an offer's details. Requires read access; non-admins see a
    /// user list reduced to themselves and `everyone`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the offer is absent or hidden from
    /// the caller — the two cases are indistinguishable by design.
    pub async fn get_application_offer(
        &self,
        id: &Identity,
        url: &OfferUrl,
    ) -> Result<OfferDetails, Error> {
        let (offer, level) = self.offer_with_access(id, url).await?;
        Ok(render_details(&offer, id, level >= Permission::Admin))
    }

    /// Fetch everything a consumer needs to relate to an offer.
    ///
    /// The remote response is rewritten to the broker's view: the user list
    /// is filtered, and the controller endpoint info is replaced with the
    /// broker-known public addresses plus the controller UUID and alias.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when absent or hidden.
    /// - [`Error::Unauthorized`] with only read access.
    pub async fn get_application_offer_consume_details(
        &self,
        id: &Identity,
        url: &OfferUrl,
        bakery_version: u8,
    ) -> Result<ConsumeOfferDetails, Error> {
        let (offer, level) = self.offer_with_access(id, url).await?;
        if level < Permission::Consume {
            return Err(Error::Unauthorized);
        }

        let (controller, handle) = self.open_controller(&offer.controller).await?;
        let mut details = handle
            .get_application_offer_consume_details(id.id(), &url.to_string(), bakery_version)
            .await?;

        details.offer.users =
            filter_offer_users(id, level >= Permission::Admin, details.offer.users);
        details.controller_info = ControllerInfo {
            uuid: controller.uuid.clone(),
            alias: controller.path.to_string(),
            addrs: controller.public_addresses(),
            ca_cert: controller.ca_cert.clone(),
        };
        Ok(details)
    }

    /// Offers the caller administers, narrowed by filters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn list_application_offers(
        &self,
        id: &Identity,
        filters: &[OfferFilter],
    ) -> Result<Vec<OfferDetails>, Error> {
        let offers = self.query_offers(id, Permission::Admin, filters).await?;
        Ok(offers
            .iter()
            .map(|offer| render_details(offer, id, true))
            .collect())
    }

    /// Offers the caller can at least read, narrowed by filters. Non-admin
    /// offers come back with reduced user lists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] on backend failure.
    pub async fn find_application_offers(
        &self,
        id: &Identity,
        filters: &[OfferFilter],
    ) -> Result<Vec<OfferDetails>, Error> {
        let offers = self.query_offers(id, Permission::Read, filters).await?;
        let groups = self.auth().groups(id).await;
        Ok(offers
            .iter()
            .map(|offer| {
                let admin = offer.access_for(id.id(), &groups) >= Permission::Admin;
                render_details(offer, id, admin)
            })
            .collect())
    }

    /// The composite offer query: caller's access ≥ `level` (directly, via
    /// a group, or via `everyone`) AND any filter clause matches.
    async fn query_offers(
        &self,
        id: &Identity,
        level: Permission,
        filters: &[OfferFilter],
    ) -> Result<Vec<ApplicationOffer>, Error> {
        let groups = self.auth().groups(id).await;
        let mut principals = vec![id.id().to_owned(), EVERYONE.to_owned()];
        principals.extend(groups.iter().cloned());
        let access = Query::or(
            principals
                .iter()
                .filter(|p| valid_name(p.as_str()))
                .map(|p| Query::gte(format!("users.{p}"), level))
                .collect(),
        );

        let filter = if filters.is_empty() {
            Query::All
        } else {
            Query::or(filters.iter().map(OfferFilter::clause).collect())
        };

        let mut offers = Vec::new();
        self.db()
            .store()
            .for_each::<ApplicationOffer, Error, _>(
                &Query::and(vec![access, filter]),
                &Sort::by("owner").then("model_name").then("offer_name"),
                |offer| {
                    offers.push(offer);
                    Ok(())
                },
            )
            .await?;
        Ok(offers)
    }

    /// Grant a user access to an offer: on the controller first, then the
    /// local permission map (which only ever moves up under grant).
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when absent or hidden.
    /// - [`Error::Unauthorized`] without admin access.
    /// - [`Error::BadRequest`] for an invalid user or level.
    pub async fn grant_offer_access(
        &self,
        id: &Identity,
        url: &OfferUrl,
        user: &str,
        level: Permission,
    ) -> Result<(), Error> {
        let (offer, caller_level) = self.offer_with_access(id, url).await?;
        if caller_level < Permission::Admin {
            return Err(Error::Unauthorized);
        }
        let target = parse_offer_user(user)?;

        let (_, handle) = self.open_controller(&offer.controller).await?;
        handle
            .grant_application_offer_access(&url.to_string(), &target, level)
            .await?;

        let current = offer.users.get(&target).copied().unwrap_or_default();
        let update = Update::new().set(format!("users.{target}"), current.max(level));
        self.db().store().update(&offer, &update, false).await?;
        info!(offer = %url, user = %target, level = %level, "offer access granted");
        Ok(())
    }

    /// Revoke a user's offer access at `level` and above: locally first,
    /// then on the controller.
    ///
    /// # Errors
    ///
    /// Same categories as [`Broker::grant_offer_access`].
    pub async fn revoke_offer_access(
        &self,
        id: &Identity,
        url: &OfferUrl,
        user: &str,
        level: Permission,
    ) -> Result<(), Error> {
        let (offer, caller_level) = self.offer_with_access(id, url).await?;
        if caller_level < Permission::Admin {
            return Err(Error::Unauthorized);
        }
        let target = parse_offer_user(user)?;

        let current = offer.users.get(&target).copied().unwrap_or_default();
        let reduced = current.min(level.below());
        let update = if reduced == Permission::None {
            Update::new().unset(format!("users.{target}"))
        } else {
            Update::new().set(format!("users.{target}"), reduced)
        };
        self.db().store().update(&offer, &update, false).await?;

        let (_, handle) = self.open_controller(&offer.controller).await?;
        handle
            .revoke_application_offer_access(&url.to_string(), &target, level)
            .await?;
        info!(offer = %url, user = %target, level = %level, "offer access revoked");
        Ok(())
    }

    /// Destroy an offer: on the controller first, then the local row, so a
    /// remote failure leaves a local retry point and no orphaned remote
    /// offer.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when absent or hidden.
    /// - [`Error::Unauthorized`] without admin access.
    /// - [`Error::Api`] when the controller refuses.
    pub async fn destroy_offer(
        &self,
        id: &Identity,
        url: &OfferUrl,
        force: bool,
    ) -> Result<(), Error> {
        let (offer, caller_level) = self.offer_with_access(id, url).await?;
        if caller_level < Permission::Admin {
            return Err(Error::Unauthorized);
        }

        let (_, handle) = self.open_controller(&offer.controller).await?;
        match handle.destroy_application_offer(&url.to_string(), force).await {
            Ok(()) => {}
            // Already gone remotely: finishing the local removal converges.
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        match self.db().store().remove(&offer).await {
            Ok(()) | Err(fleetmux_store::StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        info!(offer = %url, force, "application offer destroyed");
        if let Err(err) = self
            .db()
            .append_audit(AuditContent::OfferDestroyed {
                offer_url: url.to_string(),
            })
            .await
        {
            warn!(error = %err, "audit append failed");
        }
        Ok(())
    }
}

fn parse_offer_user(user: &str) -> Result<String, Error> {
    if user == EVERYONE {
        return Ok(EVERYONE.to_owned());
    }
    Ok(Identity::new(user)?.id().to_owned())
}

/// Collapse a controller-reported user list into the permission map,
/// discarding controller-local identities.
fn permission_map(users: &[OfferUserDetails]) -> BTreeMap<String, Permission> {
    let mut map = BTreeMap::new();
    for user in users {
        if user.user != EVERYONE && !valid_name(&user.user) {
            continue;
        }
        let entry = map.entry(user.user.clone()).or_insert(Permission::None);
        *entry = (*entry).max(user.access);
    }
    map.retain(|_, level| *level > Permission::None);
    map
}

/// Strip controller-local users; reduce the list to the caller plus
/// `everyone` unless the caller is an offer admin; sort by user name.
fn filter_offer_users(
    id: &Identity,
    is_admin: bool,
    users: Vec<OfferUserDetails>,
) -> Vec<OfferUserDetails> {
    let mut users: Vec<OfferUserDetails> = users
        .into_iter()
        .filter(|u| u.user == EVERYONE || valid_name(&u.user))
        .filter(|u| is_admin || u.user == EVERYONE || u.user == id.id())
        .collect();
    users.sort_by(|a, b| a.user.cmp(&b.user));
    users
}

fn render_details(offer: &ApplicationOffer, id: &Identity, is_admin: bool) -> OfferDetails {
    let users = offer
        .users
        .iter()
        .map(|(user, level)| OfferUserDetails {
            user: user.clone(),
            display_name: String::new(),
            access: *level,
        })
        .collect();
    OfferDetails {
        offer_uuid: offer.uuid.clone(),
        offer_url: offer.url.to_string(),
        offer_name: offer.offer_name.clone(),
        application_name: offer.application_name.clone(),
        application_description: offer.application_description.clone(),
        endpoints: offer.endpoints.clone(),
        spaces: offer.spaces.clone(),
        bindings: offer.bindings.clone(),
        users: filter_offer_users(id, is_admin, users),
        connections: offer.connections.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use crate::entity::{Controller, Model};
    use crate::testing::{FakeApi, FakeDialer, StaticIdentity};
    use fleetmux_store::{MemoryStore, Store};
    use std::sync::Arc;

    struct Setup {
        broker: Arc<Broker>,
        api: Arc<FakeApi>,
    }

    async fn setup() -> Setup {
        let api = FakeApi::new("ctl-uuid");
        let dialer = FakeDialer::new();
        dialer.register("bob/prod", Arc::clone(&api));
        let broker = Broker::new(
            Store::new(Arc::new(MemoryStore::new())),
            Arc::new(dialer),
            Arc::new(StaticIdentity::new()),
            None,
            BrokerConfig::default(),
        )
        .await
        .unwrap();

        let ctl = Controller {
            uuid: "ctl-uuid".into(),
            public: true,
            addresses: vec![
                crate::entity::HostPort {
                    host: "public.example.com".into(),
                    port: 17070,
                    scope: crate::entity::AddressScope::Public,
                },
                crate::entity::HostPort {
                    host: "10.0.0.9".into(),
                    port: 17070,
                    scope: crate::entity::AddressScope::CloudLocal,
                },
            ],
            ca_cert: "broker-known-ca".into(),
            ..Controller::with_path("bob/prod".parse().unwrap())
        };
        broker.db().store().insert(&ctl).await.unwrap();
        Setup { broker, api }
    }

    /// Create a model for `owner` directly in catalog + fake controller.
    async fn seed_model(s: &Setup, owner: &str, name: &str) -> Model {
        let uuid = s.api.with_state(|st| {
            let uuid = format!("model-{owner}-{name}");
            st.models.insert(
                uuid.clone(),
                crate::api::ModelDetails {
                    uuid: uuid.clone(),
                    name: name.to_owned(),
                    owner: owner.to_owned(),
                    ..crate::api::ModelDetails::default()
                },
            );
            uuid
        });
        let model = Model {
            uuid,
            controller: "bob/prod".parse().unwrap(),
            cloud: "aws".into(),
            cloud_region: "eu-west-1".into(),
            ..Model::with_path(format!("{owner}/{name}").parse().unwrap())
        };
        s.broker.db().store().insert(&model).await.unwrap();
        model
    }

    fn params(name: &str, application: &str, description: &str) -> OfferParams {
        OfferParams {
            offer_name: name.into(),
            application_name: application.into(),
            application_description: description.into(),
            endpoints: BTreeMap::from([("db".to_owned(), "db".to_owned())]),
        }
    }

    #[tokio::test]
    async fn offer_creates_remote_then_local_with_matching_uuid() {
        let s = setup().await;
        seed_model(&s, "bob", "m1").await;
        let bob = Identity::new("bob").unwrap();

        let url = s
            .broker
            .offer(&bob, &"bob/m1".parse().unwrap(), params("off1", "db", "a database"))
            .await
            .unwrap();
        assert_eq!(url.to_string(), "bob/m1.off1");

        let local = s.broker.db().offer_by_url(&url).await.unwrap();
        let remote_uuid = s
            .api
            .with_state(|st| st.offers.get("bob/m1.off1").map(|o| o.offer_uuid.clone()))
            .unwrap();
        assert_eq!(local.uuid, remote_uuid);
        assert_eq!(local.users.get("bob"), Some(&Permission::Admin));
    }

    #[tokio::test]
    async fn offer_requires_model_admin() {
        let s = setup().await;
        seed_model(&s, "bob", "m1").await;
        let eve = Identity::new("eve").unwrap();
        let err = s
            .broker
            .offer(&eve, &"bob/m1".parse().unwrap(), params("off1", "db", ""))
            .await
            .unwrap_err();
        // Eve cannot even see the model.
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn concurrent_offer_creates_converge_on_one_row() {
        let s = setup().await;
        seed_model(&s, "bob", "m1").await;
        let bob = Identity::new("bob").unwrap();

        let a = {
            let broker = Arc::clone(&s.broker);
            let bob = bob.clone();
            tokio::spawn(async move {
                broker
                    .offer(&bob, &"bob/m1".parse().unwrap(), params("off1", "db", ""))
                    .await
            })
        };
        let b = {
            let broker = Arc::clone(&s.broker);
            let bob = bob.clone();
            tokio::spawn(async move {
                broker
                    .offer(&bob, &"bob/m1".parse().unwrap(), params("off1", "db", ""))
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let count = s
            .broker
            .db()
            .store()
            .count::<ApplicationOffer>(&Query::All)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn probe_proof_get_regardless_of_existence() {
        let s = setup().await;
        seed_model(&s, "bob", "m1").await;
        let bob = Identity::new("bob").unwrap();
        s.broker
            .offer(&bob, &"bob/m1".parse().unwrap(), params("off1", "db", ""))
            .await
            .unwrap();

        let eve = Identity::new("eve").unwrap();
        let existing = s
            .broker
            .get_application_offer(&eve, &"bob/m1.off1".parse().unwrap())
            .await
            .unwrap_err();
        let missing = s
            .broker
            .get_application_offer(&eve, &"bob/m1.ghost".parse().unwrap())
            .await
            .unwrap_err();
        assert!(existing.is_not_found());
        assert!(missing.is_not_found());
        // Same category and same shape of message prefix: no probe signal.
        assert_eq!(
            std::mem::discriminant(&existing),
            std::mem::discriminant(&missing)
        );
    }

    async fn seed_offer_with_users(
        s: &Setup,
        users: &[(&str, Permission)],
    ) -> OfferUrl {
        seed_model(s, "bob", "m1").await;
        let bob = Identity::new("bob").unwrap();
        let url = s
            .broker
            .offer(&bob, &"bob/m1".parse().unwrap(), params("off1", "db", "shared db"))
            .await
            .unwrap();
        for (user, level) in users {
            s.broker
                .grant_offer_access(&bob, &url, user, *level)
                .await
                .unwrap();
        }
        url
    }

    #[tokio::test]
    async fn grant_by_non_admin_rejected_by_admin_accepted() {
        let s = setup().await;
        let url = seed_offer_with_users(&s, &[("charlie", Permission::Consume)]).await;

        let charlie = Identity::new("charlie").unwrap();
        let err = s
            .broker
            .grant_offer_access(&charlie, &url, "dave", Permission::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized));

        let bob = Identity::new("bob").unwrap();
        s.broker
            .grant_offer_access(&bob, &url, "dave", Permission::Consume)
            .await
            .unwrap();
        let offer = s.broker.db().offer_by_url(&url).await.unwrap();
        assert_eq!(offer.users.get("dave"), Some(&Permission::Consume));
    }

    #[tokio::test]
    async fn grant_is_monotone_and_revoke_caps() {
        let s = setup().await;
        let url = seed_offer_with_users(&s, &[("dave", Permission::Consume)]).await;
        let bob = Identity::new("bob").unwrap();

        // Granting a lower level never demotes.
        s.broker
            .grant_offer_access(&bob, &url, "dave", Permission::Read)
            .await
            .unwrap();
        let offer = s.broker.db().offer_by_url(&url).await.unwrap();
        assert_eq!(offer.users.get("dave"), Some(&Permission::Consume));

        // Revoking consume leaves at most read.
        s.broker
            .revoke_offer_access(&bob, &url, "dave", Permission::Consume)
            .await
            .unwrap();
        let offer = s.broker.db().offer_by_url(&url).await.unwrap();
        assert_eq!(offer.users.get("dave"), Some(&Permission::Read));

        // Revoking read removes the entry entirely.
        s.broker
            .revoke_offer_access(&bob, &url, "dave", Permission::Read)
            .await
            .unwrap();
        let offer = s.broker.db().offer_by_url(&url).await.unwrap();
        assert_eq!(offer.users.get("dave"), None);
    }

    #[tokio::test]
    async fn everyone_grant_gives_public_access() {
        let s = setup().await;
        let url = seed_offer_with_users(&s, &[]).await;
        let bob = Identity::new("bob").unwrap();
        s.broker
            .grant_offer_access(&bob, &url, EVERYONE, Permission::Read)
            .await
            .unwrap();

        let eve = Identity::new("eve").unwrap();
        let details = s.broker.get_application_offer(&eve, &url).await.unwrap();
        assert_eq!(details.offer_url, "bob/m1.off1");
        // Eve sees only the everyone row (she has no row of her own).
        assert_eq!(details.users.len(), 1);
        assert_eq!(details.users[0].user, EVERYONE);
    }

    #[tokio::test]
    async fn consume_details_rewrites_controller_info_and_filters_users() {
        let s = setup().await;
        let url = seed_offer_with_users(&s, &[("charlie", Permission::Consume)]).await;
        // The remote reports a controller-local user that must be dropped.
        s.api.with_state(|st| {
            if let Some(offer) = st.offers.get_mut("bob/m1.off1") {
                offer.users.push(OfferUserDetails {
                    user: "admin@local".into(),
                    display_name: String::new(),
                    access: Permission::Admin,
                });
            }
        });

        let charlie = Identity::new("charlie").unwrap();
        let details = s
            .broker
            .get_application_offer_consume_details(&charlie, &url, 3)
            .await
            .unwrap();

        // Controller info is the broker's, not the remote's.
        assert_eq!(details.controller_info.uuid, "ctl-uuid");
        assert_eq!(details.controller_info.alias, "bob/prod");
        assert_eq!(details.controller_info.addrs, vec!["public.example.com:17070"]);
        assert_eq!(details.controller_info.ca_cert, "broker-known-ca");
        // Non-admin caller: own row only, controller-local row dropped.
        assert_eq!(details.offer.users.len(), 1);
        assert_eq!(details.offer.users[0].user, "charlie");

        // Read-only users cannot consume.
        let bob = Identity::new("bob").unwrap();
        s.broker
            .grant_offer_access(&bob, &url, "dave", Permission::Read)
            .await
            .unwrap();
        let dave = Identity::new("dave").unwrap();
        assert!(matches!(
            s.broker
                .get_application_offer_consume_details(&dave, &url, 3)
                .await,
            Err(Error::Unauthorized)
        ));
    }

    async fn seed_three_offers(s: &Setup) {
        let bob = Identity::new("bob").unwrap();
        seed_model(s, "bob", "m1").await;
        seed_model(s, "bob", "m2").await;
        s.broker
            .offer(&bob, &"bob/m1".parse().unwrap(), params("db", "postgres", "relational store"))
            .await
            .unwrap();
        s.broker
            .offer(&bob, &"bob/m1".parse().unwrap(), params("cache", "redis", "hot cache"))
            .await
            .unwrap();
        s.broker
            .offer(&bob, &"bob/m2".parse().unwrap(), params("db", "mysql", "relational store"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn find_respects_access_and_filters() {
        let s = setup().await;
        seed_three_offers(&s).await;
        let bob = Identity::new("bob").unwrap();
        s.broker
            .grant_offer_access(&bob, &"bob/m1.db".parse().unwrap(), "carol", Permission::Read)
            .await
            .unwrap();

        let carol = Identity::new("carol").unwrap();
        // Carol sees only what she was granted.
        let all = s.broker.find_application_offers(&carol, &[]).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].offer_url, "bob/m1.db");

        // Bob with a model filter.
        let filtered = s
            .broker
            .find_application_offers(
                &bob,
                &[OfferFilter {
                    model_name: Some("m1".into()),
                    ..OfferFilter::default()
                }],
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 2);

        // Regex on description.
        let relational = s
            .broker
            .find_application_offers(
                &bob,
                &[OfferFilter {
                    description: Some("relational.*store".into()),
                    ..OfferFilter::default()
                }],
            )
            .await
            .unwrap();
        assert_eq!(relational.len(), 2);
        assert!(relational.iter().all(|o| o.offer_name == "db"));
    }

    #[tokio::test]
    async fn find_is_subset_of_unfiltered_and_sorted() {
        let s = setup().await;
        seed_three_offers(&s).await;
        let bob = Identity::new("bob").unwrap();

        let unfiltered = s.broker.find_application_offers(&bob, &[]).await.unwrap();
        let urls: Vec<&str> = unfiltered.iter().map(|o| o.offer_url.as_str()).collect();
        assert_eq!(urls, vec!["bob/m1.cache", "bob/m1.db", "bob/m2.db"]);

        let filtered = s
            .broker
            .find_application_offers(
                &bob,
                &[OfferFilter {
                    offer_name: Some("db".into()),
                    ..OfferFilter::default()
                }],
            )
            .await
            .unwrap();
        assert!(filtered.len() <= unfiltered.len());
        for offer in &filtered {
            assert!(urls.contains(&offer.offer_url.as_str()));
        }
    }

    #[tokio::test]
    async fn list_requires_admin_level() {
        let s = setup().await;
        seed_three_offers(&s).await;
        let bob = Identity::new("bob").unwrap();
        s.broker
            .grant_offer_access(&bob, &"bob/m1.db".parse().unwrap(), "carol", Permission::Consume)
            .await
            .unwrap();

        let carol = Identity::new("carol").unwrap();
        assert!(s.broker.list_application_offers(&carol, &[]).await.unwrap().is_empty());
        assert_eq!(s.broker.list_application_offers(&bob, &[]).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn allowed_consumer_filter_and_unparsable_tag() {
        let s = setup().await;
        seed_three_offers(&s).await;
        let bob = Identity::new("bob").unwrap();
        s.broker
            .grant_offer_access(&bob, &"bob/m1.db".parse().unwrap(), "carol", Permission::Consume)
            .await
            .unwrap();

        let consumers = s
            .broker
            .find_application_offers(
                &bob,
                &[OfferFilter {
                    allowed_consumers: vec!["carol".into()],
                    ..OfferFilter::default()
                }],
            )
            .await
            .unwrap();
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].offer_url, "bob/m1.db");

        // An unparsable tag poisons only its clause: nothing matches it.
        let poisoned = s
            .broker
            .find_application_offers(
                &bob,
                &[OfferFilter {
                    allowed_consumers: vec!["not a user!".into()],
                    ..OfferFilter::default()
                }],
            )
            .await
            .unwrap();
        assert!(poisoned.is_empty());

        // But as one clause among several it does not block the others.
        let mixed = s
            .broker
            .find_application_offers(
                &bob,
                &[
                    OfferFilter {
                        allowed_consumers: vec!["not a user!".into()],
                        ..OfferFilter::default()
                    },
                    OfferFilter {
                        model_name: Some("m2".into()),
                        ..OfferFilter::default()
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(mixed.len(), 1);
        assert_eq!(mixed[0].offer_url, "bob/m2.db");
    }

    #[tokio::test]
    async fn endpoint_filter_element_match() {
        let s = setup().await;
        seed_model(&s, "bob", "m1").await;
        let bob = Identity::new("bob").unwrap();
        let url = s
            .broker
            .offer(&bob, &"bob/m1".parse().unwrap(), params("db", "postgres", ""))
            .await
            .unwrap();
        // Give the stored offer a typed endpoint.
        let offer = s.broker.db().offer_by_url(&url).await.unwrap();
        let update = Update::new().set(
            "endpoints",
            serde_json::json!([{"name": "db", "role": "provider", "interface": "pgsql", "limit": 0}]),
        );
        s.broker.db().store().update(&offer, &update, false).await.unwrap();

        let hits = s
            .broker
            .find_application_offers(
                &bob,
                &[OfferFilter {
                    endpoints: vec![EndpointFilter {
                        interface: Some("pgsql".into()),
                        role: Some("provider".into()),
                        name: None,
                    }],
                    ..OfferFilter::default()
                }],
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let misses = s
            .broker
            .find_application_offers(
                &bob,
                &[OfferFilter {
                    endpoints: vec![EndpointFilter {
                        interface: Some("pgsql".into()),
                        role: Some("requirer".into()),
                        name: None,
                    }],
                    ..OfferFilter::default()
                }],
            )
            .await
            .unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn destroy_offer_remote_first() {
        let s = setup().await;
        let url = seed_offer_with_users(&s, &[]).await;
        let bob = Identity::new("bob").unwrap();

        // Remote failure leaves the local row as a retry point.
        s.api.fail(
            "destroy_application_offer",
            crate::api::RemoteError::new("cannot destroy: relations present"),
        );
        let err = s.broker.destroy_offer(&bob, &url, false).await.unwrap_err();
        assert!(matches!(err, Error::Api { .. }));
        s.broker.db().offer_by_url(&url).await.unwrap();

        // After the remote accepts, the local row goes too.
        s.api.clear_failure("destroy_application_offer");
        s.broker.destroy_offer(&bob, &url, false).await.unwrap();
        assert!(s.broker.db().offer_by_url(&url).await.unwrap_err().is_not_found());
        assert!(s.api.with_state(|st| st.offers.is_empty()));
    }
}
