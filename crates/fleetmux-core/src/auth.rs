//! The access checker.
//!
//! Resolves a caller identity to its groups through the external identity
//! service (cached with a short TTL) and evaluates ACL membership and
//! permission-map levels. Comparison of user names is case-insensitive:
//! identities are lower-cased on construction and ACL entries are lower-cased
//! at comparison time.
//!
//! If the identity service is unreachable the checker degrades to the bare
//! caller identity with no groups — a caller never gains access from an
//! outage, and direct grants keep working.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use crate::entity::{EVERYONE, valid_name};
use crate::error::Error;

/// Resolves group membership for users. Implemented by the external
/// identity service; a static map suffices for tests.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// The groups the user belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Identity`] when the service cannot be reached.
    async fn groups_for_user(&self, user: &str) -> Result<Vec<String>, Error>;
}

/// An authenticated caller identity with a stable, lower-cased id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    id: String,
}

impl Identity {
    /// Build an identity from an authenticated user id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] when the id is not a valid user name
    /// after lower-casing.
    pub fn new(id: &str) -> Result<Self, Error> {
        let id = id.to_lowercase();
        if !valid_name(&id) {
            return Err(Error::bad_request(format!("invalid user id '{id}'")));
        }
        Ok(Self { id })
    }

    /// The caller's id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

struct CachedGroups {
    fetched: Instant,
    groups: Arc<Vec<String>>,
}

/// Evaluates identity and ACL checks for the broker.
pub struct Authenticator {
    provider: Arc<dyn IdentityProvider>,
    cache: Mutex<HashMap<String, CachedGroups>>,
    ttl: Duration,
    controller_admin: String,
}

impl Authenticator {
    /// Create an authenticator over the given identity provider.
    ///
    /// `controller_admin` is the distinguished principal (user or group)
    /// that administers the broker itself.
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>, controller_admin: &str, ttl: Duration) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
            ttl,
            controller_admin: controller_admin.to_lowercase(),
        }
    }

    /// The caller's groups, lower-cased, served from cache within the TTL.
    ///
    /// An identity-service failure degrades to no groups.
    pub async fn groups(&self, id: &Identity) -> Arc<Vec<String>> {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(id.id()) {
                if entry.fetched.elapsed() < self.ttl {
                    return Arc::clone(&entry.groups);
                }
            }
        }
        let groups = match self.provider.groups_for_user(id.id()).await {
            Ok(groups) => groups.into_iter().map(|g| g.to_lowercase()).collect(),
            Err(err) => {
                warn!(user = %id.id(), error = %err, "group resolution failed, proceeding without groups");
                return Arc::new(Vec::new());
            }
        };
        let groups = Arc::new(groups);
        let mut cache = self.cache.lock().await;
        cache.insert(
            id.id().to_owned(),
            CachedGroups {
                fetched: Instant::now(),
                groups: Arc::clone(&groups),
            },
        );
        groups
    }

    /// Succeeds iff `name` is the caller or one of the caller's groups.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] otherwise.
    pub async fn check_is_user(&self, id: &Identity, name: &str) -> Result<(), Error> {
        let name = name.to_lowercase();
        if id.id() == name {
            return Ok(());
        }
        if self.groups(id).await.iter().any(|g| *g == name) {
            return Ok(());
        }
        Err(Error::Unauthorized)
    }

    /// Succeeds iff the caller (or one of its groups) appears in `acl`, or
    /// the ACL contains the pseudo-user `everyone`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] otherwise.
    pub async fn check_acl(&self, id: &Identity, acl: &[String]) -> Result<(), Error> {
        for entry in acl {
            let entry = entry.to_lowercase();
            if entry == EVERYONE || entry == id.id() {
                return Ok(());
            }
        }
        let groups = self.groups(id).await;
        for entry in acl {
            let entry = entry.to_lowercase();
            if groups.iter().any(|g| *g == entry) {
                return Ok(());
            }
        }
        Err(Error::Unauthorized)
    }

    /// Read check: owner plus the entity's read ACL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] when the caller may not read.
    pub async fn check_can_read(
        &self,
        id: &Identity,
        owner: &str,
        read_acl: &[String],
    ) -> Result<(), Error> {
        let mut allowed = Vec::with_capacity(read_acl.len() + 1);
        allowed.push(owner.to_owned());
        allowed.extend_from_slice(read_acl);
        self.check_acl(id, &allowed).await
    }

    /// Succeeds iff the caller is (or is in) the distinguished
    /// controller-admin principal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] otherwise.
    pub async fn check_controller_admin(&self, id: &Identity) -> Result<(), Error> {
        self.check_is_user(id, &self.controller_admin).await
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("controller_admin", &self.controller_admin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticGroups {
        map: HashMap<String, Vec<String>>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl IdentityProvider for StaticGroups {
        async fn groups_for_user(&self, user: &str) -> Result<Vec<String>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.map.get(user).cloned().unwrap_or_default())
        }
    }

    struct FailingProvider;

    #[async_trait::async_trait]
    impl IdentityProvider for FailingProvider {
        async fn groups_for_user(&self, _user: &str) -> Result<Vec<String>, Error> {
            Err(Error::Identity {
                reason: "unreachable".to_owned(),
            })
        }
    }

    fn auth_with(map: &[(&str, &[&str])]) -> Authenticator {
        let map = map
            .iter()
            .map(|(u, gs)| ((*u).to_owned(), gs.iter().map(|g| (*g).to_owned()).collect()))
            .collect();
        Authenticator::new(
            Arc::new(StaticGroups {
                map,
                calls: AtomicUsize::new(0),
            }),
            "controller-admin",
            Duration::from_secs(60),
        )
    }

    #[test]
    fn identity_lowercases_and_validates() {
        assert_eq!(Identity::new("Bob").unwrap().id(), "bob");
        assert!(Identity::new("bob smith").is_err());
        assert!(Identity::new("admin@local").is_err());
    }

    #[tokio::test]
    async fn check_is_user_matches_self_and_groups() {
        let auth = auth_with(&[("bob", &["ops"])]);
        let bob = Identity::new("bob").unwrap();
        auth.check_is_user(&bob, "bob").await.unwrap();
        auth.check_is_user(&bob, "OPS").await.unwrap();
        assert!(matches!(
            auth.check_is_user(&bob, "alice").await,
            Err(Error::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn check_acl_honors_everyone() {
        let auth = auth_with(&[]);
        let eve = Identity::new("eve").unwrap();
        auth.check_acl(&eve, &["everyone".to_owned()]).await.unwrap();
        assert!(matches!(
            auth.check_acl(&eve, &["bob".to_owned()]).await,
            Err(Error::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn check_acl_is_case_insensitive() {
        let auth = auth_with(&[("bob", &["ops"])]);
        let bob = Identity::new("BOB").unwrap();
        auth.check_acl(&bob, &["Bob".to_owned()]).await.unwrap();
        auth.check_acl(&bob, &["OPS".to_owned()]).await.unwrap();
    }

    #[tokio::test]
    async fn check_can_read_includes_owner() {
        let auth = auth_with(&[]);
        let bob = Identity::new("bob").unwrap();
        auth.check_can_read(&bob, "bob", &[]).await.unwrap();
        assert!(auth.check_can_read(&bob, "alice", &[]).await.is_err());
        auth.check_can_read(&bob, "alice", &["bob".to_owned()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn groups_are_cached_within_ttl() {
        let provider = Arc::new(StaticGroups {
            map: HashMap::from([("bob".to_owned(), vec!["ops".to_owned()])]),
            calls: AtomicUsize::new(0),
        });
        let auth = Authenticator::new(
            Arc::clone(&provider) as Arc<dyn IdentityProvider>,
            "controller-admin",
            Duration::from_secs(60),
        );
        let bob = Identity::new("bob").unwrap();
        auth.groups(&bob).await;
        auth.groups(&bob).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_no_groups() {
        let auth = Authenticator::new(
            Arc::new(FailingProvider),
            "controller-admin",
            Duration::from_secs(60),
        );
        let bob = Identity::new("bob").unwrap();
        assert!(auth.groups(&bob).await.is_empty());
        // Direct identity still works.
        auth.check_is_user(&bob, "bob").await.unwrap();
    }

    #[tokio::test]
    async fn controller_admin_check() {
        let auth = auth_with(&[("bob", &["controller-admin"])]);
        let bob = Identity::new("bob").unwrap();
        auth.check_controller_admin(&bob).await.unwrap();
        let eve = Identity::new("eve").unwrap();
        assert!(auth.check_controller_admin(&eve).await.is_err());
    }
}
