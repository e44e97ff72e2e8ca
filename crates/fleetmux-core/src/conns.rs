//! The controller connection cache.
//!
//! Authenticated sessions are cached by controller UUID. Dials run under a
//! per-key single-flight: N concurrent opens for the same controller produce
//! exactly one dial, the rest wait for its outcome. A session stays cached
//! with zero outstanding handles until it is evicted — either explicitly
//! (a controller was just created and its session is cached under the empty
//! UUID the document had before the real one was known) or lazily, when the
//! transport reports itself dead on the next open.
//!
//! Handles are reference counted through `Arc`; dropping the last handle of
//! an evicted session releases it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::api::{ApiDialer, ControllerApi};
use crate::entity::Controller;
use crate::error::Error;

struct Session {
    cell: OnceCell<Arc<dyn ControllerApi>>,
}

/// Cache of authenticated controller sessions, keyed by controller UUID.
pub struct ApiCache {
    dialer: Arc<dyn ApiDialer>,
    dial_timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

/// A live session handle. Cloneable and cheap; the session itself is shared.
pub struct ApiHandle {
    api: Arc<dyn ControllerApi>,
    uuid: String,
    cache: Arc<ApiCache>,
    dialed: bool,
}

impl std::fmt::Debug for ApiHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiHandle")
            .field("uuid", &self.uuid)
            .field("dialed", &self.dialed)
            .finish()
    }
}

impl ApiHandle {
    /// The remote API of this session.
    #[must_use]
    pub fn api(&self) -> &Arc<dyn ControllerApi> {
        &self.api
    }

    /// True when this open dialed a fresh session rather than reusing a
    /// cached one. Fresh connections trigger the pending-credential drain.
    #[must_use]
    pub fn was_dialed(&self) -> bool {
        self.dialed
    }

    /// Remove the session from the cache immediately and close it.
    ///
    /// Other handles to the same session keep working until dropped; no new
    /// opens will observe it.
    pub async fn evict(self) {
        self.cache.evict(&self.uuid).await;
        self.api.close().await;
    }
}

impl std::ops::Deref for ApiHandle {
    type Target = dyn ControllerApi;

    fn deref(&self) -> &Self::Target {
        self.api.as_ref()
    }
}

impl ApiCache {
    /// A new cache dialing through `dialer`, bounding each dial by
    /// `dial_timeout`.
    #[must_use]
    pub fn new(dialer: Arc<dyn ApiDialer>, dial_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            dial_timeout,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Obtain a handle to a live session for the given controller document,
    /// dialing one under single-flight if none is cached.
    ///
    /// A cached session whose transport reports dead is evicted and replaced
    /// by one retry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ApiConnection`] when dialing fails or times out.
    pub async fn open_from_doc(
        self: &Arc<Self>,
        controller: &Controller,
    ) -> Result<ApiHandle, Error> {
        let key = controller.uuid.clone();
        for attempt in 0..2 {
            let session = {
                let mut sessions = self.sessions.lock().await;
                Arc::clone(sessions.entry(key.clone()).or_insert_with(|| {
                    Arc::new(Session {
                        cell: OnceCell::new(),
                    })
                }))
            };

            let mut dialed = false;
            let result = session
                .cell
                .get_or_try_init(|| {
                    dialed = true;
                    let dialer = Arc::clone(&self.dialer);
                    let controller = controller.clone();
                    let timeout = self.dial_timeout;
                    async move {
                        debug!(controller = %controller.path, "dialing controller");
                        tokio::time::timeout(timeout, dialer.dial(&controller))
                            .await
                            .map_err(|_| Error::ApiConnection {
                                controller: controller.path.to_string(),
                                reason: "dial timed out".to_owned(),
                            })?
                    }
                })
                .await;

            let api = match result {
                Ok(api) => Arc::clone(api),
                Err(err) => {
                    // Failed dial: drop the empty session entry so the next
                    // open retries instead of finding a dead cell.
                    self.evict_session(&key, &session).await;
                    return Err(err);
                }
            };

            if api.is_broken() {
                info!(controller = %controller.path, "evicting dead controller session");
                self.evict_session(&key, &session).await;
                api.close().await;
                if attempt == 0 {
                    continue;
                }
                return Err(Error::ApiConnection {
                    controller: controller.path.to_string(),
                    reason: "session broken immediately after dial".to_owned(),
                });
            }

            return Ok(ApiHandle {
                api,
                uuid: key,
                cache: Arc::clone(self),
                dialed,
            });
        }
        // Loop either returns or breaks out via the error above.
        Err(Error::ApiConnection {
            controller: controller.path.to_string(),
            reason: "session unavailable".to_owned(),
        })
    }

    /// Remove the session for `uuid` from the cache, if any.
    pub async fn evict(&self, uuid: &str) {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(uuid);
    }

    /// Remove only if the map still holds this exact session (avoids
    /// clobbering a replacement raced in by another task).
    async fn evict_session(&self, key: &str, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock().await;
        if let Some(current) = sessions.get(key) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(key);
            }
        }
    }

    /// Drain the cache, closing every live session.
    pub async fn close(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            if let Some(api) = session.cell.get() {
                api.close().await;
            }
        }
    }
}

impl std::fmt::Debug for ApiCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCache")
            .field("dial_timeout", &self.dial_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entity::EntityPath;
    use crate::testing::{FakeApi, FakeDialer};

    fn controller(path: &str, uuid: &str) -> Controller {
        let path: EntityPath = path.parse().unwrap();
        Controller {
            uuid: uuid.to_owned(),
            ..Controller::with_path(path)
        }
    }

    fn cache_with(dialer: FakeDialer) -> (Arc<ApiCache>, Arc<FakeDialer>) {
        let dialer = Arc::new(dialer);
        let cache = ApiCache::new(
            Arc::clone(&dialer) as Arc<dyn ApiDialer>,
            Duration::from_secs(5),
        );
        (cache, dialer)
    }

    #[tokio::test]
    async fn open_caches_by_uuid() {
        let dialer = FakeDialer::new();
        dialer.register("bob/prod", FakeApi::new("u-1"));
        let (cache, dialer) = cache_with(dialer);

        let ctl = controller("bob/prod", "u-1");
        let first = cache.open_from_doc(&ctl).await.unwrap();
        assert!(first.was_dialed());
        let second = cache.open_from_doc(&ctl).await.unwrap();
        assert!(!second.was_dialed());
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_opens_single_flight() {
        let mut dialer = FakeDialer::new();
        dialer.dial_delay = Some(Duration::from_millis(50));
        dialer.register("bob/prod", FakeApi::new("u-1"));
        let (cache, dialer) = cache_with(dialer);

        let ctl = controller("bob/prod", "u-1");
        let opens = (0..8).map(|_| {
            let cache = Arc::clone(&cache);
            let ctl = ctl.clone();
            tokio::spawn(async move { cache.open_from_doc(&ctl).await.map(|_| ()) })
        });
        for handle in opens {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test]
    async fn dial_failure_is_api_connection_and_retryable() {
        let dialer = FakeDialer::new();
        dialer.register("bob/prod", FakeApi::new("u-1"));
        dialer.set_unreachable("bob/prod", true);
        let (cache, dialer) = cache_with(dialer);

        let ctl = controller("bob/prod", "u-1");
        let err = cache.open_from_doc(&ctl).await.unwrap_err();
        assert!(matches!(err, Error::ApiConnection { .. }));

        // The failed entry must not be sticky.
        dialer.set_unreachable("bob/prod", false);
        cache.open_from_doc(&ctl).await.unwrap();
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn evict_forces_redial() {
        let dialer = FakeDialer::new();
        let api = FakeApi::new("u-1");
        dialer.register("bob/prod", Arc::clone(&api));
        let (cache, dialer) = cache_with(dialer);

        let ctl = controller("bob/prod", "u-1");
        let handle = cache.open_from_doc(&ctl).await.unwrap();
        handle.evict().await;
        assert!(api.is_closed());

        let handle = cache.open_from_doc(&ctl).await.unwrap();
        assert!(handle.was_dialed());
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn broken_session_evicted_lazily() {
        let dialer = FakeDialer::new();
        let api = FakeApi::new("u-1");
        dialer.register("bob/prod", Arc::clone(&api));
        let (cache, dialer) = cache_with(dialer);

        let ctl = controller("bob/prod", "u-1");
        cache.open_from_doc(&ctl).await.unwrap();
        api.set_broken(true);

        // FakeDialer hands back the same broken FakeApi, so the retry also
        // fails — but two dials must have happened (evict + retry).
        let err = cache.open_from_doc(&ctl).await.unwrap_err();
        assert!(matches!(err, Error::ApiConnection { .. }));
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn close_drains_all_sessions() {
        let dialer = FakeDialer::new();
        let api_a = FakeApi::new("u-a");
        let api_b = FakeApi::new("u-b");
        dialer.register("bob/a", Arc::clone(&api_a));
        dialer.register("bob/b", Arc::clone(&api_b));
        let (cache, _dialer) = cache_with(dialer);

        cache.open_from_doc(&controller("bob/a", "u-a")).await.unwrap();
        cache.open_from_doc(&controller("bob/b", "u-b")).await.unwrap();
        cache.close().await;
        assert!(api_a.is_closed());
        assert!(api_b.is_closed());
    }
}
