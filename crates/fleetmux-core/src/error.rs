//! Error taxonomy for `fleetmux-core`.
//!
//! The variants are a closed set — each one is a stable category that
//! callers (and the HTTP glue above this crate) dispatch on. Remote
//! controller failures are wrapped into [`Error::Api`] with the remote text
//! preserved; they are never silently reinterpreted.
//!
//! The probe-proofing rule lives at the call sites, not here: a caller
//! without read access to an entity gets [`Error::NotFound`], never
//! [`Error::Unauthorized`], so the existence of hidden entities cannot be
//! probed.

use chrono::{DateTime, Utc};
use fleetmux_store::StoreError;

/// Errors surfaced by the broker core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The entity does not exist — or the caller may not know whether it
    /// does.
    #[error("{what} not found")]
    NotFound { what: String },

    /// Creation collided with an existing entity.
    #[error("{what} already exists")]
    AlreadyExists { what: String },

    /// The caller is known but lacks the required permission.
    #[error("unauthorized")]
    Unauthorized,

    /// The operation is not allowed regardless of permissions.
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// The request is malformed (bad name, bad permission level, ...).
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    /// A destructive operation was refused because the target is healthy.
    #[error("controller {controller} is still alive")]
    StillAlive { controller: String },

    /// A cloud definition conflicts with an existing cloud.
    #[error("incompatible clouds: {reason}")]
    IncompatibleClouds { reason: String },

    /// The operation needs a cloud region and none was given.
    #[error("cloud region required")]
    CloudRegionRequired,

    /// The monitor lease is held by another replica.
    #[error("monitor lease held by '{owner}' until {expiry}")]
    LeaseUnavailable {
        owner: String,
        expiry: DateTime<Utc>,
    },

    /// Could not establish a session to the remote controller.
    #[error("cannot connect to controller {controller}: {reason}")]
    ApiConnection { controller: String, reason: String },

    /// The remote controller rejected a call; the remote text is preserved.
    #[error("controller API error: {message}")]
    Api { message: String },

    /// The identity service failed.
    #[error("identity service error: {reason}")]
    Identity { reason: String },

    /// The secret vault failed.
    #[error("secret vault error: {reason}")]
    Vault { reason: String },

    /// The catalog store failed in a way that has no entity-level meaning
    /// (transient backend trouble, malformed document).
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Shorthand for [`Error::AlreadyExists`].
    #[must_use]
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    /// Shorthand for [`Error::BadRequest`].
    #[must_use]
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Error::Forbidden`].
    #[must_use]
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    /// True for either layer's not-found.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Store(StoreError::NotFound { .. })
        )
    }

    /// True for either layer's already-exists.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists { .. } | Self::Store(StoreError::AlreadyExists { .. })
        )
    }
}
