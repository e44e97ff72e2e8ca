//! Append-only audit log of significant state transitions.

use chrono::{DateTime, Utc};
use fleetmux_store::Document;
use serde::{Deserialize, Serialize};

/// Collection name for [`AuditEntry`] documents.
pub const AUDITS: &str = "audits";

/// What happened, with a stable type tag for querying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum AuditContent {
    CloudCreated {
        cloud: String,
        controller: String,
    },
    CloudRemoved {
        cloud: String,
    },
    ControllerAdded {
        controller: String,
    },
    ControllerRemoved {
        controller: String,
    },
    ModelCreated {
        model: String,
        controller: String,
    },
    ModelDestroyed {
        model: String,
    },
    OfferCreated {
        offer_url: String,
    },
    OfferDestroyed {
        offer_url: String,
    },
}

/// One audit record. Entries are only ever inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,
    #[serde(flatten)]
    pub content: AuditContent,
}

impl AuditEntry {
    /// A new entry stamped with the given time.
    #[must_use]
    pub fn new(created: DateTime<Utc>, content: AuditContent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created,
            content,
        }
    }
}

impl Document for AuditEntry {
    fn collection() -> &'static str {
        AUDITS
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}
