//! Credential documents.
//!
//! Metadata always lives in the catalog; the attribute material may instead
//! live in the external secret vault, recorded by `attributes_in_vault`.
//! The `controllers` list is the set of controllers currently holding a copy
//! of the credential — a non-owning back-reference maintained by the
//! credential-push paths.

use std::collections::BTreeMap;

use fleetmux_store::Document;
use serde::{Deserialize, Serialize};

use super::acl::Acl;
use super::path::CredentialPath;

/// Collection name for [`Credential`] documents.
pub const CREDENTIALS: &str = "credentials";

/// Cloud access material bound to `(cloud, user, name)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    pub path: CredentialPath,
    #[serde(default, rename = "type")]
    pub auth_type: String,
    #[serde(default)]
    pub label: String,
    /// Attribute material; empty when redirected to the vault.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub revoked: bool,
    /// When set, attributes are materialized from the vault on demand.
    #[serde(default)]
    pub attributes_in_vault: bool,
    /// Paths of controllers currently holding a copy.
    #[serde(default)]
    pub controllers: Vec<String>,
    #[serde(default)]
    pub acl: Acl,
}

impl Credential {
    /// A credential at the given path; remaining fields default.
    #[must_use]
    pub fn with_path(path: CredentialPath) -> Self {
        Self {
            path,
            ..Self::default()
        }
    }

    /// The vault location of this credential's attribute material.
    #[must_use]
    pub fn vault_path(&self) -> String {
        format!(
            "creds/{}/{}/{}",
            self.path.cloud, self.path.user, self.path.name
        )
    }
}

impl Document for Credential {
    fn collection() -> &'static str {
        CREDENTIALS
    }

    fn key(&self) -> String {
        self.path.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn key_and_vault_path() {
        let cred = Credential::with_path("aws/bob/default".parse().unwrap());
        assert_eq!(cred.key(), "aws/bob/default");
        assert_eq!(cred.vault_path(), "creds/aws/bob/default");
    }

    #[test]
    fn auth_type_serializes_as_type() {
        let mut cred = Credential::with_path("aws/bob/default".parse().unwrap());
        cred.auth_type = "access-key".into();
        let doc = serde_json::to_value(&cred).unwrap();
        assert_eq!(doc.get("type"), Some(&serde_json::json!("access-key")));
    }
}
