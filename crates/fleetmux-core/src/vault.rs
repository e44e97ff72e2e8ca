//! The secret vault seam.
//!
//! Credential attribute material can be redirected out of the catalog into
//! an external vault, addressed by `creds/<cloud>/<user>/<name>`. The broker
//! only reads and writes opaque string maps; sealing, transit encryption and
//! the vault deployment itself are the external service's concern.

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::error::Error;

/// Read/write access to opaque secret maps at string paths.
#[async_trait::async_trait]
pub trait SecretVault: Send + Sync + 'static {
    /// Read the map at `path`; `Ok(None)` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Vault`] when the vault cannot be reached.
    async fn read(&self, path: &str) -> Result<Option<BTreeMap<String, String>>, Error>;

    /// Write the map at `path`, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Vault`] when the vault cannot be reached.
    async fn write(&self, path: &str, data: &BTreeMap<String, String>) -> Result<(), Error>;

    /// Delete the map at `path`. Deleting an absent path is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Vault`] when the vault cannot be reached.
    async fn delete(&self, path: &str) -> Result<(), Error>;
}

/// An in-memory vault for tests and development.
#[derive(Debug, Default)]
pub struct MemoryVault {
    data: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MemoryVault {
    /// A new empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SecretVault for MemoryVault {
    async fn read(&self, path: &str) -> Result<Option<BTreeMap<String, String>>, Error> {
        Ok(self.data.read().await.get(path).cloned())
    }

    async fn write(&self, path: &str, data: &BTreeMap<String, String>) -> Result<(), Error> {
        self.data.write().await.insert(path.to_owned(), data.clone());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        self.data.write().await.remove(path);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_delete_roundtrip() {
        let vault = MemoryVault::new();
        let attrs = BTreeMap::from([("access-key".to_owned(), "abc".to_owned())]);
        vault.write("creds/aws/bob/default", &attrs).await.unwrap();
        assert_eq!(
            vault.read("creds/aws/bob/default").await.unwrap(),
            Some(attrs)
        );
        vault.delete("creds/aws/bob/default").await.unwrap();
        assert_eq!(vault.read("creds/aws/bob/default").await.unwrap(), None);
        // Idempotent delete.
        vault.delete("creds/aws/bob/default").await.unwrap();
    }
}
