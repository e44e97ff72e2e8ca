//! Path newtypes — the human-readable keys of the catalog.
//!
//! Names are restricted to lower-case alphanumerics plus `-` and `_`. The
//! restriction is load-bearing: user names become field keys inside
//! permission maps (`users.<name>`), so characters with meaning in field
//! paths (most importantly `.`) are rejected, and `@`-suffixed
//! controller-local identities can never enter the catalog.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// True when `name` is a valid catalog name component.
#[must_use]
pub fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn parse_name(name: &str, what: &str) -> Result<String, Error> {
    if valid_name(name) {
        Ok(name.to_owned())
    } else {
        Err(Error::bad_request(format!("invalid {what} '{name}'")))
    }
}

/// A `<user>/<name>` path identifying a controller or model.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct EntityPath {
    pub user: String,
    pub name: String,
}

impl EntityPath {
    /// Build a path, validating both components.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] on an invalid component.
    pub fn new(user: &str, name: &str) -> Result<Self, Error> {
        Ok(Self {
            user: parse_name(user, "user name")?,
            name: parse_name(name, "entity name")?,
        })
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.name)
    }
}

impl FromStr for EntityPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (user, name) = s
            .split_once('/')
            .ok_or_else(|| Error::bad_request(format!("invalid entity path '{s}'")))?;
        Self::new(user, name)
    }
}

/// A `<cloud>/<user>/<name>` path identifying a credential.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct CredentialPath {
    pub cloud: String,
    pub user: String,
    pub name: String,
}

impl CredentialPath {
    /// Build a path, validating all components.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] on an invalid component.
    pub fn new(cloud: &str, user: &str, name: &str) -> Result<Self, Error> {
        Ok(Self {
            cloud: parse_name(cloud, "cloud name")?,
            user: parse_name(user, "user name")?,
            name: parse_name(name, "credential name")?,
        })
    }
}

impl fmt::Display for CredentialPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cloud, self.user, self.name)
    }
}

impl FromStr for CredentialPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [cloud, user, name] => Self::new(cloud, user, name),
            _ => Err(Error::bad_request(format!("invalid credential path '{s}'"))),
        }
    }
}

/// An offer URL `<user>/<model>.<offer-name>` — the alternate key of an
/// application offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OfferUrl {
    pub user: String,
    pub model: String,
    pub name: String,
}

impl OfferUrl {
    /// Build an offer URL, validating all components.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] on an invalid component.
    pub fn new(user: &str, model: &str, name: &str) -> Result<Self, Error> {
        Ok(Self {
            user: parse_name(user, "user name")?,
            model: parse_name(model, "model name")?,
            name: parse_name(name, "offer name")?,
        })
    }
}

impl fmt::Display for OfferUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.user, self.model, self.name)
    }
}

impl FromStr for OfferUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let bad = || Error::bad_request(format!("invalid offer URL '{s}'"));
        let (user, rest) = s.split_once('/').ok_or_else(bad)?;
        let (model, name) = rest.split_once('.').ok_or_else(bad)?;
        Self::new(user, model, name)
    }
}

// Offer URLs are stored and queried as plain strings.
impl Serialize for OfferUrl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OfferUrl {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
