//! Access-control primitives shared by all catalog entities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The pseudo-user whose permission represents public access.
pub const EVERYONE: &str = "everyone";

/// A per-entity ACL: principal lists for each access class.
///
/// Entries are user or group names. Membership is evaluated by the access
/// checker against the caller's expanded identity (user plus groups), with
/// [`EVERYONE`] implicitly granting to all callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
    #[serde(default)]
    pub admin: Vec<String>,
}

/// A totally ordered permission level used by permission-map entities.
///
/// Serialized as its numeric level so that `users.<name> >= consume` is a
/// plain numeric predicate in catalog queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Permission {
    #[default]
    None = 0,
    Read = 1,
    Consume = 2,
    Admin = 3,
}

impl Permission {
    /// All levels in ascending order.
    pub const ALL: [Permission; 4] = [
        Permission::None,
        Permission::Read,
        Permission::Consume,
        Permission::Admin,
    ];

    /// Numeric level, as stored in permission maps.
    #[must_use]
    pub fn level(self) -> u8 {
        self as u8
    }

    /// The next level down; revoking level `L` leaves at most this.
    #[must_use]
    pub fn below(self) -> Permission {
        match self {
            Permission::None | Permission::Read => Permission::None,
            Permission::Consume => Permission::Read,
            Permission::Admin => Permission::Consume,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Permission::None => "none",
            Permission::Read => "read",
            Permission::Consume => "consume",
            Permission::Admin => "admin",
        };
        f.write_str(s)
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "none" => Ok(Permission::None),
            "read" => Ok(Permission::Read),
            "consume" => Ok(Permission::Consume),
            "admin" => Ok(Permission::Admin),
            _ => Err(Error::bad_request(format!("invalid permission '{s}'"))),
        }
    }
}

impl Serialize for Permission {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.level())
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Permission::None),
            1 => Ok(Permission::Read),
            2 => Ok(Permission::Consume),
            3 => Ok(Permission::Admin),
            n => Err(serde::de::Error::custom(format!(
                "invalid permission level {n}"
            ))),
        }
    }
}

impl From<Permission> for serde_json::Value {
    fn from(p: Permission) -> Self {
        serde_json::Value::from(p.level())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn permission_order() {
        assert!(Permission::None < Permission::Read);
        assert!(Permission::Read < Permission::Consume);
        assert!(Permission::Consume < Permission::Admin);
    }

    #[test]
    fn permission_below() {
        assert_eq!(Permission::Admin.below(), Permission::Consume);
        assert_eq!(Permission::Read.below(), Permission::None);
        assert_eq!(Permission::None.below(), Permission::None);
    }

    #[test]
    fn permission_serde_is_numeric() {
        let v = serde_json::to_value(Permission::Consume).unwrap();
        assert_eq!(v, serde_json::json!(2));
        let p: Permission = serde_json::from_value(serde_json::json!(3)).unwrap();
        assert_eq!(p, Permission::Admin);
        assert!(serde_json::from_value::<Permission>(serde_json::json!(7)).is_err());
    }

    #[test]
    fn permission_text_roundtrip() {
        for p in Permission::ALL {
            assert_eq!(p.to_string().parse::<Permission>().unwrap(), p);
        }
        assert!("owner".parse::<Permission>().is_err());
    }
}
