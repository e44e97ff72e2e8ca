//! Machine and application snapshots, denormalized per controller and model.
//!
//! Both are monitor-owned: upserted while alive, deleted the moment their
//! life is reported dead. Keys are `<controller-path> <model-uuid> <id>` —
//! space separated, since none of the components can contain a space.

use chrono::{DateTime, Utc};
use fleetmux_store::Document;
use serde::{Deserialize, Serialize};

use super::model::Life;
use super::path::EntityPath;

/// Collection name for [`Machine`] documents.
pub const MACHINES: &str = "machines";
/// Collection name for [`Application`] documents.
pub const APPLICATIONS: &str = "applications";

/// Status of a machine or application as reported by its controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub since: Option<DateTime<Utc>>,
}

/// Controller-reported machine state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub model_uuid: String,
    pub id: String,
    #[serde(default)]
    pub life: Life,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub status: ResourceStatus,
}

/// A machine snapshot in the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Machine {
    /// Path of the controller the machine lives under.
    pub controller: EntityPath,
    #[serde(default)]
    pub cloud: String,
    #[serde(default)]
    pub region: String,
    pub info: MachineInfo,
}

impl Machine {
    /// The key for a machine of the given model on the given controller.
    #[must_use]
    pub fn key_for(controller: &EntityPath, model_uuid: &str, id: &str) -> String {
        format!("{controller} {model_uuid} {id}")
    }
}

impl Document for Machine {
    fn collection() -> &'static str {
        MACHINES
    }

    fn key(&self) -> String {
        Self::key_for(&self.controller, &self.info.model_uuid, &self.info.id)
    }
}

/// Controller-reported application state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub model_uuid: String,
    pub name: String,
    #[serde(default)]
    pub life: Life,
    #[serde(default)]
    pub exposed: bool,
    #[serde(default)]
    pub unit_count: u64,
    #[serde(default)]
    pub status: ResourceStatus,
}

/// An application snapshot in the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Application {
    /// Path of the controller the application lives under.
    pub controller: EntityPath,
    #[serde(default)]
    pub cloud: String,
    #[serde(default)]
    pub region: String,
    pub info: ApplicationInfo,
}

impl Application {
    /// The key for an application of the given model on the given controller.
    #[must_use]
    pub fn key_for(controller: &EntityPath, model_uuid: &str, name: &str) -> String {
        format!("{controller} {model_uuid} {name}")
    }
}

impl Document for Application {
    fn collection() -> &'static str {
        APPLICATIONS
    }

    fn key(&self) -> String {
        Self::key_for(&self.controller, &self.info.model_uuid, &self.info.name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn machine_key_is_space_separated() {
        let machine = Machine {
            controller: "bob/prod".parse().unwrap(),
            info: MachineInfo {
                model_uuid: "m-uuid".into(),
                id: "7".into(),
                ..MachineInfo::default()
            },
            ..Machine::default()
        };
        assert_eq!(machine.key(), "bob/prod m-uuid 7");
    }

    #[test]
    fn application_key_uses_name() {
        let app = Application {
            controller: "bob/prod".parse().unwrap(),
            info: ApplicationInfo {
                model_uuid: "m-uuid".into(),
                name: "db".into(),
                ..ApplicationInfo::default()
            },
            ..Application::default()
        };
        assert_eq!(app.key(), "bob/prod m-uuid db");
    }
}
