//! Model documents and the time-weighted entity counts the monitor folds
//! into them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use fleetmux_store::Document;
use serde::{Deserialize, Serialize};

use super::acl::Acl;
use super::path::{CredentialPath, EntityPath};
use crate::error::Error;

/// Collection name for [`Model`] documents.
pub const MODELS: &str = "models";

/// Count kind: applications in a model.
pub const COUNT_APPLICATIONS: &str = "applications";
/// Count kind: machines in a model.
pub const COUNT_MACHINES: &str = "machines";
/// Count kind: units in a model.
pub const COUNT_UNITS: &str = "units";

/// Lifecycle phase of a model, machine, or application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

impl Life {
    /// True for [`Life::Dead`].
    #[must_use]
    pub fn is_dead(self) -> bool {
        matches!(self, Life::Dead)
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl FromStr for Life {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "alive" => Ok(Life::Alive),
            "dying" => Ok(Life::Dying),
            "dead" => Ok(Life::Dead),
            _ => Err(Error::bad_request(format!("invalid life '{s}'"))),
        }
    }
}

/// Current status of a model as reported by its controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
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

/// Monitor-maintained snapshot of a model's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub life: Life,
    #[serde(default)]
    pub status: ModelStatus,
}

/// A time-weighted statistic for one count kind.
///
/// `total_time_ms` integrates `current` over time in milliseconds; `total`
/// accumulates only growth, so it is the number of entities ever seen, not a
/// high-water mark (that is `max`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Count {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub max: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub total_time_ms: u64,
}

impl Count {
    /// The count after a first observation of `value` at `now`.
    #[must_use]
    pub fn first(now: DateTime<Utc>, value: u64) -> Self {
        Self {
            time: now,
            current: value,
            max: value,
            total: value,
            total_time_ms: 0,
        }
    }

    /// Fold a new observation into the statistic.
    ///
    /// Time credit accrues at the previous `current` value for the elapsed
    /// interval, truncated to milliseconds; an interval under 1ms accrues
    /// nothing, which makes the fold idempotent for repeated observations
    /// with the same timestamp. Only growth adds to `total`.
    pub fn observe(&mut self, now: DateTime<Utc>, value: u64) {
        let elapsed_ms = now.signed_duration_since(self.time).num_milliseconds();
        if elapsed_ms >= 1 {
            let credit = u64::try_from(elapsed_ms).unwrap_or(0);
            self.total_time_ms = self.total_time_ms.saturating_add(credit.saturating_mul(self.current));
            self.time = now;
        }
        self.total = self.total.saturating_add(value.saturating_sub(self.current));
        self.max = self.max.max(value);
        self.current = value;
    }
}

/// A workload namespace owned by a controller.
///
/// `(controller, uuid)` identifies at most one model; dead models are
/// removed from the catalog by the monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    pub path: EntityPath,
    #[serde(default)]
    pub uuid: String,
    /// Path of the owning controller.
    pub controller: EntityPath,
    #[serde(default)]
    pub cloud: String,
    #[serde(default)]
    pub cloud_region: String,
    #[serde(default)]
    pub credential: CredentialPath,
    #[serde(default)]
    pub acl: Acl,
    /// Time-weighted statistics per count kind.
    #[serde(default)]
    pub counts: BTreeMap<String, Count>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ModelInfo>,
    #[serde(default, rename = "type")]
    pub model_type: String,
}

impl Model {
    /// A model at the given path; remaining fields default.
    #[must_use]
    pub fn with_path(path: EntityPath) -> Self {
        Self {
            path,
            ..Self::default()
        }
    }

    /// The model's life phase, defaulting to alive when the monitor has not
    /// reported yet.
    #[must_use]
    pub fn life(&self) -> Life {
        self.info.as_ref().map_or(Life::Alive, |info| info.life)
    }
}

impl Document for Model {
    fn collection() -> &'static str {
        MODELS
    }

    fn key(&self) -> String {
        self.path.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn first_observation_counts_as_total() {
        let count = Count::first(at(1_000), 5);
        assert_eq!(count.current, 5);
        assert_eq!(count.max, 5);
        assert_eq!(count.total, 5);
        assert_eq!(count.total_time_ms, 0);
    }

    #[test]
    fn observe_accrues_time_at_previous_value() {
        let mut count = Count::first(at(0), 5);
        count.observe(at(4_000), 2);
        assert_eq!(count.current, 2);
        assert_eq!(count.max, 5);
        assert_eq!(count.total, 5);
        assert_eq!(count.total_time_ms, 20_000);
        assert_eq!(count.time, at(4_000));
    }

    #[test]
    fn observe_growth_adds_to_total() {
        let mut count = Count::first(at(0), 20);
        count.observe(at(4_000), 50);
        assert_eq!(count.current, 50);
        assert_eq!(count.max, 50);
        assert_eq!(count.total, 50);
        assert_eq!(count.total_time_ms, 80_000);
    }

    #[test]
    fn observe_is_idempotent_within_a_millisecond() {
        let mut once = Count::first(at(0), 5);
        once.observe(at(4_000), 7);
        let mut twice = Count::first(at(0), 5);
        twice.observe(at(4_000), 7);
        twice.observe(at(4_000), 7);
        assert_eq!(once, twice);
    }

    #[test]
    fn totals_never_decrease() {
        let mut count = Count::first(at(0), 3);
        let mut last_total = count.total;
        let mut last_time = count.total_time_ms;
        for (ms, value) in [(1_000, 5), (2_000, 1), (2_000, 9), (5_000, 0), (9_000, 4)] {
            count.observe(at(ms), value);
            assert!(count.total >= last_total);
            assert!(count.total_time_ms >= last_time);
            last_total = count.total;
            last_time = count.total_time_ms;
        }
    }

    #[test]
    fn life_defaults_to_alive() {
        let model = Model::with_path("bob/m1".parse().unwrap());
        assert_eq!(model.life(), Life::Alive);
    }
}
