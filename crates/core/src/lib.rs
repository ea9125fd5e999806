//! kcal core types: trigger definitions, scaling targets and calendar events.
//!
//! These are the canonical in-memory shapes. Both the record store and the cluster
//! translate into them; nothing downstream should be able to tell which source an
//! object came from.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod color;
pub mod time;

pub use color::{color_for_name, derive_color};

/// Free-form trigger/event metadata.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Kubernetes-style labels.
pub type Labels = BTreeMap<String, String>;

/// Validation failures raised while normalizing caller input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid timestamp: {0:?}")]
    Timestamp(String),
    #[error("unrecognized trigger type: {0:?}")]
    TriggerType(String),
    #[error("event ends before it starts ({end} < {start})")]
    EndBeforeStart { start: String, end: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Cron,
    MessageQueue,
    Kafka,
    Http,
    Prometheus,
    Custom,
}

impl TriggerType {
    pub const ALL: [TriggerType; 6] = [
        TriggerType::Cron,
        TriggerType::MessageQueue,
        TriggerType::Kafka,
        TriggerType::Http,
        TriggerType::Prometheus,
        TriggerType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Cron => "cron",
            TriggerType::MessageQueue => "message_queue",
            TriggerType::Kafka => "kafka",
            TriggerType::Http => "http",
            TriggerType::Prometheus => "prometheus",
            TriggerType::Custom => "custom",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for TriggerType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::TriggerType(s.to_string()))
    }
}

/// Kind of workload a scaling target points at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[default]
    Deployment,
    Statefulset,
    Job,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Scheduled,
    Active,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::Active => "active",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }
}

fn default_desired_replicas() -> u32 { 1 }
fn default_namespace() -> String { "default".to_string() }
fn default_max_replicas() -> u32 { ReplicaBounds::DEFAULT_MAX }

/// Generate an opaque identifier for records that do not come from the cluster.
pub fn new_id() -> String { uuid::Uuid::new_v4().to_string() }

/// One scaling rule. `cron_expression` is advisory even for cron triggers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerDefinition {
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default = "default_desired_replicas")]
    pub desired_replicas: u32,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Replica bounds with `max >= min` restored when a source violates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaBounds {
    pub min: u32,
    pub max: u32,
}

impl ReplicaBounds {
    pub const DEFAULT_MIN: u32 = 0;
    pub const DEFAULT_MAX: u32 = 10;

    /// Apply the defaults for missing values and raise `max` to `min` when inverted.
    pub fn normalized(min: Option<u32>, max: Option<u32>) -> Self {
        let min = min.unwrap_or(Self::DEFAULT_MIN);
        let max = max.unwrap_or(Self::DEFAULT_MAX).max(min);
        Self { min, max }
    }
}

impl Default for ReplicaBounds {
    fn default() -> Self { Self { min: Self::DEFAULT_MIN, max: Self::DEFAULT_MAX } }
}

/// Binds a workload to triggers and replica bounds (a KEDA `ScaledObject`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingTarget {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub target_workload: String,
    #[serde(default)]
    pub target_kind: TargetKind,
    #[serde(default)]
    pub min_replicas: u32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    pub triggers: Vec<TriggerDefinition>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(with = "time::iso")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "time::iso")]
    pub updated_at: DateTime<Utc>,
}

impl ScalingTarget {
    pub fn bounds(&self) -> ReplicaBounds {
        ReplicaBounds { min: self.min_replicas, max: self.max_replicas }
    }

    /// Re-apply replica bound normalization in place.
    pub fn normalize(&mut self) {
        let b = ReplicaBounds::normalized(Some(self.min_replicas), Some(self.max_replicas));
        self.min_replicas = b.min;
        self.max_replicas = b.max;
    }
}

/// A scheduled occurrence owning exactly one scaling target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    #[serde(with = "time::iso")]
    pub start: DateTime<Utc>,
    #[serde(default, with = "time::iso_opt")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub all_day: bool,
    pub trigger_type: TriggerType,
    pub scaling_target_id: String,
    pub target_workload: String,
    pub desired_replicas: u32,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub status: EventStatus,
    pub color: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(with = "time::iso")]
    pub created_at: DateTime<Utc>,
}

/// Caller input for creating or updating an event. Timestamps stay strings until validated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventSpec {
    pub title: String,
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub all_day: bool,
    pub trigger_type: TriggerType,
    pub target_workload: String,
    #[serde(default = "default_desired_replicas")]
    pub desired_replicas: u32,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Validated event window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWindow {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl EventSpec {
    /// Parse `start`/`end` and check that the window is not inverted.
    pub fn window(&self) -> Result<EventWindow, ValidationError> {
        let start = time::parse_timestamp(&self.start)?;
        let end = match self.end.as_deref() {
            Some(s) => Some(time::parse_timestamp(s)?),
            None => None,
        };
        if let Some(end) = end {
            if end < start {
                return Err(ValidationError::EndBeforeStart { start: self.start.clone(), end: self.end.clone().unwrap_or_default() });
            }
        }
        Ok(EventWindow { start, end })
    }

    /// The single trigger an event materializes as.
    pub fn trigger(&self) -> TriggerDefinition {
        TriggerDefinition {
            trigger_type: self.trigger_type,
            cron_expression: self.cron_expression.clone(),
            desired_replicas: self.desired_replicas,
            metadata: self.metadata.clone(),
        }
    }
}

/// Plain cached deployment metadata (no cluster sync).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub current_replicas: u32,
    #[serde(default)]
    pub labels: Labels,
}

impl Deployment {
    pub fn new(name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            namespace: namespace.unwrap_or_else(default_namespace),
            current_replicas: 0,
            labels: Labels::new(),
        }
    }
}

/// Record counts for the managed namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NamespaceStats {
    pub name: String,
    pub total_events: u64,
    pub total_deployments: u64,
    pub total_scaling_targets: u64,
    pub active_events: u64,
}

pub mod prelude {
    pub use super::{
        CalendarEvent, Deployment, EventSpec, EventStatus, EventWindow, Labels, Metadata, NamespaceStats,
        ReplicaBounds, ScalingTarget, TargetKind, TriggerDefinition, TriggerType, ValidationError,
    };
    pub use super::{derive_color, new_id};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(start: &str, end: Option<&str>) -> EventSpec {
        EventSpec {
            title: "morning peak".into(),
            start: start.into(),
            end: end.map(|s| s.to_string()),
            all_day: false,
            trigger_type: TriggerType::Cron,
            target_workload: "api".into(),
            desired_replicas: 3,
            cron_expression: Some("*/5 * * * *".into()),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn trigger_type_parses_known_names_only() {
        for t in TriggerType::ALL {
            assert_eq!(t.as_str().parse::<TriggerType>().unwrap(), t);
        }
        assert_eq!("rabbitmq".parse::<TriggerType>(), Err(ValidationError::TriggerType("rabbitmq".into())));
        assert!(serde_json::from_value::<TriggerType>(serde_json::json!("sqs")).is_err());
    }

    #[test]
    fn bounds_default_and_repair() {
        assert_eq!(ReplicaBounds::normalized(None, None), ReplicaBounds { min: 0, max: 10 });
        assert_eq!(ReplicaBounds::normalized(Some(12), None), ReplicaBounds { min: 12, max: 12 });
        assert_eq!(ReplicaBounds::normalized(Some(2), Some(5)), ReplicaBounds { min: 2, max: 5 });
    }

    #[test]
    fn window_rejects_inverted_range() {
        assert!(spec("2024-05-01T09:00:00Z", Some("2024-05-01T10:00:00Z")).window().is_ok());
        assert!(spec("2024-05-01T09:00:00Z", None).window().is_ok());
        let err = spec("2024-05-01T09:00:00Z", Some("2024-05-01T08:00:00Z")).window().unwrap_err();
        assert!(matches!(err, ValidationError::EndBeforeStart { .. }));
        assert!(matches!(spec("nine o'clock", None).window(), Err(ValidationError::Timestamp(_))));
    }

    #[test]
    fn cron_expression_is_optional_for_cron_triggers() {
        let mut s = spec("2024-05-01T09:00:00Z", None);
        s.cron_expression = None;
        let t = s.trigger();
        assert_eq!(t.trigger_type, TriggerType::Cron);
        assert!(t.cron_expression.is_none());
    }

    #[test]
    fn scaling_target_defaults_from_sparse_record() {
        let v = serde_json::json!({
            "name": "scaled-api-1",
            "target_workload": "api",
            "triggers": [{ "trigger_type": "kafka" }],
            "created_at": "2024-05-01T09:00:00+00:00",
            "updated_at": "2024-05-01T09:00:00Z",
        });
        let st: ScalingTarget = serde_json::from_value(v).unwrap();
        assert_eq!(st.namespace, "default");
        assert_eq!(st.target_kind, TargetKind::Deployment);
        assert_eq!(st.bounds(), ReplicaBounds::default());
        assert_eq!(st.triggers[0].desired_replicas, 1);
        assert!(!st.id.is_empty());
    }
}
