//! kcal kubehub – KEDA `ScaledObject` listing and translation into `ScalingTarget`s.
//!
//! The cluster is read-only from here: objects are observed, never written.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kcal_core::{new_id, Labels, Metadata, ReplicaBounds, ScalingTarget, TargetKind, TriggerDefinition, TriggerType};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, info, warn};

pub use kube::core::DynamicObject as ScaledObject;

pub const GROUP: &str = "keda.sh";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "ScaledObject";
pub const PLURAL: &str = "scaledobjects";

/// Default bound on a single cluster round-trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the cluster view is unavailable. Never surfaced past the reconciling reader.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster integration disabled: {0}")]
    Disabled(String),
    #[error("cluster request timed out after {0:?}")]
    Timeout(Duration),
    #[error("cluster api: {0}")]
    Api(#[from] kube::Error),
    #[error("decoding ScaledObject: {0}")]
    Decode(String),
}

/// Read access to the live set of ScaledObjects.
#[async_trait::async_trait]
pub trait ClusterSource: Send + Sync {
    /// List ScaledObjects across every namespace the credentials can see.
    async fn list_scaled_objects(&self) -> Result<Vec<DynamicObject>, ClusterError>;
}

pub fn scaled_object_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(GROUP, VERSION, KIND), PLURAL)
}

/// kube-rs backed source. Holds no client when config could not be loaded.
pub struct KubeCluster {
    client: Option<Client>,
    disabled_reason: String,
    timeout: Duration,
}

impl KubeCluster {
    /// Load in-cluster config, falling back to kubeconfig. Failure disables the integration.
    pub async fn connect(timeout: Duration) -> Self {
        match tokio::time::timeout(timeout, Client::try_default()).await {
            Ok(Ok(client)) => {
                info!(timeout_ms = %timeout.as_millis(), "cluster client ready");
                Self { client: Some(client), disabled_reason: String::new(), timeout }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "could not load Kubernetes config; cluster integration disabled");
                Self::disabled(e.to_string())
            }
            Err(_) => {
                warn!(timeout_ms = %timeout.as_millis(), "loading Kubernetes config timed out; cluster integration disabled");
                Self::disabled("config load timed out")
            }
        }
    }

    pub fn disabled(reason: impl Into<String>) -> Self {
        Self { client: None, disabled_reason: reason.into(), timeout: DEFAULT_TIMEOUT }
    }

    pub fn is_enabled(&self) -> bool { self.client.is_some() }
}

#[async_trait::async_trait]
impl ClusterSource for KubeCluster {
    async fn list_scaled_objects(&self) -> Result<Vec<DynamicObject>, ClusterError> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| ClusterError::Disabled(self.disabled_reason.clone()))?;
        let started = Instant::now();
        let api: Api<DynamicObject> = Api::all_with(client, &scaled_object_resource());
        let list = tokio::time::timeout(self.timeout, api.list(&ListParams::default()))
            .await
            .map_err(|_| ClusterError::Timeout(self.timeout))??;
        histogram!("cluster_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("cluster_list_total", 1u64);
        debug!(count = list.items.len(), took_ms = %started.elapsed().as_millis(), "listed ScaledObjects");
        Ok(list.items)
    }
}

fn replica_count(spec: &Value, field: &str) -> Result<Option<u32>, ClusterError> {
    match spec.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| ClusterError::Decode(format!("spec.{} is not a replica count: {}", field, v))),
    }
}

fn target_kind(scale_ref: &Value) -> TargetKind {
    match scale_ref.get("kind").and_then(Value::as_str).map(str::to_ascii_lowercase).as_deref() {
        Some("statefulset") => TargetKind::Statefulset,
        Some("job") => TargetKind::Job,
        _ => TargetKind::Deployment,
    }
}

fn trigger_from(entry: &Value) -> Result<TriggerDefinition, ClusterError> {
    // Only an absent type defaults to custom; an unknown scaler name fails the whole object.
    let trigger_type = match entry.get("type") {
        None | Some(Value::Null) => TriggerType::Custom,
        Some(Value::String(raw)) => raw
            .parse::<TriggerType>()
            .map_err(|e| ClusterError::Decode(format!("spec.triggers[].type: {}", e)))?,
        Some(other) => return Err(ClusterError::Decode(format!("spec.triggers[].type is not a string: {}", other))),
    };
    let metadata: Metadata = entry
        .get("metadata")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    // The ScaledObject schema carries no per-trigger replica target.
    Ok(TriggerDefinition { trigger_type, cron_expression: None, desired_replicas: 1, metadata })
}

/// Translate a cluster ScaledObject into the canonical `ScalingTarget`.
pub fn scaling_target_from_object(obj: &DynamicObject, now: DateTime<Utc>) -> Result<ScalingTarget, ClusterError> {
    let meta = &obj.metadata;
    let name = meta
        .name
        .clone()
        .ok_or_else(|| ClusterError::Decode("object missing metadata.name".into()))?;
    let empty = Value::Object(Default::default());
    let spec = obj.data.get("spec").unwrap_or(&empty);
    let scale_ref = spec.get("scaleTargetRef").unwrap_or(&empty);
    let bounds = ReplicaBounds::normalized(
        replica_count(spec, "minReplicaCount")?,
        replica_count(spec, "maxReplicaCount")?,
    );
    let triggers = match spec.get("triggers").and_then(Value::as_array) {
        Some(arr) => arr.iter().map(trigger_from).collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    let labels: Labels = meta.labels.clone().unwrap_or_default();

    Ok(ScalingTarget {
        id: meta.uid.clone().unwrap_or_else(new_id),
        name,
        namespace: meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
        target_workload: scale_ref.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
        target_kind: target_kind(scale_ref),
        min_replicas: bounds.min,
        max_replicas: bounds.max,
        triggers,
        labels,
        created_at: meta.creation_timestamp.as_ref().map(|t| t.0).unwrap_or(now),
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn object(v: Value) -> DynamicObject {
        serde_json::from_value(v).expect("valid DynamicObject")
    }

    fn now() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() }

    #[test]
    fn translates_full_object() {
        let obj = object(json!({
            "apiVersion": "keda.sh/v1alpha1",
            "kind": "ScaledObject",
            "metadata": {
                "name": "orders-so",
                "namespace": "shop",
                "uid": "0b7c6a52-4f5e-4a7e-9d55-1a2b3c4d5e6f",
                "labels": { "team": "payments" },
                "creationTimestamp": "2024-05-01T08:00:00Z"
            },
            "spec": {
                "scaleTargetRef": { "name": "orders", "kind": "StatefulSet" },
                "minReplicaCount": 2,
                "maxReplicaCount": 20,
                "triggers": [
                    { "type": "kafka", "metadata": { "topic": "orders", "lagThreshold": "50" } },
                    { "type": "cron", "metadata": { "start": "0 9 * * *", "end": "0 18 * * *" } }
                ]
            }
        }));
        let st = scaling_target_from_object(&obj, now()).unwrap();
        assert_eq!(st.id, "0b7c6a52-4f5e-4a7e-9d55-1a2b3c4d5e6f");
        assert_eq!(st.name, "orders-so");
        assert_eq!(st.namespace, "shop");
        assert_eq!(st.target_workload, "orders");
        assert_eq!(st.target_kind, TargetKind::Statefulset);
        assert_eq!((st.min_replicas, st.max_replicas), (2, 20));
        assert_eq!(st.labels.get("team").map(String::as_str), Some("payments"));
        assert_eq!(st.created_at, Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
        assert_eq!(st.updated_at, now());
        assert_eq!(st.triggers.len(), 2);
        assert_eq!(st.triggers[0].trigger_type, TriggerType::Kafka);
        assert_eq!(st.triggers[0].metadata["topic"], json!("orders"));
        assert_eq!(st.triggers[1].trigger_type, TriggerType::Cron);
        assert!(st.triggers.iter().all(|t| t.desired_replicas == 1 && t.cron_expression.is_none()));
    }

    #[test]
    fn sparse_object_gets_defaults() {
        let obj = object(json!({
            "apiVersion": "keda.sh/v1alpha1",
            "kind": "ScaledObject",
            "metadata": { "name": "bare" },
            "spec": { "triggers": [ { "metadata": {} } ] }
        }));
        let st = scaling_target_from_object(&obj, now()).unwrap();
        assert_eq!(st.namespace, "default");
        assert_eq!(st.target_workload, "");
        assert_eq!(st.target_kind, TargetKind::Deployment);
        assert_eq!((st.min_replicas, st.max_replicas), (0, 10));
        assert_eq!(st.created_at, now());
        assert!(!st.id.is_empty());
        assert!(st.labels.is_empty());
        assert_eq!(st.triggers.len(), 1);
        assert_eq!(st.triggers[0].trigger_type, TriggerType::Custom);
    }

    #[test]
    fn unrecognized_trigger_type_is_a_decode_error() {
        let obj = object(json!({
            "apiVersion": "keda.sh/v1alpha1",
            "kind": "ScaledObject",
            "metadata": { "name": "rabbit" },
            "spec": { "triggers": [ { "type": "cron", "metadata": {} }, { "type": "rabbitmq" } ] }
        }));
        let err = scaling_target_from_object(&obj, now()).unwrap_err();
        assert!(matches!(err, ClusterError::Decode(ref m) if m.contains("rabbitmq")), "{err}");

        let numeric = object(json!({
            "apiVersion": "keda.sh/v1alpha1",
            "kind": "ScaledObject",
            "metadata": { "name": "num" },
            "spec": { "triggers": [ { "type": 7 } ] }
        }));
        assert!(matches!(scaling_target_from_object(&numeric, now()), Err(ClusterError::Decode(_))));
    }

    #[test]
    fn inverted_bounds_are_repaired() {
        let obj = object(json!({
            "apiVersion": "keda.sh/v1alpha1",
            "kind": "ScaledObject",
            "metadata": { "name": "odd" },
            "spec": { "minReplicaCount": 15 }
        }));
        let st = scaling_target_from_object(&obj, now()).unwrap();
        assert_eq!((st.min_replicas, st.max_replicas), (15, 15));
    }

    #[test]
    fn undecodable_objects_are_errors() {
        let nameless = object(json!({ "apiVersion": "keda.sh/v1alpha1", "kind": "ScaledObject", "metadata": {} }));
        assert!(matches!(scaling_target_from_object(&nameless, now()), Err(ClusterError::Decode(_))));
        let negative = object(json!({
            "apiVersion": "keda.sh/v1alpha1",
            "kind": "ScaledObject",
            "metadata": { "name": "neg" },
            "spec": { "minReplicaCount": -1 }
        }));
        assert!(matches!(scaling_target_from_object(&negative, now()), Err(ClusterError::Decode(_))));
    }

    #[test]
    fn resource_points_at_keda() {
        let ar = scaled_object_resource();
        assert_eq!(ar.group, "keda.sh");
        assert_eq!(ar.version, "v1alpha1");
        assert_eq!(ar.plural, "scaledobjects");
        assert_eq!(ar.api_version, "keda.sh/v1alpha1");
    }

    #[tokio::test]
    async fn disabled_source_reports_disabled() {
        let src = KubeCluster::disabled("no kubeconfig");
        assert!(!src.is_enabled());
        let err = src.list_scaled_objects().await.unwrap_err();
        assert!(matches!(err, ClusterError::Disabled(ref r) if r == "no kubeconfig"));
    }
}
