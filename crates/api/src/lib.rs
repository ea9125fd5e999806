//! kcal public API façade (in-process).
//!
//! This crate defines the operation surface callers (CLI today) depend on, and wires the
//! record store and cluster handles into the dual-write coordinator and reconciling reader.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use kcal_core::{CalendarEvent, Deployment, EventSpec, NamespaceStats, ScalingTarget, ValidationError};
use kcal_kubehub::{ClusterSource, KubeCluster};
use kcal_persist::{Filter, Projection, SqliteStore, Store, CALENDAR_EVENTS, DEPLOYMENTS, INTERNAL_ID, SCALED_OBJECTS};
use serde::{Deserialize, Serialize};
use tracing::info;

mod coordinator;
mod journal;
mod reader;
pub mod records;

pub use coordinator::target_name;
pub use journal::{DualWriteIntent, DualWriteOp};
pub use reader::Source;

use coordinator::Coordinator;
use reader::ReconcilingReader;

/// API errors suitable for transport to a caller.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KcalError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl KcalError {
    pub fn internal(e: anyhow::Error) -> Self { KcalError::Internal(format!("{:#}", e)) }

    pub(crate) fn event_not_found(id: &str) -> Self { KcalError::NotFound(format!("event {} not found", id)) }
}

impl From<ValidationError> for KcalError {
    fn from(e: ValidationError) -> Self { KcalError::Validation(e.to_string()) }
}

pub type KcalResult<T> = Result<T, KcalError>;

/// Runtime configuration, read from `KCAL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Namespace for scaling targets created from events; also the stats name.
    pub namespace: String,
    pub cluster_enabled: bool,
    pub cluster_timeout: Duration,
    /// Upper bound on records returned by list operations.
    pub list_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: "keda-system".to_string(),
            cluster_enabled: true,
            cluster_timeout: kcal_kubehub::DEFAULT_TIMEOUT,
            list_limit: 1000,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Settings::default();
        let namespace = std::env::var("KCAL_NAMESPACE").ok().filter(|s| !s.is_empty()).unwrap_or(d.namespace);
        let cluster_enabled = !matches!(std::env::var("KCAL_CLUSTER").ok().as_deref(), Some("off" | "false" | "0"));
        let cluster_timeout = std::env::var("KCAL_CLUSTER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.cluster_timeout);
        let list_limit = std::env::var("KCAL_LIST_LIMIT").ok().and_then(|s| s.parse().ok()).unwrap_or(d.list_limit);
        Self { namespace, cluster_enabled, cluster_timeout, list_limit }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct About {
    pub message: String,
    pub version: String,
}

/// Operation surface exposed to callers.
#[async_trait::async_trait]
pub trait KcalApi: Send + Sync {
    async fn about(&self) -> About;

    async fn namespace_stats(&self) -> KcalResult<NamespaceStats>;

    async fn list_deployments(&self) -> KcalResult<Vec<Deployment>>;
    async fn create_deployment(&self, deployment: Deployment) -> KcalResult<Deployment>;

    async fn list_events(&self) -> KcalResult<Vec<CalendarEvent>>;
    /// Create an event together with the scaling target it owns.
    async fn create_event(&self, spec: EventSpec) -> KcalResult<CalendarEvent>;
    async fn get_event(&self, id: &str) -> KcalResult<CalendarEvent>;
    /// Rewrite an event's own fields. Its scaling target is left untouched.
    async fn update_event(&self, id: &str, spec: EventSpec) -> KcalResult<CalendarEvent>;
    /// Delete an event and the scaling target it owns.
    async fn delete_event(&self, id: &str) -> KcalResult<()>;

    /// Live ScaledObjects from the cluster, or the cached copies when the cluster is unavailable.
    async fn list_scaling_targets(&self) -> KcalResult<Vec<ScalingTarget>>;

    /// Dual writes that started but never finished.
    async fn pending_dual_writes(&self) -> KcalResult<Vec<DualWriteIntent>>;
}

// ----------------- In-process implementation -----------------

/// In-process implementation over explicitly passed store and cluster handles.
pub struct InProcApi {
    store: Arc<dyn Store>,
    settings: Settings,
    coordinator: Coordinator,
    reader: ReconcilingReader,
}

impl InProcApi {
    pub fn new(store: Arc<dyn Store>, cluster: Arc<dyn ClusterSource>, settings: Settings) -> Self {
        let coordinator = Coordinator::new(store.clone(), settings.namespace.clone(), settings.list_limit);
        let reader = ReconcilingReader::new(cluster, store.clone(), settings.list_limit, settings.cluster_timeout);
        Self { store, settings, coordinator, reader }
    }

    /// Default SQLite store plus a kube client (or a disabled source when `KCAL_CLUSTER=off`).
    pub async fn from_env() -> anyhow::Result<Self> {
        let settings = Settings::from_env();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_default()?);
        Ok(Self::with_store(store, settings).await)
    }

    /// Connect the cluster source per `settings` around an existing store.
    pub async fn with_store(store: Arc<dyn Store>, settings: Settings) -> Self {
        let cluster = if settings.cluster_enabled {
            KubeCluster::connect(settings.cluster_timeout).await
        } else {
            KubeCluster::disabled("disabled by KCAL_CLUSTER")
        };
        Self::new(store, Arc::new(cluster), settings)
    }

    pub fn settings(&self) -> &Settings { &self.settings }

    /// Like `list_scaling_targets`, also reporting which view answered.
    pub async fn scaling_targets_with_source(&self) -> KcalResult<(Vec<ScalingTarget>, Source)> {
        self.reader.list().await
    }

    fn count(&self, collection: &str, filter: &Filter) -> KcalResult<u64> {
        self.store.count(collection, filter).map_err(KcalError::internal)
    }
}

#[async_trait::async_trait]
impl KcalApi for InProcApi {
    async fn about(&self) -> About {
        About { message: "KEDA Calendar Control Center API".to_string(), version: env!("CARGO_PKG_VERSION").to_string() }
    }

    async fn namespace_stats(&self) -> KcalResult<NamespaceStats> {
        let t0 = Instant::now();
        let stats = NamespaceStats {
            name: self.settings.namespace.clone(),
            total_events: self.count(CALENDAR_EVENTS, &Filter::all())?,
            total_deployments: self.count(DEPLOYMENTS, &Filter::all())?,
            total_scaling_targets: self.count(SCALED_OBJECTS, &Filter::all())?,
            active_events: self.count(CALENDAR_EVENTS, &Filter::eq("status", "active"))?,
        };
        info!(events = stats.total_events, active = stats.active_events, took_ms = %t0.elapsed().as_millis(), "api: namespace_stats ok");
        Ok(stats)
    }

    async fn list_deployments(&self) -> KcalResult<Vec<Deployment>> {
        self.store
            .find_all(DEPLOYMENTS, Projection::Without(&[INTERNAL_ID]), self.settings.list_limit)
            .map_err(KcalError::internal)?
            .into_iter()
            .map(|d| records::from_doc(d).map_err(KcalError::internal))
            .collect()
    }

    async fn create_deployment(&self, deployment: Deployment) -> KcalResult<Deployment> {
        let doc = records::to_doc(&deployment).map_err(KcalError::internal)?;
        self.store.insert_one(DEPLOYMENTS, doc).map_err(KcalError::internal)?;
        info!(id = %deployment.id, name = %deployment.name, ns = %deployment.namespace, "api: deployment created");
        Ok(deployment)
    }

    async fn list_events(&self) -> KcalResult<Vec<CalendarEvent>> {
        let t0 = Instant::now();
        let events = self.coordinator.list()?;
        info!(count = events.len(), took_ms = %t0.elapsed().as_millis(), "api: list_events ok");
        Ok(events)
    }

    async fn create_event(&self, spec: EventSpec) -> KcalResult<CalendarEvent> {
        info!(title = %spec.title, workload = %spec.target_workload, trigger = %spec.trigger_type, "api: create_event start");
        self.coordinator.create(&spec)
    }

    async fn get_event(&self, id: &str) -> KcalResult<CalendarEvent> {
        self.coordinator.get(id)
    }

    async fn update_event(&self, id: &str, spec: EventSpec) -> KcalResult<CalendarEvent> {
        info!(id, trigger = %spec.trigger_type, "api: update_event start");
        self.coordinator.update(id, &spec)
    }

    async fn delete_event(&self, id: &str) -> KcalResult<()> {
        info!(id, "api: delete_event start");
        self.coordinator.delete(id)
    }

    async fn list_scaling_targets(&self) -> KcalResult<Vec<ScalingTarget>> {
        self.reader.list().await.map(|(items, _)| items)
    }

    async fn pending_dual_writes(&self) -> KcalResult<Vec<DualWriteIntent>> {
        self.coordinator.journal().pending(self.settings.list_limit)
    }
}
