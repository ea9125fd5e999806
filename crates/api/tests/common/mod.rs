#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use kcal_api::{InProcApi, Settings};
use kcal_core::{EventSpec, Metadata, TriggerType};
use kcal_kubehub::{ClusterError, ClusterSource, ScaledObject};
use kcal_persist::{Doc, Filter, MemStore, Projection, Store};
use serde_json::Value;

/// MemStore wrapper that counts writes and can refuse inserts into one collection.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemStore,
    pub writes: AtomicUsize,
    pub refuse_inserts_into: Option<&'static str>,
    pub refuse_deletes_from: Option<&'static str>,
}

impl FlakyStore {
    pub fn writes(&self) -> usize { self.writes.load(Ordering::SeqCst) }
}

impl Store for FlakyStore {
    fn insert_one(&self, collection: &str, doc: Doc) -> Result<()> {
        if self.refuse_inserts_into == Some(collection) {
            return Err(anyhow!("disk full while inserting into {}", collection));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.insert_one(collection, doc)
    }

    fn find_all(&self, collection: &str, projection: Projection<'_>, limit: usize) -> Result<Vec<Doc>> {
        self.inner.find_all(collection, projection, limit)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Doc>> {
        self.inner.find_one(collection, filter)
    }

    fn update_one(&self, collection: &str, filter: &Filter, set: Doc) -> Result<u64> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update_one(collection, filter, set)
    }

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64> {
        if self.refuse_deletes_from == Some(collection) {
            return Err(anyhow!("lock timeout while deleting from {}", collection));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_one(collection, filter)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.inner.count(collection, filter)
    }
}

/// Cluster double: answers with fixed objects, is down, or never answers.
pub enum FakeCluster {
    Up(Vec<Value>),
    Down,
    Hang,
}

#[async_trait::async_trait]
impl ClusterSource for FakeCluster {
    async fn list_scaled_objects(&self) -> Result<Vec<ScaledObject>, ClusterError> {
        match self {
            FakeCluster::Up(items) => items
                .iter()
                .map(|v| serde_json::from_value(v.clone()).map_err(|e| ClusterError::Decode(e.to_string())))
                .collect(),
            FakeCluster::Down => Err(ClusterError::Timeout(std::time::Duration::from_secs(5))),
            FakeCluster::Hang => std::future::pending().await,
        }
    }
}

pub fn api_with(store: Arc<dyn Store>, cluster: FakeCluster) -> InProcApi {
    InProcApi::new(store, Arc::new(cluster), Settings::default())
}

pub fn cron_spec() -> EventSpec {
    EventSpec {
        title: "api warmup".to_string(),
        start: "2024-05-01T09:00:00Z".to_string(),
        end: Some("2024-05-01T17:30:00Z".to_string()),
        all_day: false,
        trigger_type: TriggerType::Cron,
        target_workload: "api".to_string(),
        desired_replicas: 3,
        cron_expression: Some("*/5 * * * *".to_string()),
        metadata: Metadata::new(),
    }
}
