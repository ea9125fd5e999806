//! Reconciling reader: the cluster is authoritative when it answers, the store otherwise.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kcal_core::ScalingTarget;
use kcal_kubehub::{scaling_target_from_object, ClusterError, ClusterSource};
use kcal_persist::{Projection, Store, INTERNAL_ID, SCALED_OBJECTS};
use metrics::counter;
use tracing::{info, warn};

use crate::records::scaling_target_from_doc;
use crate::{KcalError, KcalResult};

/// Where a listing came from. Callers of the API never see this; it is for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cluster,
    Cache,
}

pub(crate) struct ReconcilingReader {
    cluster: Arc<dyn ClusterSource>,
    store: Arc<dyn Store>,
    list_limit: usize,
    timeout: Duration,
}

impl ReconcilingReader {
    pub(crate) fn new(cluster: Arc<dyn ClusterSource>, store: Arc<dyn Store>, list_limit: usize, timeout: Duration) -> Self {
        Self { cluster, store, list_limit, timeout }
    }

    pub(crate) async fn list(&self) -> KcalResult<(Vec<ScalingTarget>, Source)> {
        let t0 = Instant::now();
        match self.from_cluster().await {
            Ok(items) => {
                info!(count = items.len(), took_ms = %t0.elapsed().as_millis(), "scaling targets from cluster");
                return Ok((items, Source::Cluster));
            }
            Err(e) => {
                counter!("cluster_fallback_total", 1u64);
                warn!(error = %e, "cluster view unavailable; falling back to cached scaling targets");
            }
        }
        let items = self.from_cache()?;
        info!(count = items.len(), took_ms = %t0.elapsed().as_millis(), "scaling targets from cache");
        Ok((items, Source::Cache))
    }

    async fn from_cluster(&self) -> Result<Vec<ScalingTarget>, ClusterError> {
        // Bounds every source, not only KubeCluster.
        let objects = tokio::time::timeout(self.timeout, self.cluster.list_scaled_objects())
            .await
            .map_err(|_| ClusterError::Timeout(self.timeout))??;
        let now = Utc::now();
        objects.iter().map(|o| scaling_target_from_object(o, now)).collect()
    }

    fn from_cache(&self) -> KcalResult<Vec<ScalingTarget>> {
        let docs = self
            .store
            .find_all(SCALED_OBJECTS, Projection::Without(&[INTERNAL_ID]), self.list_limit)
            .map_err(KcalError::internal)?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            match scaling_target_from_doc(doc) {
                Ok(st) => out.push(st),
                Err(e) => warn!(error = ?e, "skipping undecodable cached scaling target"),
            }
        }
        Ok(out)
    }
}
