//! Intent log for compound event + scaling target writes.
//!
//! An intent is recorded before the first half of a dual write and removed after the second.
//! Anything left behind marks a pair that may be inconsistent and needs an operator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kcal_core::{new_id, time};
use kcal_persist::{Filter, Projection, Store, DUAL_WRITE_LOG, INTERNAL_ID};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::records::{from_doc, to_doc};
use crate::{KcalError, KcalResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DualWriteOp {
    Create,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DualWriteIntent {
    pub id: String,
    pub op: DualWriteOp,
    pub event_id: String,
    pub scaling_target_id: String,
    #[serde(with = "time::iso")]
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub(crate) struct Journal {
    store: Arc<dyn Store>,
}

impl Journal {
    pub(crate) fn new(store: Arc<dyn Store>) -> Self { Self { store } }

    pub(crate) fn begin(&self, op: DualWriteOp, event_id: &str, scaling_target_id: &str) -> KcalResult<DualWriteIntent> {
        let intent = DualWriteIntent {
            id: new_id(),
            op,
            event_id: event_id.to_string(),
            scaling_target_id: scaling_target_id.to_string(),
            started_at: Utc::now(),
        };
        let doc = to_doc(&intent).map_err(KcalError::internal)?;
        self.store.insert_one(DUAL_WRITE_LOG, doc).map_err(KcalError::internal)?;
        Ok(intent)
    }

    /// Drop the intent. A failure here leaves a stale entry but never fails the caller.
    pub(crate) fn settle(&self, intent: &DualWriteIntent) {
        if let Err(e) = self.store.delete_one(DUAL_WRITE_LOG, &Filter::eq("id", intent.id.as_str())) {
            warn!(intent = %intent.id, error = %e, "could not clear dual-write intent");
        }
    }

    pub(crate) fn pending(&self, limit: usize) -> KcalResult<Vec<DualWriteIntent>> {
        self.store
            .find_all(DUAL_WRITE_LOG, Projection::Without(&[INTERNAL_ID]), limit)
            .map_err(KcalError::internal)?
            .into_iter()
            .map(|d| from_doc(d).map_err(KcalError::internal))
            .collect()
    }
}
