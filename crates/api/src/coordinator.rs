//! Dual-write coordinator: a calendar event and the scaling target it owns are created
//! and deleted together. The pair is not transactional; see `journal` for detection.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use kcal_core::{
    derive_color, new_id, time::format_timestamp, CalendarEvent, EventSpec, EventStatus, Labels, ReplicaBounds,
    ScalingTarget, TargetKind,
};
use kcal_persist::{Doc, Filter, Projection, Store, CALENDAR_EVENTS, INTERNAL_ID, SCALED_OBJECTS};
use metrics::counter;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::journal::{DualWriteOp, Journal};
use crate::records::{from_doc, to_doc};
use crate::{KcalError, KcalResult};

/// `scaled-{workload}-{8 hex chars}`.
pub fn target_name(workload: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("scaled-{}-{}", workload, &suffix[..8])
}

fn by_id(id: &str) -> Filter { Filter::eq("id", id) }

pub(crate) struct Coordinator {
    store: Arc<dyn Store>,
    journal: Journal,
    namespace: String,
    list_limit: usize,
}

impl Coordinator {
    pub(crate) fn new(store: Arc<dyn Store>, namespace: String, list_limit: usize) -> Self {
        let journal = Journal::new(store.clone());
        Self { store, journal, namespace, list_limit }
    }

    pub(crate) fn journal(&self) -> &Journal { &self.journal }

    fn decode_event(doc: Doc) -> KcalResult<CalendarEvent> {
        from_doc(doc).map_err(KcalError::internal)
    }

    pub(crate) fn list(&self) -> KcalResult<Vec<CalendarEvent>> {
        self.store
            .find_all(CALENDAR_EVENTS, Projection::Without(&[INTERNAL_ID]), self.list_limit)
            .map_err(KcalError::internal)?
            .into_iter()
            .map(Self::decode_event)
            .collect()
    }

    pub(crate) fn get(&self, id: &str) -> KcalResult<CalendarEvent> {
        let doc = self
            .store
            .find_one(CALENDAR_EVENTS, &by_id(id))
            .map_err(KcalError::internal)?
            .ok_or_else(|| KcalError::event_not_found(id))?;
        Self::decode_event(doc)
    }

    pub(crate) fn create(&self, spec: &EventSpec) -> KcalResult<CalendarEvent> {
        let t0 = Instant::now();
        let window = spec.window()?;
        let now = Utc::now();
        let bounds = ReplicaBounds::default();
        let target = ScalingTarget {
            id: new_id(),
            name: target_name(&spec.target_workload),
            namespace: self.namespace.clone(),
            target_workload: spec.target_workload.clone(),
            target_kind: TargetKind::Deployment,
            min_replicas: bounds.min,
            max_replicas: bounds.max,
            triggers: vec![spec.trigger()],
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
        };
        let event = CalendarEvent {
            id: new_id(),
            title: spec.title.clone(),
            start: window.start,
            end: window.end,
            all_day: spec.all_day,
            trigger_type: spec.trigger_type,
            scaling_target_id: target.id.clone(),
            target_workload: spec.target_workload.clone(),
            desired_replicas: spec.desired_replicas,
            cron_expression: spec.cron_expression.clone(),
            status: EventStatus::Scheduled,
            color: derive_color(spec.trigger_type).to_string(),
            metadata: spec.metadata.clone(),
            created_at: now,
        };
        let target_doc = to_doc(&target).map_err(KcalError::internal)?;
        let event_doc = to_doc(&event).map_err(KcalError::internal)?;

        let intent = self.journal.begin(DualWriteOp::Create, &event.id, &target.id)?;
        if let Err(e) = self.store.insert_one(SCALED_OBJECTS, target_doc) {
            self.journal.settle(&intent);
            return Err(KcalError::internal(e));
        }
        if let Err(e) = self.store.insert_one(CALENDAR_EVENTS, event_doc) {
            counter!("dual_write_partial_total", 1u64);
            error!(
                target: "kcal::dual_write",
                op = "create",
                intent = %intent.id,
                event_id = %event.id,
                scaling_target_id = %target.id,
                error = %e,
                "partial write: scaling target persisted without its event"
            );
            return Err(KcalError::internal(e));
        }
        self.journal.settle(&intent);
        info!(id = %event.id, scaling_target = %target.name, took_ms = %t0.elapsed().as_millis(), "event created");
        Ok(event)
    }

    /// Rewrites the event's own fields only; the owned scaling target keeps its triggers.
    pub(crate) fn update(&self, id: &str, spec: &EventSpec) -> KcalResult<CalendarEvent> {
        let existing = self.store.find_one(CALENDAR_EVENTS, &by_id(id)).map_err(KcalError::internal)?;
        if existing.is_none() {
            return Err(KcalError::event_not_found(id));
        }
        let window = spec.window()?;
        let set = json!({
            "title": spec.title,
            "start": format_timestamp(&window.start),
            "end": window.end.as_ref().map(format_timestamp),
            "all_day": spec.all_day,
            "trigger_type": spec.trigger_type,
            "target_workload": spec.target_workload,
            "desired_replicas": spec.desired_replicas,
            "cron_expression": spec.cron_expression,
            "color": derive_color(spec.trigger_type),
            "metadata": spec.metadata,
        });
        let Value::Object(set) = set else {
            return Err(KcalError::Internal("update document is not an object".into()));
        };
        let matched = self.store.update_one(CALENDAR_EVENTS, &by_id(id), set).map_err(KcalError::internal)?;
        if matched == 0 {
            return Err(KcalError::event_not_found(id));
        }
        debug!(id, "event updated");
        self.get(id)
    }

    pub(crate) fn delete(&self, id: &str) -> KcalResult<()> {
        let doc = self
            .store
            .find_one(CALENDAR_EVENTS, &by_id(id))
            .map_err(KcalError::internal)?
            .ok_or_else(|| KcalError::event_not_found(id))?;
        let target_id = doc.get("scaling_target_id").and_then(Value::as_str).unwrap_or("").to_string();

        let intent = self.journal.begin(DualWriteOp::Delete, id, &target_id)?;
        if !target_id.is_empty() {
            match self.store.delete_one(SCALED_OBJECTS, &by_id(&target_id)) {
                Ok(0) => debug!(id, scaling_target_id = %target_id, "owned scaling target already gone"),
                Ok(_) => {}
                Err(e) => {
                    self.journal.settle(&intent);
                    return Err(KcalError::internal(e));
                }
            }
        }
        match self.store.delete_one(CALENDAR_EVENTS, &by_id(id)) {
            Ok(0) => {
                // Removed concurrently between the lookup and here; the pair is gone either way.
                self.journal.settle(&intent);
                Err(KcalError::event_not_found(id))
            }
            Ok(_) => {
                self.journal.settle(&intent);
                info!(id, scaling_target_id = %target_id, "event deleted");
                Ok(())
            }
            Err(e) => {
                counter!("dual_write_partial_total", 1u64);
                error!(
                    target: "kcal::dual_write",
                    op = "delete",
                    intent = %intent.id,
                    event_id = %id,
                    scaling_target_id = %target_id,
                    error = %e,
                    "partial write: scaling target deleted but its event remains"
                );
                Err(KcalError::internal(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_name_has_eight_hex_suffix() {
        let name = target_name("api");
        let suffix = name.strip_prefix("scaled-api-").expect("prefix");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(target_name("api"), target_name("api"));
    }
}
