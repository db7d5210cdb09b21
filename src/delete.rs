//! Deletion pipeline: authorization, tombstone write, projection cleanup.

use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::ingest::unix_now;
use crate::metrics::Metrics;
use crate::models::DeletedEvent;
use crate::projection::ProjectionEngine;
use crate::storage::EventStore;

/// Processes deletion requests and their projection side effects.
#[derive(Clone)]
pub struct DeletePipeline {
    store: EventStore,
    projection: ProjectionEngine,
    metrics: Arc<Metrics>,
}

impl DeletePipeline {
    pub fn new(store: EventStore, projection: ProjectionEngine, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            projection,
            metrics,
        }
    }

    /// Tombstone an event. Only the event's author may delete it.
    pub async fn delete(&self, mut req: DeletedEvent) -> Result<()> {
        if req.event_id.is_empty() || req.deleted_by.is_empty() {
            return Err(RelayError::Validation(
                "event_id and deleted_by are required".into(),
            ));
        }
        if req.deleted_at == 0 {
            req.deleted_at = unix_now();
        }

        let event = self.store.get_event(&req.event_id).await?;
        if event.pubkey != req.deleted_by {
            return Err(RelayError::Unauthorized(
                "delete not authorized for this pubkey".into(),
            ));
        }

        self.store.mark_deleted(&req).await?;
        self.metrics.inc("events_deleted_total");

        self.projection.apply_deletion(&req.event_id).await?;
        Ok(())
    }
}
