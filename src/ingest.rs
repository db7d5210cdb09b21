//! Event ingestion pipeline: validate, rate-limit, proof-of-work, storage
//! dispatch, projection.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::abuse::AbuseControls;
use crate::error::{RelayError, Result};
use crate::event::Event;
use crate::metrics::Metrics;
use crate::projection::ProjectionEngine;
use crate::storage::EventStore;
use crate::validation::Validator;

/// How a kind is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Regular,
    Replaceable,
    Ephemeral,
    ParameterizedReplaceable,
}

/// Storage semantics by kind range.
pub fn storage_mode(kind: i32) -> StorageMode {
    if kind == 0 || kind == 3 || (10000..=19999).contains(&kind) {
        StorageMode::Replaceable
    } else if (20000..=29999).contains(&kind) {
        StorageMode::Ephemeral
    } else if (30000..=39999).contains(&kind) {
        StorageMode::ParameterizedReplaceable
    } else {
        StorageMode::Regular
    }
}

/// Kinds only the relay itself may author (canonical group state).
pub fn relay_only_kind(kind: i32) -> bool {
    matches!(kind, 39000 | 39001 | 39002 | 39003)
}

/// First `d` tag value, trimmed; empty when the tag is missing.
pub fn d_tag_value(event: &Event) -> String {
    for tag in &event.tags {
        if tag.0.len() >= 2 && tag.name().trim() == "d" {
            return tag.value().trim().to_string();
        }
    }
    String::new()
}

/// Validates, abuse-checks, stores, and projects incoming events.
#[derive(Clone)]
pub struct IngestPipeline {
    store: EventStore,
    validator: Validator,
    abuse: Arc<AbuseControls>,
    projection: ProjectionEngine,
    metrics: Arc<Metrics>,
    relay_pubkey: String,
}

impl IngestPipeline {
    pub fn new(
        store: EventStore,
        validator: Validator,
        abuse: Arc<AbuseControls>,
        projection: ProjectionEngine,
        metrics: Arc<Metrics>,
        relay_pubkey: &str,
    ) -> Self {
        Self {
            store,
            validator,
            abuse,
            projection,
            metrics,
            relay_pubkey: relay_pubkey.trim().to_lowercase(),
        }
    }

    /// Run one event through the full pipeline. Fail-fast: the first failed
    /// stage skips everything after it, including projection.
    pub async fn ingest(&self, event: &Event) -> Result<()> {
        if let Err(err) = self.validator.validate(event, unix_now()) {
            self.metrics.inc("events_rejected_validation_total");
            return Err(err);
        }

        if !self.abuse.allow(&event.pubkey, Instant::now()) {
            self.metrics.inc("events_rejected_rate_limit_total");
            return Err(RelayError::RateLimit);
        }

        let required_bits = self.abuse.required_pow_bits(event.kind);
        if let Err(err) = self.abuse.validate_pow(event, required_bits) {
            self.metrics.inc("events_rejected_pow_total");
            return Err(err);
        }

        if relay_only_kind(event.kind) && !event.pubkey.eq_ignore_ascii_case(&self.relay_pubkey) {
            self.metrics.inc("events_rejected_validation_total");
            return Err(RelayError::Unauthorized(format!(
                "kind {} events must be signed by relay",
                event.kind
            )));
        }

        match storage_mode(event.kind) {
            StorageMode::Ephemeral => {
                // Accepted and relayed but intentionally not persisted.
            }
            StorageMode::Replaceable => {
                self.store.upsert_replaceable_event(event).await?;
                self.metrics.inc("events_ingested_total");
            }
            StorageMode::ParameterizedReplaceable => {
                self.store
                    .upsert_parameterized_replaceable_event(event, &d_tag_value(event))
                    .await?;
                self.metrics.inc("events_ingested_total");
            }
            StorageMode::Regular => {
                if let Err(err) = self.store.insert_event(event).await {
                    if err.is_duplicate() {
                        self.metrics.inc("events_duplicate_total");
                    }
                    return Err(err);
                }
                self.metrics.inc("events_ingested_total");
            }
        }

        if let Err(err) = self.projection.apply(event).await {
            self.metrics.inc("group_projection_errors_total");
            return Err(err);
        }

        Ok(())
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
