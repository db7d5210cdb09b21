//! Shared fixtures for the integration suites.
//!
//! Tests run against a real Postgres reachable through
//! `AGORA_TEST_DATABASE_URL` and skip silently when it is unset. Each test
//! gets a throwaway schema so suites never observe one another.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use agora::abuse::AbuseControls;
use agora::delete::DeletePipeline;
use agora::event::{Event, RelaySigner, Tag};
use agora::ingest::IngestPipeline;
use agora::metrics::Metrics;
use agora::projection::ProjectionEngine;
use agora::storage::{self, EventStore, GroupStore};
use agora::validation::Validator;
use agora::vetting::VettingPolicy;

pub const RELAY_SEED: &str = "07";

static SCHEMA_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Open a pool bound to a fresh schema, or `None` when no test database is
/// configured (the caller should return early, skipping the test).
pub async fn integration_pool() -> Option<PgPool> {
    let url = std::env::var("AGORA_TEST_DATABASE_URL").ok()?;
    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .ok()?;

    let schema = format!(
        "itest_{}_{}",
        unix_now(),
        SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    sqlx::query(&format!("CREATE SCHEMA \"{schema}\""))
        .execute(&admin)
        .await
        .ok()?;

    let opts: PgConnectOptions = url.parse().ok()?;
    let opts = opts.options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await
        .ok()?;
    storage::run_migrations(&pool).await.ok()?;
    Some(pool)
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Deterministic signer from a repeated seed byte (hex pair).
pub fn signer(seed: &str) -> RelaySigner {
    RelaySigner::from_hex(&seed.repeat(32)).unwrap()
}

pub fn relay_signer() -> RelaySigner {
    signer(RELAY_SEED)
}

/// A properly signed event from the given seed identity.
pub fn signed_event(seed: &str, created_at: i64, kind: i32, tags: Vec<Tag>, content: &str) -> Event {
    signer(seed)
        .sign_event(created_at, kind, tags, content.to_string())
        .unwrap()
}

/// A fabricated event for projection-level tests, which never verify
/// signatures.
pub fn raw_event(id: &str, pubkey: &str, created_at: i64, kind: i32, tags: Vec<Tag>) -> Event {
    Event {
        id: id.into(),
        pubkey: pubkey.into(),
        created_at,
        kind,
        tags,
        content: String::new(),
        sig: String::new(),
    }
}

pub fn tag(fields: &[&str]) -> Tag {
    Tag(fields.iter().map(|f| f.to_string()).collect())
}

/// Projection engine plus its collaborators, signing with the relay seed.
pub fn engine(pool: &PgPool) -> (ProjectionEngine, EventStore, GroupStore, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    let events = EventStore::new(pool.clone());
    let groups = GroupStore::new(pool.clone());
    let vetting = VettingPolicy::new(groups.clone());
    let relay = relay_signer();
    let relay_pubkey = relay.pubkey_hex().to_string();
    let projection = ProjectionEngine::new(
        groups.clone(),
        events.clone(),
        vetting,
        metrics.clone(),
        relay_pubkey,
        Some(relay),
    );
    (projection, events, groups, metrics)
}

/// Full ingest pipeline with configurable rate-limit settings.
pub fn pipeline(pool: &PgPool, burst: u32, per_minute: u32) -> (IngestPipeline, Arc<Metrics>) {
    let (projection, events, _groups, metrics) = engine(pool);
    let validator = Validator::new(std::time::Duration::from_secs(300));
    let abuse = Arc::new(AbuseControls::new(burst, per_minute, 0));
    let relay_pubkey = relay_signer().pubkey_hex().to_string();
    let ingest = IngestPipeline::new(
        events,
        validator,
        abuse,
        projection,
        metrics.clone(),
        &relay_pubkey,
    );
    (ingest, metrics)
}

/// Delete pipeline sharing a metrics registry with its projection engine.
pub fn delete_pipeline(pool: &PgPool) -> (DeletePipeline, EventStore, Arc<Metrics>) {
    let (projection, events, _groups, metrics) = engine(pool);
    let delete = DeletePipeline::new(events.clone(), projection, metrics.clone());
    (delete, events, metrics)
}
