//! Event persistence: raw events, normalized tag index, tombstones, and the
//! replaceable/parameterized-replaceable upsert paths.

use std::cmp::Ordering;

use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};

use crate::error::{from_sqlx, Result};
use crate::event::{Event, Tag};
use crate::models::{DeletedEvent, EventTag};

/// Filter for the deletion-aware event query.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub author: String,
    pub kind: Option<i32>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    /// Keyset cursor companion to `until`; when set, rows with
    /// `created_at == until` and `id > until_id` are still returned.
    pub until_id: String,
    /// `name:value` pair or a bare value matched against any tag name.
    pub tag: String,
    pub limit: i32,
    pub include_deleted: bool,
}

/// Transactional store for events and their tag index.
#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a regular event and its tag rows in one transaction.
    /// A second insert of the same id surfaces as `RelayError::Duplicate`.
    pub async fn insert_event(&self, event: &Event) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_event_tx(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Store a replaceable event, replacing older events with the same
    /// `(pubkey, kind)` address.
    pub async fn upsert_replaceable_event(&self, event: &Event) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, (String, i64)>(
            "SELECT e.id, e.created_at FROM events e WHERE e.pubkey = $1 AND e.kind = $2",
        )
        .bind(&event.pubkey)
        .bind(event.kind)
        .fetch_all(&mut *tx)
        .await?;
        upsert_latest_tx(&mut tx, event, existing).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Store a parameterized replaceable event addressed by
    /// `(pubkey, kind, d-tag value)`. A missing d tag is the empty address.
    pub async fn upsert_parameterized_replaceable_event(
        &self,
        event: &Event,
        d_value: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT DISTINCT e.id, e.created_at
            FROM events e
            LEFT JOIN event_tags et
              ON et.event_id = e.id
             AND et.tag_name = 'd'
            WHERE e.pubkey = $1
              AND e.kind = $2
              AND (
                  ($3 = '' AND (et.event_id IS NULL OR et.tag_value = ''))
                  OR ($3 <> '' AND et.tag_value = $3)
              )
            "#,
        )
        .bind(&event.pubkey)
        .bind(event.kind)
        .bind(d_value)
        .fetch_all(&mut *tx)
        .await?;
        upsert_latest_tx(&mut tx, event, existing).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Load a single event by id; a miss is `RelayError::NotFound`.
    pub async fn get_event(&self, event_id: &str) -> Result<Event> {
        let row = sqlx::query(
            "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events WHERE id = $1",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(from_sqlx)?;
        event_from_row(&row)
    }

    /// Upsert a deletion tombstone keyed by event id.
    pub async fn mark_deleted(&self, deleted: &DeletedEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deleted_events (event_id, deleted_at, deleted_by, reason)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO UPDATE
            SET deleted_at = EXCLUDED.deleted_at,
                deleted_by = EXCLUDED.deleted_by,
                reason = EXCLUDED.reason
            "#,
        )
        .bind(&deleted.event_id)
        .bind(deleted.deleted_at)
        .bind(&deleted.deleted_by)
        .bind(&deleted.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether a tombstone exists for the event.
    pub async fn is_deleted(&self, event_id: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM deleted_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Query events ordered `created_at DESC, id ASC`, excluding tombstoned
    /// rows unless the filter asks for them.
    pub async fn query_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT e.id, e.pubkey, e.created_at, e.kind, e.tags, e.content, e.sig FROM events e ",
        );

        if !filter.include_deleted {
            qb.push("LEFT JOIN deleted_events d ON d.event_id = e.id ");
        }
        qb.push("WHERE 1=1 ");
        if !filter.include_deleted {
            qb.push("AND d.event_id IS NULL ");
        }

        if !filter.author.is_empty() {
            qb.push("AND e.pubkey = ");
            qb.push_bind(filter.author.clone());
            qb.push(" ");
        }
        if let Some(kind) = filter.kind {
            qb.push("AND e.kind = ");
            qb.push_bind(kind);
            qb.push(" ");
        }
        if let Some(since) = filter.since {
            qb.push("AND e.created_at >= ");
            qb.push_bind(since);
            qb.push(" ");
        }
        if let Some(until) = filter.until {
            if filter.until_id.trim().is_empty() {
                qb.push("AND e.created_at <= ");
                qb.push_bind(until);
                qb.push(" ");
            } else {
                qb.push("AND (e.created_at < ");
                qb.push_bind(until);
                qb.push(" OR (e.created_at = ");
                qb.push_bind(until);
                qb.push(" AND e.id > ");
                qb.push_bind(filter.until_id.clone());
                qb.push(")) ");
            }
        }

        if !filter.tag.is_empty() {
            let (tag_name, tag_value) = parse_tag_filter(&filter.tag);
            if tag_name.is_empty() {
                qb.push(
                    "AND EXISTS (SELECT 1 FROM event_tags et \
                     WHERE et.event_id = e.id AND et.tag_value = ",
                );
                qb.push_bind(tag_value);
                qb.push(") ");
            } else {
                qb.push(
                    "AND EXISTS (SELECT 1 FROM event_tags et \
                     WHERE et.event_id = e.id AND et.tag_name = ",
                );
                qb.push_bind(tag_name);
                qb.push(" AND et.tag_value = ");
                qb.push_bind(tag_value);
                qb.push(") ");
            }
        }

        qb.push("ORDER BY e.created_at DESC, e.id ASC LIMIT ");
        qb.push_bind(clamp_limit(filter.limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }
}

/// Default 100, capped at 500.
fn clamp_limit(limit: i32) -> i64 {
    if limit <= 0 {
        100
    } else if limit > 500 {
        500
    } else {
        limit as i64
    }
}

/// Split a tag filter into `(name, value)`; a bare value matches any name.
fn parse_tag_filter(raw: &str) -> (String, String) {
    match raw.split_once(':') {
        Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
        None => (String::new(), raw.trim().to_string()),
    }
}

/// One row per non-empty-name tag, preserving each tag's position in the event.
pub(crate) fn normalize_tags(event_id: &str, tags: &[Tag]) -> Vec<EventTag> {
    tags.iter()
        .enumerate()
        .filter(|(_, tag)| !tag.name().is_empty())
        .map(|(idx, tag)| EventTag {
            event_id: event_id.to_string(),
            tag_index: idx as i32,
            tag_name: tag.name().to_string(),
            tag_value: tag.value().to_string(),
            tag_array: tag.0.clone(),
        })
        .collect()
}

async fn insert_event_tx(tx: &mut Transaction<'_, Postgres>, event: &Event) -> Result<()> {
    let encoded_tags = serde_json::to_value(&event.tags)?;
    sqlx::query(
        r#"
        INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&event.id)
    .bind(&event.pubkey)
    .bind(event.created_at)
    .bind(event.kind)
    .bind(encoded_tags)
    .bind(&event.content)
    .bind(&event.sig)
    .execute(&mut **tx)
    .await
    .map_err(from_sqlx)?;

    for tag in normalize_tags(&event.id, &event.tags) {
        let tag_array = serde_json::to_value(&tag.tag_array)?;
        sqlx::query(
            r#"
            INSERT INTO event_tags (event_id, tag_index, tag_name, tag_value, tag_array)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&tag.event_id)
        .bind(tag.tag_index)
        .bind(&tag.tag_name)
        .bind(&tag.tag_value)
        .bind(tag_array)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Replace the stored address with `event` only when it is strictly newer
/// under the replaceable total order; equal or older incoming events no-op.
async fn upsert_latest_tx(
    tx: &mut Transaction<'_, Postgres>,
    event: &Event,
    existing: Vec<(String, i64)>,
) -> Result<()> {
    let mut best: Option<(String, i64)> = None;
    let mut stale_ids = Vec::with_capacity(existing.len());
    for (id, created_at) in existing {
        let better = match &best {
            None => true,
            Some((best_id, best_ts)) => {
                compare_replaceable_version(created_at, &id, *best_ts, best_id) == Ordering::Greater
            }
        };
        if better {
            best = Some((id.clone(), created_at));
        }
        if id != event.id {
            stale_ids.push(id);
        }
    }

    if let Some((best_id, best_ts)) = &best {
        match compare_replaceable_version(event.created_at, &event.id, *best_ts, best_id) {
            Ordering::Less | Ordering::Equal => return Ok(()),
            Ordering::Greater => {}
        }
    }

    // Tag rows fall via the ON DELETE CASCADE on event_tags.event_id.
    for id in &stale_ids {
        sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }
    sqlx::query("DELETE FROM events WHERE id = $1")
        .bind(&event.id)
        .execute(&mut **tx)
        .await?;

    insert_event_tx(tx, event).await
}

/// Total order over replaceable versions: greater `created_at` wins; on a
/// tie the lexicographically smaller id ranks higher.
fn compare_replaceable_version(a_ts: i64, a_id: &str, b_ts: i64, b_id: &str) -> Ordering {
    match a_ts.cmp(&b_ts) {
        Ordering::Equal => {
            let a = a_id.trim().to_lowercase();
            let b = b_id.trim().to_lowercase();
            b.cmp(&a)
        }
        other => other,
    }
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<Event> {
    let tags_json: serde_json::Value = row.try_get("tags")?;
    Ok(Event {
        id: row.try_get("id")?,
        pubkey: row.try_get("pubkey")?,
        created_at: row.try_get("created_at")?,
        kind: row.try_get("kind")?,
        tags: serde_json::from_value(tags_json)?,
        content: row.try_get("content")?,
        sig: row.try_get("sig")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_created_at_wins() {
        assert_eq!(
            compare_replaceable_version(200, "ff", 100, "aa"),
            Ordering::Greater
        );
        assert_eq!(
            compare_replaceable_version(100, "aa", 200, "ff"),
            Ordering::Less
        );
    }

    #[test]
    fn tie_breaks_on_lexicographically_smaller_id() {
        assert_eq!(
            compare_replaceable_version(100, "aa", 100, "bb"),
            Ordering::Greater
        );
        assert_eq!(
            compare_replaceable_version(100, "bb", 100, "aa"),
            Ordering::Less
        );
        assert_eq!(
            compare_replaceable_version(100, "aa", 100, "AA "),
            Ordering::Equal
        );
    }

    #[test]
    fn tag_filter_parsing() {
        assert_eq!(parse_tag_filter("d:room-1"), ("d".into(), "room-1".into()));
        assert_eq!(parse_tag_filter(" t : nostr "), ("t".into(), "nostr".into()));
        assert_eq!(parse_tag_filter("room-1"), ("".into(), "room-1".into()));
        assert_eq!(parse_tag_filter("a:b:c"), ("a".into(), "b:c".into()));
    }

    #[test]
    fn limit_clamping() {
        assert_eq!(clamp_limit(0), 100);
        assert_eq!(clamp_limit(-3), 100);
        assert_eq!(clamp_limit(50), 50);
        assert_eq!(clamp_limit(501), 500);
    }

    #[test]
    fn tags_normalize_with_positions() {
        let tags = vec![
            Tag(vec!["e".into(), "abc".into()]),
            Tag(vec![]),
            Tag(vec!["".into(), "skipped".into()]),
            Tag(vec!["private".into()]),
        ];
        let rows = normalize_tags("ev1", &tags);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tag_index, 0);
        assert_eq!(rows[0].tag_name, "e");
        assert_eq!(rows[0].tag_value, "abc");
        assert_eq!(rows[1].tag_index, 3);
        assert_eq!(rows[1].tag_name, "private");
        assert_eq!(rows[1].tag_value, "");
        assert_eq!(rows[1].tag_array, vec!["private".to_string()]);
    }
}
