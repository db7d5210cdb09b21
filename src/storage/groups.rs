//! Group projection tables: groups, members, roles, bans, invites, join
//! requests, and group-event links. All upserts are guarded so out-of-order
//! arrivals never overwrite newer state with older state.

use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::PgPool;

use crate::error::{RelayError, Result};
use crate::models::{
    perm, Group, GroupBan, GroupEvent, GroupInvite, GroupJoinRequest, GroupMember, GroupRole,
};

/// Filter for the public group listing.
#[derive(Debug, Clone, Default)]
pub struct GroupFilter {
    pub geohash_prefix: String,
    pub is_private: Option<bool>,
    pub is_vetted: Option<bool>,
    pub updated_since: Option<i64>,
    pub limit: i32,
}

#[derive(Clone)]
pub struct GroupStore {
    pool: PgPool,
}

impl GroupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert a group row; on conflict the update applies only when the
    /// incoming `updated_at` is not older than the stored one.
    pub async fn upsert_group(&self, group: &Group) -> Result<()> {
        if group.geohash.len() > 6 {
            return Err(RelayError::Projection(
                "geohash precision exceeds level 6".into(),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO groups (
                group_id, name, about, picture, geohash, is_private, is_restricted,
                is_vetted, is_hidden, is_closed, created_at, created_by, updated_at, updated_by
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (group_id) DO UPDATE
            SET name = EXCLUDED.name,
                about = EXCLUDED.about,
                picture = EXCLUDED.picture,
                geohash = EXCLUDED.geohash,
                is_private = EXCLUDED.is_private,
                is_restricted = EXCLUDED.is_restricted,
                is_vetted = EXCLUDED.is_vetted,
                is_hidden = EXCLUDED.is_hidden,
                is_closed = EXCLUDED.is_closed,
                updated_at = EXCLUDED.updated_at,
                updated_by = EXCLUDED.updated_by
            WHERE EXCLUDED.updated_at >= groups.updated_at
            "#,
        )
        .bind(&group.group_id)
        .bind(&group.name)
        .bind(&group.about)
        .bind(&group.picture)
        .bind(&group.geohash)
        .bind(group.is_private)
        .bind(group.is_restricted)
        .bind(group.is_vetted)
        .bind(group.is_hidden)
        .bind(group.is_closed)
        .bind(group.created_at)
        .bind(&group.created_by)
        .bind(group.updated_at)
        .bind(&group.updated_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a group closed and hidden; the row survives for history.
    pub async fn close_group(&self, group_id: &str, updated_at: i64, updated_by: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE groups
            SET is_hidden = TRUE,
                is_closed = TRUE,
                updated_at = $2,
                updated_by = $3
            WHERE group_id = $1
            "#,
        )
        .bind(group_id)
        .bind(updated_at)
        .bind(updated_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_group(&self, group_id: &str) -> Result<Group> {
        sqlx::query_as::<_, Group>(
            r#"
            SELECT group_id, name, about, picture, geohash, is_private, is_restricted,
                is_vetted, is_hidden, is_closed, created_at, created_by, updated_at, updated_by
            FROM groups
            WHERE group_id = $1
            "#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RelayError::NotFound)
    }

    /// List groups ordered by `updated_at DESC`; limit defaults to 100 and is
    /// capped at 200.
    pub async fn list_groups(&self, filter: &GroupFilter) -> Result<Vec<Group>> {
        let limit: i64 = if filter.limit <= 0 {
            100
        } else if filter.limit > 200 {
            200
        } else {
            filter.limit as i64
        };

        let mut qb: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            r#"
            SELECT group_id, name, about, picture, geohash, is_private, is_restricted,
                is_vetted, is_hidden, is_closed, created_at, created_by, updated_at, updated_by
            FROM groups
            WHERE 1=1
            "#,
        );
        if !filter.geohash_prefix.is_empty() {
            qb.push(" AND geohash LIKE ");
            qb.push_bind(filter.geohash_prefix.clone());
            qb.push(" || '%'");
        }
        if let Some(is_private) = filter.is_private {
            qb.push(" AND is_private = ");
            qb.push_bind(is_private);
        }
        if let Some(is_vetted) = filter.is_vetted {
            qb.push(" AND is_vetted = ");
            qb.push_bind(is_vetted);
        }
        if let Some(updated_since) = filter.updated_since {
            qb.push(" AND updated_at >= ");
            qb.push_bind(updated_since);
        }
        qb.push(" ORDER BY updated_at DESC LIMIT ");
        qb.push_bind(limit);

        let groups = qb.build_query_as::<Group>().fetch_all(&self.pool).await?;
        Ok(groups)
    }

    pub async fn upsert_role(&self, role: &GroupRole) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_roles (
                group_id, role_name, description, permissions,
                created_at, created_by, updated_at, updated_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (group_id, role_name) DO UPDATE
            SET description = EXCLUDED.description,
                permissions = EXCLUDED.permissions,
                updated_at = EXCLUDED.updated_at,
                updated_by = EXCLUDED.updated_by
            WHERE EXCLUDED.updated_at >= group_roles.updated_at
            "#,
        )
        .bind(&role.group_id)
        .bind(&role.role_name)
        .bind(&role.description)
        .bind(&role.permissions)
        .bind(role.created_at)
        .bind(&role.created_by)
        .bind(role.updated_at)
        .bind(&role.updated_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_role(&self, group_id: &str, role_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM group_roles WHERE group_id = $1 AND role_name = $2")
            .bind(group_id)
            .bind(role_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_roles(&self, group_id: &str) -> Result<Vec<GroupRole>> {
        let roles = sqlx::query_as::<_, GroupRole>(
            r#"
            SELECT group_id, role_name, description, permissions,
                created_at, created_by, updated_at, updated_by
            FROM group_roles
            WHERE group_id = $1
            ORDER BY role_name ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    pub async fn upsert_member(&self, member: &GroupMember) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_members (
                group_id, pubkey, added_at, added_by, role_name, promoted_at, promoted_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (group_id, pubkey) DO UPDATE
            SET role_name = EXCLUDED.role_name,
                promoted_at = EXCLUDED.promoted_at,
                promoted_by = EXCLUDED.promoted_by,
                added_at = EXCLUDED.added_at,
                added_by = EXCLUDED.added_by
            WHERE EXCLUDED.added_at >= group_members.added_at
            "#,
        )
        .bind(&member.group_id)
        .bind(&member.pubkey)
        .bind(member.added_at)
        .bind(&member.added_by)
        .bind(&member.role_name)
        .bind(member.promoted_at)
        .bind(&member.promoted_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_member(&self, group_id: &str, pubkey: &str) -> Result<()> {
        sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND pubkey = $2")
            .bind(group_id)
            .bind(pubkey)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_members(&self, group_id: &str) -> Result<Vec<GroupMember>> {
        let members = sqlx::query_as::<_, GroupMember>(
            r#"
            SELECT group_id, pubkey, added_at, added_by, role_name, promoted_at, promoted_by
            FROM group_members
            WHERE group_id = $1
            ORDER BY added_at ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    pub async fn is_member(&self, group_id: &str, pubkey: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM group_members WHERE group_id = $1 AND pubkey = $2)",
        )
        .bind(group_id)
        .bind(pubkey)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Member's role name, `None` when not a member.
    pub async fn get_member_role(&self, group_id: &str, pubkey: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT role_name FROM group_members WHERE group_id = $1 AND pubkey = $2",
        )
        .bind(group_id)
        .bind(pubkey)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(role,)| role))
    }

    pub async fn upsert_ban(&self, ban: &GroupBan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_bans (group_id, pubkey, reason, banned_at, banned_by, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (group_id, pubkey) DO UPDATE
            SET reason = EXCLUDED.reason,
                banned_at = EXCLUDED.banned_at,
                banned_by = EXCLUDED.banned_by,
                expires_at = EXCLUDED.expires_at
            WHERE EXCLUDED.banned_at >= group_bans.banned_at
            "#,
        )
        .bind(&ban.group_id)
        .bind(&ban.pubkey)
        .bind(&ban.reason)
        .bind(ban.banned_at)
        .bind(&ban.banned_by)
        .bind(ban.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_bans(&self, group_id: &str) -> Result<Vec<GroupBan>> {
        let bans = sqlx::query_as::<_, GroupBan>(
            r#"
            SELECT group_id, pubkey, reason, banned_at, banned_by, expires_at
            FROM group_bans
            WHERE group_id = $1
            ORDER BY banned_at DESC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bans)
    }

    /// A ban is active when it never expires (`expires_at == 0`) or has not
    /// yet expired.
    pub async fn is_banned(&self, group_id: &str, pubkey: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT expires_at FROM group_bans WHERE group_id = $1 AND pubkey = $2",
        )
        .bind(group_id)
        .bind(pubkey)
        .fetch_optional(&self.pool)
        .await?;
        let Some((expires_at,)) = row else {
            return Ok(false);
        };
        Ok(expires_at == 0 || expires_at >= unix_now())
    }

    pub async fn upsert_invite(&self, invite: &GroupInvite) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_invites (
                group_id, code, expires_at, max_usage_count, usage_count, created_at, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (group_id, code) DO UPDATE
            SET expires_at = EXCLUDED.expires_at,
                max_usage_count = EXCLUDED.max_usage_count,
                usage_count = EXCLUDED.usage_count
            WHERE EXCLUDED.created_at >= group_invites.created_at
            "#,
        )
        .bind(&invite.group_id)
        .bind(&invite.code)
        .bind(invite.expires_at)
        .bind(invite.max_usage_count)
        .bind(invite.usage_count)
        .bind(invite.created_at)
        .bind(&invite.created_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_invites(&self, group_id: &str) -> Result<Vec<GroupInvite>> {
        let invites = sqlx::query_as::<_, GroupInvite>(
            r#"
            SELECT group_id, code, expires_at, max_usage_count, usage_count, created_at, created_by
            FROM group_invites
            WHERE group_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(invites)
    }

    pub async fn upsert_join_request(&self, req: &GroupJoinRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_join_requests (group_id, pubkey, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (group_id, pubkey) DO UPDATE
            SET created_at = GREATEST(group_join_requests.created_at, EXCLUDED.created_at)
            "#,
        )
        .bind(&req.group_id)
        .bind(&req.pubkey)
        .bind(req.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_join_request(&self, group_id: &str, pubkey: &str) -> Result<()> {
        sqlx::query("DELETE FROM group_join_requests WHERE group_id = $1 AND pubkey = $2")
            .bind(group_id)
            .bind(pubkey)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_join_request(
        &self,
        group_id: &str,
        pubkey: &str,
    ) -> Result<Option<GroupJoinRequest>> {
        let req = sqlx::query_as::<_, GroupJoinRequest>(
            "SELECT group_id, pubkey, created_at FROM group_join_requests \
             WHERE group_id = $1 AND pubkey = $2",
        )
        .bind(group_id)
        .bind(pubkey)
        .fetch_optional(&self.pool)
        .await?;
        Ok(req)
    }

    pub async fn add_group_event(&self, link: &GroupEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_events (group_id, event_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (group_id, event_id) DO UPDATE
            SET created_at = GREATEST(group_events.created_at, EXCLUDED.created_at)
            "#,
        )
        .bind(&link.group_id)
        .bind(&link.event_id)
        .bind(link.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_group_event_by_event_id(&self, event_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM group_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn has_group_event(&self, group_id: &str, event_id: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM group_events WHERE group_id = $1 AND event_id = $2)",
        )
        .bind(group_id)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Whether `pubkey` holds `permission` in the group. The group creator is
    /// always granted; otherwise the member's role (defaults plus stored
    /// permissions) decides.
    pub async fn has_permission(
        &self,
        group_id: &str,
        pubkey: &str,
        permission: &str,
    ) -> Result<bool> {
        let row: Option<(String, String, Vec<String>)> = sqlx::query_as(
            r#"
            SELECT
                g.created_by,
                COALESCE(gm.role_name, ''),
                COALESCE(gr.permissions, ARRAY[]::TEXT[])
            FROM groups g
            LEFT JOIN group_members gm
                ON gm.group_id = g.group_id AND gm.pubkey = $2
            LEFT JOIN group_roles gr
                ON gr.group_id = gm.group_id AND gr.role_name = gm.role_name
            WHERE g.group_id = $1
            "#,
        )
        .bind(group_id)
        .bind(pubkey)
        .fetch_optional(&self.pool)
        .await?;

        let Some((created_by, role_name, permissions)) = row else {
            return Ok(false);
        };
        if created_by == pubkey {
            return Ok(true);
        }
        Ok(perm::role_has_permission(&role_name, &permissions, permission))
    }

    /// Creator, role in `{owner, admin}`, or a role carrying the `admin`
    /// permission.
    pub async fn is_admin(&self, group_id: &str, pubkey: &str) -> Result<bool> {
        let group = match self.get_group(group_id).await {
            Ok(group) => group,
            Err(RelayError::NotFound) => return Ok(false),
            Err(err) => return Err(err),
        };
        if group.created_by == pubkey {
            return Ok(true);
        }

        let (is_admin,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM group_members gm
                LEFT JOIN group_roles gr
                    ON gr.group_id = gm.group_id AND gr.role_name = gm.role_name
                WHERE gm.group_id = $1
                  AND gm.pubkey = $2
                  AND (
                    gm.role_name IN ('owner', 'admin')
                    OR gr.permissions @> ARRAY['admin']::TEXT[]
                  )
            )
            "#,
        )
        .bind(group_id)
        .bind(pubkey)
        .fetch_one(&self.pool)
        .await?;
        Ok(is_admin)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
