//! Group projection: applies moderation-kind events to the group tables and
//! republishes canonical state events signed by the relay.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::event::{Event, RelaySigner, Tag};
use crate::ingest::relay_only_kind;
use crate::metrics::Metrics;
use crate::models::{
    perm, Group, GroupBan, GroupEvent, GroupInvite, GroupJoinRequest, GroupMember, GroupRole,
};
use crate::storage::{EventStore, GroupStore};
use crate::vetting::VettingPolicy;

/// Applies group-related events into queryable projection tables.
#[derive(Clone)]
pub struct ProjectionEngine {
    groups: GroupStore,
    events: EventStore,
    vetting: VettingPolicy,
    metrics: Arc<Metrics>,
    relay_pubkey: String,
    signer: Option<RelaySigner>,
}

impl ProjectionEngine {
    pub fn new(
        groups: GroupStore,
        events: EventStore,
        vetting: VettingPolicy,
        metrics: Arc<Metrics>,
        relay_pubkey: String,
        signer: Option<RelaySigner>,
    ) -> Self {
        Self {
            groups,
            events,
            vetting,
            metrics,
            relay_pubkey,
            signer,
        }
    }

    /// Apply one event to the projection. Events without a resolvable group
    /// id are ignored.
    pub async fn apply(&self, event: &Event) -> Result<()> {
        let mut group_id = event.first_tag_value("h").to_string();
        if group_id.is_empty() && relay_only_kind(event.kind) {
            group_id = event.first_tag_value("d").to_string();
        }
        if group_id.is_empty() {
            return Ok(());
        }

        let mut membership_changed = false;
        let mut admins_changed = false;

        match event.kind {
            9007 => {
                let group = Group {
                    group_id: group_id.clone(),
                    name: event.first_tag_value("name").to_string(),
                    about: event.first_tag_value("about").to_string(),
                    picture: event.first_tag_value("picture").to_string(),
                    geohash: truncate_geohash(event.first_tag_value("g")),
                    is_private: tag_bool_value(event, "private").unwrap_or(false),
                    is_restricted: tag_bool_value(event, "restricted").unwrap_or(false),
                    is_vetted: tag_bool_value(event, "vetted").unwrap_or(false),
                    is_hidden: tag_bool_value(event, "hidden").unwrap_or(false),
                    is_closed: tag_bool_value(event, "closed").unwrap_or(false),
                    created_at: event.created_at,
                    created_by: event.pubkey.clone(),
                    updated_at: event.created_at,
                    updated_by: event.pubkey.clone(),
                };
                self.groups.upsert_group(&group).await?;
                self.groups
                    .upsert_role(&GroupRole {
                        group_id: group_id.clone(),
                        role_name: "owner".into(),
                        description: "Group owner".into(),
                        permissions: owner_role_permissions(),
                        created_at: event.created_at,
                        created_by: event.pubkey.clone(),
                        updated_at: event.created_at,
                        updated_by: event.pubkey.clone(),
                    })
                    .await?;
                self.groups
                    .upsert_member(&GroupMember {
                        group_id: group_id.clone(),
                        pubkey: event.pubkey.clone(),
                        added_at: event.created_at,
                        added_by: event.pubkey.clone(),
                        role_name: "owner".into(),
                        ..Default::default()
                    })
                    .await?;
                membership_changed = true;
                admins_changed = true;
            }

            9002 => {
                let mut existing = match self.groups.get_group(&group_id).await {
                    Ok(existing) => {
                        self.require_permission(&group_id, &event.pubkey, perm::EDIT_METADATA)
                            .await?;
                        existing
                    }
                    Err(RelayError::NotFound) => Group {
                        group_id: group_id.clone(),
                        created_at: event.created_at,
                        created_by: event.pubkey.clone(),
                        ..Default::default()
                    },
                    Err(err) => return Err(err),
                };

                let name = event.first_tag_value("name");
                if !name.is_empty() {
                    existing.name = name.to_string();
                }
                let about = event.first_tag_value("about");
                if !about.is_empty() {
                    existing.about = about.to_string();
                }
                let picture = event.first_tag_value("picture");
                if !picture.is_empty() {
                    existing.picture = picture.to_string();
                }
                let geohash = event.first_tag_value("g");
                if !geohash.is_empty() {
                    existing.geohash = truncate_geohash(geohash);
                }
                if let Some(v) = tag_bool_value(event, "private") {
                    existing.is_private = v;
                }
                if let Some(v) = tag_bool_value(event, "restricted") {
                    existing.is_restricted = v;
                }
                if let Some(v) = tag_bool_value(event, "vetted") {
                    existing.is_vetted = v;
                }
                if let Some(v) = tag_bool_value(event, "hidden") {
                    existing.is_hidden = v;
                }
                if let Some(v) = tag_bool_value(event, "closed") {
                    existing.is_closed = v;
                }
                existing.updated_at = event.created_at;
                existing.updated_by = event.pubkey.clone();
                if existing.created_at == 0 {
                    existing.created_at = event.created_at;
                    existing.created_by = event.pubkey.clone();
                }
                self.groups.upsert_group(&existing).await?;
            }

            9003 => {
                self.require_permission(&group_id, &event.pubkey, perm::CREATE_ROLE)
                    .await?;
                let role_name = role_name_from_tags(event)
                    .ok_or_else(|| RelayError::Projection("role update missing role tag".into()))?;
                let mut permissions = parse_csv_tag(event.first_tag_value("permissions"));
                if permissions.is_empty() {
                    permissions = parse_csv_tag(event.first_tag_value("perm"));
                }
                self.groups
                    .upsert_role(&GroupRole {
                        group_id: group_id.clone(),
                        role_name,
                        description: event.first_tag_value("description").to_string(),
                        permissions,
                        created_at: event.created_at,
                        created_by: event.pubkey.clone(),
                        updated_at: event.created_at,
                        updated_by: event.pubkey.clone(),
                    })
                    .await?;
            }

            9004 => {
                self.require_permission(&group_id, &event.pubkey, perm::DELETE_ROLE)
                    .await?;
                let role_name = role_name_from_tags(event)
                    .ok_or_else(|| RelayError::Projection("delete-role missing role tag".into()))?;
                self.groups.delete_role(&group_id, &role_name).await?;
            }

            9000 => {
                let (member_key, tag_role) = parse_put_user_tag(event)?;
                let mut requested_role = tag_role;
                if requested_role.is_empty() {
                    requested_role = event.first_tag_value("role").trim().to_string();
                }
                if requested_role.is_empty() {
                    requested_role = "member".into();
                }

                let previous_role = self.groups.get_member_role(&group_id, &member_key).await?;

                let required = if previous_role.is_some() {
                    perm::PROMOTE_USER
                } else {
                    perm::ADD_USER
                };
                self.require_permission(&group_id, &event.pubkey, required)
                    .await?;
                if requested_role != "member" {
                    self.require_permission(&group_id, &event.pubkey, perm::PROMOTE_USER)
                        .await?;
                }

                let role_permissions = self.role_permissions_by_name(&group_id).await?;
                let admin_role_changed = admin_assignment_changed(
                    previous_role.as_deref().unwrap_or(""),
                    &requested_role,
                    &role_permissions,
                );

                self.groups
                    .upsert_member(&GroupMember {
                        group_id: group_id.clone(),
                        pubkey: member_key.clone(),
                        added_at: event.created_at,
                        added_by: event.pubkey.clone(),
                        role_name: requested_role,
                        promoted_at: event.created_at,
                        promoted_by: event.pubkey.clone(),
                    })
                    .await?;
                self.groups.delete_join_request(&group_id, &member_key).await?;
                membership_changed = true;
                admins_changed = admin_role_changed;
            }

            9001 => {
                self.require_permission(&group_id, &event.pubkey, perm::REMOVE_USER)
                    .await?;
                let member_key = event.first_tag_value("p").to_string();
                if member_key.is_empty() {
                    return Err(RelayError::Projection("remove-user missing p tag".into()));
                }
                self.groups.remove_member(&group_id, &member_key).await?;
                membership_changed = true;
                if event.has_tag("ban") {
                    let mut reason = event.first_tag_value("reason").trim().to_string();
                    if reason.is_empty() {
                        reason = event.first_tag_value("ban").trim().to_string();
                    }
                    self.groups
                        .upsert_ban(&GroupBan {
                            group_id: group_id.clone(),
                            pubkey: member_key,
                            reason,
                            banned_at: event.created_at,
                            banned_by: event.pubkey.clone(),
                            expires_at: parse_i64_tag(event.first_tag_value("expires_at")),
                        })
                        .await?;
                }
            }

            9009 => {
                self.require_permission(&group_id, &event.pubkey, perm::CREATE_INVITE)
                    .await?;
                let mut code = event.first_tag_value("code").to_string();
                if code.is_empty() {
                    code = event.first_tag_value("invite").to_string();
                }
                if code.is_empty() {
                    return Err(RelayError::Projection("invite event missing code".into()));
                }
                self.groups
                    .upsert_invite(&GroupInvite {
                        group_id: group_id.clone(),
                        code,
                        expires_at: parse_i64_tag(event.first_tag_value("expires_at")),
                        max_usage_count: parse_i64_tag(event.first_tag_value("max_usage_count"))
                            as i32,
                        usage_count: parse_i64_tag(event.first_tag_value("usage_count")) as i32,
                        created_at: event.created_at,
                        created_by: event.pubkey.clone(),
                    })
                    .await?;
            }

            9021 => {
                let request_key = join_request_pubkey(event)?;
                if self.groups.is_member(&group_id, &request_key).await? {
                    return Err(RelayError::Projection("duplicate: user already member".into()));
                }
                if self.groups.is_banned(&group_id, &request_key).await? {
                    return Err(RelayError::Projection("user is banned".into()));
                }

                if self.vetting.can_auto_approve(&group_id, &request_key).await? {
                    self.groups
                        .upsert_member(&GroupMember {
                            group_id: group_id.clone(),
                            pubkey: request_key,
                            added_at: event.created_at,
                            added_by: event.pubkey.clone(),
                            role_name: "member".into(),
                            ..Default::default()
                        })
                        .await?;
                    membership_changed = true;
                } else {
                    self.groups
                        .upsert_join_request(&GroupJoinRequest {
                            group_id: group_id.clone(),
                            pubkey: request_key,
                            created_at: event.created_at,
                        })
                        .await?;
                }
            }

            9022 => {
                self.groups.remove_member(&group_id, &event.pubkey).await?;
                self.groups
                    .delete_join_request(&group_id, &event.pubkey)
                    .await?;
                membership_changed = true;
            }

            9008 => {
                self.require_permission(&group_id, &event.pubkey, perm::DELETE_GROUP)
                    .await?;
                self.groups
                    .close_group(&group_id, event.created_at, &event.pubkey)
                    .await?;
            }

            9005 => {
                self.require_permission(&group_id, &event.pubkey, perm::DELETE_EVENT)
                    .await?;
                let target_id = event.first_tag_value("e").trim().to_string();
                if !target_id.is_empty() {
                    self.groups.remove_group_event_by_event_id(&target_id).await?;
                    match self.events.get_event(&target_id).await {
                        Ok(_) => {
                            if !self.events.is_deleted(&target_id).await? {
                                let mut reason =
                                    event.first_tag_value("reason").trim().to_string();
                                if reason.is_empty() {
                                    reason = "group moderation delete".into();
                                }
                                self.events
                                    .mark_deleted(&crate::models::DeletedEvent {
                                        event_id: target_id,
                                        deleted_at: event.created_at,
                                        deleted_by: event.pubkey.clone(),
                                        reason,
                                    })
                                    .await?;
                            }
                        }
                        Err(RelayError::NotFound) => {}
                        Err(err) => return Err(err),
                    }
                }
            }

            _ => {}
        }

        self.sync_canonical_state_events(event, &group_id, membership_changed, admins_changed)
            .await?;

        self.groups
            .add_group_event(&GroupEvent {
                group_id,
                event_id: event.id.clone(),
                created_at: event.created_at,
            })
            .await?;
        self.metrics.inc("group_projection_applied_total");
        Ok(())
    }

    /// Moderator-driven approval of a pending join request.
    pub async fn approve_join_request(
        &self,
        group_id: &str,
        pubkey: &str,
        approved_by: &str,
        approved_at: i64,
    ) -> Result<()> {
        self.require_permission(group_id, approved_by, perm::ADD_USER)
            .await?;
        self.groups
            .upsert_member(&GroupMember {
                group_id: group_id.to_string(),
                pubkey: pubkey.to_string(),
                added_at: approved_at,
                added_by: approved_by.to_string(),
                role_name: "member".into(),
                promoted_at: approved_at,
                promoted_by: approved_by.to_string(),
            })
            .await?;
        self.groups.delete_join_request(group_id, pubkey).await?;
        self.emit_members_state_event(group_id, approved_at).await?;
        self.metrics.inc("group_join_approved_total");
        Ok(())
    }

    /// Projection cleanup after an event is tombstoned.
    pub async fn apply_deletion(&self, event_id: &str) -> Result<()> {
        self.groups.remove_group_event_by_event_id(event_id).await?;
        self.metrics.inc("group_projection_deletion_applied_total");
        Ok(())
    }

    async fn require_permission(
        &self,
        group_id: &str,
        pubkey: &str,
        permission: &str,
    ) -> Result<()> {
        if self.groups.has_permission(group_id, pubkey, permission).await? {
            return Ok(());
        }
        if permission.trim().is_empty() {
            return Err(RelayError::Unauthorized("not authorized".into()));
        }
        Err(RelayError::Unauthorized(format!(
            "not authorized: missing {permission} permission"
        )))
    }

    async fn sync_canonical_state_events(
        &self,
        source: &Event,
        group_id: &str,
        membership_changed: bool,
        admins_changed: bool,
    ) -> Result<()> {
        if self.signer.is_none() || self.relay_pubkey.trim().is_empty() {
            return Ok(());
        }

        for kind in
            canonical_state_kinds_for_source(source.kind, membership_changed, admins_changed)
        {
            match kind {
                39000 => {
                    self.emit_group_metadata_state_event(group_id, source.created_at)
                        .await?
                }
                39001 => self.emit_admins_state_event(group_id, source.created_at).await?,
                39002 => self.emit_members_state_event(group_id, source.created_at).await?,
                39003 => self.emit_roles_state_event(group_id, source.created_at).await?,
                _ => {}
            }
        }
        Ok(())
    }

    async fn emit_group_metadata_state_event(&self, group_id: &str, created_at: i64) -> Result<()> {
        let group = self.groups.get_group(group_id).await?;
        self.upsert_canonical_state_event(39000, group_id, created_at, group_metadata_state_tags(&group))
            .await
    }

    async fn emit_members_state_event(&self, group_id: &str, created_at: i64) -> Result<()> {
        let members = self.groups.list_members(group_id).await?;
        self.upsert_canonical_state_event(
            39002,
            group_id,
            created_at,
            group_members_state_tags(group_id, &members),
        )
        .await
    }

    async fn emit_admins_state_event(&self, group_id: &str, created_at: i64) -> Result<()> {
        let group = self.groups.get_group(group_id).await?;
        let members = self.groups.list_members(group_id).await?;
        let role_permissions = self.role_permissions_by_name(group_id).await?;

        let mut admin_roles: HashMap<String, String> = HashMap::new();
        for member in &members {
            let role_name = default_string(&member.role_name, "member");
            let normalized = perm::normalize(&role_name);
            let permissions = role_permissions.get(&normalized).map(Vec::as_slice).unwrap_or(&[]);
            if perm::role_grants_admin(&normalized, permissions) {
                admin_roles.insert(member.pubkey.clone(), role_name);
            }
        }
        if !group.created_by.is_empty() {
            admin_roles
                .entry(group.created_by.clone())
                .or_insert_with(|| "owner".into());
        }

        let mut pubkeys: Vec<&String> = admin_roles.keys().collect();
        pubkeys.sort();

        let mut tags = vec![Tag(vec!["d".into(), group_id.to_string()])];
        for pubkey in pubkeys {
            let role_name = default_string(&admin_roles[pubkey], "owner");
            tags.push(Tag(vec!["p".into(), pubkey.clone(), role_name]));
        }

        self.upsert_canonical_state_event(39001, group_id, created_at, tags)
            .await
    }

    async fn emit_roles_state_event(&self, group_id: &str, created_at: i64) -> Result<()> {
        let roles = self.groups.list_roles(group_id).await?;
        self.upsert_canonical_state_event(
            39003,
            group_id,
            created_at,
            group_roles_state_tags(group_id, &roles),
        )
        .await
    }

    /// Sign a state snapshot with the relay key and persist it as a
    /// parameterized-replaceable event addressed by the group id.
    async fn upsert_canonical_state_event(
        &self,
        kind: i32,
        group_id: &str,
        created_at: i64,
        tags: Vec<Tag>,
    ) -> Result<()> {
        let Some(signer) = &self.signer else {
            return Ok(());
        };

        let event = signer.sign_event(created_at, kind, tags, String::new())?;
        if !event.pubkey.eq_ignore_ascii_case(&self.relay_pubkey) {
            return Err(RelayError::Projection(
                "signed canonical state event pubkey does not match relay pubkey".into(),
            ));
        }

        self.events
            .upsert_parameterized_replaceable_event(&event, group_id)
            .await?;
        self.groups
            .add_group_event(&GroupEvent {
                group_id: group_id.to_string(),
                event_id: event.id,
                created_at,
            })
            .await?;
        Ok(())
    }

    async fn role_permissions_by_name(
        &self,
        group_id: &str,
    ) -> Result<HashMap<String, Vec<String>>> {
        let roles = self.groups.list_roles(group_id).await?;
        Ok(roles
            .into_iter()
            .map(|role| (perm::normalize(&role.role_name), role.permissions))
            .collect())
    }
}

/// All moderation permissions granted to the `owner` role on group creation.
fn owner_role_permissions() -> Vec<String> {
    perm::MODERATION.iter().map(|p| p.to_string()).collect()
}

/// Canonical state kinds to re-emit for a source kind, deduplicated in
/// emission order.
fn canonical_state_kinds_for_source(
    kind: i32,
    membership_changed: bool,
    admins_changed: bool,
) -> Vec<i32> {
    fn append_unique(event_kind: i32, kinds: &mut Vec<i32>) {
        if !kinds.contains(&event_kind) {
            kinds.push(event_kind);
        }
    }
    let mut kinds: Vec<i32> = Vec::with_capacity(4);

    match kind {
        9007 => {
            append_unique(39000, &mut kinds);
            append_unique(39002, &mut kinds);
            append_unique(39003, &mut kinds);
            append_unique(39001, &mut kinds);
        }
        9002 | 9008 => append_unique(39000, &mut kinds),
        9003 | 9004 => append_unique(39003, &mut kinds),
        9000 | 9001 | 9021 | 9022 => {
            if membership_changed {
                append_unique(39002, &mut kinds);
            }
        }
        _ => {}
    }

    if kind == 9000 && admins_changed {
        append_unique(39001, &mut kinds);
    }

    kinds
}

/// `["d", group]` plus non-empty metadata values and presence-only flags.
fn group_metadata_state_tags(group: &Group) -> Vec<Tag> {
    let mut tags = vec![Tag(vec!["d".into(), group.group_id.clone()])];
    if !group.name.is_empty() {
        tags.push(Tag(vec!["name".into(), group.name.clone()]));
    }
    if !group.picture.is_empty() {
        tags.push(Tag(vec!["picture".into(), group.picture.clone()]));
    }
    if !group.about.is_empty() {
        tags.push(Tag(vec!["about".into(), group.about.clone()]));
    }
    if !group.geohash.is_empty() {
        tags.push(Tag(vec!["g".into(), truncate_geohash(&group.geohash)]));
    }
    if group.is_private {
        tags.push(Tag(vec!["private".into()]));
    }
    if group.is_restricted {
        tags.push(Tag(vec!["restricted".into()]));
    }
    if group.is_vetted {
        tags.push(Tag(vec!["vetted".into()]));
    }
    if group.is_hidden {
        tags.push(Tag(vec!["hidden".into()]));
    }
    if group.is_closed {
        tags.push(Tag(vec!["closed".into()]));
    }
    tags
}

fn group_members_state_tags(group_id: &str, members: &[GroupMember]) -> Vec<Tag> {
    let mut tags = vec![Tag(vec!["d".into(), group_id.to_string()])];
    for member in members {
        tags.push(Tag(vec!["p".into(), member.pubkey.clone()]));
    }
    tags
}

fn group_roles_state_tags(group_id: &str, roles: &[GroupRole]) -> Vec<Tag> {
    let mut tags = vec![Tag(vec!["d".into(), group_id.to_string()])];
    for role in roles {
        let mut fields = vec!["role".to_string(), role.role_name.clone()];
        if !role.description.is_empty() {
            fields.push(role.description.clone());
        }
        tags.push(Tag(fields));
    }
    tags
}

/// Whether a put-user changes the admin set: admin-hood flips, or the member
/// moves between two distinct admin-granting roles.
fn admin_assignment_changed(
    previous_role: &str,
    requested_role: &str,
    role_permissions: &HashMap<String, Vec<String>>,
) -> bool {
    let previous = perm::normalize(previous_role);
    let requested = perm::normalize(requested_role);
    if previous == requested {
        return false;
    }

    let empty: Vec<String> = Vec::new();
    let previous_was_admin = perm::role_grants_admin(
        &previous,
        role_permissions.get(&previous).unwrap_or(&empty),
    );
    let requested_is_admin = perm::role_grants_admin(
        &requested,
        role_permissions.get(&requested).unwrap_or(&empty),
    );
    if previous_was_admin != requested_is_admin {
        return true;
    }
    previous_was_admin && requested_is_admin
}

/// Member pubkey and optional role from the first `p` tag.
fn parse_put_user_tag(event: &Event) -> Result<(String, String)> {
    for tag in &event.tags {
        if tag.0.len() < 2 || tag.name() != "p" {
            continue;
        }
        let pubkey = tag.value().trim().to_string();
        if pubkey.is_empty() {
            return Err(RelayError::Projection("put-user missing p tag".into()));
        }
        let role = tag.0.get(2).map(|r| r.trim().to_string()).unwrap_or_default();
        return Ok((pubkey, role));
    }
    Err(RelayError::Projection("put-user missing p tag".into()))
}

/// The requester of a join event: the `p` tag when present (which must match
/// the event author), otherwise the author.
fn join_request_pubkey(event: &Event) -> Result<String> {
    let request_key = event.first_tag_value("p").trim().to_string();
    if request_key.is_empty() {
        return Ok(event.pubkey.trim().to_string());
    }
    if !request_key.eq_ignore_ascii_case(event.pubkey.trim()) {
        return Err(RelayError::Projection(
            "join-request p tag must match event pubkey".into(),
        ));
    }
    Ok(request_key)
}

fn role_name_from_tags(event: &Event) -> Option<String> {
    let role = event.first_tag_value("role");
    if !role.is_empty() {
        return Some(role.to_string());
    }
    let d = event.first_tag_value("d");
    if !d.is_empty() {
        return Some(d.to_string());
    }
    None
}

/// Boolean tags come in three shapes: presence-only, empty value, and truthy
/// string. `None` means the tag is absent.
fn tag_bool_value(event: &Event, name: &str) -> Option<bool> {
    for tag in &event.tags {
        if tag.name() != name {
            continue;
        }
        let Some(raw) = tag.0.get(1) else {
            return Some(true);
        };
        if raw.trim().is_empty() {
            return Some(true);
        }
        return Some(parse_bool_tag(raw));
    }
    None
}

fn parse_bool_tag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_i64_tag(raw: &str) -> i64 {
    raw.trim().parse().unwrap_or(0)
}

fn parse_csv_tag(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn truncate_geohash(gh: &str) -> String {
    gh.chars().take(6).collect()
}

fn default_string(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
