//! Projection row types and the group permission vocabulary.

use serde::{Deserialize, Serialize};

/// Projected group metadata state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(default)]
pub struct Group {
    pub group_id: String,
    pub name: String,
    pub about: String,
    pub picture: String,
    pub geohash: String,
    pub is_private: bool,
    pub is_restricted: bool,
    pub is_vetted: bool,
    pub is_hidden: bool,
    pub is_closed: bool,
    pub created_at: i64,
    pub created_by: String,
    pub updated_at: i64,
    pub updated_by: String,
}

/// Projected membership row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(default)]
pub struct GroupMember {
    pub group_id: String,
    pub pubkey: String,
    pub added_at: i64,
    pub added_by: String,
    pub role_name: String,
    pub promoted_at: i64,
    pub promoted_by: String,
}

/// Named permission set inside a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(default)]
pub struct GroupRole {
    pub group_id: String,
    pub role_name: String,
    pub description: String,
    pub permissions: Vec<String>,
    pub created_at: i64,
    pub created_by: String,
    pub updated_at: i64,
    pub updated_by: String,
}

/// User ban for a group; `expires_at == 0` means permanent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(default)]
pub struct GroupBan {
    pub group_id: String,
    pub pubkey: String,
    pub reason: String,
    pub banned_at: i64,
    pub banned_by: String,
    pub expires_at: i64,
}

/// Projected invite code row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(default)]
pub struct GroupInvite {
    pub group_id: String,
    pub code: String,
    pub expires_at: i64,
    pub max_usage_count: i32,
    pub usage_count: i32,
    pub created_at: i64,
    pub created_by: String,
}

/// Pending request for membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(default)]
pub struct GroupJoinRequest {
    pub group_id: String,
    pub pubkey: String,
    pub created_at: i64,
}

/// Link between a stored event and a group projection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(default)]
pub struct GroupEvent {
    pub group_id: String,
    pub event_id: String,
    pub created_at: i64,
}

/// Deletion tombstone for a previously accepted event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
#[serde(default)]
pub struct DeletedEvent {
    pub event_id: String,
    pub deleted_at: i64,
    pub deleted_by: String,
    pub reason: String,
}

/// One normalized tag row derived from an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct EventTag {
    pub event_id: String,
    pub tag_index: i32,
    pub tag_name: String,
    pub tag_value: String,
    pub tag_array: Vec<String>,
}

/// Group permission vocabulary and the algebra over role permission sets.
pub mod perm {
    pub const ADMIN: &str = "admin";
    pub const ADD_USER: &str = "add-user";
    pub const PROMOTE_USER: &str = "promote-user";
    pub const REMOVE_USER: &str = "remove-user";
    pub const EDIT_METADATA: &str = "edit-metadata";
    pub const CREATE_ROLE: &str = "create-role";
    pub const DELETE_ROLE: &str = "delete-role";
    pub const DELETE_EVENT: &str = "delete-event";
    pub const CREATE_GROUP: &str = "create-group";
    pub const DELETE_GROUP: &str = "delete-group";
    pub const CREATE_INVITE: &str = "create-invite";

    /// Every moderation permission except `admin` itself.
    pub const MODERATION: [&str; 10] = [
        ADD_USER,
        PROMOTE_USER,
        REMOVE_USER,
        EDIT_METADATA,
        CREATE_ROLE,
        DELETE_ROLE,
        DELETE_EVENT,
        CREATE_GROUP,
        DELETE_GROUP,
        CREATE_INVITE,
    ];

    /// Trim and lowercase a permission or role name for matching.
    pub fn normalize(value: &str) -> String {
        value.trim().to_lowercase()
    }

    /// Permissions implied by a role name alone.
    pub fn default_role_permissions(role_name: &str) -> &'static [&'static str] {
        match role_name {
            "admin" => &MODERATION,
            _ => &[],
        }
    }

    /// Whether a role (with its stored permission set) grants `required`.
    ///
    /// `owner` is all-powerful; any set containing `admin` grants everything.
    pub fn role_has_permission(
        role_name: &str,
        role_permissions: &[String],
        required: &str,
    ) -> bool {
        let required = normalize(required);
        if required.is_empty() {
            return false;
        }

        let role_name = normalize(role_name);
        if role_name == "owner" {
            return true;
        }

        let mut has_admin = false;
        let mut has_required = false;
        for p in default_role_permissions(&role_name)
            .iter()
            .map(|p| normalize(p))
            .chain(role_permissions.iter().map(|p| normalize(p)))
        {
            if p == required {
                has_required = true;
            }
            if p == ADMIN {
                has_admin = true;
            }
        }
        has_required || has_admin
    }

    /// Whether the role name or its permission set confers admin-hood.
    pub fn role_grants_admin(role_name: &str, permissions: &[String]) -> bool {
        match normalize(role_name).as_str() {
            "" => false,
            "owner" | "admin" => true,
            _ => permissions.iter().any(|p| normalize(p) == ADMIN),
        }
    }
}
