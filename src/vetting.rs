//! Vetted-group membership policy.

use crate::error::{RelayError, Result};
use crate::storage::GroupStore;

/// Decides whether a join request may bypass moderator approval.
#[derive(Clone)]
pub struct VettingPolicy {
    groups: GroupStore,
}

impl VettingPolicy {
    pub fn new(groups: GroupStore) -> Self {
        Self { groups }
    }

    /// Unknown groups always require approval; known groups follow their
    /// `is_vetted` flag.
    pub async fn join_requires_approval(&self, group_id: &str) -> Result<bool> {
        match self.groups.get_group(group_id).await {
            Ok(group) => Ok(group.is_vetted),
            Err(RelayError::NotFound) => Ok(true),
            Err(err) => Err(err),
        }
    }

    /// Auto-approval needs an unvetted group and an unbanned requester.
    pub async fn can_auto_approve(&self, group_id: &str, pubkey: &str) -> Result<bool> {
        if self.join_requires_approval(group_id).await? {
            return Ok(false);
        }
        Ok(!self.groups.is_banned(group_id, pubkey).await?)
    }
}
