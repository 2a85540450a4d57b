//! Channel visibility check.
use std::collections::BTreeSet;

use crate::model::Channel;

/// Capability granting read access to every channel that allows it.
pub const ACCESS_CHANNELS_PERMISSION: &str = "access channels";

/// Whoever is asking to read a channel, passed explicitly by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub authenticated: bool,
    pub uuid: Option<String>,
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            roles: BTreeSet::from(["anonymous".to_string()]),
            ..Default::default()
        }
    }

    pub fn user(uuid: &str, roles: &[&str]) -> Self {
        Self {
            authenticated: true,
            uuid: Some(uuid.to_string()),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            permissions: BTreeSet::new(),
        }
    }

    pub fn with_permission(mut self, permission: &str) -> Self {
        self.permissions.insert(permission.to_string());
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

pub fn can_access(channel: &Channel, principal: &Principal) -> bool {
    let rule = &channel.access;
    if rule.by_permission && principal.has_permission(ACCESS_CHANNELS_PERMISSION) {
        return true;
    }
    if !rule.allowed_roles.is_disjoint(&principal.roles) {
        return true;
    }
    if principal.authenticated {
        if let Some(uuid) = principal.uuid.as_deref() {
            return rule.allowed_users.contains(uuid);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(by_permission: bool, roles: &[&str], users: &[&str]) -> Channel {
        let mut channel: Channel =
            serde_yaml::from_str("id: c\nlabel: C\nentity_type: node\nbundle: page\n").unwrap();
        channel.access.by_permission = by_permission;
        channel.access.allowed_roles = roles.iter().map(|r| r.to_string()).collect();
        channel.access.allowed_users = users.iter().map(|u| u.to_string()).collect();
        channel
    }

    #[test]
    fn permission_only_counts_when_enabled() {
        let editor = Principal::user("u1", &["editor"]).with_permission(ACCESS_CHANNELS_PERMISSION);
        assert!(can_access(&channel(true, &[], &[]), &editor));
        assert!(!can_access(&channel(false, &[], &[]), &editor));
    }

    #[test]
    fn roles_grant_access() {
        let anon = Principal::anonymous();
        assert!(can_access(&channel(false, &["anonymous"], &[]), &anon));
        assert!(!can_access(&channel(false, &["editor"], &[]), &anon));
    }

    #[test]
    fn user_list_requires_authentication() {
        let user = Principal::user("u1", &[]);
        assert!(can_access(&channel(false, &[], &["u1"]), &user));
        assert!(!can_access(&channel(false, &[], &["u2"]), &user));

        let mut spoofed = Principal::anonymous();
        spoofed.uuid = Some("u1".into());
        assert!(!can_access(&channel(false, &[], &["u1"]), &spoofed));
    }
}
