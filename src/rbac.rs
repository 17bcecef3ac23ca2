//! Role-permission matrix (§4.8). Permissions are flat strings; `canPerform` is the
//! single source of truth every REST handler and frame-level check goes through.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Viewer,
    Developer,
    Operator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Operator => "OPERATOR",
            Role::Developer => "DEVELOPER",
            Role::Viewer => "VIEWER",
        }
    }
}

impl FromStr for Role {
    type Err = crate::error::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Role::Admin),
            "OPERATOR" => Ok(Role::Operator),
            "DEVELOPER" => Ok(Role::Developer),
            "VIEWER" => Ok(Role::Viewer),
            other => Err(crate::error::AppError::Validation {
                details: vec![format!("unknown role '{other}'")],
            }),
        }
    }
}

/// Flat permission strings checked by every gated operation.
pub mod perm {
    pub const USERS_READ: &str = "users:read";
    pub const USERS_WRITE: &str = "users:write";
    pub const USERS_DELETE: &str = "users:delete";
    pub const TEAMS_READ: &str = "teams:read";
    pub const TEAMS_WRITE: &str = "teams:write";
    pub const INSTANCES_READ: &str = "instances:read";
    pub const INSTANCES_UPDATE: &str = "instances:update";
    pub const INSTANCES_DEPLOY: &str = "instances:deploy";
    pub const INSTANCES_DESTROY: &str = "instances:destroy";
    pub const INSTANCES_DESTROY_OTHER_TEAM: &str = "instances:destroy_other_team";
    pub const INSTANCES_EXECUTE: &str = "instances:execute";
    pub const INSTANCES_CONNECT: &str = "instances:connect";
    pub const EXTENSIONS_INSTALL: &str = "extensions:install";
    pub const EXTENSIONS_REMOVE: &str = "extensions:remove";
    pub const AUDIT_READ: &str = "audit:read";
    pub const ALERTS_WRITE: &str = "alerts:write";
    pub const BUDGETS_WRITE: &str = "budgets:write";
    pub const TASKS_WRITE: &str = "tasks:write";
    pub const TEMPLATES_WRITE: &str = "templates:write";
    pub const API_KEYS_WRITE: &str = "api_keys:write";
}

/// Returns true iff `role` carries `permission` per the fixed matrix in §4.8.
/// Invariant under test (§8.7): false for every pair not explicitly granted here.
pub fn can_perform(role: Role, permission: &str) -> bool {
    use perm::*;
    if role == Role::Admin {
        return true;
    }
    let granted: &[&str] = match role {
        Role::Admin => unreachable!(),
        Role::Operator => &[
            USERS_READ,
            TEAMS_READ,
            INSTANCES_READ,
            INSTANCES_UPDATE,
            INSTANCES_DEPLOY,
            INSTANCES_DESTROY,
            INSTANCES_EXECUTE,
            INSTANCES_CONNECT,
            EXTENSIONS_INSTALL,
            EXTENSIONS_REMOVE,
            AUDIT_READ,
            ALERTS_WRITE,
            BUDGETS_WRITE,
            TASKS_WRITE,
            TEMPLATES_WRITE,
        ],
        Role::Developer => &[
            USERS_READ,
            TEAMS_READ,
            INSTANCES_READ,
            INSTANCES_UPDATE,
            INSTANCES_EXECUTE,
            INSTANCES_CONNECT,
            EXTENSIONS_INSTALL,
        ],
        Role::Viewer => &[USERS_READ, TEAMS_READ, INSTANCES_READ],
    };
    granted.contains(&permission)
}

/// True when the instance's team is one the user belongs to, or the user is ADMIN.
/// Non-ADMIN roles are scoped to their teams per §4.8; ADMIN bypasses scoping.
pub fn in_scope(role: Role, user_team_ids: &[uuid::Uuid], instance_team_id: Option<uuid::Uuid>) -> bool {
    if role == Role::Admin {
        return true;
    }
    match instance_team_id {
        Some(team_id) => user_team_ids.contains(&team_id),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_can_perform_everything() {
        assert!(can_perform(Role::Admin, perm::USERS_DELETE));
        assert!(can_perform(Role::Admin, "anything:at_all"));
    }

    #[test]
    fn viewer_cannot_write() {
        assert!(!can_perform(Role::Viewer, perm::INSTANCES_DEPLOY));
        assert!(!can_perform(Role::Viewer, perm::USERS_DELETE));
        assert!(can_perform(Role::Viewer, perm::INSTANCES_READ));
    }

    #[test]
    fn developer_cannot_destroy() {
        assert!(!can_perform(Role::Developer, perm::INSTANCES_DESTROY));
        assert!(can_perform(Role::Developer, perm::INSTANCES_EXECUTE));
    }

    #[test]
    fn operator_cannot_delete_users() {
        assert!(!can_perform(Role::Operator, perm::USERS_DELETE));
        assert!(can_perform(Role::Operator, perm::INSTANCES_DESTROY));
    }

    #[test]
    fn scoping_bypassed_for_admin_only() {
        let team = uuid::Uuid::new_v4();
        assert!(in_scope(Role::Admin, &[], Some(team)));
        assert!(!in_scope(Role::Operator, &[], Some(team)));
        assert!(in_scope(Role::Operator, &[team], Some(team)));
    }
}
