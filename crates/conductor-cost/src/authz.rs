use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Actions a role can grant over cost data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "cost:read")]
    CostRead,
    #[serde(rename = "cost:admin")]
    CostAdmin,
    #[serde(rename = "cost:export")]
    CostExport,
}

/// Whether a user may see only their own records or everything.
/// Ordered so the widest scope compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    OwnWorkflows,
    AllWorkflows,
}

/// Built-in roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    CostViewer,
    CostAdmin,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CostViewer => "cost-viewer",
            Self::CostAdmin => "cost-admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cost-viewer" => Some(Self::CostViewer),
            "cost-admin" => Some(Self::CostAdmin),
            _ => None,
        }
    }

    pub fn permissions(&self) -> &'static [Permission] {
        match self {
            Self::CostViewer => &[Permission::CostRead],
            Self::CostAdmin => &[
                Permission::CostRead,
                Permission::CostAdmin,
                Permission::CostExport,
            ],
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Self::CostViewer => Scope::OwnWorkflows,
            Self::CostAdmin => Scope::AllWorkflows,
        }
    }
}

/// Role assignments and the decision surface over cost queries.
///
/// A user's permissions are the union over their roles; their scope is the
/// widest among them, defaulting to own-workflows.
#[derive(Default)]
pub struct Authorizer {
    assignments: RwLock<HashMap<String, HashSet<Role>>>,
}

impl Authorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_role(&self, user: &str, role: Role) {
        self.assignments
            .write()
            .entry(user.to_string())
            .or_default()
            .insert(role);
    }

    pub fn revoke_role(&self, user: &str, role: Role) {
        let mut assignments = self.assignments.write();
        if let Some(roles) = assignments.get_mut(user) {
            roles.remove(&role);
            if roles.is_empty() {
                assignments.remove(user);
            }
        }
    }

    pub fn roles(&self, user: &str) -> HashSet<Role> {
        self.assignments
            .read()
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    pub fn permissions(&self, user: &str) -> HashSet<Permission> {
        self.roles(user)
            .iter()
            .flat_map(|r| r.permissions().iter().copied())
            .collect()
    }

    pub fn has_permission(&self, user: &str, permission: Permission) -> bool {
        self.permissions(user).contains(&permission)
    }

    pub fn scope(&self, user: &str) -> Scope {
        self.roles(user)
            .iter()
            .map(|r| r.scope())
            .max()
            .unwrap_or(Scope::OwnWorkflows)
    }

    pub fn can_view(&self, user: &str) -> bool {
        self.has_permission(user, Permission::CostRead)
    }

    pub fn can_export(&self, user: &str) -> bool {
        self.has_permission(user, Permission::CostExport)
    }

    pub fn can_modify_limits(&self, user: &str) -> bool {
        self.has_permission(user, Permission::CostAdmin)
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.has_permission(user, Permission::CostAdmin)
    }

    /// Admins may see any run; viewers need cost:read, and the store must
    /// then filter results down to the user's own records.
    pub fn can_view_run_costs(&self, user: &str, _run_id: &str) -> bool {
        self.is_admin(user) || self.can_view(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_permissions_and_scope() {
        let authz = Authorizer::new();
        authz.assign_role("alice", Role::CostViewer);

        assert!(authz.can_view("alice"));
        assert!(!authz.can_export("alice"));
        assert!(!authz.is_admin("alice"));
        assert_eq!(authz.scope("alice"), Scope::OwnWorkflows);
    }

    #[test]
    fn admin_gets_union_and_widest_scope() {
        let authz = Authorizer::new();
        authz.assign_role("bob", Role::CostViewer);
        authz.assign_role("bob", Role::CostAdmin);

        assert!(authz.can_view("bob"));
        assert!(authz.can_export("bob"));
        assert!(authz.can_modify_limits("bob"));
        assert_eq!(authz.scope("bob"), Scope::AllWorkflows);
    }

    #[test]
    fn unknown_user_has_nothing() {
        let authz = Authorizer::new();
        assert!(!authz.can_view("ghost"));
        assert_eq!(authz.scope("ghost"), Scope::OwnWorkflows);
        assert!(authz.permissions("ghost").is_empty());
    }

    #[test]
    fn revoke_removes_access() {
        let authz = Authorizer::new();
        authz.assign_role("carol", Role::CostAdmin);
        assert!(authz.is_admin("carol"));
        authz.revoke_role("carol", Role::CostAdmin);
        assert!(!authz.is_admin("carol"));
        assert!(authz.roles("carol").is_empty());
    }

    #[test]
    fn run_costs_visible_to_viewer_and_admin() {
        let authz = Authorizer::new();
        authz.assign_role("viewer", Role::CostViewer);
        authz.assign_role("admin", Role::CostAdmin);

        assert!(authz.can_view_run_costs("viewer", "run-1"));
        assert!(authz.can_view_run_costs("admin", "run-1"));
        assert!(!authz.can_view_run_costs("ghost", "run-1"));
    }

    #[test]
    fn role_names_roundtrip() {
        assert_eq!(Role::parse("cost-viewer"), Some(Role::CostViewer));
        assert_eq!(Role::parse(Role::CostAdmin.name()), Some(Role::CostAdmin));
        assert_eq!(Role::parse("superuser"), None);
    }
}
