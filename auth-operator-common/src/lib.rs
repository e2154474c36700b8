pub mod apply;
pub mod conditions;
pub mod errors;
pub mod shutdown;

pub fn signal_ready() {
    let _ = std::fs::write("/etc/ready", "ready");
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

/// Well-known annotation/label keys stamped on every generated object.
pub mod annotations {
    pub const SOURCE_KIND: &str = "authorization.t-caas/source-kind";
    pub const SOURCE_NAME: &str = "authorization.t-caas/source-name";
    pub const SOURCE_NAMES: &str = "authorization.t-caas/source-names";
    pub const REFERENCED_BY: &str = "authorization.t-caas/referenced-by";
}

pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const CREATED_BY: &str = "app.kubernetes.io/created-by";
    pub const OPERATOR_NAME: &str = "auth-operator";
}

/// Field-ownership identity used for every SSA apply issued by the
/// controller's primary reconcilers.
pub const MANAGER_NAME: &str = "auth-operator";

pub mod finalizers {
    pub const ROLE_DEFINITION: &str = "authorization.t-caas.telekom.com/role-definition";
    pub const BIND_DEFINITION: &str = "authorization.t-caas.telekom.com/bind-definition";
    pub const ROLE_BINDING: &str = "authorization.t-caas.telekom.com/role-binding";
}

/// Builds the per-owner field-ownership identity used for shared
/// ServiceAccounts, e.g. `auth-operator/dev-team-binding`.
pub fn per_owner_manager(owner_name: &str) -> String {
    format!("{MANAGER_NAME}/{owner_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_owner_manager_is_namespaced_under_the_base_identity() {
        assert_eq!(per_owner_manager("bd1"), "auth-operator/bd1");
    }
}
