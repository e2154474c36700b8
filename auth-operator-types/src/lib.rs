//! CRD types for the `authorization.t-caas.telekom.com/v1alpha1` API group.
//!
//! One `#[derive(CustomResource)]` struct per kind, plain serde structs for
//! everything nested, and a `JsonSchema` derive throughout so
//! `kube::CustomResourceExt::crd()` can produce the CRD manifest.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub const GROUP: &str = "authorization.t-caas.telekom.com";
pub const VERSION: &str = "v1alpha1";

/// `authorization.t-caas/missing-role-policy` annotation key.
pub const MISSING_ROLE_POLICY_ANNOTATION: &str = "authorization.t-caas/missing-role-policy";

/// `authorization.t-caas/breakglass-compatible` label key.
pub const BREAKGLASS_LABEL: &str = "authorization.t-caas/breakglass-compatible";

// ---------------------------------------------------------------------
// RoleDefinition
// ---------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "authorization.t-caas.telekom.com",
    version = "v1alpha1",
    kind = "RoleDefinition",
    plural = "roledefinitions",
    derive = "PartialEq",
    status = "RoleDefinitionStatus",
    shortname = "roledef"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.conditions[?(@.type==\\\"Ready\\\")].status\", \"name\": \"READY\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".metadata.creationTimestamp\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct RoleDefinitionSpec {
    pub target_role: TargetRoleKind,
    pub target_name: String,
    pub target_namespace: Option<String>,
    #[serde(default)]
    pub scope_namespaced: bool,
    #[serde(default, rename = "restrictedAPIs")]
    pub restricted_apis: BTreeSet<String>,
    #[serde(default)]
    pub restricted_resources: Vec<RestrictedResource>,
    #[serde(default)]
    pub restricted_verbs: BTreeSet<String>,
    pub breakglass_allowed: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum TargetRoleKind {
    ClusterRole,
    Role,
}

impl Default for TargetRoleKind {
    fn default() -> Self {
        Self::ClusterRole
    }
}

impl fmt::Display for TargetRoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRoleKind::ClusterRole => write!(f, "ClusterRole"),
            TargetRoleKind::Role => write!(f, "Role"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestrictedResource {
    pub api_group: String,
    pub resource: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleDefinitionStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// ---------------------------------------------------------------------
// BindDefinition
// ---------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "authorization.t-caas.telekom.com",
    version = "v1alpha1",
    kind = "BindDefinition",
    plural = "binddefinitions",
    derive = "PartialEq",
    status = "BindDefinitionStatus",
    shortname = "binddef"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.conditions[?(@.type==\\\"Ready\\\")].status\", \"name\": \"READY\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.missingRoleRefs\", \"name\": \"MISSING-REFS\", \"type\": \"string\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct BindDefinitionSpec {
    pub target_name: String,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub cluster_role_bindings: ClusterRoleBindingsSpec,
    #[serde(default)]
    pub role_bindings: Vec<RoleBindingEntry>,
    pub automount_service_account_token: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleBindingsSpec {
    #[serde(default)]
    pub cluster_role_refs: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleBindingEntry {
    #[serde(default)]
    pub cluster_role_refs: Vec<String>,
    #[serde(default)]
    pub role_refs: Vec<String>,
    pub namespace: Option<String>,
    pub namespace_selector: Option<Vec<LabelSelector>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum SubjectKind {
    User,
    Group,
    ServiceAccount,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub kind: SubjectKind,
    pub name: String,
    /// Required (and meaningful) only for `kind = ServiceAccount`: the
    /// namespace the ServiceAccount lives (or will be created) in.
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum MissingRolePolicy {
    Warn,
    Error,
    Ignore,
}

impl Default for MissingRolePolicy {
    fn default() -> Self {
        Self::Warn
    }
}

impl FromStr for MissingRolePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warn" => Ok(MissingRolePolicy::Warn),
            "error" => Ok(MissingRolePolicy::Error),
            "ignore" => Ok(MissingRolePolicy::Ignore),
            _ => Err(()),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindDefinitionStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub missing_role_refs: Vec<String>,
    #[serde(default)]
    pub external_service_accounts: Vec<String>,
}

/// `<targetName>-<roleRef>-binding`, the name used for every generated
/// ClusterRoleBinding/RoleBinding.
pub fn binding_name(target_name: &str, role_ref: &str) -> String {
    format!("{target_name}-{role_ref}-binding")
}

// ---------------------------------------------------------------------
// WebhookAuthorizer
// ---------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "authorization.t-caas.telekom.com",
    version = "v1alpha1",
    kind = "WebhookAuthorizer",
    plural = "webhookauthorizers",
    derive = "PartialEq",
    status = "WebhookAuthorizerStatus",
    shortname = "webhookauth"
)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuthorizerSpec {
    #[serde(default)]
    pub namespace_selector: LabelSelector,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuthorizerStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub authorizer_configured: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_name_matches_convention() {
        assert_eq!(binding_name("dev", "view"), "dev-view-binding");
    }

    #[test]
    fn missing_role_policy_defaults_to_warn() {
        assert_eq!(MissingRolePolicy::default(), MissingRolePolicy::Warn);
    }

    #[test]
    fn missing_role_policy_parses_known_values() {
        assert_eq!("warn".parse(), Ok(MissingRolePolicy::Warn));
        assert_eq!("error".parse(), Ok(MissingRolePolicy::Error));
        assert_eq!("ignore".parse(), Ok(MissingRolePolicy::Ignore));
        assert_eq!("bogus".parse::<MissingRolePolicy>(), Err(()));
    }
}
