use auth_operator_types::{BindDefinition, RoleDefinition, WebhookAuthorizer};
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/authorization.t-caas.telekom.com_roledefinitions.yaml",
        serde_yaml::to_string(&RoleDefinition::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/authorization.t-caas.telekom.com_binddefinitions.yaml",
        serde_yaml::to_string(&BindDefinition::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/authorization.t-caas.telekom.com_webhookauthorizers.yaml",
        serde_yaml::to_string(&WebhookAuthorizer::crd()).unwrap(),
    )
    .unwrap();
}
