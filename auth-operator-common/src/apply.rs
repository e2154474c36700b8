//! Generic server-side-apply helpers that work for any kind --
//! ClusterRole and ClusterRoleBinding are cluster-scoped,
//! Role/RoleBinding/ServiceAccount are namespaced, and the three
//! reconcilers need to apply both shapes through the same code path.

use crate::errors::{Error, Result};
use kube::api::{Api, Patch, PatchParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Creates or updates `obj` via server-side apply, owning every field under
/// `manager`. `force` steals conflicting fields from other managers --
/// callers ask for it explicitly rather than it being baked in, since
/// stealing fields from a shared ServiceAccount's other owners is only
/// correct for the fields this reconciler actually sets.
pub async fn apply<K>(api: &Api<K>, name: &str, obj: &K, manager: &str, force: bool) -> Result<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
{
    let mut pp = PatchParams::apply(manager);
    if force {
        pp = pp.force();
    }
    Ok(api.patch(name, &pp, &Patch::Apply(obj)).await?)
}

/// Applies only the `/status` subresource of `obj`.
pub async fn apply_status<K>(api: &Api<K>, name: &str, obj: &K, manager: &str) -> Result<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
{
    let pp = PatchParams::apply(manager).force();
    Ok(api.patch_status(name, &pp, &Patch::Apply(obj)).await?)
}

/// Deletes `name` and swallows a 404, since the object the reconciler is
/// trying to remove having already disappeared is success, not failure.
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}

/// Retrieves `name`, swallowing a 404 into `None` rather than an error --
/// used by the reconcilers to check "does this already exist" before
/// deciding how to react to a missing object.
pub async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(Error::from(e)),
    }
}
