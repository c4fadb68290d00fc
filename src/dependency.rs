//! Reverse dependency tracking for objects the reconcilers care about but do
//! not own.
//!
//! Kubernetes only wakes a reconciler for objects whose controller owner is
//! the reconciled kind. Init jobs are owned by their PVC (so deleting the
//! PVC cascades), and PVs and VolumeAttachments are cluster-scoped, so none
//! of them can carry an owner reference back to a Pool or Checkout. Instead,
//! every such object carries an annotation listing its dependents, keyed by
//! the dependent kind; the watch handlers decode the annotation and enqueue
//! each dependent. Stale entries cost at most one no-op reconcile.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

pub const DEPENDENCY_ANNOTATION_PREFIX: &str = "pvpool.puppet.com/dependency-of";

/// One entry in a dependency annotation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DependentRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// The annotation key under which dependents of kind `K` are tracked.
pub fn annotation_key<K>() -> String
where
    K: Resource<DynamicType = ()>,
{
    format!(
        "{}.{}",
        DEPENDENCY_ANNOTATION_PREFIX,
        K::kind(&()).to_ascii_lowercase()
    )
}

fn decode(meta: &ObjectMeta, key: &str) -> Result<Vec<DependentRef>> {
    match meta.annotations.as_ref().and_then(|a| a.get(key)) {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(vec![]),
    }
}

/// Record `dependent` as a dependent of the object described by `meta`.
/// Returns true when the annotation changed.
pub fn set_dependency_of<K>(meta: &mut ObjectMeta, dependent: &K) -> Result<bool>
where
    K: Resource<DynamicType = ()>,
{
    let key = annotation_key::<K>();
    let entry = DependentRef {
        namespace: dependent.namespace(),
        name: dependent.name_any(),
    };

    let mut entries = decode(meta, &key).unwrap_or_default();
    if entries.contains(&entry) {
        return Ok(false);
    }
    entries.push(entry);

    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key, serde_json::to_string(&entries)?);
    Ok(true)
}

/// The dependents of kind `K` recorded on an object, as reconcile requests.
/// A malformed annotation yields no requests rather than an error; the
/// object will be rewritten on the owner's next reconcile.
pub fn dependent_requests<K>(meta: &ObjectMeta) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    decode(meta, &annotation_key::<K>())
        .unwrap_or_default()
        .into_iter()
        .map(|d| {
            let obj_ref = ObjectRef::<K>::new(&d.name);
            match d.namespace {
                Some(ns) => obj_ref.within(&ns),
                None => obj_ref,
            }
        })
        .collect()
}
