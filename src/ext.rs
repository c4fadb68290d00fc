//! Small helpers over kube objects shared by the reconcilers.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Whether an object has been persisted to the API server.
pub fn exists(meta: &ObjectMeta) -> bool {
    meta.uid.is_some()
}

/// The controller owner reference of an object, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether `owner` is the controller of the object described by `meta`.
pub fn is_controlled_by<K>(meta: &ObjectMeta, owner: &K) -> bool
where
    K: Resource,
{
    match (controller_of(meta), owner.meta().uid.as_ref()) {
        (Some(r), Some(uid)) => &r.uid == uid,
        _ => false,
    }
}

/// Install `owner` as the controller of the object described by `meta`,
/// replacing any existing controller reference.
pub fn set_controller_ref<K>(meta: &mut ObjectMeta, owner: &K)
where
    K: Resource<DynamicType = ()>,
{
    let Some(owner_ref) = owner.controller_owner_ref(&()) else {
        return;
    };

    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|r| r.controller == Some(true)) {
        Some(existing) => *existing = owner_ref,
        None => refs.push(owner_ref),
    }
}

pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations.as_ref()?.get(key).map(String::as_str)
}

pub fn annotate(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Copy labels and annotations from a template's metadata onto an object,
/// preserving entries the template does not mention.
pub fn label_annotate_from(meta: &mut ObjectMeta, template: &ObjectMeta) {
    if let Some(labels) = &template.labels {
        meta.labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
    }
    if let Some(annotations) = &template.annotations {
        meta.annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
    }
}

/// Write an object back to the API server, creating it when it has never
/// been persisted and replacing it otherwise. Replacement carries the
/// object's `resourceVersion`, so concurrent writers surface as conflicts.
pub async fn create_or_replace<K>(api: &Api<K>, obj: &K) -> Result<K, kube::Error>
where
    K: Resource + Serialize + DeserializeOwned + Clone + std::fmt::Debug,
{
    let name = obj.meta().name.clone().unwrap_or_default();
    let pp = PostParams::default();

    if obj.meta().resource_version.is_some() {
        return api.replace(&name, &pp, obj).await;
    }

    match api.create(&pp, obj).await {
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            // Lost a create race; adopt the existing object's version and
            // replace it.
            let current = api.get(&name).await?;
            let mut desired = obj.clone();
            desired.meta_mut().resource_version = current.meta().resource_version.clone();
            desired.meta_mut().uid = current.meta().uid.clone();
            api.replace(&name, &pp, &desired).await
        }
        other => other,
    }
}

/// Delete an object, treating a missing object as success.
pub async fn delete_ignore_not_found<K>(
    api: &Api<K>,
    name: &str,
    dp: &DeleteParams,
) -> Result<bool, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, dp).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(err) => Err(err),
    }
}

/// Render a label selector in the string form accepted by list requests.
pub fn label_selector_string(selector: &LabelSelector) -> Result<String, String> {
    let mut terms = Vec::new();

    if let Some(labels) = &selector.match_labels {
        for (k, v) in labels {
            terms.push(format!("{k}={v}"));
        }
    }

    for expr in selector.match_expressions.iter().flatten() {
        let values = || expr.values.clone().unwrap_or_default().join(",");
        match expr.operator.as_str() {
            "In" => terms.push(format!("{} in ({})", expr.key, values())),
            "NotIn" => terms.push(format!("{} notin ({})", expr.key, values())),
            "Exists" => terms.push(expr.key.clone()),
            "DoesNotExist" => terms.push(format!("!{}", expr.key)),
            op => return Err(format!("unrecognized selector operator {op:?}")),
        }
    }

    Ok(terms.join(","))
}

/// Evaluate a label selector against a label set.
pub fn label_selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> bool {
    if let Some(required) = &selector.match_labels {
        for (k, v) in required {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
    }

    for expr in selector.match_expressions.iter().flatten() {
        let value = labels.get(&expr.key);
        let in_values = |v: &String| {
            expr.values
                .as_ref()
                .is_some_and(|values| values.contains(v))
        };
        let ok = match expr.operator.as_str() {
            "In" => value.is_some_and(in_values),
            "NotIn" => value.map_or(true, |v| !in_values(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        };
        if !ok {
            return false;
        }
    }

    true
}
