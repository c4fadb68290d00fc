//! Spec validation shared by the admission validators and the reconcilers.
//!
//! Errors are reported as field-path strings suitable for embedding in a
//! Kubernetes `Invalid` status.

use std::collections::BTreeMap;

use crate::crd::{CheckoutSpec, PoolSpec};
use crate::ext::label_selector_matches;

/// Restart policy required of init job pods. Jobs cannot use the default
/// `Always` policy, and a restarting init job would mask failures.
pub const MOUNT_JOB_RESTART_POLICY: &str = "Never";

/// Longest an init job may run before the replica is considered stuck.
pub const MOUNT_JOB_MAX_ACTIVE_DEADLINE_SECONDS: i64 = 300;

/// Most retries an init job may make before the replica goes stale.
pub const MOUNT_JOB_MAX_BACKOFF_LIMIT: i32 = 10;

/// Default name of the init job pod volume bound to the replica's PVC.
pub const DEFAULT_MOUNT_JOB_VOLUME_NAME: &str = "workspace";

pub fn validate_pool_spec(spec: &PoolSpec) -> Vec<String> {
    let mut errs = Vec::new();

    if let Some(n) = spec.replicas {
        if n < 0 {
            errs.push(format!("spec.replicas: Invalid value: {n}: must be nonnegative"));
        }
    }

    let selector_terms = spec.selector.match_labels.as_ref().map_or(0, BTreeMap::len)
        + spec
            .selector
            .match_expressions
            .as_ref()
            .map_or(0, Vec::len);
    if selector_terms == 0 {
        errs.push("spec.selector: Invalid value: empty selector will match all claims".to_string());
    } else {
        let labels = spec
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        if !label_selector_matches(&spec.selector, &labels) {
            errs.push(
                "spec.template.metadata.labels: Invalid value: selector does not match template labels"
                    .to_string(),
            );
        }
    }

    if let Some(init_job) = &spec.init_job {
        let job_spec = &init_job.template.spec;

        if let Some(policy) = job_spec
            .template
            .spec
            .as_ref()
            .and_then(|s| s.restart_policy.as_deref())
        {
            if policy != MOUNT_JOB_RESTART_POLICY {
                errs.push(format!(
                    "spec.initJob.template.spec.template.spec.restartPolicy: Unsupported value: {policy:?}: supported values: {MOUNT_JOB_RESTART_POLICY:?}"
                ));
            }
        }

        if let Some(deadline) = job_spec.active_deadline_seconds {
            if deadline > MOUNT_JOB_MAX_ACTIVE_DEADLINE_SECONDS {
                errs.push(format!(
                    "spec.initJob.template.spec.activeDeadlineSeconds: Invalid value: {deadline}: must be at most {MOUNT_JOB_MAX_ACTIVE_DEADLINE_SECONDS}"
                ));
            }
        }

        if let Some(limit) = job_spec.backoff_limit {
            if limit > MOUNT_JOB_MAX_BACKOFF_LIMIT {
                errs.push(format!(
                    "spec.initJob.template.spec.backoffLimit: Invalid value: {limit}: must be at most {MOUNT_JOB_MAX_BACKOFF_LIMIT}"
                ));
            }
        }
    }

    errs
}

pub fn validate_pool_spec_update(new_spec: &PoolSpec, old_spec: &PoolSpec) -> Vec<String> {
    let mut errs = validate_pool_spec(new_spec);

    if new_spec.selector != old_spec.selector {
        errs.push("spec.selector: Invalid value: field is immutable".to_string());
    }

    errs
}

/// The pool reference of a checkout is immutable once the checkout holds a
/// bound PVC; `acquired` reflects the old object's Acquired condition.
pub fn validate_checkout_spec_update(
    new_spec: &CheckoutSpec,
    old_spec: &CheckoutSpec,
    acquired: bool,
) -> Vec<String> {
    let mut errs = Vec::new();

    if acquired && new_spec.pool_ref != old_spec.pool_ref {
        errs.push(
            "spec.poolRef: Invalid value: field is immutable while a claim is checked out"
                .to_string(),
        );
    }

    errs
}
