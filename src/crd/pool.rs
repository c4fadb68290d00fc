use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Condition;

/// Pool is a collection of preconfigured persistent volumes that can be
/// taken and recycled as needed.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "pvpool.puppet.com",
    version = "v1alpha1",
    kind = "Pool",
    plural = "pools",
    namespaced,
    status = "PoolStatus",
    derive = "Default",
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Replicas are the number of PVs to make available in the pool.
    ///
    /// Once a PV is checked out from the pool, it no longer counts toward
    /// the number of replicas. Setting this field to 0 makes the pool
    /// unusable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Selector is the label selector for PVCs maintained in the pool.
    ///
    /// The selector must match a subset of the labels in the template.
    pub selector: LabelSelector,

    /// Template describes the configuration of the dynamic PVCs that this
    /// controller should manage.
    pub template: PersistentVolumeClaimTemplate,

    /// InitJob configures a job to process newly created PVs before they
    /// are made available as part of the pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_job: Option<MountJob>,
}

/// A subset of a core persistent volume claim that can be used as a template
/// in an object spec.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct PersistentVolumeClaimTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    pub spec: PersistentVolumeClaimSpec,
}

/// A subset of a batch job that can be used as a template in an object spec.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct JobTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    pub spec: JobSpec,
}

/// A job that has a persistent volume attached to it under a configured
/// volume name.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MountJob {
    /// Template is the configuration for the job.
    pub template: JobTemplate,

    /// VolumeName is the name of the volume to be added to the template to
    /// access the persistent volume. The volume must either not exist in
    /// the template or must have a persistent volume claim source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
}

/// The type of a Pool condition.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, JsonSchema,
)]
pub enum PoolConditionType {
    /// Whether the pool has at least one replica ready to be checked out.
    Available,

    /// Whether the observed replicas match the requested replicas and all
    /// initializing replicas have progressed.
    Settlement,
}

pub const POOL_AVAILABLE_REASON_MINIMUM_REPLICAS_AVAILABLE: &str = "MinimumReplicasAvailable";
pub const POOL_AVAILABLE_REASON_NO_REPLICAS_REQUESTED: &str = "NoReplicasRequested";

pub const POOL_SETTLEMENT_REASON_SETTLED: &str = "Settled";
pub const POOL_SETTLEMENT_REASON_INVALID: &str = "Invalid";
pub const POOL_SETTLEMENT_REASON_INIT_JOB_FAILED: &str = "InitJobFailed";

/// A status condition for a Pool.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct PoolCondition {
    #[serde(flatten)]
    pub condition: Condition,

    /// Type is the identifier for this condition.
    #[serde(rename = "type")]
    pub type_: PoolConditionType,
}

/// The runtime state of an existing pool.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    /// The generation of the resource specification that this status
    /// matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// The number of PVCs that currently exist that match this pool's
    /// selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// The number of PVs from this pool that are ready to be checked out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,

    /// The possible observable conditions for the pool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(extend("x-kubernetes-list-type" = "map", "x-kubernetes-list-map-keys" = ["type"]))]
    pub conditions: Vec<PoolCondition>,
}

impl Pool {
    /// The number of replicas the pool should maintain, defaulting to one.
    pub fn replicas_requested(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    pub fn condition(&self, type_: PoolConditionType) -> Option<&PoolCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
    }
}

/// A reference to a Pool.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolReference {
    /// Namespace identifies the Kubernetes namespace of the pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Name identifies the name of the pool within the namespace.
    pub name: String,
}
