use k8s_openapi::api::core::v1::LocalObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::{Condition, CONDITION_TRUE};
use super::pool::PoolReference;

/// Checkout requests a PVC from a Pool.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "pvpool.puppet.com",
    version = "v1alpha1",
    kind = "Checkout",
    plural = "checkouts",
    namespaced,
    status = "CheckoutStatus",
    derive = "Default",
    printcolumn = r#"{"name":"Claim","type":"string","jsonPath":".status.volumeClaimRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSpec {
    /// PoolRef is the pool to check out a PVC from. The namespace defaults
    /// to the namespace of the checkout itself.
    pub pool_ref: PoolReference,

    /// AccessModes are the access modes to assign to the checked out PVC.
    /// Defaults to ReadWriteOnce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_modes: Option<Vec<String>>,

    /// ClaimName is the name to give the checked out PVC. Defaults to the
    /// name of the checkout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,
}

/// The type of a Checkout condition.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, JsonSchema,
)]
pub enum CheckoutConditionType {
    /// Whether the checkout has successfully taken a PVC from the pool.
    Acquired,
}

pub const CHECKOUT_ACQUIRED_REASON_POOL_DOES_NOT_EXIST: &str = "PoolDoesNotExist";
pub const CHECKOUT_ACQUIRED_REASON_NOT_AVAILABLE: &str = "NotAvailable";
pub const CHECKOUT_ACQUIRED_REASON_INVALID: &str = "Invalid";
pub const CHECKOUT_ACQUIRED_REASON_CONFLICT: &str = "Conflict";
pub const CHECKOUT_ACQUIRED_REASON_CHECKED_OUT: &str = "CheckedOut";

/// A status condition for a Checkout.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct CheckoutCondition {
    #[serde(flatten)]
    pub condition: Condition,

    /// Type is the identifier for this condition.
    #[serde(rename = "type")]
    pub type_: CheckoutConditionType,
}

/// The runtime state of a checkout.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutStatus {
    /// The name of the volume being configured for the checkout. It tracks
    /// a volume from the upstream pool until its configuration is copied to
    /// a new volume, at which point it is permanently set to that new
    /// volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,

    /// A reference to the PVC checked out from the pool. Only set when the
    /// checked out PVC is ready to be used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_ref: Option<LocalObjectReference>,

    /// The possible observable conditions for the checkout.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(extend("x-kubernetes-list-type" = "map", "x-kubernetes-list-map-keys" = ["type"]))]
    pub conditions: Vec<CheckoutCondition>,
}

impl Checkout {
    pub fn condition(&self, type_: CheckoutConditionType) -> Option<&CheckoutCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
    }

    /// Whether this checkout currently holds a bound PVC.
    pub fn acquired(&self) -> bool {
        self.condition(CheckoutConditionType::Acquired)
            .is_some_and(|c| c.condition.status == CONDITION_TRUE)
    }

    /// Access modes requested for the checked out PVC, defaulting to
    /// ReadWriteOnce.
    pub fn access_modes(&self) -> Vec<String> {
        match self.spec.access_modes.as_deref() {
            Some(modes) if !modes.is_empty() => modes.to_vec(),
            _ => vec!["ReadWriteOnce".to_string()],
        }
    }
}
