use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

/// Common fields shared by all status conditions. Typed condition structs
/// flatten this next to their `type` discriminator.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Status of the condition: "True", "False", or "Unknown".
    pub status: String,

    /// Machine-readable reason for the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message accompanying the reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Time of the last observable change to this condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl Condition {
    pub fn new(status: &str, reason: &str, message: impl Into<String>) -> Self {
        Condition {
            status: status.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: None,
        }
    }
}

/// Merge a proposed condition with its prior observation.
///
/// The `lastTransitionTime` is only stamped when the (status, reason,
/// message) triple actually changes, so the timestamp always answers "when
/// did this condition last change?" for operators watching the resource.
pub fn update_condition(prev: &Condition, mut next: Condition) -> Condition {
    if next.status.is_empty() {
        next.status = CONDITION_UNKNOWN.to_string();
    }

    if next.status == prev.status && next.reason == prev.reason && next.message == prev.message {
        return prev.clone();
    }

    if next.last_transition_time.is_none() {
        next.last_transition_time = Some(Time(Utc::now()));
    }

    next
}
