//! Aggregate state of a Checkout: the consumer claim it produces, the
//! short-lived locked claim used to lift a volume out of its pool, and the
//! two volume objects involved in the rebind.
//!
//! A pooled PV is bound to a pool-owned PVC. Handing it to a checkout
//! requires (a) making sure deleting the pool's claim cannot reclaim the
//! storage, (b) producing a new PV object whose spec we are free to mutate,
//! and (c) presenting that new PV to the consumer claim with the Kubernetes
//! pre-bind protocol. Doing all of that through a single claim would mean
//! dropping and reacquiring the binding within one reconcile, which cannot
//! be made crash-safe. The locked claim decouples "reserve from pool" from
//! "present to consumer" so each step is an independent, durable write.

use k8s_openapi::api::core::v1::{
    LocalObjectReference, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::crd::{
    update_condition, Checkout, CheckoutCondition, CheckoutConditionType, CheckoutStatus,
    Condition, Pool, CHECKOUT_ACQUIRED_REASON_CHECKED_OUT, CHECKOUT_ACQUIRED_REASON_CONFLICT,
    CHECKOUT_ACQUIRED_REASON_INVALID, CHECKOUT_ACQUIRED_REASON_NOT_AVAILABLE,
    CHECKOUT_ACQUIRED_REASON_POOL_DOES_NOT_EXIST, CONDITION_FALSE, CONDITION_TRUE,
    CONDITION_UNKNOWN,
};
use crate::dependency::set_dependency_of;
use crate::error::{Error, Result};
use crate::ext::{
    annotate, annotation, create_or_replace, delete_ignore_not_found, exists, is_controlled_by,
    set_controller_ref,
};
use crate::pool_state::PoolState;
use crate::replica::PoolReplica;

/// Snapshot of a pooled volume's original reclaim policy, taken before the
/// policy is forced to Retain for the duration of the rebind.
pub const RECLAIM_POLICY_ANNOTATION: &str = "pvpool.puppet.com/checkout.reclaim-policy";

/// Name of the PVC a checkout produces for its consumer.
pub fn claim_name(checkout: &Checkout) -> String {
    checkout
        .spec
        .claim_name
        .clone()
        .unwrap_or_else(|| checkout.name_any())
}

/// Name of the transient claim that reserves a volume from the pool.
pub fn locked_claim_name(checkout: &Checkout) -> String {
    format!("{}-locked", checkout.name_any())
}

/// Name of the fresh volume presented to the consumer claim. Derived from
/// the reserved volume's uid so restarts converge on the same object.
pub fn pooled_volume_name(locked_uid: &str) -> String {
    format!("pvpool-{locked_uid}")
}

fn claim_ref_for(pvc: &PersistentVolumeClaim) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        namespace: pvc.metadata.namespace.clone(),
        name: pvc.metadata.name.clone(),
        uid: pvc.metadata.uid.clone(),
        ..Default::default()
    }
}

fn storage_capacity(spec: &PersistentVolumeSpec) -> Option<BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>> {
    let storage = spec.capacity.as_ref()?.get("storage")?.clone();
    Some([("storage".to_string(), storage)].into_iter().collect())
}

/// A claim spec that mirrors a volume closely enough for the pair to bind.
fn mirror_claim_spec(pv: &PersistentVolume) -> PersistentVolumeClaimSpec {
    let spec = pv.spec.clone().unwrap_or_default();
    PersistentVolumeClaimSpec {
        access_modes: spec.access_modes.clone(),
        storage_class_name: spec.storage_class_name.clone(),
        volume_name: Some(pv.name_any()),
        resources: Some(VolumeResourceRequirements {
            requests: storage_capacity(&spec),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub struct CheckoutState {
    pub checkout: Checkout,

    // The long-lived claim the consumer will actually use.
    pvc_out: PersistentVolumeClaim,
    // The fresh volume presented to it.
    pv_out: Option<PersistentVolume>,

    // The short-lived claim that reserves a volume from the pool while the
    // rebind completes.
    pvc_locked: PersistentVolumeClaim,
    // The reserved volume, still carrying its pooled identity.
    pv_locked: Option<PersistentVolume>,

    // The pool replica the volume was lifted from this pass, if any.
    source: Option<PoolReplica>,

    pub conds: BTreeMap<CheckoutConditionType, Condition>,

    recorder: Option<Arc<Recorder>>,
}

impl CheckoutState {
    pub fn new(checkout: Checkout) -> Self {
        let ns = checkout.namespace();
        let new_claim = |name: String| PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: ns.clone(),
                ..Default::default()
            },
            ..Default::default()
        };

        let pvc_out = new_claim(claim_name(&checkout));
        let pvc_locked = new_claim(locked_claim_name(&checkout));

        CheckoutState {
            checkout,
            pvc_out,
            pv_out: None,
            pvc_locked,
            pv_locked: None,
            source: None,
            conds: BTreeMap::new(),
            recorder: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    fn key(&self) -> String {
        format!(
            "{}/{}",
            self.checkout.namespace().unwrap_or_default(),
            self.checkout.name_any()
        )
    }

    async fn event(&self, type_: EventType, reason: &str, action: &str, note: String) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(err) = recorder
            .publish(&event, &self.checkout.object_ref(&()))
            .await
        {
            warn!(checkout = %self.key(), error = %err, "failed to publish event");
        }
    }

    /// The protocol is finished once the consumer claim is bound.
    pub fn complete(&self) -> bool {
        exists(&self.pvc_out.metadata)
            && self.pvc_out.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound")
    }

    /// Load a claim we expect to own, plus the volume it is pre-bound to.
    /// A claim with a different controller is a conflict the user has to
    /// resolve; a volume whose claimRef does not point back is ignored so
    /// acquisition starts over from the pool.
    async fn load_claim(
        checkout: &Checkout,
        pvcs: &Api<PersistentVolumeClaim>,
        pvs: &Api<PersistentVolume>,
        pvc: &mut PersistentVolumeClaim,
        conds: &mut BTreeMap<CheckoutConditionType, Condition>,
    ) -> Result<Option<PersistentVolume>> {
        let name = pvc.name_any();
        let Some(loaded) = pvcs.get_opt(&name).await? else {
            return Ok(None);
        };

        if !is_controlled_by(&loaded.metadata, checkout) {
            conds.insert(
                CheckoutConditionType::Acquired,
                Condition::new(
                    CONDITION_UNKNOWN,
                    CHECKOUT_ACQUIRED_REASON_CONFLICT,
                    format!("The claim {name:?} exists but does not belong to this checkout."),
                ),
            );
            return Err(Error::Conflict {
                kind: "persistentvolumeclaim",
                name,
            });
        }
        *pvc = loaded;

        let volume_name = pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .unwrap_or_default();
        if volume_name.is_empty() {
            return Ok(None);
        }

        let Some(pv) = pvs.get_opt(&volume_name).await? else {
            return Ok(None);
        };
        let claim_uid = pv
            .spec
            .as_ref()
            .and_then(|s| s.claim_ref.as_ref())
            .and_then(|r| r.uid.as_ref());
        if claim_uid != pvc.metadata.uid.as_ref() {
            // Pre-bind must be consistent; otherwise start over.
            return Ok(None);
        }

        Ok(Some(pv))
    }

    pub async fn load(&mut self, client: &Client) -> Result<()> {
        let ns = self.checkout.namespace().unwrap_or_default();
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &ns);
        let pvs: Api<PersistentVolume> = Api::all(client.clone());

        self.pv_out =
            Self::load_claim(&self.checkout, &pvcs, &pvs, &mut self.pvc_out, &mut self.conds)
                .await?;
        if self.complete() {
            // The volume has already been handed over; nothing to acquire.
            return Ok(());
        }

        self.pv_locked = Self::load_claim(
            &self.checkout,
            &pvcs,
            &pvs,
            &mut self.pvc_locked,
            &mut self.conds,
        )
        .await?;

        if self.pv_out.is_none() && self.pv_locked.is_none() {
            // A crash may have left a chosen volume recorded in status.
            // Adopt it only if it already points at our locked claim;
            // anything else re-pools.
            let recorded = self
                .checkout
                .status
                .as_ref()
                .and_then(|s| s.volume_name.clone())
                .unwrap_or_default();
            if !recorded.is_empty() {
                if let Some(pv) = pvs.get_opt(&recorded).await? {
                    let claim_ref = pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref());
                    let points_at_locked = claim_ref.is_some_and(|r| {
                        r.name.as_deref() == Some(&locked_claim_name(&self.checkout))
                            && r.namespace.as_deref() == Some(ns.as_str())
                    });
                    if points_at_locked {
                        self.pv_locked = Some(pv);
                    }
                }
            }
        }

        if self.pv_out.is_none() && self.pv_locked.is_none() {
            self.load_from_pool(client).await?;
        }

        Ok(())
    }

    async fn load_from_pool(&mut self, client: &Client) -> Result<()> {
        let pool_name = self.checkout.spec.pool_ref.name.clone();
        let pool_ns = self
            .checkout
            .spec
            .pool_ref
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| self.checkout.namespace())
            .unwrap_or_default();
        let pool_key = format!("{pool_ns}/{pool_name}");

        let pools: Api<Pool> = Api::namespaced(client.clone(), &pool_ns);
        let Some(pool) = pools.get_opt(&pool_name).await? else {
            self.event(
                EventType::Warning,
                "PoolAvailability",
                "Acquire",
                format!("Pool {pool_key} does not exist"),
            )
            .await;
            self.conds.insert(
                CheckoutConditionType::Acquired,
                Condition::new(
                    CONDITION_UNKNOWN,
                    CHECKOUT_ACQUIRED_REASON_POOL_DOES_NOT_EXIST,
                    format!("The pool {pool_key:?} does not exist."),
                ),
            );
            return Err(Error::PoolNotFound(pool_key));
        };

        let mut pool_state = PoolState::new(pool);
        pool_state.load(client).await?;

        // Always take the oldest available replica; the oldest is the most
        // likely to have fully settled all downstream bindings.
        let Some(replica) = pool_state.oldest_available() else {
            self.event(
                EventType::Warning,
                "PoolAvailability",
                "Acquire",
                "Pool has no available claims to check out".to_string(),
            )
            .await;
            self.conds.insert(
                CheckoutConditionType::Acquired,
                Condition::new(
                    CONDITION_UNKNOWN,
                    CHECKOUT_ACQUIRED_REASON_NOT_AVAILABLE,
                    format!("The pool {pool_key:?} has no available claims to check out."),
                ),
            );
            return Err(Error::NoReplicasAvailable(pool_key));
        };

        debug!(
            checkout = %self.key(),
            pool = %pool_key,
            replica = %replica.name(),
            "reserving volume from pool"
        );

        self.pv_locked = replica.pv.clone();
        self.source = Some(replica);
        Ok(())
    }

    pub fn configure(&mut self) -> Result<()> {
        if self.complete() {
            return Ok(());
        }

        let requested_modes = self.checkout.access_modes();

        if let Some(pv_locked) = &mut self.pv_locked {
            // Snapshot the original reclaim policy exactly once, before any
            // mutation; the final volume gets it back.
            if annotation(&pv_locked.metadata, RECLAIM_POLICY_ANNOTATION).is_none() {
                let policy = pv_locked
                    .spec
                    .as_ref()
                    .and_then(|s| s.persistent_volume_reclaim_policy.clone())
                    .unwrap_or_else(|| "Delete".to_string());
                annotate(&mut pv_locked.metadata, RECLAIM_POLICY_ANNOTATION, &policy);
            }

            // Volume phase changes wake this checkout through the watch on
            // annotated dependencies.
            set_dependency_of(&mut pv_locked.metadata, &self.checkout)?;

            let spec = pv_locked.spec.get_or_insert_with(Default::default);
            spec.claim_ref = Some(claim_ref_for(&self.pvc_locked));
            // Retain must land before the pool's claim goes away, or the
            // underlying storage would be reclaimed with it.
            spec.persistent_volume_reclaim_policy = Some("Retain".to_string());

            self.pvc_locked.spec = Some(mirror_claim_spec(pv_locked));

            if self.pv_out.is_none() {
                self.pv_out = Some(Self::build_output_volume(pv_locked, &requested_modes));
            }
        }

        if let Some(pv_out) = &mut self.pv_out {
            set_dependency_of(&mut pv_out.metadata, &self.checkout)?;

            let pv_out_name = pv_out.name_any();
            let spec = pv_out.spec.get_or_insert_with(Default::default);
            spec.claim_ref = Some(claim_ref_for(&self.pvc_out));

            self.pvc_out.spec = Some(PersistentVolumeClaimSpec {
                access_modes: Some(requested_modes.clone()),
                storage_class_name: spec.storage_class_name.clone(),
                volume_name: Some(pv_out_name),
                resources: Some(VolumeResourceRequirements {
                    requests: storage_capacity(spec),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        Ok(())
    }

    /// A copy of the reserved volume under a new deterministic name, with
    /// the fields the checkout controls overwritten.
    fn build_output_volume(
        pv_locked: &PersistentVolume,
        requested_modes: &[String],
    ) -> PersistentVolume {
        let mut spec = pv_locked.spec.clone().unwrap_or_default();
        spec.access_modes = Some(requested_modes.to_vec());
        spec.claim_ref = None;
        spec.persistent_volume_reclaim_policy = Some(
            annotation(&pv_locked.metadata, RECLAIM_POLICY_ANNOTATION)
                .unwrap_or("Delete")
                .to_string(),
        );
        if let Some(csi) = &mut spec.csi {
            csi.read_only = Some(requested_modes == ["ReadOnlyMany".to_string()]);
        }

        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(pooled_volume_name(
                    pv_locked.metadata.uid.as_deref().unwrap_or_default(),
                )),
                labels: pv_locked.metadata.labels.clone(),
                annotations: pv_locked.metadata.annotations.clone(),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn classify_invalid(
        conds: &mut BTreeMap<CheckoutConditionType, Condition>,
        err: kube::Error,
    ) -> Error {
        let err = Error::classify(err);
        if let Error::Invalid(source) = &err {
            conds.insert(
                CheckoutConditionType::Acquired,
                Condition::new(
                    CONDITION_FALSE,
                    CHECKOUT_ACQUIRED_REASON_INVALID,
                    format!("The claim could not be created because of configuration problems: {source}"),
                ),
            );
        }
        err
    }

    /// Write everything back in a fixed, crash-safe order. If any write
    /// fails, the next reconcile restarts from load; the locked pair is the
    /// durable checkpoint.
    pub async fn persist(&mut self, client: &Client) -> Result<()> {
        let ns = self.checkout.namespace().unwrap_or_default();
        let key = self.key();
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &ns);
        let pvs: Api<PersistentVolume> = Api::all(client.clone());

        if self.complete() {
            self.conds.insert(
                CheckoutConditionType::Acquired,
                Condition::new(
                    CONDITION_TRUE,
                    CHECKOUT_ACQUIRED_REASON_CHECKED_OUT,
                    "The claim is ready to use.",
                ),
            );
            self.cleanup_locked(client).await?;
            return Ok(());
        }

        if let Some(pv_locked) = &mut self.pv_locked {
            // 1. Take ownership of the locked claim.
            set_controller_ref(&mut self.pvc_locked.metadata, &self.checkout);
            self.pvc_locked = match create_or_replace(&pvcs, &self.pvc_locked).await {
                Ok(pvc) => pvc,
                Err(err) => return Err(Self::classify_invalid(&mut self.conds, err)),
            };

            // 2. Commit Retain and the rebind to the locked claim in one
            // write. After this lands, losing the pool's claim cannot
            // destroy the storage.
            if let Some(claim_ref) = pv_locked.spec.as_mut().and_then(|s| s.claim_ref.as_mut()) {
                claim_ref.uid = self.pvc_locked.metadata.uid.clone();
            }
            *pv_locked = create_or_replace(&pvs, pv_locked).await?;

            // 3. Retire the source replica. Its claim is Lost now anyway;
            // the pool backfills the capacity.
            if let Some(source) = self.source.take() {
                info!(
                    checkout = %key,
                    replica = %source.name(),
                    "retiring pool replica after reserving its volume"
                );
                source.retire(client).await?;
            }
        }

        let Some(pv_out) = &mut self.pv_out else {
            return Err(Error::VolumeNotReady(claim_name(&self.checkout)));
        };

        // 4. Take ownership of the consumer claim.
        set_controller_ref(&mut self.pvc_out.metadata, &self.checkout);
        self.pvc_out = match create_or_replace(&pvcs, &self.pvc_out).await {
            Ok(pvc) => pvc,
            Err(err) => return Err(Self::classify_invalid(&mut self.conds, err)),
        };

        // 5. Present the fresh volume with the pre-bind protocol.
        if let Some(claim_ref) = pv_out.spec.as_mut().and_then(|s| s.claim_ref.as_mut()) {
            claim_ref.uid = self.pvc_out.metadata.uid.clone();
        }
        *pv_out = create_or_replace(&pvs, pv_out).await?;

        if self.complete() {
            self.conds.insert(
                CheckoutConditionType::Acquired,
                Condition::new(
                    CONDITION_TRUE,
                    CHECKOUT_ACQUIRED_REASON_CHECKED_OUT,
                    "The claim is ready to use.",
                ),
            );
            self.cleanup_locked(client).await?;
        }

        Ok(())
    }

    /// Drop the intermediate pair once the consumer claim is bound. The
    /// locked volume carries Retain, so deleting the object leaves the
    /// underlying storage untouched.
    async fn cleanup_locked(&mut self, client: &Client) -> Result<()> {
        let ns = self.checkout.namespace().unwrap_or_default();
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &ns);
        let pvs: Api<PersistentVolume> = Api::all(client.clone());

        let locked_name = locked_claim_name(&self.checkout);
        let Some(pvc) = pvcs.get_opt(&locked_name).await? else {
            self.pv_locked = None;
            return Ok(());
        };
        if !is_controlled_by(&pvc.metadata, &self.checkout) {
            return Ok(());
        }

        let volume_name = pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .unwrap_or_default();
        if !volume_name.is_empty() {
            delete_ignore_not_found(&pvs, &volume_name, &DeleteParams::background()).await?;
        }
        delete_ignore_not_found(&pvcs, &locked_name, &DeleteParams::default()).await?;
        self.pv_locked = None;

        Ok(())
    }

    /// The status this pass observed, merged over the previously recorded
    /// conditions.
    pub fn status(&self) -> CheckoutStatus {
        let prev = self.checkout.status.clone().unwrap_or_default();
        let empty = Condition::default();

        let mut conditions = Vec::new();
        for type_ in [CheckoutConditionType::Acquired] {
            let prev_cond = prev.conditions.iter().find(|c| c.type_ == type_);
            match self.conds.get(&type_) {
                Some(next) => conditions.push(CheckoutCondition {
                    condition: update_condition(
                        prev_cond.map_or(&empty, |c| &c.condition),
                        next.clone(),
                    ),
                    type_,
                }),
                None => {
                    if let Some(prev_cond) = prev_cond {
                        conditions.push(prev_cond.clone());
                    }
                }
            }
        }

        // The status tracks the pooled volume until its configuration has
        // been copied to the fresh one, then sticks with the fresh one.
        let volume_name = self
            .pv_out
            .as_ref()
            .map(|pv| pv.name_any())
            .or_else(|| self.pv_locked.as_ref().map(|pv| pv.name_any()));

        let volume_claim_ref = self.complete().then(|| LocalObjectReference {
            name: claim_name(&self.checkout),
        });

        CheckoutStatus {
            volume_name,
            volume_claim_ref,
            conditions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CheckoutSpec, PoolReference};
    use k8s_openapi::api::core::v1::{CSIPersistentVolumeSource, PersistentVolumeClaimStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn test_checkout(access_modes: Option<Vec<&str>>) -> Checkout {
        let mut checkout = Checkout::new(
            "scratch",
            CheckoutSpec {
                pool_ref: PoolReference {
                    namespace: None,
                    name: "warm".to_string(),
                },
                access_modes: access_modes
                    .map(|modes| modes.into_iter().map(String::from).collect()),
                claim_name: None,
            },
        );
        checkout.metadata.namespace = Some("default".to_string());
        checkout.metadata.uid = Some("checkout-uid".to_string());
        checkout
    }

    fn pooled_volume() -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pvc-abc".to_string()),
                uid: Some("pv-uid".to_string()),
                labels: Some(
                    [("app".to_string(), "test".to_string())].into_iter().collect(),
                ),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                capacity: Some(
                    [("storage".to_string(), Quantity("10Mi".to_string()))]
                        .into_iter()
                        .collect(),
                ),
                storage_class_name: Some("local-path".to_string()),
                persistent_volume_reclaim_policy: Some("Delete".to_string()),
                csi: Some(CSIPersistentVolumeSource {
                    driver: "example.csi".to_string(),
                    volume_handle: "h".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_names_are_deterministic() {
        let checkout = test_checkout(None);
        assert_eq!(claim_name(&checkout), "scratch");
        assert_eq!(locked_claim_name(&checkout), "scratch-locked");
        assert_eq!(pooled_volume_name("pv-uid"), "pvpool-pv-uid");

        let mut named = test_checkout(None);
        named.spec.claim_name = Some("data".to_string());
        assert_eq!(claim_name(&named), "data");
    }

    #[test]
    fn test_configure_snapshots_policy_and_retains() {
        let mut state = CheckoutState::new(test_checkout(None));
        state.pv_locked = Some(pooled_volume());
        state.configure().unwrap();

        let pv_locked = state.pv_locked.as_ref().unwrap();
        assert_eq!(
            annotation(&pv_locked.metadata, RECLAIM_POLICY_ANNOTATION),
            Some("Delete")
        );
        let spec = pv_locked.spec.as_ref().unwrap();
        assert_eq!(
            spec.persistent_volume_reclaim_policy.as_deref(),
            Some("Retain")
        );
        let claim_ref = spec.claim_ref.as_ref().unwrap();
        assert_eq!(claim_ref.name.as_deref(), Some("scratch-locked"));
        assert_eq!(claim_ref.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn test_configure_does_not_resnapshot() {
        let mut state = CheckoutState::new(test_checkout(None));
        let mut pv = pooled_volume();
        // Simulates resuming after the policy was already flipped.
        annotate(&mut pv.metadata, RECLAIM_POLICY_ANNOTATION, "Recycle");
        pv.spec.as_mut().unwrap().persistent_volume_reclaim_policy =
            Some("Retain".to_string());
        state.pv_locked = Some(pv);
        state.configure().unwrap();

        assert_eq!(
            annotation(
                &state.pv_locked.as_ref().unwrap().metadata,
                RECLAIM_POLICY_ANNOTATION
            ),
            Some("Recycle")
        );
        let out_spec = state.pv_out.as_ref().unwrap().spec.as_ref().unwrap();
        assert_eq!(
            out_spec.persistent_volume_reclaim_policy.as_deref(),
            Some("Recycle")
        );
    }

    #[test]
    fn test_configure_builds_output_volume() {
        let mut state = CheckoutState::new(test_checkout(None));
        state.pv_locked = Some(pooled_volume());
        state.configure().unwrap();

        let pv_out = state.pv_out.as_ref().unwrap();
        assert_eq!(pv_out.name_any(), "pvpool-pv-uid");
        assert_eq!(
            pv_out.metadata.labels.as_ref().unwrap().get("app").map(String::as_str),
            Some("test")
        );

        let spec = pv_out.spec.as_ref().unwrap();
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        assert_eq!(spec.storage_class_name.as_deref(), Some("local-path"));
        // Restored from the snapshot rather than inheriting Retain.
        assert_eq!(
            spec.persistent_volume_reclaim_policy.as_deref(),
            Some("Delete")
        );
        assert_eq!(spec.csi.as_ref().unwrap().read_only, Some(false));

        let claim_ref = spec.claim_ref.as_ref().unwrap();
        assert_eq!(claim_ref.name.as_deref(), Some("scratch"));
    }

    #[test]
    fn test_configure_read_only_many() {
        let mut state = CheckoutState::new(test_checkout(Some(vec!["ReadOnlyMany"])));
        state.pv_locked = Some(pooled_volume());
        state.configure().unwrap();

        let spec = state.pv_out.as_ref().unwrap().spec.as_ref().unwrap();
        assert_eq!(spec.access_modes, Some(vec!["ReadOnlyMany".to_string()]));
        assert_eq!(spec.csi.as_ref().unwrap().read_only, Some(true));

        let out_claim_spec = state.pvc_out.spec.as_ref().unwrap();
        assert_eq!(
            out_claim_spec.access_modes,
            Some(vec!["ReadOnlyMany".to_string()])
        );
    }

    #[test]
    fn test_configure_mirrors_locked_claim() {
        let mut state = CheckoutState::new(test_checkout(None));
        state.pv_locked = Some(pooled_volume());
        state.configure().unwrap();

        let locked_spec = state.pvc_locked.spec.as_ref().unwrap();
        assert_eq!(locked_spec.volume_name.as_deref(), Some("pvc-abc"));
        assert_eq!(locked_spec.storage_class_name.as_deref(), Some("local-path"));
        assert_eq!(
            locked_spec
                .resources
                .as_ref()
                .unwrap()
                .requests
                .as_ref()
                .unwrap()
                .get("storage"),
            Some(&Quantity("10Mi".to_string()))
        );
    }

    #[test]
    fn test_configure_sizes_consumer_claim_from_volume() {
        let mut state = CheckoutState::new(test_checkout(None));
        state.pv_locked = Some(pooled_volume());
        state.configure().unwrap();

        let out_spec = state.pvc_out.spec.as_ref().unwrap();
        assert_eq!(out_spec.volume_name.as_deref(), Some("pvpool-pv-uid"));
        assert_eq!(
            out_spec
                .resources
                .as_ref()
                .unwrap()
                .requests
                .as_ref()
                .unwrap()
                .get("storage"),
            Some(&Quantity("10Mi".to_string()))
        );
    }

    #[test]
    fn test_status_tracks_volume_progression() {
        let mut state = CheckoutState::new(test_checkout(None));
        assert_eq!(state.status().volume_name, None);

        state.pv_locked = Some(pooled_volume());
        assert_eq!(state.status().volume_name.as_deref(), Some("pvc-abc"));

        state.configure().unwrap();
        assert_eq!(state.status().volume_name.as_deref(), Some("pvpool-pv-uid"));
        assert_eq!(state.status().volume_claim_ref, None);
    }

    #[test]
    fn test_status_claim_ref_on_completion() {
        let mut state = CheckoutState::new(test_checkout(None));
        state.pvc_out.metadata.uid = Some("pvc-out-uid".to_string());
        state.pvc_out.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        });

        assert!(state.complete());
        let status = state.status();
        assert_eq!(
            status.volume_claim_ref.as_ref().map(|r| r.name.as_str()),
            Some("scratch")
        );
    }
}
