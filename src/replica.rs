//! A pool replica is one PVC managed by a Pool, together with its optional
//! init job, the PV it is bound to, and any VolumeAttachments that pin the
//! volume to a node.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, Volume,
};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, warn};

use crate::crd::Pool;
use crate::dependency::{annotation_key, set_dependency_of};
use crate::error::{Error, Result};
use crate::ext::{
    annotate, annotation, create_or_replace, delete_ignore_not_found, label_annotate_from,
    set_controller_ref,
};
use crate::validation::{
    DEFAULT_MOUNT_JOB_VOLUME_NAME, MOUNT_JOB_MAX_ACTIVE_DEADLINE_SECONDS,
    MOUNT_JOB_MAX_BACKOFF_LIMIT, MOUNT_JOB_RESTART_POLICY,
};

pub const REPLICA_PHASE_ANNOTATION: &str = "pvpool.puppet.com/replica.phase";

pub const REPLICA_PHASE_INITIALIZING: &str = "Initializing";
pub const REPLICA_PHASE_AVAILABLE: &str = "Available";

// https://hub.docker.com/layers/busybox/library/busybox/stable-musl
const INIT_JOB_IMAGE: &str =
    "busybox@sha256:8d0c42425011ea3fb5b4ec5a121dde4ce986c2efea46be9d981a478fe1d206ec";

fn job_condition<'a>(job: &'a Job, type_: &str) -> Option<&'a k8s_openapi::api::batch::v1::JobCondition> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_ && c.status == "True")
}

pub fn job_succeeded(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .unwrap_or_default()
        > 0
        || job_condition(job, "Complete").is_some()
}

pub fn job_failed(job: &Job) -> bool {
    job_condition(job, "Failed").is_some()
}

pub fn job_complete(job: &Job) -> bool {
    job_succeeded(job) || job_failed(job)
}

/// The Failed condition of a job, if present and true.
pub fn job_failed_condition(job: &Job) -> Option<&k8s_openapi::api::batch::v1::JobCondition> {
    job_condition(job, "Failed")
}

/// The init job used when a pool does not configure one. Some storage
/// classes insist on WaitForFirstConsumer binding, which is not compatible
/// with pooling, so every replica gets a job that mounts the claim at least
/// once.
fn default_init_job_spec() -> JobSpec {
    JobSpec {
        template: PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "init".to_string(),
                    image: Some(INIT_JOB_IMAGE.to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        },
        backoff_limit: Some(MOUNT_JOB_MAX_BACKOFF_LIMIT),
        ..Default::default()
    }
}

pub struct PoolReplica {
    pub pool: Pool,
    pub pvc: PersistentVolumeClaim,
    pub init_job: Option<Job>,
    pub pv: Option<PersistentVolume>,
    pub volume_attachments: Vec<VolumeAttachment>,

    // Job to create on persist when none exists yet.
    desired_job: Option<Job>,
}

impl PoolReplica {
    pub fn new(pool: &Pool, name: &str) -> Self {
        PoolReplica {
            pool: pool.clone(),
            pvc: PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: pool.namespace(),
                    ..Default::default()
                },
                ..Default::default()
            },
            init_job: None,
            pv: None,
            volume_attachments: Vec::new(),
            desired_job: None,
        }
    }

    pub fn name(&self) -> String {
        self.pvc.name_any()
    }

    fn namespace(&self) -> String {
        self.pool.namespace().unwrap_or_default()
    }

    /// A replica is stale when its PVC is going away, has lost its volume,
    /// or its init job failed. Stale replicas are deleted and replaced.
    pub fn stale(&self) -> bool {
        self.pvc.metadata.deletion_timestamp.is_some()
            || self
                .pvc
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                == Some("Lost")
            || self.init_job.as_ref().is_some_and(job_failed)
    }

    /// A replica is available when it holds a bound PV, has been marked
    /// through its init phase, and nothing is attached to the volume.
    pub fn available(&self) -> bool {
        self.pv.is_some()
            && annotation(&self.pvc.metadata, REPLICA_PHASE_ANNOTATION)
                == Some(REPLICA_PHASE_AVAILABLE)
            && self.volume_attachments.is_empty()
    }

    /// Fetch the replica's objects. Returns false when the PVC does not
    /// exist or its bound PV no longer points back at it, in which case the
    /// replica should not be used.
    pub async fn load(&mut self, client: &Client) -> Result<bool> {
        let ns = self.namespace();
        let name = self.name();

        let jobs: Api<Job> = Api::namespaced(client.clone(), &ns);
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &ns);
        let pvs: Api<PersistentVolume> = Api::all(client.clone());

        // The init job may not exist. This is desired behavior.
        self.init_job = jobs.get_opt(&name).await?;

        let Some(pvc) = pvcs.get_opt(&name).await? else {
            return Ok(false);
        };
        self.pvc = pvc;

        if self.pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound") {
            let volume_name = self
                .pvc
                .spec
                .as_ref()
                .and_then(|s| s.volume_name.clone())
                .unwrap_or_default();
            let Some(pv) = pvs.get_opt(&volume_name).await? else {
                return Ok(false);
            };
            if pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref()).and_then(|r| r.uid.as_ref())
                != self.pvc.metadata.uid.as_ref()
            {
                // The volume has been reassigned from under the claim.
                return Ok(false);
            }
            self.pv = Some(pv);
        }

        if !self.stale() && !self.available() && self.pv.is_some() {
            // There is no way to map a PV to its attachments other than
            // listing them all; this only runs while a replica settles. The
            // read goes straight to the API server, so a completed init job
            // with no visible attachments really has none.
            self.load_volume_attachments(client).await?;
        }

        Ok(true)
    }

    async fn load_volume_attachments(&mut self, client: &Client) -> Result<()> {
        let pv_name = self.pv.as_ref().map(|pv| pv.name_any()).unwrap_or_default();

        let vas: Api<VolumeAttachment> = Api::all(client.clone());
        self.volume_attachments = vas
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|va| va.spec.source.persistent_volume_name.as_deref() == Some(&pv_name))
            .collect();

        Ok(())
    }

    /// Bring the in-memory objects to their desired configuration. No-op
    /// for stale and available replicas.
    pub fn configure(&mut self) {
        if self.stale() || self.available() {
            return;
        }

        // Configure the PVC if it's not yet provisioning or bound.
        let phase = self.pvc.status.as_ref().and_then(|s| s.phase.as_deref());
        if phase != Some("Pending") && phase != Some("Bound") {
            let mut spec = self.pool.spec.template.spec.clone();

            // We always request dynamic provisioning, so fields that force
            // static binding are cleared. A storageClassName of "" (not
            // absent) disables dynamic provisioning, as does any selector
            // or an explicit volume name.
            if spec.storage_class_name.as_deref() == Some("") {
                spec.storage_class_name = None;
            }
            spec.selector = None;
            spec.volume_name = None;

            if spec.access_modes.as_ref().map_or(true, Vec::is_empty) {
                spec.access_modes = Some(vec!["ReadWriteOnce".to_string()]);
            }

            self.pvc.spec = Some(spec);
        }

        if !self.init_job.as_ref().is_some_and(job_succeeded) {
            if self.init_job.is_none() && self.desired_job.is_none() {
                self.desired_job = Some(self.build_init_job());
            }
            annotate(
                &mut self.pvc.metadata,
                REPLICA_PHASE_ANNOTATION,
                REPLICA_PHASE_INITIALIZING,
            );
        } else if self.volume_attachments.is_empty() {
            annotate(
                &mut self.pvc.metadata,
                REPLICA_PHASE_ANNOTATION,
                REPLICA_PHASE_AVAILABLE,
            );
        }
    }

    fn build_init_job(&self) -> Job {
        let (mut spec, volume_name, template_meta) = match &self.pool.spec.init_job {
            Some(mount_job) => (
                mount_job.template.spec.clone(),
                mount_job
                    .volume_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_MOUNT_JOB_VOLUME_NAME.to_string()),
                mount_job.template.metadata.clone(),
            ),
            None => (
                default_init_job_spec(),
                DEFAULT_MOUNT_JOB_VOLUME_NAME.to_string(),
                None,
            ),
        };

        let pod_spec = spec.template.spec.get_or_insert_with(PodSpec::default);
        if pod_spec.restart_policy.as_deref().unwrap_or("").is_empty() {
            pod_spec.restart_policy = Some(MOUNT_JOB_RESTART_POLICY.to_string());
        }

        if spec
            .active_deadline_seconds
            .map_or(true, |d| d > MOUNT_JOB_MAX_ACTIVE_DEADLINE_SECONDS)
        {
            spec.active_deadline_seconds = Some(MOUNT_JOB_MAX_ACTIVE_DEADLINE_SECONDS);
        }

        if spec
            .backoff_limit
            .is_some_and(|l| l > MOUNT_JOB_MAX_BACKOFF_LIMIT)
        {
            spec.backoff_limit = Some(MOUNT_JOB_MAX_BACKOFF_LIMIT);
        }

        // One of the pod volumes must mount this replica's claim.
        let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
        if !volumes.iter().any(|v| v.name == volume_name) {
            volumes.push(Volume {
                name: volume_name.clone(),
                ..Default::default()
            });
        }
        if let Some(volume) = volumes.iter_mut().find(|v| v.name == volume_name) {
            volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                claim_name: self.name(),
                read_only: None,
            });
        }

        let mut metadata = ObjectMeta {
            name: Some(self.name()),
            namespace: Some(self.namespace()),
            ..Default::default()
        };
        if let Some(template_meta) = template_meta {
            label_annotate_from(&mut metadata, &template_meta);
        }

        Job {
            metadata,
            spec: Some(spec),
            ..Default::default()
        }
    }

    /// Write the replica's objects back to the cluster.
    pub async fn persist(&mut self, client: &Client) -> Result<()> {
        let ns = self.namespace();
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &ns);
        let jobs: Api<Job> = Api::namespaced(client.clone(), &ns);

        if let Some(template_meta) = self.pool.spec.template.metadata.clone() {
            label_annotate_from(&mut self.pvc.metadata, &template_meta);
        }
        set_controller_ref(&mut self.pvc.metadata, &self.pool);

        self.pvc = create_or_replace(&pvcs, &self.pvc)
            .await
            .map_err(Error::classify)?;

        if self.available() {
            // The init job has served its purpose.
            if self.init_job.is_some() {
                delete_ignore_not_found(&jobs, &self.name(), &DeleteParams::background()).await?;
                self.init_job = None;
            }
            self.track_volume_attachments(client).await?;
        } else if self.init_job.is_some() {
            // Jobs are effectively immutable once they start; leave the
            // spec alone but keep attachment tracking current.
            self.track_volume_attachments(client).await?;
        } else if let Some(mut job) = self.desired_job.take() {
            // Ownership goes to the PVC so garbage collection cascades,
            // while the dependency annotation wakes the pool reconciler on
            // job status changes without blocking PVC deletion.
            set_dependency_of(&mut job.metadata, &self.pool)?;
            set_controller_ref(&mut job.metadata, &self.pvc);

            match jobs.create(&PostParams::default(), &job).await {
                Ok(created) => self.init_job = Some(created),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    self.init_job = jobs.get_opt(&self.name()).await?;
                }
                Err(err) => return Err(Error::classify(err)),
            }
        }

        Ok(())
    }

    /// Record the pool as a dependent of each attachment pinning this
    /// replica's volume, so attachment changes re-enter the reconcile loop.
    async fn track_volume_attachments(&mut self, client: &Client) -> Result<()> {
        let vas: Api<VolumeAttachment> = Api::all(client.clone());
        let key = annotation_key::<Pool>();

        for va in &mut self.volume_attachments {
            if set_dependency_of(&mut va.metadata, &self.pool)? {
                let value = annotation(&va.metadata, &key).unwrap_or_default().to_string();
                let mut annotations = serde_json::Map::new();
                annotations.insert(key.clone(), serde_json::Value::String(value));
                vas.patch(
                    &va.name_any(),
                    &PatchParams::default(),
                    &Patch::Merge(json!({
                        "metadata": {"annotations": annotations}
                    })),
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Delete the replica's claim and job without touching the bound PV.
    /// Used when a checkout lifts the volume out of the pool.
    pub async fn retire(&self, client: &Client) -> Result<()> {
        let ns = self.namespace();
        let jobs: Api<Job> = Api::namespaced(client.clone(), &ns);
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &ns);

        // The job's existence blocks the PVC from being deleted unless it
        // has failed, so it goes first.
        delete_ignore_not_found(&jobs, &self.name(), &DeleteParams::default()).await?;
        delete_ignore_not_found(&pvcs, &self.name(), &DeleteParams::default()).await?;

        Ok(())
    }

    /// Tear the replica down entirely, releasing the underlying storage.
    pub async fn delete(&self, client: &Client) -> Result<()> {
        if let Some(pv) = &self.pv {
            // A checkout may have flipped the volume to Retain; put Delete
            // back so the storage is released along with the claim. Best
            // effort: the volume may already be gone.
            let pvs: Api<PersistentVolume> = Api::all(client.clone());
            if let Err(err) = pvs
                .patch(
                    &pv.name_any(),
                    &PatchParams::default(),
                    &Patch::Merge(json!({
                        "spec": {"persistentVolumeReclaimPolicy": "Delete"}
                    })),
                )
                .await
            {
                warn!(
                    pv = %pv.name_any(),
                    error = %err,
                    "failed to restore reclaim policy before deleting replica"
                );
            }
        }

        debug!(replica = %self.name(), "deleting pool replica");
        self.retire(client).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        JobTemplate, MountJob, PersistentVolumeClaimTemplate, PoolSpec,
    };
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PersistentVolumeSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn test_pool(init_job: Option<MountJob>) -> Pool {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "test".to_string());

        let mut pool = Pool::new(
            "warm",
            PoolSpec {
                replicas: Some(2),
                template: PersistentVolumeClaimTemplate {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: PersistentVolumeClaimSpec {
                        storage_class_name: Some("".to_string()),
                        volume_name: Some("pinned".to_string()),
                        ..Default::default()
                    },
                },
                init_job,
                ..Default::default()
            },
        );
        pool.metadata.namespace = Some("default".to_string());
        pool.metadata.uid = Some("pool-uid".to_string());
        pool
    }

    fn job_with_condition(type_: &str) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    reason: Some("DeadlineExceeded".to_string()),
                    message: Some("too slow".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pvc_phase(replica: &mut PoolReplica, phase: &str) {
        replica.pvc.status = Some(PersistentVolumeClaimStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
    }

    #[test]
    fn test_stale_when_pvc_terminating() {
        let pool = test_pool(None);
        let mut replica = PoolReplica::new(&pool, "warm-1");
        assert!(!replica.stale());

        replica.pvc.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(replica.stale());
    }

    #[test]
    fn test_stale_when_claim_lost() {
        let pool = test_pool(None);
        let mut replica = PoolReplica::new(&pool, "warm-1");
        pvc_phase(&mut replica, "Lost");
        assert!(replica.stale());
    }

    #[test]
    fn test_stale_when_init_job_failed() {
        let pool = test_pool(None);
        let mut replica = PoolReplica::new(&pool, "warm-1");
        replica.init_job = Some(job_with_condition("Failed"));
        assert!(replica.stale());
        assert!(job_failed_condition(replica.init_job.as_ref().unwrap()).is_some());
    }

    #[test]
    fn test_available_requires_volume_and_phase() {
        let pool = test_pool(None);
        let mut replica = PoolReplica::new(&pool, "warm-1");
        assert!(!replica.available());

        annotate(
            &mut replica.pvc.metadata,
            REPLICA_PHASE_ANNOTATION,
            REPLICA_PHASE_AVAILABLE,
        );
        assert!(!replica.available());

        replica.pv = Some(PersistentVolume::default());
        assert!(replica.available());

        replica.volume_attachments = vec![VolumeAttachment::default()];
        assert!(!replica.available());
    }

    #[test]
    fn test_configure_scrubs_static_binding_fields() {
        let pool = test_pool(None);
        let mut replica = PoolReplica::new(&pool, "warm-1");
        replica.configure();

        let spec = replica.pvc.spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name, None);
        assert_eq!(spec.volume_name, None);
        assert_eq!(spec.selector, None);
        assert_eq!(
            spec.access_modes,
            Some(vec!["ReadWriteOnce".to_string()])
        );
        assert_eq!(
            annotation(&replica.pvc.metadata, REPLICA_PHASE_ANNOTATION),
            Some(REPLICA_PHASE_INITIALIZING)
        );
    }

    #[test]
    fn test_configure_leaves_bound_claim_spec_alone() {
        let pool = test_pool(None);
        let mut replica = PoolReplica::new(&pool, "warm-1");
        pvc_phase(&mut replica, "Bound");
        replica.pvc.spec = Some(PersistentVolumeClaimSpec {
            volume_name: Some("existing".to_string()),
            ..Default::default()
        });
        replica.configure();

        assert_eq!(
            replica.pvc.spec.as_ref().unwrap().volume_name.as_deref(),
            Some("existing")
        );
    }

    #[test]
    fn test_configure_builds_default_init_job() {
        let pool = test_pool(None);
        let mut replica = PoolReplica::new(&pool, "warm-1");
        replica.configure();

        let job = replica.desired_job.as_ref().unwrap();
        let spec = job.spec.as_ref().unwrap();
        let pod_spec = spec.template.spec.as_ref().unwrap();

        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            spec.active_deadline_seconds,
            Some(MOUNT_JOB_MAX_ACTIVE_DEADLINE_SECONDS)
        );
        assert_eq!(spec.backoff_limit, Some(MOUNT_JOB_MAX_BACKOFF_LIMIT));

        let volume = pod_spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == DEFAULT_MOUNT_JOB_VOLUME_NAME)
            .unwrap();
        assert_eq!(
            volume
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "warm-1"
        );
    }

    #[test]
    fn test_configure_clamps_templated_init_job() {
        let pool = test_pool(Some(MountJob {
            template: JobTemplate {
                metadata: None,
                spec: JobSpec {
                    active_deadline_seconds: Some(100_000),
                    backoff_limit: Some(50),
                    template: PodTemplateSpec {
                        spec: Some(PodSpec {
                            volumes: Some(vec![Volume {
                                name: "data".to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            },
            volume_name: Some("data".to_string()),
        }));

        let mut replica = PoolReplica::new(&pool, "warm-1");
        replica.configure();

        let job = replica.desired_job.as_ref().unwrap();
        let spec = job.spec.as_ref().unwrap();
        assert_eq!(
            spec.active_deadline_seconds,
            Some(MOUNT_JOB_MAX_ACTIVE_DEADLINE_SECONDS)
        );
        assert_eq!(spec.backoff_limit, Some(MOUNT_JOB_MAX_BACKOFF_LIMIT));

        // The named template volume is rewritten to mount this claim.
        let volumes = spec.template.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            "warm-1"
        );
    }

    #[test]
    fn test_configure_marks_available_after_init_job_succeeds() {
        let pool = test_pool(None);
        let mut replica = PoolReplica::new(&pool, "warm-1");
        replica.init_job = Some(Job {
            status: Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        });
        replica.configure();

        assert_eq!(
            annotation(&replica.pvc.metadata, REPLICA_PHASE_ANNOTATION),
            Some(REPLICA_PHASE_AVAILABLE)
        );
        assert!(replica.desired_job.is_none());
    }

    #[test]
    fn test_configure_holds_initializing_while_attached() {
        let pool = test_pool(None);
        let mut replica = PoolReplica::new(&pool, "warm-1");
        replica.init_job = Some(Job {
            status: Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        });
        replica.volume_attachments = vec![VolumeAttachment::default()];
        replica.configure();

        // Succeeded job but a lingering attachment: not yet available, and
        // no phase regression either.
        assert_ne!(
            annotation(&replica.pvc.metadata, REPLICA_PHASE_ANNOTATION),
            Some(REPLICA_PHASE_AVAILABLE)
        );
    }

    #[test]
    fn test_configure_noop_for_stale_replica() {
        let pool = test_pool(None);
        let mut replica = PoolReplica::new(&pool, "warm-1");
        pvc_phase(&mut replica, "Lost");
        replica.configure();
        assert!(replica.desired_job.is_none());
        assert!(replica.pvc.spec.is_none());
    }

    #[test]
    fn test_job_predicates() {
        assert!(job_succeeded(&Job {
            status: Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        }));
        assert!(job_succeeded(&job_with_condition("Complete")));
        assert!(job_failed(&job_with_condition("Failed")));
        assert!(job_complete(&job_with_condition("Failed")));
        assert!(!job_complete(&Job::default()));
    }
}
