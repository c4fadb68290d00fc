//! Aggregate state of a Pool: every replica matching its selector,
//! partitioned by lifecycle phase, plus the status conditions accumulated
//! while reconciling.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, ListParams};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource, ResourceExt};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::crd::{
    update_condition, Condition, Pool, PoolCondition, PoolConditionType, PoolStatus,
    CONDITION_FALSE, CONDITION_TRUE, CONDITION_UNKNOWN,
    POOL_AVAILABLE_REASON_MINIMUM_REPLICAS_AVAILABLE, POOL_AVAILABLE_REASON_NO_REPLICAS_REQUESTED,
    POOL_SETTLEMENT_REASON_INIT_JOB_FAILED, POOL_SETTLEMENT_REASON_INVALID,
    POOL_SETTLEMENT_REASON_SETTLED,
};
use crate::error::{Error, Result};
use crate::ext::{is_controlled_by, label_selector_string};
use crate::replica::{job_failed_condition, PoolReplica};

pub struct PoolState {
    pub pool: Pool,
    pub initializing: Vec<PoolReplica>,
    pub available: Vec<PoolReplica>,
    pub stale: Vec<PoolReplica>,
    pub conds: BTreeMap<PoolConditionType, Condition>,

    recorder: Option<Arc<Recorder>>,
}

fn pop_random(replicas: &mut Vec<PoolReplica>) -> Option<PoolReplica> {
    if replicas.is_empty() {
        return None;
    }
    let i = rand::thread_rng().gen_range(0..replicas.len());
    Some(replicas.swap_remove(i))
}

impl PoolState {
    pub fn new(pool: Pool) -> Self {
        PoolState {
            pool,
            initializing: Vec::new(),
            available: Vec::new(),
            stale: Vec::new(),
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
            self.pool.namespace().unwrap_or_default(),
            self.pool.name_any()
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
        if let Err(err) = recorder.publish(&event, &self.pool.object_ref(&())).await {
            warn!(pool = %self.key(), error = %err, "failed to publish event");
        }
    }

    fn partition_push(&mut self, replica: PoolReplica) {
        if replica.stale() {
            self.stale.push(replica);
        } else if replica.available() {
            self.available.push(replica);
        } else {
            self.initializing.push(replica);
        }
    }

    /// Load every replica whose PVC matches the pool's selector.
    pub async fn load(&mut self, client: &Client) -> Result<()> {
        let selector = label_selector_string(&self.pool.spec.selector).map_err(Error::Selector)?;
        let ns = self.pool.namespace().unwrap_or_default();

        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &ns);
        let list = pvcs
            .list(&ListParams::default().labels(&selector))
            .await?;

        self.initializing.clear();
        self.available.clear();
        self.stale.clear();

        for pvc in list.items {
            // Two pools may select the same labels; each owns only what it
            // created.
            if !is_controlled_by(&pvc.metadata, &self.pool) {
                continue;
            }

            let mut replica = PoolReplica::new(&self.pool, &pvc.name_any());
            if !replica.load(client).await? {
                // Lost from under us between list and get.
                continue;
            }

            self.partition_push(replica);
        }

        debug!(
            pool = %self.key(),
            initializing = self.initializing.len(),
            available = self.available.len(),
            stale = self.stale.len(),
            "pool state loaded"
        );

        Ok(())
    }

    pub fn configure(&mut self) {
        if self.pool.replicas_requested() == 0 {
            self.conds.insert(
                PoolConditionType::Available,
                Condition::new(
                    CONDITION_FALSE,
                    POOL_AVAILABLE_REASON_NO_REPLICAS_REQUESTED,
                    "The pool requests no replicas, so none can be checked out.",
                ),
            );
        }

        for replica in &mut self.initializing {
            replica.configure();
        }
    }

    async fn persist_initializing(&mut self, client: &Client) -> Result<()> {
        let mut i = 0;
        while i < self.initializing.len() {
            self.initializing[i].persist(client).await?;

            // Move replicas that finished initializing to the available
            // list so this pass counts them.
            if self.initializing[i].available() {
                let replica = self.initializing.swap_remove(i);
                self.available.push(replica);
            } else {
                i += 1;
            }
        }

        Ok(())
    }

    async fn persist_available(&mut self, client: &Client) -> Result<()> {
        for replica in &mut self.available {
            replica.persist(client).await?;
        }

        if !self.available.is_empty() {
            self.conds.insert(
                PoolConditionType::Available,
                Condition::new(
                    CONDITION_TRUE,
                    POOL_AVAILABLE_REASON_MINIMUM_REPLICAS_AVAILABLE,
                    "The pool has replicas ready to be checked out.",
                ),
            );
        }

        Ok(())
    }

    async fn persist_scale_up(&mut self, client: &Client) -> Result<()> {
        let name = format!(
            "{}-{}",
            self.pool.name_any(),
            uuid::Uuid::new_v4().simple()
        );
        info!(pool = %self.key(), replica = %name, "adding a claim to meet replica request");

        let mut replica = PoolReplica::new(&self.pool, &name);
        replica.load(client).await?;
        replica.configure();
        match replica.persist(client).await {
            Err(err @ Error::Invalid(_)) => {
                self.conds.insert(
                    PoolConditionType::Settlement,
                    Condition::new(
                        CONDITION_FALSE,
                        POOL_SETTLEMENT_REASON_INVALID,
                        format!("A replica could not be created because of configuration problems: {err}"),
                    ),
                );
                Err(err)
            }
            Err(err) => Err(err),
            Ok(()) => {
                self.partition_push(replica);
                Ok(())
            }
        }
    }

    async fn persist_scale_down(&mut self, client: &Client) -> Result<()> {
        info!(pool = %self.key(), "removing a claim to meet replica request");

        // Work through initializing replicas first; only touch available
        // ones when there is nothing cheaper to give up. The pick within a
        // tier is randomized so two racing reconcilers do not repeatedly
        // fight over the same replica.
        for tier in [&mut self.initializing, &mut self.available] {
            if let Some(replica) = pop_random(tier) {
                if let Err(err) = replica.delete(client).await {
                    tier.push(replica);
                    return Err(err);
                }
                break;
            }
        }

        Ok(())
    }

    async fn persist_scale(&mut self, client: &Client) -> Result<()> {
        let request = self.pool.replicas_requested();
        let actual = (self.available.len() + self.initializing.len()) as i32;
        debug!(pool = %self.key(), request, actual, "pool scale assessed");

        if actual < request {
            self.event(
                EventType::Normal,
                "PoolScaling",
                "ScaleUp",
                format!("Scaling pool up to {request} replicas"),
            )
            .await;
            // One new replica per reconcile; the requeue spreads out bursts.
            self.persist_scale_up(client).await
        } else if actual > request {
            self.event(
                EventType::Normal,
                "PoolScaling",
                "ScaleDown",
                format!("Scaling pool down to {request} replicas"),
            )
            .await;
            self.persist_scale_down(client).await
        } else {
            if self.initializing.is_empty() {
                self.conds.insert(
                    PoolConditionType::Settlement,
                    Condition::new(
                        CONDITION_TRUE,
                        POOL_SETTLEMENT_REASON_SETTLED,
                        "The pool has settled at its requested replica count.",
                    ),
                );
            }
            Ok(())
        }
    }

    async fn persist_stale(&mut self, client: &Client) -> Result<()> {
        while let Some(replica) = pop_random(&mut self.stale) {
            info!(pool = %self.key(), replica = %replica.name(), "removing stale replica");

            if let Some(fc) = replica.init_job.as_ref().and_then(job_failed_condition) {
                let reason = fc.reason.clone().unwrap_or_default();
                let message = fc.message.clone().unwrap_or_default();
                self.conds.insert(
                    PoolConditionType::Settlement,
                    Condition::new(
                        CONDITION_UNKNOWN,
                        POOL_SETTLEMENT_REASON_INIT_JOB_FAILED,
                        format!("A replica init job failed: {reason}: {message}"),
                    ),
                );
                self.event(
                    EventType::Warning,
                    "StaleReplica",
                    "Delete",
                    format!("Deleting stale replica with failed init job: {reason}: {message}"),
                )
                .await;
            }

            if let Err(err) = replica.delete(client).await {
                self.stale.push(replica);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Write the pool's replicas back to the cluster. Ordered to avoid
    /// oscillation: settle initializing replicas, refresh available ones,
    /// then correct the count, then collect garbage.
    pub async fn persist(&mut self, client: &Client) -> Result<()> {
        self.persist_initializing(client).await?;
        self.persist_available(client).await?;
        self.persist_scale(client).await?;
        self.persist_stale(client).await?;
        Ok(())
    }

    /// Tear down every replica. Called under the pool's finalizer.
    pub async fn delete(&mut self, client: &Client) -> Result<()> {
        for tier in [&mut self.stale, &mut self.initializing, &mut self.available] {
            while let Some(replica) = pop_random(tier) {
                if let Err(err) = replica.delete(client).await {
                    tier.push(replica);
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    pub fn settled(&self) -> bool {
        self.stale.is_empty()
            && self.initializing.is_empty()
            && self.available.len() as i32 == self.pool.replicas_requested()
    }

    /// Remove and return the oldest available replica. Oldest replicas are
    /// the most likely to have fully settled all downstream bindings.
    pub fn oldest_available(&mut self) -> Option<PoolReplica> {
        let idx = self
            .available
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.pvc.metadata.creation_timestamp.as_ref().map(|t| t.0))
            .map(|(i, _)| i)?;
        Some(self.available.remove(idx))
    }

    /// The status this pass observed, merged over the previously recorded
    /// conditions so unchanged conditions keep their transition times.
    pub fn status(&self) -> PoolStatus {
        let prev = self.pool.status.clone().unwrap_or_default();
        let empty = Condition::default();

        let mut conditions = Vec::new();
        for type_ in [PoolConditionType::Available, PoolConditionType::Settlement] {
            let prev_cond = prev.conditions.iter().find(|c| c.type_ == type_);
            match self.conds.get(&type_) {
                Some(next) => conditions.push(PoolCondition {
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

        PoolStatus {
            observed_generation: self.pool.metadata.generation,
            replicas: Some(
                (self.initializing.len() + self.available.len() + self.stale.len()) as i32,
            ),
            available_replicas: Some(self.available.len() as i32),
            conditions,
        }
    }
}
