//! The pool reconciler: drives `PoolState` and owns finalization, so a
//! deleted Pool takes its replicas with it before the object goes away.

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{backoff_key, error_policy, Context};
use crate::crd::Pool;
use crate::dependency::dependent_requests;
use crate::error::Result;
use crate::pool_state::PoolState;

/// Holds deletion of a Pool until every replica has been torn down.
pub const POOL_FINALIZER: &str = "pvpool.puppet.com/pool-reconciler";

fn has_finalizer(pool: &Pool) -> bool {
    pool.finalizers().iter().any(|f| f == POOL_FINALIZER)
}

async fn set_finalizers(api: &Api<Pool>, name: &str, finalizers: &[String]) -> Result<()> {
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({"metadata": {"finalizers": finalizers}})),
    )
    .await?;
    Ok(())
}

pub async fn reconcile(pool: Arc<Pool>, ctx: Arc<Context>) -> Result<Action> {
    let ns = pool.namespace().unwrap_or_default();
    let name = pool.name_any();
    debug!(pool = %format!("{ns}/{name}"), "starting pool reconcile");

    let api: Api<Pool> = Api::namespaced(ctx.client.clone(), &ns);

    let mut state = PoolState::new((*pool).clone()).with_recorder(ctx.recorder.clone());
    state.load(&ctx.client).await?;

    if pool.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&pool) {
            state.delete(&ctx.client).await?;

            let finalizers: Vec<String> = pool
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != POOL_FINALIZER)
                .cloned()
                .collect();
            set_finalizers(&api, &name, &finalizers).await?;
        }
        ctx.backoff.reset(&backoff_key(pool.as_ref()));
        return Ok(Action::await_change());
    }

    if !has_finalizer(&pool) {
        let mut finalizers = pool.finalizers().to_vec();
        finalizers.push(POOL_FINALIZER.to_string());
        set_finalizers(&api, &name, &finalizers).await?;
    }

    state.configure();
    let persisted = state.persist(&ctx.client).await;

    // The status carries the user-visible narrative, so it goes out even
    // when persistence failed part way through.
    let status = state.status();
    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({"status": {
            "observedGeneration": status.observed_generation,
            "replicas": status.replicas,
            "availableReplicas": status.available_replicas,
            "conditions": status.conditions,
        }})),
    )
    .await?;

    persisted?;

    ctx.backoff.reset(&backoff_key(pool.as_ref()));

    if state.settled() {
        Ok(Action::await_change())
    } else {
        // Scaling creates at most one replica per pass; come back for the
        // rest instead of bursting.
        Ok(Action::requeue(Duration::from_secs(1)))
    }
}

pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    let client = ctx.client.clone();
    let pools: Api<Pool> = Api::all(client.clone());

    Controller::new(pools, watcher::Config::default())
        .owns(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher::Config::default(),
        )
        .watches(
            Api::<Job>::all(client.clone()),
            watcher::Config::default(),
            |job: Job| dependent_requests::<Pool>(&job.metadata),
        )
        .watches(
            Api::<VolumeAttachment>::all(client.clone()),
            watcher::Config::default(),
            |va: VolumeAttachment| dependent_requests::<Pool>(&va.metadata),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "pool reconciled"),
                Err(err) => debug!(error = %err, "pool reconcile failed"),
            }
        })
        .await;

    Ok(())
}
