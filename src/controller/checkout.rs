//! The checkout reconciler: drives `CheckoutState`. PVCs it produces are
//! watched through ownership; the volumes involved in the rebind are
//! cluster-scoped and unowned, so they wake this reconciler through the
//! dependency annotations instead.

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::{backoff_key, error_policy, Context};
use crate::checkout_state::CheckoutState;
use crate::crd::Checkout;
use crate::dependency::dependent_requests;
use crate::error::Result;

pub async fn reconcile(checkout: Arc<Checkout>, ctx: Arc<Context>) -> Result<Action> {
    let ns = checkout.namespace().unwrap_or_default();
    let name = checkout.name_any();
    debug!(checkout = %format!("{ns}/{name}"), "starting checkout reconcile");

    let api: Api<Checkout> = Api::namespaced(ctx.client.clone(), &ns);

    let mut state = CheckoutState::new((*checkout).clone()).with_recorder(ctx.recorder.clone());

    let applied = match state.load(&ctx.client).await {
        Ok(()) => match state.configure() {
            Ok(()) => state.persist(&ctx.client).await,
            Err(err) => Err(err),
        },
        Err(err) => Err(err),
    };

    // Conditions accumulated on the way out (pool missing, conflicts,
    // invalid claims) reach the user even when the pass failed. Cleared
    // fields are written as explicit nulls so the merge removes them.
    let status = state.status();
    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({"status": {
            "volumeName": status.volume_name,
            "volumeClaimRef": status.volume_claim_ref,
            "conditions": status.conditions,
        }})),
    )
    .await?;

    applied?;

    ctx.backoff.reset(&backoff_key(checkout.as_ref()));
    Ok(Action::await_change())
}

pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    let client = ctx.client.clone();
    let checkouts: Api<Checkout> = Api::all(client.clone());

    Controller::new(checkouts, watcher::Config::default())
        .owns(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher::Config::default(),
        )
        .watches(
            Api::<PersistentVolume>::all(client.clone()),
            watcher::Config::default(),
            |pv: PersistentVolume| dependent_requests::<Checkout>(&pv.metadata),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "checkout reconciled"),
                Err(err) => debug!(error = %err, "checkout reconcile failed"),
            }
        })
        .await;

    Ok(())
}
