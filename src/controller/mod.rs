//! Controller wiring shared by the pool and checkout reconcilers.

pub mod checkout;
pub mod pool;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Recorder, Reporter};
use kube::{Client, CustomResourceExt, Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::crd::{Checkout, Pool};
use crate::error::{Error, Result};

/// Starting delay for the per-object retry backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Per-object exponential retry backoff, capped by configuration. The work
/// queue serializes reconciles per key, so the counters only race with
/// themselves across error and reset.
pub struct Backoff {
    max: Duration,
    retries: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Backoff {
            max,
            retries: Mutex::new(HashMap::new()),
        }
    }

    /// The delay to apply for the next retry of `key`.
    pub fn next(&self, key: &str) -> Duration {
        let mut retries = self.retries.lock().expect("backoff lock poisoned");
        let n = retries.entry(key.to_string()).or_insert(0);
        let delay = BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(*n))
            .min(self.max);
        *n = n.saturating_add(1);
        delay
    }

    /// Forget the retry history of `key` after a successful reconcile.
    pub fn reset(&self, key: &str) {
        self.retries
            .lock()
            .expect("backoff lock poisoned")
            .remove(key);
    }
}

/// Shared state handed to every reconcile invocation.
pub struct Context {
    pub client: Client,
    pub recorder: Arc<Recorder>,
    pub backoff: Backoff,
}

impl Context {
    pub fn new(client: Client, config: &Config) -> Self {
        let reporter = Reporter {
            controller: config.name.clone(),
            instance: std::env::var("HOSTNAME").ok(),
        };

        Context {
            recorder: Arc::new(Recorder::new(client.clone(), reporter)),
            backoff: Backoff::new(config.controller_max_reconcile_backoff_duration),
            client,
        }
    }
}

pub fn backoff_key<K>(obj: &K) -> String
where
    K: Resource<DynamicType = ()>,
{
    format!(
        "{}/{}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Decide what to do with a failed reconcile: user errors wait for the user,
/// everything else retries with per-object exponential backoff.
pub fn error_policy<K>(obj: Arc<K>, err: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let key = backoff_key(obj.as_ref());

    if err.is_user() {
        warn!(object = %key, error = %err, "not requeuing; the next update to the resource retries");
        return Action::await_change();
    }

    let delay = ctx.backoff.next(&key);
    warn!(object = %key, error = %err, delay_ms = delay.as_millis() as u64, "reconcile failed, requeuing");
    Action::requeue(delay)
}

/// Install the Pool and Checkout CRDs when they are absent. Existing CRDs
/// are left untouched to avoid clobbering a newer deployment's schema.
pub async fn ensure_crds(client: &Client) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());

    for crd in [Pool::crd(), Checkout::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        if crds.get_opt(&name).await?.is_some() {
            continue;
        }

        info!(crd = %name, "installing custom resource definition");
        match crds.create(&PostParams::default(), &crd).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_millis(40));
        assert_eq!(backoff.next("k"), Duration::from_millis(5));
        assert_eq!(backoff.next("k"), Duration::from_millis(10));
        assert_eq!(backoff.next("k"), Duration::from_millis(20));
        assert_eq!(backoff.next("k"), Duration::from_millis(40));
        assert_eq!(backoff.next("k"), Duration::from_millis(40));
    }

    #[test]
    fn test_backoff_is_per_key() {
        let backoff = Backoff::new(Duration::from_secs(60));
        assert_eq!(backoff.next("a"), Duration::from_millis(5));
        assert_eq!(backoff.next("a"), Duration::from_millis(10));
        assert_eq!(backoff.next("b"), Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_reset() {
        let backoff = Backoff::new(Duration::from_secs(60));
        backoff.next("k");
        backoff.next("k");
        backoff.reset("k");
        assert_eq!(backoff.next("k"), Duration::from_millis(5));
    }
}
