//! Admission decisions for the Pool and Checkout endpoints.
//!
//! Only the decision boundary lives here: schema validation plus the
//! SubjectAccessReview "use" check against the referenced pool. The HTTPS
//! server, certificates, and webhook registration that route requests to
//! these functions are provided by the deployment.

use k8s_openapi::api::authentication::v1::UserInfo;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::Client;
use tracing::warn;

use crate::crd::{Checkout, Pool, GROUP};
use crate::validation::{
    validate_checkout_spec_update, validate_pool_spec, validate_pool_spec_update,
};

/// Webhook path for Checkout validation.
pub const CHECKOUT_WEBHOOK_PATH: &str = "/validate-pvpool-puppet-com-v1alpha1-checkout";

/// Webhook path for Pool validation.
pub const POOL_WEBHOOK_PATH: &str = "/validate-pvpool-puppet-com-v1alpha1-pool";

/// Build a denial carrying Kubernetes `Invalid` status semantics with
/// field-level errors.
fn invalid(response: AdmissionResponse, kind: &str, name: &str, errs: &[String]) -> AdmissionResponse {
    let mut response = response.deny(format!(
        "{kind} {name:?} is invalid: {}",
        errs.join("; ")
    ));
    response.result.reason = "Invalid".to_string();
    response.result.code = 422;
    response
}

/// Validate a Pool create or update.
pub fn validate_pool(req: &AdmissionRequest<Pool>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);

    let errs = match req.operation {
        Operation::Create => req
            .object
            .as_ref()
            .map(|pool| validate_pool_spec(&pool.spec))
            .unwrap_or_default(),
        Operation::Update => match (req.object.as_ref(), req.old_object.as_ref()) {
            (Some(new_pool), Some(old_pool)) => {
                validate_pool_spec_update(&new_pool.spec, &old_pool.spec)
            }
            _ => vec![],
        },
        _ => vec![],
    };

    if errs.is_empty() {
        response
    } else {
        invalid(response, "Pool", &req.name, &errs)
    }
}

/// The access review that decides whether a request's user may take volumes
/// from the referenced pool.
pub fn pool_use_review(
    checkout: &Checkout,
    request_namespace: Option<&str>,
    user: &UserInfo,
) -> SubjectAccessReview {
    let namespace = checkout
        .spec
        .pool_ref
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .or_else(|| request_namespace.map(String::from));

    SubjectAccessReview {
        spec: SubjectAccessReviewSpec {
            user: user.username.clone(),
            groups: user.groups.clone(),
            uid: user.uid.clone(),
            extra: user.extra.clone(),
            resource_attributes: Some(ResourceAttributes {
                verb: Some("use".to_string()),
                group: Some(GROUP.to_string()),
                resource: Some("pools".to_string()),
                namespace,
                name: Some(checkout.spec.pool_ref.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Validate a Checkout create or update: the pool reference is immutable
/// while the checkout holds a claim, and the requesting user must be
/// allowed to "use" the referenced pool.
pub async fn validate_checkout(
    client: &Client,
    req: &AdmissionRequest<Checkout>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);

    let Some(checkout) = req.object.as_ref() else {
        return response;
    };

    if matches!(req.operation, Operation::Update) {
        if let Some(old_checkout) = req.old_object.as_ref() {
            let errs = validate_checkout_spec_update(
                &checkout.spec,
                &old_checkout.spec,
                old_checkout.acquired(),
            );
            if !errs.is_empty() {
                return invalid(response, "Checkout", &req.name, &errs);
            }
        }
    }

    let review = pool_use_review(checkout, req.namespace.as_deref(), &req.user_info);
    let reviews: Api<SubjectAccessReview> = Api::all(client.clone());
    let outcome = match reviews.create(&PostParams::default(), &review).await {
        Ok(created) => created.status.unwrap_or_default(),
        Err(err) => {
            warn!(error = %err, "failed to create subject access review");
            return AdmissionResponse::invalid(format!(
                "unable to authorize pool use: {err}"
            ));
        }
    };

    if outcome.allowed {
        return response;
    }

    let reason = outcome.reason.unwrap_or_else(|| {
        format!(
            "user {:?} is not permitted to use pool {:?}",
            req.user_info.username.as_deref().unwrap_or("<unknown>"),
            checkout.spec.pool_ref.name,
        )
    });
    response.deny(reason)
}

/// Entry point for the Pool webhook endpoint.
pub fn review_pool(review: AdmissionReview<Pool>) -> AdmissionReview<DynamicObject> {
    match review.try_into() {
        Ok(req) => validate_pool(&req).into_review(),
        Err(err) => AdmissionResponse::invalid(err.to_string()).into_review(),
    }
}

/// Entry point for the Checkout webhook endpoint.
pub async fn review_checkout(
    client: &Client,
    review: AdmissionReview<Checkout>,
) -> AdmissionReview<DynamicObject> {
    match review.try_into() {
        Ok(req) => validate_checkout(client, &req).await.into_review(),
        Err(err) => AdmissionResponse::invalid(err.to_string()).into_review(),
    }
}
