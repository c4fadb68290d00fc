use thiserror::Error;

/// Errors produced while reconciling pools and checkouts.
///
/// The classification predicates drive the work queue: user errors are not
/// requeued (the next update to the resource re-triggers reconciliation),
/// transient errors requeue with backoff, and everything else is treated as
/// an infrastructure failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("pool {0} does not exist")]
    PoolNotFound(String),

    #[error("pool {0} has no available replicas to check out")]
    NoReplicasAvailable(String),

    #[error("persistent volume for claim {0} is not yet available")]
    VolumeNotReady(String),

    #[error("{kind} {name} exists but is not controlled by this checkout")]
    Conflict { kind: &'static str, name: String },

    #[error("invalid label selector: {0}")]
    Selector(String),

    #[error("invalid resource: {0}")]
    Invalid(#[source] kube::Error),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("malformed dependency annotation: {0}")]
    DependencyAnnotation(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wrap a Kubernetes API error, recognizing `Invalid` responses from the
    /// API server as user errors.
    pub fn classify(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.reason == "Invalid" => Error::Invalid(err),
            _ => Error::Kube(err),
        }
    }

    /// User errors are only resolved by the user updating the resource, so
    /// requeueing them is pointless.
    pub fn is_user(&self) -> bool {
        matches!(self, Error::Invalid(_) | Error::Selector(_))
    }

    /// Transient errors resolve on their own (a pool appears, a replica
    /// becomes available, a volume binds) and requeue with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PoolNotFound(_)
                | Error::NoReplicasAvailable(_)
                | Error::VolumeNotReady(_)
                | Error::Conflict { .. }
        )
    }
}
