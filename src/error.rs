use thiserror::Error;

/// Errors raised from a reconcile tick.
///
/// Probe failures are not represented here: a pod that cannot be probed is
/// counted as not-busy and the tick continues. Only errors that prevent
/// computing any count or applying any mutation surface to the controller,
/// which records a `ReconcileError` event and requeues with backoff.
#[derive(Debug, Error)]
pub enum Error {
    /// The resource is malformed in a way defaults cannot paper over
    /// (e.g. a cluster-scoped object with no namespace).
    #[error("invalid HotStandbyJob: {0}")]
    Config(String),

    /// The `jobTemplate` document could not be shaped into a valid Job.
    #[error("invalid jobTemplate: {0}")]
    Template(#[from] serde_json::Error),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("exec did not finish within {0:?}")]
    ExecTimeout(std::time::Duration),

    #[error("pod-state store error: {0}")]
    Store(#[from] redis::RedisError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
