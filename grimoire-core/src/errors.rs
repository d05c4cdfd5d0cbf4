use thiserror::Error;

/// The nine error kinds the runtime can surface, per the external error-handling
/// contract. Each leaf kind is its own type so callers can match on a specific
/// failure mode without unpacking a flat string.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RuntimeError {
    #[error("schema provisioning failed: {0}")]
    SchemaProvision(#[from] SchemaProvisionError),

    #[error(transparent)]
    LocalDb(#[from] LocalDbError),

    #[error(transparent)]
    RemoteDb(#[from] RemoteDbError),

    #[error(transparent)]
    RemoteAuth(#[from] RemoteAuthError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    VersionStale(#[from] VersionStale),

    #[error(transparent)]
    MutationFailed(#[from] MutationFailed),

    #[error(transparent)]
    QueueDrainAborted(#[from] QueueDrainAborted),

    #[error(transparent)]
    RemoteTimeout(#[from] RemoteTimeout),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("uuid parsing error: {0}")]
    UuidParse(#[from] uuid::Error),
}

#[derive(Error, Debug)]
#[error("failed to provision local schema: {0}")]
pub struct SchemaProvisionError(pub String);

#[derive(Error, Debug)]
pub enum LocalDbError {
    #[error("local database error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("local migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("local invariant violated: {0}")]
    InvariantViolated(String),
}

#[derive(Error, Debug)]
pub enum RemoteDbError {
    #[error("remote transport error: {0}")]
    Transport(String),

    #[error("remote returned malformed response: {0}")]
    MalformedResponse(String),

    #[error("remote connection is closed")]
    ConnectionClosed,

    #[error(transparent)]
    Timeout(#[from] RemoteTimeout),
}

#[derive(Error, Debug)]
#[error("remote authentication failed: {0}")]
pub struct RemoteAuthError(pub String);

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("unsupported operator in surql: {0}")]
    UnsupportedOperator(String),

    #[error("malformed surql: {0}")]
    Malformed(String),

    #[error("equi-join requires a declared relationship between `{0}` and `{1}`")]
    MissingJoinKey(String, String),
}

#[derive(Error, Debug)]
#[error("record {record_id} version stale: anticipated {anticipated}, returned {returned}")]
pub struct VersionStale {
    pub record_id: String,
    pub anticipated: u64,
    pub returned: u64,
}

#[derive(Error, Debug)]
#[error("mutation failed: {0}")]
pub struct MutationFailed(pub String);

#[derive(Error, Debug)]
#[error("queue drain aborted: {0}")]
pub struct QueueDrainAborted(pub String);

#[derive(Error, Debug)]
#[error("remote call timed out after {0:?}")]
pub struct RemoteTimeout(pub std::time::Duration);

pub type RuntimeResult<T> = Result<T, RuntimeError>;
