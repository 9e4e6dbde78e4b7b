//! Control-plane error kinds.
//!
//! Every failed control request maps to one of these kinds; the handler
//! formats the error into a negative reply. Data-plane failures never use
//! this type — they are silent drops counted in statistics.

use forest_proto::ctl::MissingAttr;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CtlError {
    #[error("unable to unpack control packet: {0}")]
    Unpack(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("no capacity: {0}")]
    NoCapacity(String),
    #[error("queue allocation failed: {0}")]
    QueueAlloc(String),
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    #[error("thread pool exhausted")]
    PoolExhausted,
}

impl From<MissingAttr> for CtlError {
    fn from(e: MissingAttr) -> Self {
        CtlError::InvalidParameter(e.to_string())
    }
}
