#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,

    #[error("revision conflict")]
    Conflict,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt document: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Transient errors are retried by the jar's retry policy; domain
    /// errors (not-found, conflict) always surface to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JarError {
    #[error("cookie not found")]
    NotFound,

    #[error("cookie {0:?} is not reserved by any worker")]
    NotReserved(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why `next_for_processing` returned without a cookie.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("timed out waiting for a dirty cookie")]
    Timeout,

    #[error("queue has been stopped")]
    Stopped,
}
