use std::error::Error as StdError;

/// Errors returned when talking to the shared job/queue store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transport or protocol failure.
    #[error("store connection error: {0}")]
    Connection(#[source] Box<dyn StdError + Send + Sync>),
    /// A queue or record payload could not be decoded.
    #[error("malformed store payload: {0}")]
    Decode(String),
    /// The referenced job does not exist.
    #[error("unknown job: {0}")]
    UnknownJob(String),
}

impl StoreError {
    /// Wrap an arbitrary transport error.
    pub fn connection(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Connection(Box::new(err))
    }
}

/// Errors returned when talking to the index backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Transport failure.
    #[error("backend connection error: {0}")]
    Connection(#[source] Box<dyn StdError + Send + Sync>),
    /// The backend answered with an error object.
    #[error("backend error: {0}")]
    Api(String),
}

impl BackendError {
    /// Wrap an arbitrary transport error.
    pub fn connection(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Connection(Box::new(err))
    }
}
