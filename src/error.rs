use std::fmt;
use thiserror::Error;

/// A convenience `Result` type for shard operations.
pub type Result<T> = std::result::Result<T, ShardError>;

/// Custom error type for the shard engine.
///
/// Callers can rely on the taxonomy: `InvalidParams` must not be retried,
/// `Throttled` should be backed off and retried, `LoadLimitHit` is a distinct
/// sentinel callers degrade on, and `InvariantViolation` is always logged at
/// error with full context before being returned.
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Series not present in the shard map. Only surfaced internally; the
    /// read path swallows it at the boundary.
    #[error("shard entry not found")]
    EntryNotFound,

    #[error("shard is not open")]
    ShardNotOpen,

    #[error("shard is already ticking")]
    AlreadyTicking,

    #[error("shard is closing, terminating tick")]
    ClosingTickTerminated,

    #[error("shard is not bootstrapped")]
    NotBootstrapped,

    #[error("shard is already bootstrapped")]
    AlreadyBootstrapped,

    #[error("shard is bootstrapping")]
    Bootstrapping,

    #[error("shard flush state is not initialized")]
    FlushStateNotInitialized,

    #[error("could not decode metadata page token")]
    InvalidPageToken,

    #[error("insert queue is closed")]
    QueueClosed,

    #[error("new-series insert rate limit reached")]
    Throttled,

    /// The cumulative bytes budget for loaded blocks was exceeded.
    #[error("error loading series, shard load limit hit")]
    LoadLimitHit,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("lock acquisition failed: {0}")]
    Lock(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Multi(#[from] MultiError),
}

impl ShardError {
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        ShardError::InvalidParams(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ShardError::Internal(msg.into())
    }

    /// True for errors the caller caused and must not retry.
    pub fn is_invalid_params(&self) -> bool {
        matches!(
            self,
            ShardError::InvalidParams(_) | ShardError::ShardNotOpen | ShardError::InvalidPageToken
        )
    }
}

// Poisoned locks are unrecoverable state corruption; surface them as errors
// rather than panicking in library code.
impl<T> From<std::sync::PoisonError<T>> for ShardError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ShardError::Lock(format!("mutex/rwlock poisoned: {}", err))
    }
}

/// Accumulates per-series errors during flush, snapshot and load so a single
/// bad series does not mask the outcome of the others.
#[derive(Debug, Default, Error)]
pub struct MultiError {
    errors: Vec<ShardError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, err: ShardError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Collapses into `Ok(())`, the single error, or the aggregate.
    pub fn final_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(ShardError::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, " [{}]", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_error_collapses() {
        let empty = MultiError::new();
        assert!(empty.final_result().is_ok());

        let mut single = MultiError::new();
        single.add(ShardError::Throttled);
        match single.final_result() {
            Err(ShardError::Throttled) => {}
            other => panic!("expected throttled, got {:?}", other),
        }

        let mut many = MultiError::new();
        many.add(ShardError::Throttled);
        many.add(ShardError::EntryNotFound);
        let err = many.final_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("2 errors occurred"), "{}", msg);
    }

    #[test]
    fn invalid_params_classification() {
        assert!(ShardError::ShardNotOpen.is_invalid_params());
        assert!(ShardError::invalid_params("bad").is_invalid_params());
        assert!(!ShardError::Throttled.is_invalid_params());
        assert!(!ShardError::internal("x").is_invalid_params());
    }
}
