use std::fmt;

/// Results of engine operations that are not plain success.
///
/// Flow-control variants are expected and left to the caller's retry or
/// backpressure policy. Invariant violations never show up here: they go
/// through [`crate::ffdc::fatal`] and stop the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// A bounded queue had no free slot
    #[error("queue full")]
    QueueFull,
    /// A job queue was polled while empty
    #[error("no job available")]
    NoJobAvailable,
    /// A timed receive ended without a message
    #[error("no message available")]
    NoMessageAvailable,
    /// The operation can be retried later
    #[error("retry")]
    Retry,
    #[error("timed out")]
    Timeout,
    /// The target object was torn down first
    #[error("object destroyed")]
    Destroyed,
    #[error("timer could not be scheduled")]
    TimerUnavailable,
    #[error("thread {0} is not registered with the engine")]
    UnknownThread(String),
    #[error("destination not found, {0}")]
    DestinationNotFound(String),
    #[error("invalid argument, {0}")]
    InvalidArgument(String),
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("{0}")]
    Msg(String),
}

impl EngineError {
    /// Expected outcomes a caller reacts to rather than reports.
    #[inline]
    pub fn is_flow_control(&self) -> bool {
        matches!(
            self,
            EngineError::QueueFull
                | EngineError::NoJobAvailable
                | EngineError::NoMessageAvailable
                | EngineError::Retry
                | EngineError::Timeout
        )
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        matches!(self, EngineError::Destroyed)
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Msg(e.to_string())
    }
}

/// Success half of an operation that may finish out-of-line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Finished before returning; no completion callback will fire
    Completed,
    /// Finishes later; the completion callback fires exactly once
    AsyncCompletion,
}

impl CallStatus {
    #[inline]
    pub fn is_async(&self) -> bool {
        matches!(self, CallStatus::AsyncCompletion)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Completed => write!(f, "completed"),
            CallStatus::AsyncCompletion => write!(f, "async completion"),
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_control_classification() {
        assert!(EngineError::QueueFull.is_flow_control());
        assert!(EngineError::NoMessageAvailable.is_flow_control());
        assert!(!EngineError::Destroyed.is_flow_control());
        assert!(!EngineError::TimerUnavailable.is_flow_control());
        assert!(EngineError::Destroyed.is_destroyed());
    }
}
