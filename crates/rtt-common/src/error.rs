use thiserror::Error;

/// Harness error types covering line access, configuration, and scheduling.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RttError {
    /// Line or controller already claimed, or an offset not owned by the request.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The line controller could not be opened.
    #[error("device error: {0}")]
    Device(String),

    /// Read, write, or wait failure at the syscall level.
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid line/request configuration or runtime configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Scheduling class or memory lock could not be applied.
    #[error("scheduling degradation: {0}")]
    SchedulingDegradation(String),

    /// Invalid responder state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

/// Convenience type alias for harness operations.
pub type RttResult<T> = Result<T, RttError>;
