//! Error taxonomy for the microscope control core.
//!
//! Every operation exposed by this crate returns [`AppResult`]. Variants are
//! grouped the way the dispatcher needs to react to them: configuration
//! errors are fatal at start-up, transient hardware errors are retried
//! silently, preempted operations resolve to a `success:false` response,
//! protocol errors log and leave state untouched, and resource-busy errors
//! reject the request without side effects.

use thiserror::Error;

/// Convenience alias used by every core operation.
pub type AppResult<T> = Result<T, MicroscopeError>;

/// Error taxonomy for the microscope control core.
#[derive(Debug, Error)]
pub enum MicroscopeError {
    /// A pin, ADC channel, or axis calibration is missing or invalid.
    /// Fatal at start-up; the affected axis refuses motion commands.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Settings or calibration document failed to parse.
    #[error("config file error: {0}")]
    Config(#[from] figment::Error),

    /// Underlying filesystem operation failed while loading or saving a document.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A command body failed to deserialize or carried an out-of-range value.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A move or focus session was aborted by `stop_move` or a transport disconnect.
    #[error("operation preempted: {0}")]
    Preempted(String),

    /// A resource that admits only one owner (a recorder, a sensor mode) was
    /// already in use when the request arrived.
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// A single hardware read or frame failed but the caller should retry at
    /// the next iteration; normally swallowed rather than surfaced to the
    /// operator.
    #[error("transient hardware error: {0}")]
    Transient(String),

    /// The axis named in a command does not exist or is not the one a
    /// reconciliation step expected.
    #[error("unknown or invalid axis: {0}")]
    InvalidAxis(String),

    /// A channel read timed out (autofocus sharpness reads nominally at 2s).
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Shutdown encountered more than one failure; all are preserved.
    #[error("shutdown failed: {0:?}")]
    ShutdownFailed(Vec<MicroscopeError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_displays_message() {
        let err = MicroscopeError::Configuration("missing pin map entry for Z".into());
        assert_eq!(
            err.to_string(),
            "configuration error: missing pin map entry for Z"
        );
    }

    #[test]
    fn shutdown_failed_collects_all_errors() {
        let err = MicroscopeError::ShutdownFailed(vec![
            MicroscopeError::Transient("adc read".into()),
            MicroscopeError::ResourceBusy("recorder".into()),
        ]);
        assert!(err.to_string().contains("shutdown failed"));
    }
}
