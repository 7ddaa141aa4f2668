//! Error types shared by the experiments.
//!
//! A unit that is still running when a bounded wait expires is *not* an error
//! at this level; see [`Joined::TimedOut`](crate::Joined::TimedOut). Only an
//! experiment verdict turns it into [`HarnessError::LivenessViolation`].

use std::time::Duration;

/// Failures surfaced to the driver or test layer. Nothing here is retried.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to spawn execution unit `{unit}`: {source}")]
    Spawn {
        unit: String,
        #[source]
        source: std::io::Error,
    },

    #[error("execution unit `{unit}` panicked")]
    UnitPanicked { unit: String },

    #[error("execution unit `{unit}` was already joined")]
    AlreadyJoined { unit: String },

    #[error("`{experiment}`: execution unit `{unit}` did not finish within {timeout:?}")]
    UnitTimedOut {
        experiment: String,
        unit: String,
        timeout: Duration,
    },

    #[error("invalid configuration for `{experiment}`: {reason}")]
    InvalidConfig {
        experiment: String,
        reason: &'static str,
    },

    #[error("`{experiment}` is inconclusive: {reason}")]
    Inconclusive {
        experiment: String,
        reason: String,
    },

    #[error(
        "liveness violation in `{experiment}`: `{unit}` did not observe the write within {timeout:?}"
    )]
    LivenessViolation {
        experiment: String,
        unit: String,
        timeout: Duration,
    },

    #[error(
        "happens-before violation in `{experiment}`: `{unit}` saw the flag but read payload {seen}"
    )]
    HappensBeforeViolation {
        experiment: String,
        unit: String,
        seen: u64,
    },

    #[error("worker `{unit}` did not terminate within {timeout:?} of the shutdown request")]
    ShutdownTimedOut { unit: String, timeout: Duration },
}

/// Returned by cancellable waits when cancellation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("execution unit was asked to cancel")]
pub struct Cancelled;

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_message_names_experiment_and_unit() {
        let err = HarnessError::LivenessViolation {
            experiment: "visibility/guarded".into(),
            unit: "reader-0".into(),
            timeout: Duration::from_secs(3),
        };
        let msg = err.to_string();
        assert!(msg.contains("visibility/guarded"));
        assert!(msg.contains("reader-0"));
        assert!(msg.contains("3s"));
    }

    #[test]
    fn spawn_error_keeps_source() {
        use std::error::Error;

        let err = HarnessError::Spawn {
            unit: "writer-0".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "no threads left"),
        };
        assert!(err.source().is_some());
    }
}
