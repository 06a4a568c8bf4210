//! Error taxonomy shared by the gateways, controllers and healer.
//!
//! Gateways wrap protocol-level failures into one of these kinds;
//! controllers turn kinds into task status transitions; the healer never
//! propagates them past a rule.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A group, instance, backup or container that callers asked for does
    /// not exist. The healer reads this as "missing, synthesize".
    #[error("not found: {0}")]
    NotFound(String),

    /// Settings are missing or inconsistent (no subnet, no managed network,
    /// unsupported config file, restore exceeding the blueprint memsize).
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The allocator found no host, or the IP pool ran dry.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Timeouts, refused connections, a leaderless Consul cluster. Retried
    /// on the next tick.
    #[error("transient failure: {0}")]
    Transient(String),

    /// An internal assertion did not hold (e.g. a registration without a
    /// blueprint). Logged at error level and reconciled by the healer.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// An in-container script exited non-zero.
    #[error("external command failed: {0}")]
    ExternalFailure(String),
}

impl Error {
    /// Whether retrying the same operation later can succeed without
    /// operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::CapacityExhausted(_))
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Error::NotFound(message),
            bollard::errors::Error::RequestTimeoutError => {
                Error::Transient("docker api timed out".to_string())
            }
            other => Error::Transient(format!("docker api: {other}")),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.status().map(|s| s.as_u16()) == Some(404) {
            Error::NotFound(err.to_string())
        } else {
            Error::Transient(format!("consul api: {err}"))
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transient(format!("io: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_404_maps_to_not_found() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        };
        assert!(matches!(Error::from(err), Error::NotFound(_)));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::Transient("x".into()).is_retryable());
        assert!(Error::CapacityExhausted("x".into()).is_retryable());
        assert!(!Error::ConfigInvalid("x".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
    }
}
