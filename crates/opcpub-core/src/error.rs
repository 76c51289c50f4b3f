//! Error taxonomy shared by the pipeline components.
//!
//! Callers branch on [`CoreError::kind`] to decide between retrying,
//! shedding load, alerting an operator or reconfiguring.

use crate::state::ConnectionStatus;
use std::time::Duration;

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network blip or busy server, retry with backoff
    Transient,
    /// A quota or queue is at capacity
    ResourceExhaustion,
    /// Duplicate resource, caller must resolve
    Conflict,
    /// Certificate or credential failure, needs operator intervention
    Trust,
    /// Malformed response from the device
    Protocol,
    /// Caller cancelled or a deadline fired
    Cancelled,
    /// The owning session or component was shut down
    Closed,
    /// Referenced resource does not exist
    NotFound,
    /// Invalid argument or configuration
    Invalid,
}

/// Errors produced by the session, subscription and publishing pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// Network failure talking to the device
    #[error("transient failure: {0}")]
    Transient(String),
    /// Device reported it is too busy to serve the request
    #[error("server busy: {0}")]
    ServerBusy(String),
    /// Device could not be reached after all reconnect attempts
    #[error("endpoint {endpoint} not reachable after {attempts} attempts")]
    NotReachable {
        /// Endpoint URL
        endpoint: String,
        /// Number of attempts made
        attempts: u32,
    },
    /// A quota is exhausted
    #[error("{resource} exhausted (limit {limit})")]
    ResourceExhausted {
        /// Name of the exhausted resource
        resource: &'static str,
        /// Configured limit
        limit: usize,
    },
    /// A subscription with the same name already exists on the session
    #[error("subscription '{name}' already exists on session {session}")]
    SubscriptionAlreadyExists {
        /// Session identifier
        session: String,
        /// Subscription name
        name: String,
    },
    /// Credentials were rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Server certificate is not trusted
    #[error("server certificate not trusted: {0}")]
    NoTrust(String),
    /// Server certificate is invalid (expired, wrong host, malformed)
    #[error("certificate invalid: {0}")]
    CertificateInvalid(String),
    /// Device returned a malformed response
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,
    /// Operation did not complete in time
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// Session was detached while the operation was in flight
    #[error("session {0} closed")]
    SessionClosed(String),
    /// A component queue or loop was shut down
    #[error("{0} closed")]
    Closed(&'static str),
    /// Referenced resource does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Invalid argument or configuration
    #[error("invalid: {0}")]
    Invalid(String),
}

impl CoreError {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::ServerBusy(_) | Self::NotReachable { .. } => {
                ErrorKind::Transient
            }
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhaustion,
            Self::SubscriptionAlreadyExists { .. } => ErrorKind::Conflict,
            Self::Unauthorized(_) | Self::NoTrust(_) | Self::CertificateInvalid(_) => {
                ErrorKind::Trust
            }
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Cancelled | Self::Timeout(_) => ErrorKind::Cancelled,
            Self::SessionClosed(_) | Self::Closed(_) => ErrorKind::Closed,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Invalid(_) => ErrorKind::Invalid,
        }
    }

    /// Returns `true` if retrying the same operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::ResourceExhaustion
        )
    }

    /// Returns `true` for failures that a connect loop should retry in place.
    ///
    /// `NotReachable` is the outcome of exhausted retries and is excluded.
    #[must_use]
    pub fn is_transient_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::ServerBusy(_) | Self::Timeout(_)
        )
    }

    /// Map a connect/keep-alive failure to the connection status it implies.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        match self {
            Self::ServerBusy(_) => ConnectionStatus::Busy,
            Self::NoTrust(_) => ConnectionStatus::NoTrust,
            Self::CertificateInvalid(_) => ConnectionStatus::CertificateInvalid,
            Self::Unauthorized(_) => ConnectionStatus::Unauthorized,
            Self::Transient(_) | Self::NotReachable { .. } | Self::Timeout(_) => {
                ConnectionStatus::NotReachable
            }
            Self::Cancelled | Self::SessionClosed(_) | Self::Closed(_) => {
                ConnectionStatus::Disconnected
            }
            _ => ConnectionStatus::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_are_retryable_conflicts_are_not() {
        let quota = CoreError::ResourceExhausted {
            resource: "sessions",
            limit: 1,
        };
        assert_eq!(quota.kind(), ErrorKind::ResourceExhaustion);
        assert!(quota.is_retryable());

        let conflict = CoreError::SubscriptionAlreadyExists {
            session: "s1".to_string(),
            name: "temps".to_string(),
        };
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert!(!conflict.is_retryable());
    }

    #[test]
    fn trust_failures_map_to_granular_states() {
        assert_eq!(
            CoreError::NoTrust("self-signed".into()).connection_status(),
            ConnectionStatus::NoTrust
        );
        assert_eq!(
            CoreError::CertificateInvalid("expired".into()).connection_status(),
            ConnectionStatus::CertificateInvalid
        );
        assert_eq!(
            CoreError::Unauthorized("bad password".into()).connection_status(),
            ConnectionStatus::Unauthorized
        );
        assert_eq!(
            CoreError::ServerBusy("too many sessions".into()).connection_status(),
            ConnectionStatus::Busy
        );
        assert_eq!(
            CoreError::Protocol("bad frame".into()).connection_status(),
            ConnectionStatus::Error
        );
        assert_eq!(CoreError::NoTrust(String::new()).kind(), ErrorKind::Trust);
    }

    #[test]
    fn busy_and_transient_connect_failures_are_retried_in_place() {
        assert!(CoreError::ServerBusy("full".into()).is_transient_connect_failure());
        assert!(CoreError::Transient("reset".into()).is_transient_connect_failure());
        assert!(!CoreError::NoTrust("self-signed".into()).is_transient_connect_failure());
        assert!(!CoreError::NotReachable {
            endpoint: "opc.tcp://plc-1:4840".into(),
            attempts: 3,
        }
        .is_transient_connect_failure());
    }
}
