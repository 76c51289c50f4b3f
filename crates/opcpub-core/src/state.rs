//! Connection and writer state values plus the reporter seam.
//!
//! All state values are compared structurally. Producers only report a value
//! when it differs from the previously reported one (level-triggered).

use crate::endpoint::EndpointDescriptor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection status of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Connect or reconnect in progress
    Connecting,
    /// Session is established and usable
    Ready,
    /// Endpoint did not answer
    NotReachable,
    /// Server refused because it is overloaded
    Busy,
    /// Server certificate is not trusted
    NoTrust,
    /// Server certificate is invalid
    CertificateInvalid,
    /// Unclassified failure
    Error,
    /// Session was closed
    Disconnected,
    /// Credentials were rejected
    Unauthorized,
}

impl ConnectionStatus {
    /// Returns `true` if the session can serve requests.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns `true` if the status needs operator action to clear.
    #[inline]
    #[must_use]
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::NoTrust | Self::CertificateInvalid | Self::Unauthorized
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "Connecting",
            Self::Ready => "Ready",
            Self::NotReachable => "NotReachable",
            Self::Busy => "Busy",
            Self::NoTrust => "NoTrust",
            Self::CertificateInvalid => "CertificateInvalid",
            Self::Error => "Error",
            Self::Disconnected => "Disconnected",
            Self::Unauthorized => "Unauthorized",
        };
        f.write_str(s)
    }
}

/// Connection state attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Current status
    pub status: ConnectionStatus,
    /// Description of the last operation result, if any
    pub last_result: Option<String>,
    /// When the status last changed
    pub changed_at: DateTime<Utc>,
}

impl ConnectionState {
    /// Create a state stamped with the current time.
    #[must_use]
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            status,
            last_result: None,
            changed_at: Utc::now(),
        }
    }

    /// Compute the next state.
    ///
    /// Returns `None` when status and result are unchanged so that repeated
    /// identical states never re-fire.
    #[must_use]
    pub fn transition(
        &self,
        status: ConnectionStatus,
        last_result: Option<String>,
    ) -> Option<Self> {
        if self.status == status && self.last_result == last_result {
            return None;
        }
        Some(Self {
            status,
            last_result,
            changed_at: Utc::now(),
        })
    }
}

/// Status of a dataset writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterStatus {
    /// Attached, waiting for the first notification
    Pending,
    /// Emitting messages
    Publishing,
    /// Source subscription lost its session
    Disconnected,
    /// Writer failed to hand off messages
    Error,
}

/// A sequence discontinuity caused by a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGap {
    /// Last sequence number emitted before the disconnect (`None` if none yet)
    pub last_sequence: Option<u64>,
    /// When the source disconnected
    pub disconnected_at: DateTime<Utc>,
    /// When the source came back
    pub resumed_at: DateTime<Utc>,
}

/// Overall state of a dataset writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterState {
    /// Writer status
    pub status: WriterStatus,
    /// Last error message
    pub last_error: Option<String>,
    /// Gap reported on the transition back to publishing after a reconnect
    pub gap: Option<SequenceGap>,
}

impl WriterState {
    /// A state with the given status and no error or gap.
    #[must_use]
    pub fn new(status: WriterStatus) -> Self {
        Self {
            status,
            last_error: None,
            gap: None,
        }
    }
}

/// State of one monitored item as seen by a writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemState {
    /// Item is monitored and delivering values
    Good,
    /// Item could not be created or reported a bad status
    Error {
        /// Error description
        message: String,
    },
    /// Item was removed from the subscription
    Removed,
}

/// Receives connection and writer state changes for persistence/telemetry.
///
/// Every method is called only when the reported value changed.
#[async_trait]
pub trait StateReporter: Send + Sync {
    /// A session's connection state changed.
    async fn on_connection_state_change(
        &self,
        endpoint: &EndpointDescriptor,
        state: &ConnectionState,
    );

    /// A writer's overall state changed.
    async fn on_writer_state_change(&self, writer: &str, state: &WriterState);

    /// The state of a variable item feeding a writer changed.
    async fn on_variable_state_change(&self, writer: &str, item_id: &str, state: &ItemState);

    /// The state of an event field item feeding a writer changed.
    async fn on_event_field_state_change(&self, writer: &str, item_id: &str, state: &ItemState);
}

/// Reporter that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStateReporter;

#[async_trait]
impl StateReporter for LogStateReporter {
    async fn on_connection_state_change(
        &self,
        endpoint: &EndpointDescriptor,
        state: &ConnectionState,
    ) {
        tracing::info!(
            endpoint = %endpoint.url,
            status = %state.status,
            last_result = ?state.last_result,
            "Connection state changed"
        );
    }

    async fn on_writer_state_change(&self, writer: &str, state: &WriterState) {
        tracing::info!(writer, status = ?state.status, gap = ?state.gap, "Writer state changed");
    }

    async fn on_variable_state_change(&self, writer: &str, item_id: &str, state: &ItemState) {
        tracing::debug!(writer, item_id, state = ?state, "Variable state changed");
    }

    async fn on_event_field_state_change(&self, writer: &str, item_id: &str, state: &ItemState) {
        tracing::debug!(writer, item_id, state = ?state, "Event field state changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_transition_does_not_fire() {
        let state = ConnectionState::new(ConnectionStatus::Ready);
        assert!(state.transition(ConnectionStatus::Ready, None).is_none());
    }

    #[test]
    fn changed_result_fires_with_same_status() {
        let state = ConnectionState::new(ConnectionStatus::Error);
        let next = state
            .transition(ConnectionStatus::Error, Some("bad frame".to_string()))
            .unwrap();
        assert_eq!(next.status, ConnectionStatus::Error);
        assert_eq!(next.last_result.as_deref(), Some("bad frame"));
        assert!(next.changed_at >= state.changed_at);
    }

    #[test]
    fn trust_failures_are_flagged() {
        assert!(ConnectionStatus::NoTrust.is_trust_failure());
        assert!(ConnectionStatus::Unauthorized.is_trust_failure());
        assert!(!ConnectionStatus::Busy.is_trust_failure());
    }
}
