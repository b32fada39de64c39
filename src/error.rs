//! Failure taxonomy for terminal sessions.
//!
//! Every failure that can end a terminal session maps onto an [`ErrorCategory`],
//! which carries the troubleshooting text shown next to the raw error message.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Why a shell session could not be established (or died).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The server has no address yet or is still being provisioned.
    #[error("Server Not Ready: {0}")]
    ServerNotReady(String),
    /// Every offered credential was rejected.
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("connection timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    /// The operating system gave up on the TCP connection.
    #[error("connection timed out: {0}")]
    TransportTimeout(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("network error: {0}")]
    Network(String),
}

impl ConnectError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ServerNotReady(_) => ErrorCategory::Precondition,
            Self::AuthFailure(_) => ErrorCategory::Auth,
            Self::Timeout(_) | Self::TransportTimeout(_) => ErrorCategory::Timeout,
            Self::ConnectionRefused(_) => ErrorCategory::Refused,
            Self::Network(_) => ErrorCategory::Network,
        }
    }

    /// Classify an I/O failure from the transport below the shell.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::TransportTimeout(err.to_string()),
            _ => Self::Network(err.to_string()),
        }
    }
}

/// User-facing failure category, sent on the wire with every `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Precondition,
    Auth,
    Timeout,
    Refused,
    Network,
    UnexpectedDisconnect,
}

impl ErrorCategory {
    /// Short headline for the status banner.
    pub fn headline(self) -> &'static str {
        match self {
            Self::Precondition => "Server Not Ready",
            Self::Auth => "Authentication failed",
            Self::Timeout => "Connection timed out",
            Self::Refused => "Connection refused",
            Self::Network => "Connection error",
            Self::UnexpectedDisconnect => "Disconnected",
        }
    }

    /// Remediation hints, most relevant first.
    pub fn troubleshooting(self) -> &'static [&'static str] {
        match self {
            Self::Precondition => &[
                "The server does not have an IP address yet.",
                "Wait for provisioning to finish, then open the terminal again.",
            ],
            Self::Timeout | Self::Refused => &[
                "The server may still be provisioning. New servers can take a few minutes before SSH is available.",
                "Wait a moment, then press Reconnect.",
            ],
            Self::Auth => &[
                "The server rejected the root credential.",
                "Try resetting the root password from the server settings, then reconnect.",
            ],
            Self::Network | Self::UnexpectedDisconnect => &[
                "Check your network connection.",
                "Press Reconnect to start a new session.",
            ],
        }
    }

    /// Whether the failure looks transient and a manual reconnect is likely to help.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Refused | Self::Network | Self::UnexpectedDisconnect
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            ConnectError::ServerNotReady("no address".into()).category(),
            ErrorCategory::Precondition
        );
        assert_eq!(
            ConnectError::AuthFailure("rejected".into()).category(),
            ErrorCategory::Auth
        );
        assert_eq!(
            ConnectError::Timeout(Duration::from_secs(30)).category(),
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn test_refused_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(ConnectError::from_io(&io).category(), ErrorCategory::Refused);
    }

    #[test]
    fn test_timed_out_io_error_keeps_os_message() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "no reply from 203.0.113.5");
        let err = ConnectError::from_io(&io);
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert_eq!(
            err.to_string(),
            "connection timed out: no reply from 203.0.113.5"
        );
    }

    #[test]
    fn test_timeout_guidance_mentions_provisioning() {
        let hints = ErrorCategory::Timeout.troubleshooting();
        assert!(hints[0].contains("provisioning"));
        assert!(ErrorCategory::Timeout.is_transient());
        assert!(!ErrorCategory::Auth.is_transient());
    }

    #[test]
    fn test_auth_guidance_mentions_reset() {
        assert!(ErrorCategory::Auth
            .troubleshooting()
            .iter()
            .any(|h| h.contains("resetting the root password")));
    }

    #[test]
    fn test_timeout_display() {
        let err = ConnectError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "connection timed out after 30s");
    }

    #[test]
    fn test_category_json() {
        let json = serde_json::to_string(&ErrorCategory::UnexpectedDisconnect).unwrap();
        assert_eq!(json, "\"unexpected_disconnect\"");
    }
}
