//! Remote Shell Connector: one authenticated interactive shell per [`ShellHandle`].

pub mod connector;
pub mod session;

pub use connector::{
    ConnectProgress, OpenedShell, ProgressSink, ShellConnector, ShellEndpoint, ShellHandle,
    ShellOutput,
};
pub use session::SshConnector;

use crate::protocol::TermSize;
use std::fmt;

/// Target and credentials for one shell connection attempt.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Tried in order within a single attempt; the first accepted method wins.
    pub auth: Vec<SshAuth>,
    /// Initial pty size.
    pub size: TermSize,
}

/// SSH authentication method.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub enum SshAuth {
    Password(String),
    KeyFile {
        path: String,
        passphrase: Option<String>,
    },
}

impl SshAuth {
    /// Method name as reported to the client.
    pub fn method_name(&self) -> &'static str {
        match self {
            SshAuth::Password(_) => "password",
            SshAuth::KeyFile { .. } => "publickey",
        }
    }
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuth::KeyFile { path, .. } => f.debug_struct("KeyFile").field("path", path).finish(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: "root".to_string(),
            auth: Vec::new(),
            size: TermSize::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let auth = SshAuth::Password("hunter2".to_string());
        let printed = format!("{:?}", auth);
        assert!(!printed.contains("hunter2"));
        assert_eq!(auth.method_name(), "password");
    }

    #[test]
    fn test_key_method_name() {
        let auth = SshAuth::KeyFile {
            path: "/etc/panel/id_ed25519".to_string(),
            passphrase: None,
        };
        assert_eq!(auth.method_name(), "publickey");
        assert!(format!("{:?}", auth).contains("id_ed25519"));
    }
}
