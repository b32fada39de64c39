//! Gateway configuration: a TOML file, then `SHELL_GATEWAY_*` environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "SHELL_GATEWAY_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Address the WebSocket gateway listens on.
    pub listen: String,
    /// Bound on one shell connect attempt, handshake and auth included.
    /// Freshly provisioned hosts can be slow to answer.
    pub connect_timeout_secs: u64,
    pub ssh_user: String,
    pub ssh_port: u16,
    /// Pre-provisioned key tried after the stored root password.
    pub fallback_key_path: Option<PathBuf>,
    /// Hex AES-256 key that opens `sealed_password` entries.
    pub credential_key: Option<String>,
    /// Output chunks queued per attached tab. A full queue pauses the shell.
    pub output_buffer: usize,
    pub log_level: String,
    pub servers: Vec<ServerEntry>,
}

/// A server known to the gateway, as exported by the provisioning side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    pub id: u64,
    /// `None` until the cloud API has assigned an address.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_ready")]
    pub ready: bool,
    /// Root password sealed with `credential_key`, hex encoded.
    #[serde(default)]
    pub sealed_password: Option<String>,
}

fn default_ready() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8022".to_string(),
            connect_timeout_secs: 30,
            ssh_user: "root".to_string(),
            ssh_port: 22,
            fallback_key_path: None,
            credential_key: None,
            output_buffer: 1024,
            log_level: "info".to_string(),
            servers: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let mut config = Self::parse(&content)?;
        config.apply_env_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("parsing TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SHELL_GATEWAY_*` overrides using `lookup` to read variables.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(listen) = var("LISTEN") {
            self.listen = listen;
        }
        if let Some(secs) = var("CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = secs
                .parse()
                .with_context(|| format!("{}CONNECT_TIMEOUT_SECS: not a number", ENV_PREFIX))?;
        }
        if let Some(user) = var("SSH_USER") {
            self.ssh_user = user;
        }
        if let Some(path) = var("FALLBACK_KEY_PATH") {
            self.fallback_key_path = Some(PathBuf::from(path));
        }
        if let Some(key) = var("CREDENTIAL_KEY") {
            self.credential_key = Some(key);
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs must be greater than 0");
        }
        if self.output_buffer == 0 {
            anyhow::bail!("output_buffer must be greater than 0");
        }
        if self.ssh_user.is_empty() {
            anyhow::bail!("ssh_user must not be empty");
        }
        self.credential_key_bytes()?;
        let mut ids = std::collections::HashSet::new();
        for server in &self.servers {
            if !ids.insert(server.id) {
                anyhow::bail!("duplicate server id {}", server.id);
            }
            if server.sealed_password.is_some() && self.credential_key.is_none() {
                anyhow::bail!(
                    "server {} has a sealed_password but no credential_key is configured",
                    server.id
                );
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn credential_key_bytes(&self) -> Result<Option<[u8; 32]>> {
        self.credential_key
            .as_deref()
            .map(|hex| crate::crypto::parse_key(hex).context("invalid credential_key"))
            .transpose()
    }
}
