//! Read-only collaborators: where a server lives and how to log into it.

use crate::config::{GatewayConfig, ServerEntry};
use async_trait::async_trait;
use std::collections::HashMap;

/// What the provisioning side knows about a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: u64,
    pub address: Option<String>,
    pub ready: bool,
}

impl ServerRecord {
    /// The address to connect to, if the server can take connections yet.
    pub fn reachable_address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .map(str::trim)
            .filter(|a| self.ready && !a.is_empty())
    }
}

/// Looks up servers by id.
#[async_trait]
pub trait ServerInventory: Send + Sync {
    async fn lookup(&self, server_id: u64) -> Option<ServerRecord>;
}

/// Supplies stored root credentials. Absence is normal; errors are reported
/// and treated as absence by the caller.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn root_password(&self, server_id: u64) -> anyhow::Result<Option<String>>;
}

/// Inventory and credential store backed by the `[[servers]]` config table.
pub struct ConfigInventory {
    servers: HashMap<u64, ServerEntry>,
    credential_key: Option<[u8; 32]>,
}

impl ConfigInventory {
    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        Ok(Self {
            servers: config.servers.iter().map(|s| (s.id, s.clone())).collect(),
            credential_key: config.credential_key_bytes()?,
        })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[async_trait]
impl ServerInventory for ConfigInventory {
    async fn lookup(&self, server_id: u64) -> Option<ServerRecord> {
        self.servers.get(&server_id).map(|entry| ServerRecord {
            id: entry.id,
            address: entry.address.clone(),
            ready: entry.ready,
        })
    }
}

#[async_trait]
impl CredentialStore for ConfigInventory {
    async fn root_password(&self, server_id: u64) -> anyhow::Result<Option<String>> {
        let Some(sealed) = self
            .servers
            .get(&server_id)
            .and_then(|s| s.sealed_password.as_deref())
        else {
            return Ok(None);
        };
        let key = self
            .credential_key
            .ok_or_else(|| anyhow::anyhow!("no credential_key configured"))?;
        crate::crypto::open_hex(&key, sealed).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> ConfigInventory {
        let key = [7u8; 32];
        let mut config = GatewayConfig {
            credential_key: Some(hex::encode(key)),
            ..Default::default()
        };
        config.servers = vec![
            ServerEntry {
                id: 1,
                address: Some("203.0.113.5".to_string()),
                ready: true,
                sealed_password: Some(crate::crypto::seal_hex(&key, "s3cret").unwrap()),
            },
            ServerEntry {
                id: 2,
                address: None,
                ready: false,
                sealed_password: None,
            },
        ];
        ConfigInventory::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn test_lookup() {
        let inventory = inventory();
        let record = inventory.lookup(1).await.unwrap();
        assert_eq!(record.reachable_address(), Some("203.0.113.5"));
        assert_eq!(inventory.lookup(2).await.unwrap().reachable_address(), None);
        assert!(inventory.lookup(3).await.is_none());
    }

    #[tokio::test]
    async fn test_root_password_opened() {
        let inventory = inventory();
        assert_eq!(
            inventory.root_password(1).await.unwrap().as_deref(),
            Some("s3cret")
        );
        assert_eq!(inventory.root_password(2).await.unwrap(), None);
    }

    #[test]
    fn test_not_ready_hides_address() {
        let record = ServerRecord {
            id: 5,
            address: Some("198.51.100.2".to_string()),
            ready: false,
        };
        assert_eq!(record.reachable_address(), None);

        let blank = ServerRecord {
            id: 6,
            address: Some("  ".to_string()),
            ready: true,
        };
        assert_eq!(blank.reachable_address(), None);
    }
}
