use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::RwLock;
use tracing::info;

use crate::Result;

/// Publishes load balancer names.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create or repoint the A record for `fqdn`.
    async fn activate_a_record(&self, fqdn: &str, addr: &str) -> Result<()>;

    /// Delete every record for `fqdn`. Missing records are not an error.
    async fn delete_records(&self, fqdn: &str) -> Result<()>;
}

/// Process-local record table for development cloudlets.
#[derive(Default)]
pub struct InMemoryDns {
    records: RwLock<BTreeMap<String, String>>,
}

impl InMemoryDns {
    pub async fn lookup(&self, fqdn: &str) -> Option<String> {
        self.records.read().await.get(fqdn).cloned()
    }
}

#[async_trait]
impl DnsProvider for InMemoryDns {
    async fn activate_a_record(&self, fqdn: &str, addr: &str) -> Result<()> {
        self.records
            .write()
            .await
            .insert(fqdn.to_string(), addr.to_string());
        info!(fqdn, addr, "dns: A record active");
        Ok(())
    }

    async fn delete_records(&self, fqdn: &str) -> Result<()> {
        if self.records.write().await.remove(fqdn).is_some() {
            info!(fqdn, "dns: records deleted");
        }
        Ok(())
    }
}
