//! Narrow interfaces to external collaborators: ownership lookup, the
//! control plane's capacity sink, and backend connect hooks.

use async_trait::async_trait;
use tracing::info;

/// Resolves which account owns a volume; the owner namespaces the volume's
/// install path on the backend filesystem.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn owner_account_uuid(&self, volume_uuid: &str) -> anyhow::Result<String>;
}

/// Resolver for deployments where every volume belongs to a single account.
pub struct StaticAccountResolver {
    account_uuid: String,
}

impl StaticAccountResolver {
    pub fn new(account_uuid: impl Into<String>) -> Self {
        Self {
            account_uuid: account_uuid.into(),
        }
    }
}

#[async_trait]
impl AccountResolver for StaticAccountResolver {
    async fn owner_account_uuid(&self, _volume_uuid: &str) -> anyhow::Result<String> {
        Ok(self.account_uuid.clone())
    }
}

/// One-way capacity notifications to the control plane. Failures here must
/// never fail the operation that produced the figures.
#[async_trait]
pub trait CapacitySink: Send + Sync {
    async fn report(
        &self,
        total_capacity: u64,
        available_capacity: u64,
        backend_uuid: &str,
    ) -> anyhow::Result<()>;
}

pub struct LoggingCapacitySink;

#[async_trait]
impl CapacitySink for LoggingCapacitySink {
    async fn report(
        &self,
        total_capacity: u64,
        available_capacity: u64,
        backend_uuid: &str,
    ) -> anyhow::Result<()> {
        info!(backend_uuid, total_capacity, available_capacity, "capacity report");
        Ok(())
    }
}

/// Hook invoked after a backend's agent has been initialized, before the
/// backend is marked connected. Registered at construction time.
#[async_trait]
pub trait ConnectExtension: Send + Sync {
    fn name(&self) -> &str;

    async fn on_connect(&self, backend_uuid: &str) -> anyhow::Result<()>;
}
