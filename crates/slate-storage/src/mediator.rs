//! Transfers image bits from backup storage onto a backend, driven through
//! the backend's own agent.

use async_trait::async_trait;
use slate_agent_client::AgentClient;
use slate_agent_protocol::{DownloadBitsCmd, DownloadBitsRsp, DOWNLOAD_BITS_PATH};

use crate::backend::BackendConfig;
use crate::error::StorageError;
use crate::paths;

#[async_trait]
pub trait BackupStorageMediator: Send + Sync {
    /// Copies the bits at `backup_install_path` to `primary_install_path` on
    /// the backend, returning the agent's response.
    async fn download_bits(
        &self,
        backup_install_path: &str,
        primary_install_path: &str,
    ) -> Result<DownloadBitsRsp, StorageError>;
}

/// Mediator that issues the download to the backend agent's sftp endpoint.
pub struct AgentBackupStorageMediator {
    client: AgentClient,
    download_url: String,
}

impl AgentBackupStorageMediator {
    pub fn new(client: AgentClient, download_url: impl Into<String>) -> Self {
        Self {
            client,
            download_url: download_url.into(),
        }
    }

    pub fn for_backend(client: AgentClient, config: &BackendConfig) -> Self {
        let url = paths::agent_url(
            &config.hostname,
            config.agent_port,
            &config.filesystem_type,
            DOWNLOAD_BITS_PATH,
        );
        Self::new(client, url)
    }
}

#[async_trait]
impl BackupStorageMediator for AgentBackupStorageMediator {
    async fn download_bits(
        &self,
        backup_install_path: &str,
        primary_install_path: &str,
    ) -> Result<DownloadBitsRsp, StorageError> {
        let cmd = DownloadBitsCmd {
            backup_storage_install_path: backup_install_path.to_string(),
            primary_storage_install_path: primary_install_path.to_string(),
        };
        let rsp: DownloadBitsRsp = self.client.call(&self.download_url, &cmd).await?;
        if !rsp.base.success {
            return Err(StorageError::Agent(rsp.base.error_text()));
        }
        Ok(rsp)
    }
}
