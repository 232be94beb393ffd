//! Volume provisioning workflows for iSCSI filesystem-backend storage.
//!
//! The backend stages template images into a per-backend cache, instructs the
//! remote storage agent to materialize volumes, translates the agent's
//! returned target into an iSCSI protocol address, and reports storage
//! capacity back to the control plane.

mod backend;
mod cache;
mod error;
mod hooks;
mod mediator;
pub mod paths;

pub use backend::{BackendConfig, IscsiStorageBackend};
pub use cache::{
    CacheEntry, CacheState, ImageCacheRegistry, MemoryImageCacheRegistry, CHECKSUM_NOT_CALCULATED,
};
pub use error::StorageError;
pub use hooks::{
    AccountResolver, CapacitySink, ConnectExtension, LoggingCapacitySink, StaticAccountResolver,
};
pub use mediator::{AgentBackupStorageMediator, BackupStorageMediator};
