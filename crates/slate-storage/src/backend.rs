//! The iSCSI filesystem-backend workflows.
//!
//! Provisioning a root volume from a template is a two-flow chain: stage the
//! image into the backend's cache (resolve the cache entry, verify it still
//! exists on disk, download if not), then ask the agent to cut a volume from
//! the cached template. The create flow carries a rollback that discards the
//! half-created volume, so any create failure leaves no orphaned bits behind.
//! Empty-volume creation and deletion are single irreversible calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use slate_agent_client::AgentClient;
use slate_agent_protocol::{
    AgentResponse, CheckBitsExistenceCmd, CheckBitsExistenceRsp, CreateEmptyVolumeCmd,
    CreateEmptyVolumeRsp, CreateRootVolumeFromTemplateCmd, CreateRootVolumeFromTemplateRsp,
    DeleteBitsCmd, DeleteBitsRsp, ImageInventory, ImageMediaType, ImageSpec, InitCmd, InitRsp,
    VolumeInventory, VolumeType, CHECK_BITS_EXISTENCE_PATH, CREATE_EMPTY_VOLUME_PATH,
    CREATE_ROOT_VOLUME_PATH, DELETE_BITS_PATH, INIT_PATH,
};
use slate_flow::{Flow, FlowChain};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheState, ImageCacheRegistry, CHECKSUM_NOT_CALCULATED};
use crate::error::StorageError;
use crate::hooks::{AccountResolver, CapacitySink, ConnectExtension};
use crate::mediator::BackupStorageMediator;
use crate::paths;

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub uuid: String,
    pub hostname: String,
    pub agent_port: u16,
    /// Path segment the agent mounts its routes under, e.g. `btrfs`.
    pub filesystem_type: String,
    /// Root of the backend filesystem holding the image cache and volumes.
    pub root_path: String,
    pub chap_username: Option<String>,
    pub chap_password: Option<String>,
}

/// State threaded through one create-root-volume chain. Each request gets its
/// own context; nothing here outlives the chain.
struct RootVolumeContext {
    volume_uuid: String,
    image: ImageInventory,
    backup_storage_install_path: String,
    volume_path: String,
    image_path_in_cache: Option<String>,
    iscsi_install_path: Option<String>,
}

/// A storage backend reachable through one agent. Cheap to clone; all state
/// is shared behind `Arc`s, so clones observe the same connection flag.
#[derive(Clone)]
pub struct IscsiStorageBackend {
    config: Arc<BackendConfig>,
    client: AgentClient,
    cache: Arc<dyn ImageCacheRegistry>,
    accounts: Arc<dyn AccountResolver>,
    capacity: Arc<dyn CapacitySink>,
    mediator: Arc<dyn BackupStorageMediator>,
    connect_extensions: Vec<Arc<dyn ConnectExtension>>,
    connected: Arc<AtomicBool>,
}

impl IscsiStorageBackend {
    pub fn new(
        config: BackendConfig,
        client: AgentClient,
        cache: Arc<dyn ImageCacheRegistry>,
        accounts: Arc<dyn AccountResolver>,
        capacity: Arc<dyn CapacitySink>,
        mediator: Arc<dyn BackupStorageMediator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            client,
            cache,
            accounts,
            capacity,
            mediator,
            connect_extensions: Vec::new(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a hook to run after agent initialization during [`connect`].
    ///
    /// [`connect`]: IscsiStorageBackend::connect
    pub fn with_connect_extension(mut self, extension: Arc<dyn ConnectExtension>) -> Self {
        self.connect_extensions.push(extension);
        self
    }

    pub fn uuid(&self) -> &str {
        &self.config.uuid
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn agent_url(&self, endpoint: &str) -> String {
        paths::agent_url(
            &self.config.hostname,
            self.config.agent_port,
            &self.config.filesystem_type,
            endpoint,
        )
    }

    /// Initialize the backend: deploy slot, agent init with the root path,
    /// then the registered connect extensions. Only a fully successful pass
    /// marks the backend connected.
    pub async fn connect(&self) -> Result<(), StorageError> {
        let uuid = &self.config.uuid;
        // Agent deployment is handled out of band; the flow keeps its slot in
        // the chain so init ordering stays explicit.
        let deploy: Flow<(), StorageError> = Flow::new(
            format!("deploy-agent-to-backend-{uuid}"),
            |_ctx| Box::pin(async { Ok(()) }),
        );
        let init: Flow<(), StorageError> = {
            let backend = self.clone();
            Flow::new(format!("init-backend-{uuid}"), move |_ctx| {
                let backend = backend.clone();
                Box::pin(async move { backend.init_agent().await })
            })
        };

        FlowChain::new(format!("connect-backend-{uuid}"))
            .then(deploy)
            .then(init)
            .run(Arc::new(Mutex::new(())))
            .await?;

        for extension in &self.connect_extensions {
            extension.on_connect(uuid).await.map_err(|err| {
                StorageError::Internal(format!(
                    "connect extension {} failed for backend {uuid}: {err:#}",
                    extension.name()
                ))
            })?;
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(backend = %uuid, "backend connected");
        Ok(())
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        info!(backend = %self.config.uuid, "backend disconnected");
    }

    async fn init_agent(&self) -> Result<(), StorageError> {
        let cmd = InitCmd {
            root_folder_path: self.config.root_path.clone(),
        };
        let rsp: InitRsp = self.client.call(&self.agent_url(INIT_PATH), &cmd).await?;
        if !rsp.base.success {
            return Err(StorageError::Agent(rsp.base.error_text()));
        }
        self.report_capacity(&rsp.base).await;
        Ok(())
    }

    /// Materialize a volume: root volumes backed by a root-volume template go
    /// through the template chain, everything else (data volumes, ISO-backed
    /// or imageless roots) becomes an empty volume.
    pub async fn instantiate_volume(
        &self,
        volume: &VolumeInventory,
        image: Option<&ImageSpec>,
    ) -> Result<VolumeInventory, StorageError> {
        match image {
            Some(spec) if spec.inventory.media_type == ImageMediaType::RootVolumeTemplate => {
                self.create_root_volume_from_template(volume, spec).await
            }
            _ => self.create_empty_volume(volume).await,
        }
    }

    pub async fn create_root_volume_from_template(
        &self,
        volume: &VolumeInventory,
        image: &ImageSpec,
    ) -> Result<VolumeInventory, StorageError> {
        let account = self.owner_account(&volume.uuid).await?;
        let volume_path =
            paths::root_volume_path(&self.config.root_path, &account, &volume.uuid);
        let ctx = Arc::new(Mutex::new(RootVolumeContext {
            volume_uuid: volume.uuid.clone(),
            image: image.inventory.clone(),
            backup_storage_install_path: image.backup_storage_install_path.clone(),
            volume_path,
            image_path_in_cache: None,
            iscsi_install_path: None,
        }));

        let stage = {
            let backend = self.clone();
            Flow::new(
                format!(
                    "download-image-{}-to-cache-backend-{}",
                    image.inventory.uuid, self.config.uuid
                ),
                move |ctx| {
                    let backend = backend.clone();
                    Box::pin(async move { backend.stage_image(ctx).await })
                },
            )
        };
        let create = {
            let backend = self.clone();
            let rollback_backend = self.clone();
            Flow::new(
                format!(
                    "create-volume-{}-from-image-{}",
                    volume.uuid, image.inventory.uuid
                ),
                move |ctx| {
                    let backend = backend.clone();
                    Box::pin(async move { backend.create_volume_from_cache(ctx).await })
                },
            )
            .with_rollback(move |ctx| {
                let backend = rollback_backend.clone();
                Box::pin(async move { backend.discard_half_created_volume(ctx).await })
            })
        };

        FlowChain::new(format!(
            "create-root-volume-from-image-{}",
            image.inventory.uuid
        ))
        .then(stage)
        .then(create)
        .run(ctx.clone())
        .await?;

        let guard = ctx.lock().await;
        let mut volume = volume.clone();
        volume.install_path = guard.iscsi_install_path.clone();
        Ok(volume)
    }

    /// Ensure the template is present in this backend's image cache and
    /// record where it lives in the chain context.
    async fn stage_image(&self, ctx: Arc<Mutex<RootVolumeContext>>) -> Result<(), StorageError> {
        let (image, backup_path) = {
            let guard = ctx.lock().await;
            (guard.image.clone(), guard.backup_storage_install_path.clone())
        };

        let cached = self
            .cache
            .find(&self.config.uuid, &image.uuid)
            .await
            .map_err(|err| {
                StorageError::Cache(format!("cache lookup for image {}: {err:#}", image.uuid))
            })?;

        let Some(entry) = cached else {
            return self.download_to_cache(ctx, &image, &backup_path, None).await;
        };

        let cmd = CheckBitsExistenceCmd {
            path: entry.install_url.clone(),
        };
        let rsp: CheckBitsExistenceRsp = self
            .client
            .call(&self.agent_url(CHECK_BITS_EXISTENCE_PATH), &cmd)
            .await?;
        if !rsp.base.success {
            // Ambiguous answer about the cache's state; nothing has been
            // created yet, so fail the whole operation here.
            return Err(StorageError::Cache(format!(
                "staleness check for {} failed: {}",
                entry.install_url,
                rsp.base.error_text()
            )));
        }
        if rsp.existing {
            debug!(image = %image.uuid, path = %entry.install_url, "image already staged, reusing it");
            ctx.lock().await.image_path_in_cache = Some(entry.install_url);
            return Ok(());
        }

        info!(image = %image.uuid, stale = %entry.install_url, "cached image is gone from the backend, downloading again");
        self.download_to_cache(ctx, &image, &backup_path, Some(entry))
            .await
    }

    async fn download_to_cache(
        &self,
        ctx: Arc<Mutex<RootVolumeContext>>,
        image: &ImageInventory,
        backup_path: &str,
        stale: Option<CacheEntry>,
    ) -> Result<(), StorageError> {
        let cache_path = paths::image_cache_path(&self.config.root_path, &image.uuid);
        let rsp = self.mediator.download_bits(backup_path, &cache_path).await?;
        self.report_capacity(&rsp.base).await;

        // One entry per (backend, image): a re-download overwrites the stale
        // record instead of adding a second one.
        let entry = match stale {
            Some(mut entry) => {
                entry.install_url = cache_path.clone();
                entry
            }
            None => CacheEntry {
                backend_uuid: self.config.uuid.clone(),
                image_uuid: image.uuid.clone(),
                install_url: cache_path.clone(),
                media_type: image.media_type,
                size: image.size,
                md5sum: CHECKSUM_NOT_CALCULATED.to_string(),
                state: CacheState::Ready,
                created_at: Utc::now(),
            },
        };
        self.cache.upsert(entry).await.map_err(|err| {
            StorageError::Cache(format!("cache upsert for image {}: {err:#}", image.uuid))
        })?;

        ctx.lock().await.image_path_in_cache = Some(cache_path);
        Ok(())
    }

    async fn create_volume_from_cache(
        &self,
        ctx: Arc<Mutex<RootVolumeContext>>,
    ) -> Result<(), StorageError> {
        let (volume_uuid, volume_path, template_path) = {
            let guard = ctx.lock().await;
            let template = guard.image_path_in_cache.clone().ok_or_else(|| {
                StorageError::Internal(format!(
                    "image {} was never staged into the cache",
                    guard.image.uuid
                ))
            })?;
            (guard.volume_uuid.clone(), guard.volume_path.clone(), template)
        };

        let cmd = CreateRootVolumeFromTemplateCmd {
            install_path: volume_path,
            volume_uuid: volume_uuid.clone(),
            template_path_in_cache: template_path,
            chap_username: self.config.chap_username.clone(),
            chap_password: self.config.chap_password.clone(),
        };
        let rsp: CreateRootVolumeFromTemplateRsp = self
            .client
            .call(&self.agent_url(CREATE_ROOT_VOLUME_PATH), &cmd)
            .await?;
        if !rsp.base.success {
            return Err(StorageError::Agent(rsp.base.error_text()));
        }
        self.report_capacity(&rsp.base).await;

        let target = rsp.iscsi_path.ok_or_else(|| {
            StorageError::Internal(format!(
                "agent returned no iSCSI target for volume {volume_uuid}"
            ))
        })?;
        ctx.lock().await.iscsi_install_path =
            Some(paths::iscsi_volume_path(&self.config.uuid, &target));
        Ok(())
    }

    /// Rollback of the create flow: remove whatever the failed create left at
    /// the install path. Best effort; the chain's original error is what the
    /// caller sees.
    async fn discard_half_created_volume(
        &self,
        ctx: Arc<Mutex<RootVolumeContext>>,
    ) -> Result<(), StorageError> {
        let (volume_uuid, volume_path) = {
            let guard = ctx.lock().await;
            (guard.volume_uuid.clone(), guard.volume_path.clone())
        };
        if let Err(err) = self.delete_bits(&volume_path, Some(&volume_uuid)).await {
            warn!(volume = %volume_uuid, path = %volume_path, "failed to discard half-created volume: {err}");
        }
        Ok(())
    }

    pub async fn create_empty_volume(
        &self,
        volume: &VolumeInventory,
    ) -> Result<VolumeInventory, StorageError> {
        let account = self.owner_account(&volume.uuid).await?;
        let install_path = match volume.volume_type {
            VolumeType::Root => {
                paths::root_volume_path(&self.config.root_path, &account, &volume.uuid)
            }
            VolumeType::Data => {
                paths::data_volume_path(&self.config.root_path, &account, &volume.uuid)
            }
        };

        let cmd = CreateEmptyVolumeCmd {
            install_path,
            volume_uuid: volume.uuid.clone(),
            size: volume.size,
            chap_username: self.config.chap_username.clone(),
            chap_password: self.config.chap_password.clone(),
        };
        let rsp: CreateEmptyVolumeRsp = self
            .client
            .call(&self.agent_url(CREATE_EMPTY_VOLUME_PATH), &cmd)
            .await?;
        if !rsp.base.success {
            return Err(StorageError::Agent(rsp.base.error_text()));
        }
        self.report_capacity(&rsp.base).await;

        let target = rsp.iscsi_path.ok_or_else(|| {
            StorageError::Internal(format!(
                "agent returned no iSCSI target for volume {}",
                volume.uuid
            ))
        })?;
        let mut volume = volume.clone();
        volume.install_path = Some(paths::iscsi_volume_path(&self.config.uuid, &target));
        Ok(volume)
    }

    /// Delete a volume's bits. The recorded install path is forwarded to the
    /// agent as-is; the agent resolves whatever form it stored.
    pub async fn delete_volume(&self, volume: &VolumeInventory) -> Result<(), StorageError> {
        let install_path = volume.install_path.as_deref().ok_or_else(|| {
            StorageError::Internal(format!(
                "volume {} has no install path to delete",
                volume.uuid
            ))
        })?;
        self.delete_bits(install_path, Some(&volume.uuid)).await
    }

    pub async fn delete_bits(
        &self,
        install_path: &str,
        volume_uuid: Option<&str>,
    ) -> Result<(), StorageError> {
        let cmd = DeleteBitsCmd {
            install_path: install_path.to_string(),
            volume_uuid: volume_uuid.map(str::to_string),
        };
        let rsp: DeleteBitsRsp = self
            .client
            .call(&self.agent_url(DELETE_BITS_PATH), &cmd)
            .await?;
        if !rsp.base.success {
            return Err(StorageError::Agent(rsp.base.error_text()));
        }
        self.report_capacity(&rsp.base).await;
        Ok(())
    }

    async fn owner_account(&self, volume_uuid: &str) -> Result<String, StorageError> {
        self.accounts
            .owner_account_uuid(volume_uuid)
            .await
            .map_err(|err| {
                StorageError::Internal(format!(
                    "account lookup for volume {volume_uuid}: {err:#}"
                ))
            })
    }

    /// Forward capacity figures to the control plane when a response carries
    /// both. Fire-and-forget: a sink failure is logged, never propagated.
    async fn report_capacity(&self, rsp: &AgentResponse) {
        let (Some(total), Some(available)) = (rsp.total_capacity, rsp.available_capacity) else {
            return;
        };
        if let Err(err) = self
            .capacity
            .report(total, available, &self.config.uuid)
            .await
        {
            warn!(backend = %self.config.uuid, "capacity report failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryImageCacheRegistry;
    use crate::hooks::StaticAccountResolver;
    use crate::mediator::AgentBackupStorageMediator;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;
    use slate_agent_client::{callback_router, AgentClient, CALLBACK_PATH};
    use slate_test_utils::MockAgent;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    const CHECK: &str = "/btrfs/bits/checkifexists";
    const DELETE: &str = "/btrfs/bits/delete";
    const CREATE_ROOT: &str = "/btrfs/volumes/createrootfromtemplate";
    const CREATE_EMPTY: &str = "/btrfs/volumes/createempty";
    const DOWNLOAD: &str = "/btrfs/image/sftp/download";
    const INIT: &str = "/btrfs/init";

    #[derive(Default)]
    struct RecordingSink {
        reports: std::sync::Mutex<Vec<(u64, u64, String)>>,
    }

    impl RecordingSink {
        fn reports(&self) -> Vec<(u64, u64, String)> {
            self.reports.lock().expect("reports poisoned").clone()
        }
    }

    #[async_trait]
    impl CapacitySink for RecordingSink {
        async fn report(
            &self,
            total_capacity: u64,
            available_capacity: u64,
            backend_uuid: &str,
        ) -> anyhow::Result<()> {
            self.reports
                .lock()
                .expect("reports poisoned")
                .push((total_capacity, available_capacity, backend_uuid.to_string()));
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl CapacitySink for FailingSink {
        async fn report(&self, _: u64, _: u64, _: &str) -> anyhow::Result<()> {
            Err(anyhow!("sink offline"))
        }
    }

    #[derive(Default)]
    struct CountingExtension {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConnectExtension for CountingExtension {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_connect(&self, _backend_uuid: &str) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RefusingExtension;

    #[async_trait]
    impl ConnectExtension for RefusingExtension {
        fn name(&self) -> &str {
            "refusing"
        }

        async fn on_connect(&self, _backend_uuid: &str) -> anyhow::Result<()> {
            Err(anyhow!("hook refused"))
        }
    }

    /// Spawns the callback route on an ephemeral port and returns a client
    /// whose callback url points at it. Must run inside a tokio runtime.
    fn spawn_callback_client() -> AgentClient {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind callback listener");
        listener
            .set_nonblocking(true)
            .expect("nonblocking callback listener");
        let addr = listener.local_addr().expect("callback listener addr");
        let client = AgentClient::new(format!("http://{addr}{CALLBACK_PATH}"));
        let app = callback_router(client.clone());
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .expect("callback server from listener")
                .serve(app.into_make_service())
                .await
                .expect("serve callbacks");
        });
        client
    }

    fn config_for(agent: &MockAgent) -> BackendConfig {
        let authority = agent
            .base_url()
            .trim_start_matches("http://")
            .to_string();
        let (hostname, port) = authority.split_once(':').expect("agent authority");
        BackendConfig {
            uuid: "b1".to_string(),
            hostname: hostname.to_string(),
            agent_port: port.parse().expect("agent port"),
            filesystem_type: "btrfs".to_string(),
            root_path: "/ps".to_string(),
            chap_username: None,
            chap_password: None,
        }
    }

    struct Harness {
        agent: MockAgent,
        backend: IscsiStorageBackend,
        cache: Arc<MemoryImageCacheRegistry>,
        sink: Arc<RecordingSink>,
    }

    fn build(config: BackendConfig, agent: MockAgent) -> Harness {
        let client = spawn_callback_client();
        let cache = Arc::new(MemoryImageCacheRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let mediator = Arc::new(AgentBackupStorageMediator::for_backend(
            client.clone(),
            &config,
        ));
        let backend = IscsiStorageBackend::new(
            config,
            client,
            cache.clone(),
            Arc::new(StaticAccountResolver::new("a1")),
            sink.clone(),
            mediator,
        );
        Harness {
            agent,
            backend,
            cache,
            sink,
        }
    }

    fn harness() -> Harness {
        let agent = MockAgent::spawn();
        let config = config_for(&agent);
        build(config, agent)
    }

    fn root_volume(uuid: &str) -> VolumeInventory {
        VolumeInventory {
            uuid: uuid.to_string(),
            volume_type: VolumeType::Root,
            size: 8 << 30,
            install_path: None,
            format: Some("raw".to_string()),
        }
    }

    fn data_volume(uuid: &str) -> VolumeInventory {
        VolumeInventory {
            volume_type: VolumeType::Data,
            ..root_volume(uuid)
        }
    }

    fn image_spec(image_uuid: &str) -> ImageSpec {
        ImageSpec {
            inventory: ImageInventory {
                uuid: image_uuid.to_string(),
                media_type: ImageMediaType::RootVolumeTemplate,
                size: 1 << 30,
                format: Some("raw".to_string()),
            },
            backup_storage_install_path: format!("sftp://backup/{image_uuid}.template"),
        }
    }

    fn seeded_entry(install_url: &str) -> CacheEntry {
        CacheEntry {
            backend_uuid: "b1".to_string(),
            image_uuid: "img-1".to_string(),
            install_url: install_url.to_string(),
            media_type: ImageMediaType::RootVolumeTemplate,
            size: 1 << 30,
            md5sum: CHECKSUM_NOT_CALCULATED.to_string(),
            state: CacheState::Ready,
            created_at: Utc::now(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fresh_image_is_downloaded_then_cut_into_a_volume() {
        let h = harness();
        h.agent.stub(CREATE_ROOT, json!({"iscsiPath": "t9"}));

        let created = h
            .backend
            .create_root_volume_from_template(&root_volume("v1"), &image_spec("img-1"))
            .await
            .expect("volume created");

        assert_eq!(
            created.install_path.as_deref(),
            Some("iscsi://ip-b1:3260-iscsi-t9-lun-1")
        );

        let entry = h
            .cache
            .find("b1", "img-1")
            .await
            .expect("cache read")
            .expect("cache entry created");
        assert_eq!(
            entry.install_url,
            "/ps/imageCache/templates/img-1/img-1.template"
        );
        assert_eq!(entry.md5sum, CHECKSUM_NOT_CALCULATED);

        // No entry existed, so no staleness check was needed.
        assert!(h.agent.commands_for(CHECK).is_empty());

        let downloads = h.agent.commands_for(DOWNLOAD);
        assert_eq!(downloads.len(), 1);
        assert_eq!(
            downloads[0]["backupStorageInstallPath"],
            "sftp://backup/img-1.template"
        );
        assert_eq!(
            downloads[0]["primaryStorageInstallPath"],
            "/ps/imageCache/templates/img-1/img-1.template"
        );

        let creates = h.agent.commands_for(CREATE_ROOT);
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0]["installPath"], "/ps/rootVolumes/acct-a1/vol-v1/v1.img");
        assert_eq!(creates[0]["volumeUuid"], "v1");
        assert_eq!(
            creates[0]["templatePathInCache"],
            "/ps/imageCache/templates/img-1/img-1.template"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cached_image_still_on_disk_skips_the_download() {
        let h = harness();
        h.cache
            .upsert(seeded_entry("/ps/imageCache/templates/img-1/img-1.template"))
            .await
            .expect("seed cache");
        h.agent.stub(CHECK, json!({"existing": true}));
        h.agent.stub(CREATE_ROOT, json!({"iscsiPath": "t2"}));

        let created = h
            .backend
            .create_root_volume_from_template(&root_volume("v1"), &image_spec("img-1"))
            .await
            .expect("volume created");

        assert_eq!(
            created.install_path.as_deref(),
            Some("iscsi://ip-b1:3260-iscsi-t2-lun-1")
        );
        let checks = h.agent.commands_for(CHECK);
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0]["path"], "/ps/imageCache/templates/img-1/img-1.template");
        assert!(h.agent.commands_for(DOWNLOAD).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_cache_entry_is_redownloaded_in_place() {
        let h = harness();
        h.cache
            .upsert(seeded_entry("/old/img-1.template"))
            .await
            .expect("seed cache");
        h.agent.stub(CHECK, json!({"existing": false}));
        h.agent.stub(CREATE_ROOT, json!({"iscsiPath": "t3"}));

        h.backend
            .create_root_volume_from_template(&root_volume("v1"), &image_spec("img-1"))
            .await
            .expect("volume created");

        assert_eq!(h.agent.commands_for(DOWNLOAD).len(), 1);
        assert_eq!(h.cache.entry_count().await, 1);
        let entry = h
            .cache
            .find("b1", "img-1")
            .await
            .expect("cache read")
            .expect("entry kept");
        assert_eq!(
            entry.install_url,
            "/ps/imageCache/templates/img-1/img-1.template"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_failure_discards_the_half_created_volume() {
        let h = harness();
        h.agent
            .stub(CREATE_ROOT, json!({"success": false, "error": "disk full"}));

        let err = h
            .backend
            .create_root_volume_from_template(&root_volume("v1"), &image_spec("img-1"))
            .await
            .expect_err("create fails");
        assert!(err.to_string().contains("disk full"));

        let deletes = h.agent.commands_for(DELETE);
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0]["installPath"], "/ps/rootVolumes/acct-a1/vol-v1/v1.img");
        assert_eq!(deletes[0]["volumeUuid"], "v1");

        // The staged image survives the rollback for the next attempt.
        assert!(h.cache.find("b1", "img-1").await.expect("cache read").is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ambiguous_staleness_check_fails_without_touching_anything() {
        let h = harness();
        h.cache
            .upsert(seeded_entry("/ps/imageCache/templates/img-1/img-1.template"))
            .await
            .expect("seed cache");
        h.agent
            .stub(CHECK, json!({"success": false, "error": "agent exploded"}));

        let err = h
            .backend
            .create_root_volume_from_template(&root_volume("v1"), &image_spec("img-1"))
            .await
            .expect_err("staleness check fails the operation");
        assert!(matches!(err, StorageError::Cache(_)));
        assert!(err.to_string().contains("agent exploded"));

        assert!(h.agent.commands_for(DOWNLOAD).is_empty());
        assert!(h.agent.commands_for(CREATE_ROOT).is_empty());
        assert!(h.agent.commands_for(DELETE).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rerun_after_success_issues_no_second_download() {
        let h = harness();
        h.agent.stub(CREATE_ROOT, json!({"iscsiPath": "t9"}));

        h.backend
            .create_root_volume_from_template(&root_volume("v1"), &image_spec("img-1"))
            .await
            .expect("first volume created");

        h.agent.stub(CHECK, json!({"existing": true}));
        h.backend
            .create_root_volume_from_template(&root_volume("v2"), &image_spec("img-1"))
            .await
            .expect("second volume created");

        assert_eq!(h.agent.commands_for(DOWNLOAD).len(), 1);
        assert_eq!(h.cache.entry_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_root_volume_lands_under_root_volumes() {
        let h = harness();
        h.agent.stub(CREATE_EMPTY, json!({"iscsiPath": "t5"}));

        let created = h
            .backend
            .create_empty_volume(&root_volume("v1"))
            .await
            .expect("volume created");

        assert_eq!(
            created.install_path.as_deref(),
            Some("iscsi://ip-b1:3260-iscsi-t5-lun-1")
        );
        let creates = h.agent.commands_for(CREATE_EMPTY);
        assert_eq!(creates[0]["installPath"], "/ps/rootVolumes/acct-a1/vol-v1/v1.img");
        assert_eq!(creates[0]["size"], json!(8u64 << 30));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_data_volume_lands_under_data_volumes() {
        let h = harness();
        h.agent.stub(CREATE_EMPTY, json!({"iscsiPath": "t6"}));

        h.backend
            .create_empty_volume(&data_volume("v7"))
            .await
            .expect("volume created");

        let creates = h.agent.commands_for(CREATE_EMPTY);
        assert_eq!(creates[0]["installPath"], "/ps/dataVolumes/acct-a1/vol-v7/v7.img");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_template_image_falls_back_to_an_empty_volume() {
        let h = harness();
        h.agent.stub(CREATE_EMPTY, json!({"iscsiPath": "t8"}));

        let mut spec = image_spec("iso-1");
        spec.inventory.media_type = ImageMediaType::Iso;
        h.backend
            .instantiate_volume(&root_volume("v1"), Some(&spec))
            .await
            .expect("volume created");

        assert_eq!(h.agent.commands_for(CREATE_EMPTY).len(), 1);
        assert!(h.agent.commands_for(CREATE_ROOT).is_empty());
        assert!(h.agent.commands_for(DOWNLOAD).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chap_credentials_travel_with_create_commands() {
        let agent = MockAgent::spawn();
        let mut config = config_for(&agent);
        config.chap_username = Some("chap-user".to_string());
        config.chap_password = Some("chap-pass".to_string());
        let h = build(config, agent);
        h.agent.stub(CREATE_EMPTY, json!({"iscsiPath": "t1"}));

        h.backend
            .create_empty_volume(&root_volume("v1"))
            .await
            .expect("volume created");

        let creates = h.agent.commands_for(CREATE_EMPTY);
        assert_eq!(creates[0]["chapUsername"], "chap-user");
        assert_eq!(creates[0]["chapPassword"], "chap-pass");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_forwards_the_recorded_install_path_verbatim() {
        let h = harness();
        h.agent.stub(
            DELETE,
            json!({"totalCapacity": 100u64, "availableCapacity": 60u64}),
        );

        let mut volume = root_volume("v1");
        volume.install_path = Some("iscsi://ip-b1:3260-iscsi-t9-lun-1".to_string());
        h.backend.delete_volume(&volume).await.expect("delete ok");

        let deletes = h.agent.commands_for(DELETE);
        assert_eq!(deletes[0]["installPath"], "iscsi://ip-b1:3260-iscsi-t9-lun-1");
        assert_eq!(h.sink.reports(), vec![(100, 60, "b1".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn busy_delete_surfaces_the_error_and_reports_nothing() {
        let h = harness();
        h.agent
            .stub(DELETE, json!({"success": false, "error": "busy"}));

        let mut volume = root_volume("v1");
        volume.install_path = Some("/ps/rootVolumes/acct-a1/vol-v1/v1.img".to_string());
        let err = h
            .backend
            .delete_volume(&volume)
            .await
            .expect_err("delete fails");
        assert!(err.to_string().contains("busy"));
        assert!(h.sink.reports().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_initializes_the_agent_and_reports_capacity() {
        let h = harness();
        h.agent.stub(
            INIT,
            json!({"totalCapacity": 500u64, "availableCapacity": 400u64}),
        );

        assert!(!h.backend.is_connected());
        h.backend.connect().await.expect("connect ok");
        assert!(h.backend.is_connected());

        let inits = h.agent.commands_for(INIT);
        assert_eq!(inits.len(), 1);
        assert_eq!(inits[0]["rootFolderPath"], "/ps");
        assert_eq!(h.sink.reports(), vec![(500, 400, "b1".to_string())]);

        h.backend.disconnect();
        assert!(!h.backend.is_connected());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_init_leaves_the_backend_disconnected() {
        let h = harness();
        h.agent
            .stub(INIT, json!({"success": false, "error": "mount failed"}));

        let err = h.backend.connect().await.expect_err("connect fails");
        assert!(err.to_string().contains("mount failed"));
        assert!(!h.backend.is_connected());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_extensions_run_after_init() {
        let h = harness();
        let extension = Arc::new(CountingExtension::default());
        let backend = h.backend.clone().with_connect_extension(extension.clone());

        backend.connect().await.expect("connect ok");
        assert_eq!(extension.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refusing_connect_extension_fails_the_connect() {
        let h = harness();
        let backend = h
            .backend
            .clone()
            .with_connect_extension(Arc::new(RefusingExtension));

        let err = backend.connect().await.expect_err("connect fails");
        assert!(err.to_string().contains("hook refused"));
        assert!(!backend.is_connected());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_capacity_sink_does_not_fail_the_operation() {
        let agent = MockAgent::spawn();
        let config = config_for(&agent);
        let client = spawn_callback_client();
        let cache = Arc::new(MemoryImageCacheRegistry::new());
        let mediator = Arc::new(AgentBackupStorageMediator::for_backend(
            client.clone(),
            &config,
        ));
        let backend = IscsiStorageBackend::new(
            config,
            client,
            cache,
            Arc::new(StaticAccountResolver::new("a1")),
            Arc::new(FailingSink),
            mediator,
        );
        agent.stub(
            DELETE,
            json!({"totalCapacity": 10u64, "availableCapacity": 5u64}),
        );

        backend
            .delete_bits("/ps/rootVolumes/acct-a1/vol-v1/v1.img", None)
            .await
            .expect("delete succeeds despite the sink");
    }
}
