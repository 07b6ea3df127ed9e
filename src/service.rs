//! The top-level context that owns every component.
//!
//! 中文: 顶层服务上下文，持有并装配所有组件。
//!
//! All collaborators are constructed here and handed to each other
//! explicitly; there is no global instance.

use crate::backup::{Backup, BackupManager};
use crate::certificate::{Certificate, CertificateRegistry, CertificateSpec, CertificateStatus};
use crate::cluster::{Cluster, ClusterManager, ClusterNode, ClusterSpec, SyncStatus};
use crate::config::HsmConfig;
use crate::device::{
    Device, DeviceProbe, DeviceRegistry, DeviceSpec, DeviceStatus, DeviceStatusReport,
    ProviderProbe, Session,
};
use crate::error::Result;
use crate::events::{EventBus, HsmEvent, DEFAULT_EVENT_CAPACITY};
use crate::key::{Key, KeyRegistry, KeySpec, KeyState};
use crate::operation::{
    AuditTrail, DecryptOutput, EncryptOutput, Operation, OperationContext, OperationExecutor,
    SignOutput, VerifyOutput,
};
use crate::provider::selector::ProviderStatus;
use crate::provider::{CryptoProvider, HardwareFactory, ProviderKind, ProviderSelector};
use crate::scheduler::{self, HealthTargets, Scheduler};
use crate::store::Store;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Subsystem health, for the web layer's health endpoint.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub provider: ProviderStatus,
    pub devices_total: usize,
    pub devices_online: usize,
    pub devices_error: usize,
    pub devices_offline: usize,
    pub devices_maintenance: usize,
    pub active_keys: usize,
    pub clusters: usize,
}

/// Builds an [`HsmService`] with optional overrides.
pub struct HsmServiceBuilder {
    config: HsmConfig,
    store: Option<Arc<Store>>,
    provider: Option<Arc<dyn CryptoProvider>>,
    hardware_factory: Option<HardwareFactory>,
    probe: Option<Arc<dyn DeviceProbe>>,
    event_capacity: usize,
}

impl HsmServiceBuilder {
    pub fn new(config: HsmConfig) -> Self {
        Self {
            config,
            store: None,
            provider: None,
            hardware_factory: None,
            probe: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Serve this provider instead of resolving one from configuration.
    pub fn provider(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn hardware_factory(mut self, factory: HardwareFactory) -> Self {
        self.hardware_factory = Some(factory);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<HsmService> {
        self.config.validate()?;
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => match &config.storage.data_dir {
                Some(dir) => Arc::new(Store::open(dir, config.storage.file_permissions)?),
                None => Arc::new(Store::memory()),
            },
        };
        let events = EventBus::new(self.event_capacity);

        let mut selector = match self.provider {
            Some(provider) => ProviderSelector::fixed(provider),
            None => ProviderSelector::new(&config),
        };
        if let Some(factory) = self.hardware_factory {
            selector = selector.with_hardware_factory(factory);
        }
        let selector = Arc::new(selector.with_events(events.clone()));

        let probe: Arc<dyn DeviceProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(ProviderProbe::new(selector.clone())),
        };
        let devices = Arc::new(DeviceRegistry::new(
            store.clone(),
            probe,
            events.clone(),
            config.timeouts.clone(),
        ));
        let audit = Arc::new(AuditTrail::new(store.clone(), events.clone()));
        let keys = Arc::new(KeyRegistry::new(
            store.clone(),
            devices.clone(),
            selector.clone(),
            audit.clone(),
            events.clone(),
            config.timeouts.clone(),
            config.hardware.key_label.clone(),
        ));
        let certificates = Arc::new(CertificateRegistry::new(
            store.clone(),
            devices.clone(),
            events.clone(),
        ));
        let executor = Arc::new(OperationExecutor::new(
            devices.clone(),
            keys.clone(),
            selector.clone(),
            audit.clone(),
            config.timeouts.clone(),
        ));
        let clusters = Arc::new(ClusterManager::new(
            store.clone(),
            devices.clone(),
            events.clone(),
        ));
        let backups = Arc::new(BackupManager::new(
            store.clone(),
            devices.clone(),
            events.clone(),
            config.storage.backup_dir.clone(),
        ));

        Ok(HsmService {
            config,
            store,
            events,
            selector,
            devices,
            keys,
            certificates,
            audit,
            executor,
            clusters,
            backups,
            scheduler: Mutex::new(None),
        })
    }
}

/// HSM key-management and crypto-operation subsystem.
pub struct HsmService {
    config: HsmConfig,
    store: Arc<Store>,
    events: EventBus,
    selector: Arc<ProviderSelector>,
    devices: Arc<DeviceRegistry>,
    keys: Arc<KeyRegistry>,
    certificates: Arc<CertificateRegistry>,
    audit: Arc<AuditTrail>,
    executor: Arc<OperationExecutor>,
    clusters: Arc<ClusterManager>,
    backups: Arc<BackupManager>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl std::fmt::Debug for HsmService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmService")
            .field("provider", &self.selector)
            .field("devices", &self.store.devices.len())
            .finish_non_exhaustive()
    }
}

impl HsmService {
    pub fn builder(config: HsmConfig) -> HsmServiceBuilder {
        HsmServiceBuilder::new(config)
    }

    pub fn new(config: HsmConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Reads [`HsmConfig`] from the environment.
    pub fn from_env() -> Result<Self> {
        Self::new(HsmConfig::from_env()?)
    }

    pub fn config(&self) -> &HsmConfig {
        &self.config
    }

    /// Resolves the provider now instead of on first use, deactivates stored
    /// keys the provider no longer holds, then spawns the schedulers when
    /// enabled. In strict mode a hardware failure surfaces here.
    pub async fn start(&self) -> Result<()> {
        self.selector.provider().await?;
        let deactivated = self.keys.reconcile(&OperationContext::actor("system")).await?;
        if !deactivated.is_empty() {
            tracing::warn!(
                keys = deactivated.len(),
                "stored keys deactivated, provider no longer holds their material"
            );
        }
        if !self.config.scheduler.enabled {
            return Ok(());
        }
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_none() {
            *scheduler = Some(Scheduler::start(
                &self.config.scheduler,
                self.health_targets(),
                self.backups.clone(),
            ));
        }
        Ok(())
    }

    /// Stops schedulers, closes open sessions, releases the provider and
    /// waits for pending store writes.
    pub async fn cleanup(&self) -> Result<()> {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await;
        }
        let closed = self.devices.close_all_sessions().await?;
        self.selector.close().await?;
        self.store.flush().await?;
        tracing::info!(sessions_closed = closed, "HSM subsystem cleaned up");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HsmEvent> {
        self.events.subscribe()
    }

    pub async fn health_status(&self) -> HealthStatus {
        // Forces resolution so the report names a provider.
        let provider_ready = self.selector.provider().await.is_ok();
        let provider = self.selector.status();
        let devices = self.store.devices.values();
        let count = |status: DeviceStatus| {
            devices
                .iter()
                .filter(|d| d.active && d.status == status)
                .count()
        };
        let devices_error = count(DeviceStatus::Error);
        HealthStatus {
            healthy: provider_ready && devices_error == 0,
            devices_total: devices.len(),
            devices_online: count(DeviceStatus::Online),
            devices_error,
            devices_offline: devices
                .iter()
                .filter(|d| !d.active || d.status == DeviceStatus::Offline)
                .count(),
            devices_maintenance: count(DeviceStatus::Maintenance),
            active_keys: self.store.keys.count(|k| k.state == KeyState::Active),
            clusters: self.store.clusters.len(),
            provider,
        }
    }

    pub async fn provider_kind(&self) -> Result<ProviderKind> {
        Ok(self.selector.active().await?.kind)
    }

    // --- devices ---

    pub async fn register_device(&self, spec: DeviceSpec) -> Result<Device> {
        self.devices.register_device(spec).await
    }

    pub fn get_device_status(&self, device_id: &str) -> Result<DeviceStatusReport> {
        self.devices.status_report(device_id)
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.list_devices()
    }

    pub fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<Device> {
        self.devices.set_device_status(device_id, status)
    }

    pub async fn deactivate_device(&self, device_id: &str) -> Result<Device> {
        self.devices.deactivate_device(device_id).await
    }

    pub async fn open_session(&self, device_id: &str, actor: &str) -> Result<Session> {
        self.devices.open_session(device_id, actor).await
    }

    pub async fn close_session(&self, session_id: &str) -> Result<Session> {
        self.devices.close_session(session_id).await
    }

    // --- keys and certificates ---

    pub async fn generate_key(&self, device_id: &str, spec: KeySpec) -> Result<Key> {
        self.keys
            .generate_key(device_id, spec, &OperationContext::default())
            .await
    }

    pub async fn generate_key_as(
        &self,
        device_id: &str,
        spec: KeySpec,
        context: &OperationContext,
    ) -> Result<Key> {
        self.keys.generate_key(device_id, spec, context).await
    }

    pub fn get_key(&self, key_id: &str) -> Result<Key> {
        self.keys.get_key(key_id)
    }

    pub fn list_keys(&self, device_id: &str) -> Vec<Key> {
        self.keys.list_keys(device_id)
    }

    pub async fn transition_key(&self, key_id: &str, state: KeyState) -> Result<Key> {
        self.keys.transition_key(key_id, state).await
    }

    pub async fn destroy_key(&self, key_id: &str) -> Result<Key> {
        self.keys.destroy_key(key_id).await
    }

    pub async fn rotate_key(&self, key_id: &str) -> Result<Key> {
        self.keys
            .rotate_key(key_id, &OperationContext::default())
            .await
    }

    pub async fn import_certificate(
        &self,
        device_id: &str,
        spec: CertificateSpec,
    ) -> Result<Certificate> {
        self.certificates.import_certificate(device_id, spec).await
    }

    pub fn set_certificate_status(
        &self,
        certificate_id: &str,
        status: CertificateStatus,
    ) -> Result<Certificate> {
        self.certificates
            .set_certificate_status(certificate_id, status)
    }

    // --- crypto operations ---

    pub async fn encrypt(
        &self,
        device_id: &str,
        key_id: &str,
        plaintext: &[u8],
        algorithm: Option<&str>,
    ) -> Result<EncryptOutput> {
        self.executor
            .encrypt(device_id, key_id, plaintext, algorithm, &OperationContext::default())
            .await
    }

    pub async fn decrypt(
        &self,
        device_id: &str,
        key_id: &str,
        ciphertext: &[u8],
        algorithm: Option<&str>,
    ) -> Result<DecryptOutput> {
        self.executor
            .decrypt(device_id, key_id, ciphertext, algorithm, &OperationContext::default())
            .await
    }

    pub async fn sign(
        &self,
        device_id: &str,
        key_id: &str,
        data: &[u8],
        algorithm: Option<&str>,
    ) -> Result<SignOutput> {
        self.executor
            .sign(device_id, key_id, data, algorithm, &OperationContext::default())
            .await
    }

    pub async fn verify(
        &self,
        device_id: &str,
        key_id: &str,
        data: &[u8],
        signature: &[u8],
        algorithm: Option<&str>,
    ) -> Result<VerifyOutput> {
        self.executor
            .verify(
                device_id,
                key_id,
                data,
                signature,
                algorithm,
                &OperationContext::default(),
            )
            .await
    }

    /// The executor, for calls that carry an actor or session.
    pub fn executor(&self) -> &OperationExecutor {
        &self.executor
    }

    pub fn get_operation(&self, operation_id: &str) -> Result<Operation> {
        self.audit.get_operation(operation_id)
    }

    /// Finalized operations in completion order.
    pub fn audit_log(&self, device_id: Option<&str>) -> Vec<Operation> {
        self.audit.log(device_id)
    }

    // --- clusters ---

    pub fn create_cluster(&self, spec: ClusterSpec) -> Result<Cluster> {
        self.clusters.create_cluster(spec)
    }

    pub fn get_cluster(&self, cluster_id: &str) -> Result<Cluster> {
        self.clusters.get_cluster(cluster_id)
    }

    pub fn list_clusters(&self) -> Vec<Cluster> {
        self.clusters.list_clusters()
    }

    pub fn update_node_health(&self, cluster_id: &str, device_id: &str, score: u8) -> Result<Cluster> {
        self.clusters.update_node_health(cluster_id, device_id, score)
    }

    pub fn record_sync(&self, cluster_id: &str, device_id: &str, status: SyncStatus) -> Result<Cluster> {
        self.clusters.record_sync(cluster_id, device_id, status)
    }

    pub fn select_node(&self, cluster_id: &str) -> Result<ClusterNode> {
        self.clusters.select_node(cluster_id)
    }

    // --- backups and maintenance ---

    pub async fn create_backup(&self, device_id: &str) -> Result<Backup> {
        self.backups.create_backup(device_id).await
    }

    pub async fn verify_backup(&self, backup_id: &str) -> Result<bool> {
        self.backups.verify_backup(backup_id).await
    }

    pub fn list_backups(&self, device_id: &str) -> Vec<Backup> {
        self.backups.list_backups(device_id)
    }

    /// Runs one health pass immediately, outside the schedule.
    pub async fn run_health_checks(&self) {
        scheduler::run_health_pass(&self.health_targets()).await;
    }

    /// Runs one backup pass immediately, outside the schedule.
    pub async fn run_backups(&self) {
        scheduler::run_backup_pass(&self.backups).await;
    }

    fn health_targets(&self) -> HealthTargets {
        HealthTargets {
            devices: self.devices.clone(),
            clusters: self.clusters.clone(),
            certificates: self.certificates.clone(),
        }
    }
}
