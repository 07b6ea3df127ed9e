//!
//! # 设备注册表
//!
//! HSM endpoints: identity, configuration, connection parameters, measured
//! capabilities and performance, status, and the sessions opened against
//! them. Devices are never deleted; [`DeviceRegistry::deactivate_device`]
//! takes one out of service.
//!
use crate::certificate::Certificate;
use crate::config::TimeoutConfig;
use crate::error::{NotFoundError, ProviderError, Result, ValidationError};
use crate::events::{EventBus, HsmEvent};
use crate::key::Key;
use crate::operation::Operation;
use crate::provider::{with_timeout, ProviderSelector};
use crate::store::{Record, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

/// How many operations a status report includes.
pub const RECENT_OPERATIONS_LIMIT: usize = 10;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
    Maintenance,
}

impl DeviceStatus {
    /// Statuses only an operator sets or clears. Health checks leave them alone.
    pub fn is_operator_held(self) -> bool {
        matches!(self, DeviceStatus::Offline | DeviceStatus::Maintenance)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
            DeviceStatus::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    Pin,
    Password,
    Certificate,
    MultiFactor,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupPolicy {
    pub enabled: bool,
    pub frequency_hours: u32,
    pub retention_days: u32,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency_hours: 24,
            retention_days: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfiguration {
    pub auth_method: AuthMethod,
    pub session_timeout_secs: u64,
    pub max_sessions: u32,
    pub fips_level: u8,
    pub clustering_enabled: bool,
    #[serde(default)]
    pub backup_policy: BackupPolicy,
}

impl Default for DeviceConfiguration {
    fn default() -> Self {
        Self {
            auth_method: AuthMethod::Pin,
            session_timeout_secs: 30 * 60,
            max_sessions: 10,
            fips_level: 2,
            clustering_enabled: false,
            backup_policy: BackupPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Pkcs11,
    Kmip,
    Https,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionParams {
    pub endpoint: String,
    /// Kept wider than `u16` so out-of-range input can be reported.
    pub port: u32,
    pub protocol: Protocol,
    pub tls: bool,
    pub pool_size: u32,
}

impl ConnectionParams {
    pub fn new(endpoint: impl Into<String>, port: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            port,
            protocol: Protocol::Pkcs11,
            tls: true,
            pool_size: 4,
        }
    }
}

/// What a device can do. Algorithm names are stored upper-case; key sizes are
/// in bytes.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub algorithms: BTreeSet<String>,
    pub key_sizes: BTreeSet<usize>,
    pub key_slots: usize,
    pub certificate_slots: usize,
}

impl Capabilities {
    pub fn new<A, S>(algorithms: A, key_sizes: S, key_slots: usize, certificate_slots: usize) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        S: IntoIterator<Item = usize>,
    {
        Self {
            algorithms: algorithms
                .into_iter()
                .map(|a| a.as_ref().trim().to_ascii_uppercase())
                .collect(),
            key_sizes: key_sizes.into_iter().collect(),
            key_slots,
            certificate_slots,
        }
    }

    pub fn supports_algorithm(&self, algorithm: &str) -> bool {
        self.algorithms
            .contains(&algorithm.trim().to_ascii_uppercase())
    }

    pub fn supports_key_size(&self, size_bytes: usize) -> bool {
        self.key_sizes.contains(&size_bytes)
    }

    /// Keeps only what `available` can actually serve. Slot counts are the
    /// device's own.
    pub fn restricted_to(&self, available: &Capabilities) -> Capabilities {
        Capabilities {
            algorithms: self
                .algorithms
                .intersection(&available.algorithms)
                .cloned()
                .collect(),
            key_sizes: self
                .key_sizes
                .intersection(&available.key_sizes)
                .copied()
                .collect(),
            key_slots: self.key_slots,
            certificate_slots: self.certificate_slots,
        }
    }
}

/// Measured performance. Latency is a moving average over health probes.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Performance {
    pub ops_per_sec: f64,
    pub avg_latency_ms: f64,
    pub utilization_pct: f64,
    pub measured_at: Option<DateTime<Utc>>,
}

impl Performance {
    fn record_latency(&mut self, latency: Duration, now: DateTime<Utc>) {
        let sample = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = match self.measured_at {
            Some(_) => 0.8 * self.avg_latency_ms + 0.2 * sample,
            None => sample,
        };
        self.ops_per_sec = if self.avg_latency_ms > 0.0 {
            1000.0 / self.avg_latency_ms
        } else {
            0.0
        };
        self.measured_at = Some(now);
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: String,
    pub identity: DeviceIdentity,
    pub configuration: DeviceConfiguration,
    pub connection: ConnectionParams,
    pub capabilities: Capabilities,
    pub performance: Performance,
    pub status: DeviceStatus,
    pub active: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.active && self.status == DeviceStatus::Online
    }
}

impl Record for Device {
    const TABLE: &'static str = "devices";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Registration request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeviceSpec {
    pub identity: DeviceIdentity,
    #[serde(default)]
    pub configuration: DeviceConfiguration,
    pub connection: ConnectionParams,
    /// Declared capabilities. When absent the provider's are used.
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
}

impl DeviceSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.configuration.session_timeout_secs == 0 {
            return Err(ValidationError::InvalidSessionTimeout);
        }
        if self.configuration.max_sessions == 0 {
            return Err(ValidationError::InvalidSessionLimit);
        }
        if self.connection.endpoint.trim().is_empty() {
            return Err(ValidationError::EmptyEndpoint);
        }
        if !(1..=65535).contains(&self.connection.port) {
            return Err(ValidationError::InvalidPort(self.connection.port));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Closed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub device_id: String,
    pub actor: String,
    pub opened_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub state: SessionState,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Session {
    fn is_idle(&self, timeout_secs: u64, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(self.last_used_at);
        idle > chrono::Duration::seconds(timeout_secs.min(i64::MAX as u64) as i64)
    }
}

impl Record for Session {
    const TABLE: &'static str = "sessions";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Everything known about one device.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DeviceStatusReport {
    pub device: Device,
    pub keys: Vec<Key>,
    pub certificates: Vec<Certificate>,
    pub sessions: Vec<Session>,
    /// Most recent first.
    pub recent_operations: Vec<Operation>,
}

/// Result of a successful liveness probe.
#[derive(Clone, Debug)]
pub struct ProbeReport {
    pub capabilities: Capabilities,
    pub latency: Duration,
}

/// Checks whether a device answers.
#[async_trait]
pub trait DeviceProbe: Send + Sync + fmt::Debug {
    async fn probe(&self, device: &Device) -> Result<ProbeReport, ProviderError>;
}

/// Probes devices through the active crypto provider.
#[derive(Debug)]
pub struct ProviderProbe {
    selector: Arc<ProviderSelector>,
}

impl ProviderProbe {
    pub fn new(selector: Arc<ProviderSelector>) -> Self {
        Self { selector }
    }
}

#[async_trait]
impl DeviceProbe for ProviderProbe {
    async fn probe(&self, _device: &Device) -> Result<ProbeReport, ProviderError> {
        let provider = self.selector.provider().await?;
        let started = Instant::now();
        provider.test_connection().await?;
        Ok(ProbeReport {
            capabilities: provider.capabilities(),
            latency: started.elapsed(),
        })
    }
}

/// Outcome of one scheduled health probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub device_id: String,
    pub status: DeviceStatus,
}

#[derive(Debug)]
pub struct DeviceRegistry {
    store: Arc<Store>,
    probe: Arc<dyn DeviceProbe>,
    events: EventBus,
    timeouts: TimeoutConfig,
    registration: Mutex<()>,
    sessions: Mutex<()>,
}

impl DeviceRegistry {
    pub fn new(
        store: Arc<Store>,
        probe: Arc<dyn DeviceProbe>,
        events: EventBus,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            store,
            probe,
            events,
            timeouts,
            registration: Mutex::new(()),
            sessions: Mutex::new(()),
        }
    }

    /// Validates, probes and persists a new device.
    ///
    /// A device whose connection test fails is still registered, with status
    /// [`DeviceStatus::Error`].
    pub async fn register_device(&self, spec: DeviceSpec) -> Result<Device> {
        spec.validate()?;

        let _guard = self.registration.lock().await;
        let serial = spec.identity.serial_number.trim().to_string();
        if self
            .store
            .devices
            .count(|d| d.identity.serial_number == serial)
            > 0
        {
            return Err(ValidationError::DuplicateDevice(serial).into());
        }

        let now = Utc::now();
        let mut identity = spec.identity;
        identity.serial_number = serial;
        let mut device = Device {
            id: Uuid::new_v4().to_string(),
            identity,
            configuration: spec.configuration,
            connection: spec.connection,
            capabilities: spec.capabilities.clone().unwrap_or_default(),
            performance: Performance::default(),
            status: DeviceStatus::Offline,
            active: true,
            last_health_check: Some(now),
            created_at: now,
            updated_at: now,
        };

        let probed = with_timeout(
            "test_connection",
            self.timeouts.connection(),
            self.probe.probe(&device),
        )
        .await;
        match probed {
            Ok(report) => {
                device.capabilities = match &spec.capabilities {
                    Some(declared) => declared.restricted_to(&report.capabilities),
                    None => report.capabilities,
                };
                device.performance.record_latency(report.latency, now);
                device.status = DeviceStatus::Online;
            }
            Err(e) => {
                tracing::warn!(
                    serial = %device.identity.serial_number,
                    error = %e,
                    "connection test failed during registration"
                );
                device.status = DeviceStatus::Error;
            }
        }

        self.store.devices.insert(device.clone())?;
        tracing::info!(
            device_id = %device.id,
            name = %device.identity.name,
            status = %device.status,
            "device registered"
        );
        self.events.publish(HsmEvent::DeviceRegistered {
            device_id: device.id.clone(),
            name: device.identity.name.clone(),
            status: device.status,
        });
        Ok(device)
    }

    pub fn get_device(&self, device_id: &str) -> Result<Device> {
        self.store
            .devices
            .get(device_id)
            .ok_or_else(|| NotFoundError::Device(device_id.to_string()).into())
    }

    /// All devices, oldest first.
    pub fn list_devices(&self) -> Vec<Device> {
        let mut devices = self.store.devices.values();
        devices.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    /// The device, provided it is active and online.
    pub fn require_online(&self, device_id: &str) -> Result<Device> {
        let device = self.get_device(device_id)?;
        if !device.is_online() {
            let status = if device.active {
                device.status.to_string()
            } else {
                "deactivated".to_string()
            };
            return Err(ValidationError::DeviceOffline {
                device_id: device.id,
                status,
            }
            .into());
        }
        Ok(device)
    }

    pub fn status_report(&self, device_id: &str) -> Result<DeviceStatusReport> {
        let device = self.get_device(device_id)?;

        let mut keys = self.store.keys.filter(|k| k.device_id == device_id);
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut certificates = self.store.certificates.filter(|c| c.device_id == device_id);
        certificates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut sessions = self.store.sessions.filter(|s| s.device_id == device_id);
        sessions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));

        let mut recent_operations = self.store.operations.filter(|o| o.device_id == device_id);
        recent_operations.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        recent_operations.truncate(RECENT_OPERATIONS_LIMIT);

        Ok(DeviceStatusReport {
            device,
            keys,
            certificates,
            sessions,
            recent_operations,
        })
    }

    /// Operator status change, e.g. into or out of maintenance.
    pub fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<Device> {
        let mut previous = None;
        let device = self
            .store
            .devices
            .try_update(device_id, |d| {
                if !d.active && status != DeviceStatus::Offline {
                    return Err(ValidationError::DeviceOffline {
                        device_id: d.id.clone(),
                        status: "deactivated".to_string(),
                    }
                    .into());
                }
                previous = Some(d.status);
                d.status = status;
                d.updated_at = Utc::now();
                Ok::<(), crate::Error>(())
            })?
            .ok_or_else(|| NotFoundError::Device(device_id.to_string()))?;

        self.publish_change(&device.id, previous, status);
        Ok(device)
    }

    /// Takes a device out of service and closes its sessions.
    pub async fn deactivate_device(&self, device_id: &str) -> Result<Device> {
        let mut previous = None;
        let device = self
            .store
            .devices
            .update(device_id, |d| {
                previous = Some(d.status);
                d.active = false;
                d.status = DeviceStatus::Offline;
                d.updated_at = Utc::now();
            })?
            .ok_or_else(|| NotFoundError::Device(device_id.to_string()))?;

        let _guard = self.sessions.lock().await;
        let open = self
            .store
            .sessions
            .filter(|s| s.device_id == device_id && s.state == SessionState::Open);
        for session in open {
            self.mark_closed(&session.id, Utc::now())?;
        }
        self.refresh_utilization(device_id)?;

        tracing::info!(device_id, "device deactivated");
        self.publish_change(&device.id, previous, DeviceStatus::Offline);
        Ok(device)
    }

    /// Opens a session, bounded by the device's `max_sessions`.
    pub async fn open_session(&self, device_id: &str, actor: &str) -> Result<Session> {
        let _guard = self.sessions.lock().await;
        let device = self.require_online(device_id)?;
        let open = self
            .store
            .sessions
            .count(|s| s.device_id == device_id && s.state == SessionState::Open);
        if open >= device.configuration.max_sessions as usize {
            return Err(ValidationError::SessionLimitExceeded {
                device_id: device.id,
                limit: device.configuration.max_sessions,
            }
            .into());
        }

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            device_id: device.id.clone(),
            actor: actor.to_string(),
            opened_at: now,
            last_used_at: now,
            state: SessionState::Open,
            closed_at: None,
        };
        self.store.sessions.insert(session.clone())?;
        self.refresh_utilization(device_id)?;
        tracing::debug!(session_id = %session.id, device_id, actor, "session opened");
        Ok(session)
    }

    /// Closing an already closed session is a no-op.
    pub async fn close_session(&self, session_id: &str) -> Result<Session> {
        let _guard = self.sessions.lock().await;
        let session = self
            .store
            .sessions
            .get(session_id)
            .ok_or_else(|| NotFoundError::Session(session_id.to_string()))?;
        if session.state == SessionState::Closed {
            return Ok(session);
        }
        let closed = self.mark_closed(session_id, Utc::now())?;
        self.refresh_utilization(&closed.device_id)?;
        Ok(closed)
    }

    /// Marks an open session as used by an operation on `device_id`.
    pub async fn touch_session(&self, session_id: &str, device_id: &str) -> Result<Session> {
        let _guard = self.sessions.lock().await;
        let session = self
            .store
            .sessions
            .get(session_id)
            .filter(|s| s.device_id == device_id)
            .ok_or_else(|| NotFoundError::Session(session_id.to_string()))?;
        if session.state == SessionState::Closed {
            return Err(ValidationError::SessionClosed(session_id.to_string()).into());
        }

        let now = Utc::now();
        let timeout = self.get_device(device_id)?.configuration.session_timeout_secs;
        if session.is_idle(timeout, now) {
            self.mark_closed(session_id, now)?;
            self.refresh_utilization(device_id)?;
            return Err(ValidationError::SessionClosed(session_id.to_string()).into());
        }

        let touched = self
            .store
            .sessions
            .update(session_id, |s| s.last_used_at = now)?
            .ok_or_else(|| NotFoundError::Session(session_id.to_string()))?;
        Ok(touched)
    }

    /// Closes sessions idle longer than their device's session timeout.
    /// Returns the ids of the sessions closed.
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let _guard = self.sessions.lock().await;
        let mut expired = Vec::new();
        for session in self.store.sessions.filter(|s| s.state == SessionState::Open) {
            let timeout = match self.store.devices.get(&session.device_id) {
                Some(device) => device.configuration.session_timeout_secs,
                None => continue,
            };
            if session.is_idle(timeout, now) {
                self.mark_closed(&session.id, now)?;
                self.refresh_utilization(&session.device_id)?;
                expired.push(session.id);
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "idle sessions expired");
        }
        Ok(expired)
    }

    /// Closes every open session. Used on shutdown.
    pub async fn close_all_sessions(&self) -> Result<usize> {
        let _guard = self.sessions.lock().await;
        let open = self.store.sessions.filter(|s| s.state == SessionState::Open);
        let now = Utc::now();
        for session in &open {
            self.mark_closed(&session.id, now)?;
        }
        let devices: BTreeSet<&str> = open.iter().map(|s| s.device_id.as_str()).collect();
        for device_id in devices {
            self.refresh_utilization(device_id)?;
        }
        Ok(open.len())
    }

    /// Probes every active device whose status is not operator-held,
    /// concurrently. A slow device only delays its own outcome.
    pub async fn probe_all(self: &Arc<Self>) -> Vec<ProbeOutcome> {
        let mut probes = JoinSet::new();
        for device in self
            .store
            .devices
            .filter(|d| d.active && !d.status.is_operator_held())
        {
            let registry = Arc::clone(self);
            probes.spawn(async move {
                let device_id = device.id.clone();
                (device_id, registry.probe_device(device).await)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((device_id, Ok(status))) => outcomes.push(ProbeOutcome { device_id, status }),
                Ok((device_id, Err(e))) => {
                    tracing::warn!(device_id, error = %e, "could not record health probe")
                }
                Err(e) => tracing::error!(error = %e, "health probe task failed"),
            }
        }
        outcomes
    }

    async fn probe_device(&self, device: Device) -> Result<DeviceStatus> {
        let probed = with_timeout(
            "health_probe",
            self.timeouts.health_probe(),
            self.probe.probe(&device),
        )
        .await;
        let status = match &probed {
            Ok(_) => DeviceStatus::Online,
            Err(e) => {
                tracing::warn!(device_id = %device.id, error = %e, "health probe failed");
                DeviceStatus::Error
            }
        };

        let now = Utc::now();
        let mut previous = None;
        let updated = self
            .store
            .devices
            .update(&device.id, |d| {
                // An operator may have taken the device out while the probe ran.
                if d.active && !d.status.is_operator_held() {
                    previous = Some(d.status);
                    d.status = status;
                }
                if let Ok(report) = &probed {
                    d.performance.record_latency(report.latency, now);
                }
                d.last_health_check = Some(now);
                d.updated_at = now;
            })?
            .ok_or_else(|| NotFoundError::Device(device.id.clone()))?;

        self.publish_change(&updated.id, previous, updated.status);
        Ok(updated.status)
    }

    fn mark_closed(&self, session_id: &str, now: DateTime<Utc>) -> Result<Session> {
        let closed = self
            .store
            .sessions
            .update(session_id, |s| {
                s.state = SessionState::Closed;
                s.closed_at = Some(now);
            })?
            .ok_or_else(|| NotFoundError::Session(session_id.to_string()))?;
        tracing::debug!(session_id, "session closed");
        Ok(closed)
    }

    fn refresh_utilization(&self, device_id: &str) -> Result<()> {
        let open = self
            .store
            .sessions
            .count(|s| s.device_id == device_id && s.state == SessionState::Open);
        self.store.devices.update(device_id, |d| {
            let max = d.configuration.max_sessions.max(1) as f64;
            d.performance.utilization_pct = (open as f64 / max * 100.0).min(100.0);
        })?;
        Ok(())
    }

    fn publish_change(&self, device_id: &str, previous: Option<DeviceStatus>, current: DeviceStatus) {
        if let Some(from) = previous.filter(|from| *from != current) {
            tracing::info!(device_id, %from, to = %current, "device status changed");
            self.events.publish(HsmEvent::DeviceStatusChanged {
                device_id: device_id.to_string(),
                from,
                to: current,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct SwitchProbe {
        down: AtomicBool,
        hang: AtomicBool,
    }

    #[async_trait]
    impl DeviceProbe for SwitchProbe {
        async fn probe(&self, _device: &Device) -> Result<ProbeReport, ProviderError> {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("no route to host".into()));
            }
            Ok(ProbeReport {
                capabilities: Capabilities::new(["AES", "HMAC"], [16, 32], 64, 64),
                latency: Duration::from_millis(2),
            })
        }
    }

    fn registry() -> (Arc<DeviceRegistry>, Arc<SwitchProbe>) {
        let probe = Arc::new(SwitchProbe::default());
        let timeouts = TimeoutConfig {
            health_probe_ms: 50,
            connection_ms: 50,
            ..TimeoutConfig::default()
        };
        let registry = DeviceRegistry::new(
            Arc::new(Store::memory()),
            probe.clone(),
            EventBus::default(),
            timeouts,
        );
        (Arc::new(registry), probe)
    }

    fn spec(serial: &str) -> DeviceSpec {
        DeviceSpec {
            identity: DeviceIdentity {
                name: format!("hsm-{serial}"),
                vendor: "Acme".into(),
                model: "Vault 9000".into(),
                serial_number: serial.into(),
                firmware_version: "2.1.0".into(),
            },
            configuration: DeviceConfiguration {
                max_sessions: 2,
                ..DeviceConfiguration::default()
            },
            connection: ConnectionParams::new("hsm.local", 1792),
            capabilities: None,
        }
    }

    #[test]
    fn spec_validation() {
        let mut s = spec("S1");
        s.connection.port = 0;
        assert_eq!(s.validate(), Err(ValidationError::InvalidPort(0)));
        s.connection.port = 65536;
        assert_eq!(s.validate(), Err(ValidationError::InvalidPort(65536)));
        s.connection.port = 65535;
        assert!(s.validate().is_ok());

        let mut s = spec("S1");
        s.connection.endpoint = "  ".into();
        assert_eq!(s.validate(), Err(ValidationError::EmptyEndpoint));

        let mut s = spec("S1");
        s.configuration.session_timeout_secs = 0;
        assert_eq!(s.validate(), Err(ValidationError::InvalidSessionTimeout));

        let mut s = spec("S1");
        s.configuration.max_sessions = 0;
        assert_eq!(s.validate(), Err(ValidationError::InvalidSessionLimit));
    }

    #[test]
    fn capabilities_are_case_insensitive_and_restrictable() {
        let declared = Capabilities::new(["aes", "RSA"], [32, 256], 1, 2);
        assert!(declared.supports_algorithm("AES"));
        assert!(declared.supports_key_size(32));

        let available = Capabilities::new(["AES", "HMAC"], [16, 32], 100, 100);
        let effective = declared.restricted_to(&available);
        assert_eq!(effective, Capabilities::new(["AES"], [32], 1, 2));
    }

    #[tokio::test]
    async fn registration_probes_and_rejects_duplicates() {
        let (registry, _) = registry();
        let device = registry.register_device(spec("S1")).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert!(device.capabilities.supports_algorithm("HMAC"));
        assert!(device.performance.avg_latency_ms > 0.0);

        let err = registry.register_device(spec("S1")).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_DEVICE");
        assert_eq!(registry.list_devices().len(), 1);
    }

    #[tokio::test]
    async fn failed_connection_test_registers_in_error() {
        let (registry, probe) = registry();
        probe.down.store(true, Ordering::SeqCst);
        let device = registry.register_device(spec("S1")).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Error);
        assert_eq!(
            registry.require_online(&device.id).unwrap_err().code(),
            "DEVICE_OFFLINE"
        );
    }

    #[tokio::test]
    async fn session_limit_is_enforced() {
        let (registry, _) = registry();
        let device = registry.register_device(spec("S1")).await.unwrap();

        let first = registry.open_session(&device.id, "alice").await.unwrap();
        registry.open_session(&device.id, "bob").await.unwrap();
        let err = registry.open_session(&device.id, "carol").await.unwrap_err();
        assert_eq!(err.code(), "SESSION_LIMIT_EXCEEDED");
        assert_eq!(registry.get_device(&device.id).unwrap().performance.utilization_pct, 100.0);

        registry.close_session(&first.id).await.unwrap();
        registry.open_session(&device.id, "carol").await.unwrap();
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let (registry, _) = registry();
        let device = registry.register_device(spec("S1")).await.unwrap();
        let session = registry.open_session(&device.id, "alice").await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        let expired = registry.expire_sessions(later).await.unwrap();
        assert_eq!(expired, vec![session.id.clone()]);

        let err = registry.touch_session(&session.id, &device.id).await.unwrap_err();
        assert_eq!(err.code(), "SESSION_CLOSED");
    }

    #[tokio::test]
    async fn probes_flip_status_and_skip_maintenance() {
        let (registry, probe) = registry();
        let a = registry.register_device(spec("A")).await.unwrap();
        let b = registry.register_device(spec("B")).await.unwrap();
        registry.set_device_status(&b.id, DeviceStatus::Maintenance).unwrap();

        let mut events = registry.events.subscribe();
        probe.down.store(true, Ordering::SeqCst);
        let outcomes = registry.probe_all().await;
        assert_eq!(
            outcomes,
            vec![ProbeOutcome {
                device_id: a.id.clone(),
                status: DeviceStatus::Error
            }]
        );
        assert_eq!(registry.get_device(&b.id).unwrap().status, DeviceStatus::Maintenance);
        assert!(matches!(
            events.recv().await.unwrap(),
            HsmEvent::DeviceStatusChanged { to: DeviceStatus::Error, .. }
        ));

        probe.down.store(false, Ordering::SeqCst);
        registry.probe_all().await;
        assert_eq!(registry.get_device(&a.id).unwrap().status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn operator_offline_survives_health_checks() {
        let (registry, _) = registry();
        let device = registry.register_device(spec("S1")).await.unwrap();
        registry.set_device_status(&device.id, DeviceStatus::Offline).unwrap();

        // 健康检查成功也不能把运维设置的离线状态改回在线
        assert!(registry.probe_all().await.is_empty());
        assert_eq!(registry.get_device(&device.id).unwrap().status, DeviceStatus::Offline);

        registry.set_device_status(&device.id, DeviceStatus::Online).unwrap();
        assert_eq!(registry.probe_all().await.len(), 1);
    }

    #[tokio::test]
    async fn hung_probe_times_out_as_error() {
        let (registry, probe) = registry();
        let device = registry.register_device(spec("S1")).await.unwrap();
        probe.hang.store(true, Ordering::SeqCst);

        let outcomes = registry.probe_all().await;
        assert_eq!(outcomes[0].status, DeviceStatus::Error);
        assert!(registry.get_device(&device.id).unwrap().last_health_check.is_some());
    }

    #[tokio::test]
    async fn deactivated_devices_close_sessions_and_stay_down() {
        let (registry, _) = registry();
        let device = registry.register_device(spec("S1")).await.unwrap();
        let session = registry.open_session(&device.id, "alice").await.unwrap();

        let deactivated = registry.deactivate_device(&device.id).await.unwrap();
        assert!(!deactivated.active);
        assert_eq!(deactivated.status, DeviceStatus::Offline);
        assert_eq!(
            registry.store.sessions.get(&session.id).unwrap().state,
            SessionState::Closed
        );
        assert!(registry.set_device_status(&device.id, DeviceStatus::Online).is_err());
        assert!(registry.probe_all().await.is_empty());
    }
}
