//!
//! # 备份
//!
//! Point-in-time, checksum-verified descriptors of a device's key and
//! certificate inventory. A backup never contains key material or provider
//! handles: only metadata and counts.
//!
//! The manifest is written to `<backup_dir>/<device_id>/<backup_id>.json`.
//! Its checksum is SHA-256 over the canonical JSON of the inventory.
//!
use crate::certificate::{Certificate, CertificateStatus};
use crate::device::{Device, DeviceRegistry};
use crate::error::{NotFoundError, Result, StoreError};
use crate::events::{EventBus, HsmEvent};
use crate::key::{Key, KeyState, KeyType, KeyUsage};
use crate::store::{Record, Store};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backup {
    pub id: String,
    pub device_id: String,
    pub key_count: usize,
    pub certificate_count: usize,
    /// Hex SHA-256 of the inventory.
    pub checksum: String,
    pub location: PathBuf,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Record for Backup {
    const TABLE: &'static str = "backups";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyMetadata {
    pub id: String,
    pub label: String,
    pub algorithm: String,
    pub size: usize,
    pub key_type: KeyType,
    pub usage: BTreeSet<KeyUsage>,
    pub state: KeyState,
    pub extractable: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Key> for KeyMetadata {
    fn from(key: &Key) -> Self {
        Self {
            id: key.id.clone(),
            label: key.label.clone(),
            algorithm: key.algorithm.clone(),
            size: key.size,
            key_type: key.key_type,
            usage: key.usage.clone(),
            state: key.state,
            extractable: key.attributes.extractable,
            created_at: key.created_at,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateMetadata {
    pub id: String,
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub status: CertificateStatus,
    pub private_key_id: Option<String>,
}

impl From<&Certificate> for CertificateMetadata {
    fn from(cert: &Certificate) -> Self {
        Self {
            id: cert.id.clone(),
            subject: cert.subject.clone(),
            issuer: cert.issuer.clone(),
            serial_number: cert.serial_number.clone(),
            not_before: cert.not_before,
            not_after: cert.not_after,
            status: cert.status,
            private_key_id: cert.private_key_id.clone(),
        }
    }
}

/// The inventory covered by a checksum, sorted by id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inventory {
    pub keys: Vec<KeyMetadata>,
    pub certificates: Vec<CertificateMetadata>,
}

impl Inventory {
    fn capture(store: &Store, device_id: &str) -> Self {
        let mut keys: Vec<KeyMetadata> = store
            .keys
            .filter(|k| k.device_id == device_id && k.state != KeyState::Destroyed)
            .iter()
            .map(KeyMetadata::from)
            .collect();
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        let mut certificates: Vec<CertificateMetadata> = store
            .certificates
            .filter(|c| c.device_id == device_id)
            .iter()
            .map(CertificateMetadata::from)
            .collect();
        certificates.sort_by(|a, b| a.id.cmp(&b.id));
        Self { keys, certificates }
    }

    pub fn checksum(&self) -> Result<String, StoreError> {
        let canonical = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&canonical)))
    }
}

/// What is written to disk for each backup.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupManifest {
    pub backup_id: String,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub checksum: String,
    pub inventory: Inventory,
}

#[derive(Debug)]
pub struct BackupManager {
    store: Arc<Store>,
    devices: Arc<DeviceRegistry>,
    events: EventBus,
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(
        store: Arc<Store>,
        devices: Arc<DeviceRegistry>,
        events: EventBus,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            devices,
            events,
            backup_dir: backup_dir.into(),
        }
    }

    /// Whether `device`'s backup policy calls for a backup at `now`.
    pub fn is_due(&self, device: &Device, now: DateTime<Utc>) -> bool {
        let policy = &device.configuration.backup_policy;
        if !device.active || !policy.enabled {
            return false;
        }
        let last = self
            .store
            .backups
            .filter(|b| b.device_id == device.id)
            .into_iter()
            .map(|b| b.created_at)
            .max();
        match last {
            Some(last) => last + Duration::hours(i64::from(policy.frequency_hours)) <= now,
            None => true,
        }
    }

    /// Backs up every device that is due. A failing device is logged and
    /// skipped.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<Backup> {
        let mut created = Vec::new();
        for device in self.devices.list_devices() {
            if !self.is_due(&device, now) {
                continue;
            }
            match self.create_backup(&device.id).await {
                Ok(backup) => created.push(backup),
                Err(e) => tracing::error!(device_id = %device.id, error = %e, "scheduled backup failed"),
            }
        }
        created
    }

    /// Snapshots the inventory of `device_id`, writes the manifest and
    /// verifies it.
    pub async fn create_backup(&self, device_id: &str) -> Result<Backup> {
        let device = self.devices.get_device(device_id)?;
        let inventory = Inventory::capture(&self.store, &device.id);
        let checksum = inventory.checksum()?;

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let retention = Duration::days(i64::from(device.configuration.backup_policy.retention_days));
        let location = self.backup_dir.join(&device.id).join(format!("{id}.json"));
        let manifest = BackupManifest {
            backup_id: id.clone(),
            device_id: device.id.clone(),
            created_at: now,
            expires_at: now + retention,
            checksum: checksum.clone(),
            inventory,
        };
        write_manifest(&location, &manifest).await?;

        let backup = Backup {
            id,
            device_id: device.id,
            key_count: manifest.inventory.keys.len(),
            certificate_count: manifest.inventory.certificates.len(),
            checksum,
            location,
            created_at: now,
            expires_at: manifest.expires_at,
            verified: false,
            verified_at: None,
        };
        self.store.backups.insert(backup.clone())?;

        let verified = self.verify_backup(&backup.id).await?;
        tracing::info!(
            backup_id = %backup.id,
            device_id = %backup.device_id,
            keys = backup.key_count,
            certificates = backup.certificate_count,
            verified,
            "backup created"
        );
        self.events.publish(HsmEvent::BackupCreated {
            backup_id: backup.id.clone(),
            device_id: backup.device_id.clone(),
            key_count: backup.key_count,
            certificate_count: backup.certificate_count,
        });
        self.get_backup(&backup.id)
    }

    /// Re-reads the manifest and recomputes its checksum. Records the result.
    pub async fn verify_backup(&self, backup_id: &str) -> Result<bool> {
        let backup = self.get_backup(backup_id)?;
        let verified = match read_manifest(&backup.location).await {
            Ok(manifest) => {
                manifest.backup_id == backup.id
                    && manifest.checksum == backup.checksum
                    && manifest.inventory.checksum()? == backup.checksum
            }
            Err(e) => {
                tracing::warn!(backup_id, error = %e, "backup manifest unreadable");
                false
            }
        };
        let now = Utc::now();
        self.store.backups.update(backup_id, |b| {
            b.verified = verified;
            b.verified_at = Some(now);
        })?;
        Ok(verified)
    }

    pub fn get_backup(&self, backup_id: &str) -> Result<Backup> {
        self.store
            .backups
            .get(backup_id)
            .ok_or_else(|| NotFoundError::Backup(backup_id.to_string()).into())
    }

    pub fn list_backups(&self, device_id: &str) -> Vec<Backup> {
        let mut backups = self.store.backups.filter(|b| b.device_id == device_id);
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        backups
    }

    /// Deletes backups past their retention. Returns their ids.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let expired = self.store.backups.filter(|b| b.expires_at <= now);
        let mut pruned = Vec::with_capacity(expired.len());
        for backup in expired {
            match tokio::fs::remove_file(&backup.location).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::from(e).into()),
            }
            self.store.backups.remove(&backup.id)?;
            tracing::info!(backup_id = %backup.id, device_id = %backup.device_id, "expired backup pruned");
            pruned.push(backup.id);
        }
        Ok(pruned)
    }
}

async fn write_manifest(location: &Path, manifest: &BackupManifest) -> Result<(), StoreError> {
    if let Some(parent) = location.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(manifest)?;
    let temp_path = location.with_extension("json.tmp");
    tokio::fs::write(&temp_path, json).await?;
    tokio::fs::rename(&temp_path, location).await?;
    Ok(())
}

async fn read_manifest(location: &Path) -> Result<BackupManifest, StoreError> {
    let json = tokio::fs::read(location).await?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_hex_sha256() {
        let inventory = Inventory {
            keys: Vec::new(),
            certificates: Vec::new(),
        };
        let first = inventory.checksum().unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(first, inventory.checksum().unwrap());
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
