//! Key inventory and lifecycle.
//!
//! 中文: 密钥清单与生命周期管理。
//!
//! Keys belong to exactly one device and reference provider key material by
//! an opaque handle. The lifecycle is one-directional:
//!
//! ```text
//! active ──► inactive ────┐
//!   │   ──► compromised ──┼──► destroyed
//!   └────► archived ──────┘
//! ```
//!
//! Each key has a read/write gate. Crypto operations hold the read side while
//! they validate and dispatch; destruction takes the write side, so it waits
//! for in-flight work and is observed by everything dispatched afterwards.

use crate::config::TimeoutConfig;
use crate::device::DeviceRegistry;
use crate::error::{Error, NotFoundError, ProviderError, Result, ValidationError};
use crate::events::{EventBus, HsmEvent};
use crate::operation::{AuditTrail, OperationContext, OperationType};
use crate::provider::{with_timeout, ProviderSelector};
use crate::store::{Record, Store};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    #[default]
    Symmetric,
    AsymmetricPrivate,
    AsymmetricPublic,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Wrap,
    Unwrap,
    Derive,
    Generate,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyUsage::Encrypt => "encrypt",
            KeyUsage::Decrypt => "decrypt",
            KeyUsage::Sign => "sign",
            KeyUsage::Verify => "verify",
            KeyUsage::Wrap => "wrap",
            KeyUsage::Unwrap => "unwrap",
            KeyUsage::Derive => "derive",
            KeyUsage::Generate => "generate",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyAttributes {
    pub extractable: bool,
    pub sensitive: bool,
    pub token: bool,
    pub destroyable: bool,
}

impl Default for KeyAttributes {
    fn default() -> Self {
        Self {
            extractable: false,
            sensitive: true,
            token: true,
            destroyable: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyOwner {
    pub owner: Option<String>,
    pub application: Option<String>,
    pub purpose: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Active,
    Inactive,
    Compromised,
    Archived,
    Destroyed,
}

impl KeyState {
    pub fn can_transition_to(self, to: KeyState) -> bool {
        use KeyState::*;
        matches!(
            (self, to),
            (Active, Inactive | Compromised | Archived)
                | (Inactive | Compromised | Archived, Destroyed)
        )
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyState::Active => "active",
            KeyState::Inactive => "inactive",
            KeyState::Compromised => "compromised",
            KeyState::Archived => "archived",
            KeyState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Key {
    pub id: String,
    pub device_id: String,
    /// Provider-specific reference to the key material.
    pub handle: String,
    pub label: String,
    pub algorithm: String,
    /// Bytes.
    pub size: usize,
    pub key_type: KeyType,
    pub usage: BTreeSet<KeyUsage>,
    pub attributes: KeyAttributes,
    pub owner: KeyOwner,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    pub usage_count: u64,
    pub rotated_from: Option<String>,
}

impl Key {
    pub fn is_active(&self) -> bool {
        self.state == KeyState::Active
    }

    pub fn allows(&self, usage: KeyUsage) -> bool {
        self.usage.contains(&usage)
    }

    fn spec(&self) -> KeySpec {
        KeySpec {
            label: Some(self.label.clone()),
            algorithm: self.algorithm.clone(),
            key_size: self.size,
            key_type: self.key_type,
            usage: self.usage.clone(),
            attributes: self.attributes.clone(),
            owner: self.owner.clone(),
        }
    }
}

impl Record for Key {
    const TABLE: &'static str = "keys";

    fn id(&self) -> &str {
        &self.id
    }
}

fn default_algorithm() -> String {
    "AES".to_string()
}

fn default_usage() -> BTreeSet<KeyUsage> {
    BTreeSet::from([KeyUsage::Encrypt, KeyUsage::Decrypt])
}

/// Key generation request. `key_size` is in bytes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KeySpec {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    pub key_size: usize,
    #[serde(default)]
    pub key_type: KeyType,
    #[serde(default = "default_usage")]
    pub usage: BTreeSet<KeyUsage>,
    #[serde(default)]
    pub attributes: KeyAttributes,
    #[serde(default)]
    pub owner: KeyOwner,
}

impl KeySpec {
    /// An AES key of `key_size` bytes for encryption and decryption.
    pub fn aes(key_size: usize) -> Self {
        Self {
            label: None,
            algorithm: default_algorithm(),
            key_size,
            key_type: KeyType::Symmetric,
            usage: default_usage(),
            attributes: KeyAttributes::default(),
            owner: KeyOwner::default(),
        }
    }

    pub fn with_usage(mut self, usage: impl IntoIterator<Item = KeyUsage>) -> Self {
        self.usage = usage.into_iter().collect();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug)]
pub struct KeyRegistry {
    store: Arc<Store>,
    devices: Arc<DeviceRegistry>,
    selector: Arc<ProviderSelector>,
    audit: Arc<AuditTrail>,
    events: EventBus,
    timeouts: TimeoutConfig,
    default_label: String,
    gates: DashMap<String, Arc<RwLock<()>>>,
    slots: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyRegistry {
    pub fn new(
        store: Arc<Store>,
        devices: Arc<DeviceRegistry>,
        selector: Arc<ProviderSelector>,
        audit: Arc<AuditTrail>,
        events: EventBus,
        timeouts: TimeoutConfig,
        default_label: impl Into<String>,
    ) -> Self {
        Self {
            store,
            devices,
            selector,
            audit,
            events,
            timeouts,
            default_label: default_label.into(),
            gates: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    pub fn get_key(&self, key_id: &str) -> Result<Key> {
        self.store
            .keys
            .get(key_id)
            .ok_or_else(|| NotFoundError::Key(key_id.to_string()).into())
    }

    /// Keys of one device, oldest first.
    pub fn list_keys(&self, device_id: &str) -> Vec<Key> {
        let mut keys = self.store.keys.filter(|k| k.device_id == device_id);
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        keys
    }

    /// Shared access to a key for the duration of one operation.
    pub(crate) async fn read_gate(&self, key_id: &str) -> OwnedRwLockReadGuard<()> {
        self.gate(key_id).read_owned().await
    }

    fn gate(&self, key_id: &str) -> Arc<RwLock<()>> {
        self.gates
            .entry(key_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn slot_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.slots
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates a key on `device_id`. The attempt is audited as a
    /// `generate_key` operation whether or not it succeeds.
    pub async fn generate_key(
        &self,
        device_id: &str,
        spec: KeySpec,
        context: &OperationContext,
    ) -> Result<Key> {
        let mut pending = self.audit.begin(
            OperationType::GenerateKey,
            device_id,
            None,
            Some(spec.algorithm.clone()),
            0,
            context,
        )?;

        let slot = self.slot_lock(device_id);
        let _slot = slot.lock().await;
        let result = self.create_key(device_id, spec, None).await;
        match result {
            Ok(key) => {
                pending.set_key(&key.id);
                self.audit.complete(pending, key.size, "handle")?;
                Ok(key)
            }
            Err(e) => {
                self.audit.record_failure(pending, &e);
                Err(e)
            }
        }
    }

    async fn create_key(
        &self,
        device_id: &str,
        spec: KeySpec,
        rotated_from: Option<&Key>,
    ) -> Result<Key> {
        let device = self.devices.require_online(device_id)?;
        let capabilities = &device.capabilities;
        if !capabilities.supports_algorithm(&spec.algorithm) {
            return Err(ValidationError::UnsupportedAlgorithm(spec.algorithm).into());
        }
        if !capabilities.supports_key_size(spec.key_size) {
            return Err(ValidationError::UnsupportedKeySize(spec.key_size).into());
        }
        let in_use = self
            .store
            .keys
            .count(|k| k.device_id == device_id && k.state != KeyState::Destroyed);
        if in_use >= capabilities.key_slots {
            return Err(ValidationError::StorageExceeded {
                capacity: capabilities.key_slots,
            }
            .into());
        }

        let provider = self.selector.provider().await?;
        let label = spec
            .label
            .clone()
            .unwrap_or_else(|| self.default_label.clone());
        let handle = match rotated_from {
            Some(old) => {
                with_timeout(
                    "rotate_key",
                    self.timeouts.key_generation(),
                    provider.rotate_key(&old.handle),
                )
                .await?
            }
            None => {
                with_timeout(
                    "generate_key",
                    self.timeouts.key_generation(),
                    provider.generate_key(spec.key_size, &label),
                )
                .await?
            }
        };

        let now = Utc::now();
        let key = Key {
            id: Uuid::new_v4().to_string(),
            device_id: device.id.clone(),
            handle,
            label,
            algorithm: spec.algorithm.trim().to_ascii_uppercase(),
            size: spec.key_size,
            key_type: spec.key_type,
            usage: spec.usage,
            attributes: spec.attributes,
            owner: spec.owner,
            state: KeyState::Active,
            created_at: now,
            activated_at: Some(now),
            state_changed_at: now,
            usage_count: 0,
            rotated_from: rotated_from.map(|old| old.id.clone()),
        };
        self.store.keys.insert(key.clone())?;

        tracing::info!(
            key_id = %key.id,
            device_id = %key.device_id,
            algorithm = %key.algorithm,
            size = key.size,
            "key generated"
        );
        self.events.publish(HsmEvent::KeyGenerated {
            key_id: key.id.clone(),
            device_id: key.device_id.clone(),
            algorithm: key.algorithm.clone(),
            size: key.size,
        });
        Ok(key)
    }

    /// Moves a key along its lifecycle. `Destroyed` also destroys the
    /// provider's key material.
    pub async fn transition_key(&self, key_id: &str, to: KeyState) -> Result<Key> {
        if to == KeyState::Destroyed {
            return self.destroy_key(key_id).await;
        }
        self.get_key(key_id)?;
        let gate = self.gate(key_id);
        let _exclusive = gate.write().await;
        self.set_state(key_id, to)
    }

    /// Destroys a key that has already left `active`. Waits for operations in
    /// flight on the key.
    pub async fn destroy_key(&self, key_id: &str) -> Result<Key> {
        self.get_key(key_id)?;
        let gate = self.gate(key_id);
        let destroyed = {
            let _exclusive = gate.write().await;
            self.destroy_locked(key_id).await
        };
        // Destroyed is terminal, so nothing needs the gate any more. Waiters
        // still holding a clone see the destroyed state.
        if destroyed.is_ok() {
            self.gates.remove(key_id);
        }
        destroyed
    }

    async fn destroy_locked(&self, key_id: &str) -> Result<Key> {
        let key = self.get_key(key_id)?;
        if !key.attributes.destroyable {
            return Err(ValidationError::KeyNotDestroyable(key.id).into());
        }
        if !key.state.can_transition_to(KeyState::Destroyed) {
            return Err(ValidationError::InvalidKeyTransition {
                from: key.state.to_string(),
                to: KeyState::Destroyed.to_string(),
            }
            .into());
        }

        let provider = self.selector.provider().await?;
        match with_timeout(
            "destroy_key",
            self.timeouts.crypto(),
            provider.destroy_key(&key.handle),
        )
        .await
        {
            Ok(()) => {}
            Err(ProviderError::UnknownHandle(handle)) => {
                tracing::warn!(key_id, %handle, "key material already gone from provider");
            }
            Err(e) => return Err(e.into()),
        }

        self.set_state(key_id, KeyState::Destroyed)
    }

    /// Replaces an active key with a fresh one of the same spec. The old key
    /// becomes `inactive` and the new one records where it came from.
    pub async fn rotate_key(&self, key_id: &str, context: &OperationContext) -> Result<Key> {
        let old = self.get_key(key_id)?;
        let mut pending = self.audit.begin(
            OperationType::GenerateKey,
            &old.device_id,
            None,
            Some(old.algorithm.clone()),
            0,
            context,
        )?;

        let result = self.rotate_locked(&old).await;
        match result {
            Ok(new_key) => {
                pending.set_key(&new_key.id);
                self.audit.complete(pending, new_key.size, "handle")?;
                tracing::info!(old_key_id = %old.id, new_key_id = %new_key.id, "key rotated");
                self.events.publish(HsmEvent::KeyRotated {
                    old_key_id: old.id.clone(),
                    new_key_id: new_key.id.clone(),
                });
                Ok(new_key)
            }
            Err(e) => {
                self.audit.record_failure(pending, &e);
                Err(e)
            }
        }
    }

    async fn rotate_locked(&self, old: &Key) -> Result<Key> {
        let gate = self.gate(&old.id);
        let _exclusive = gate.write().await;
        let slot = self.slot_lock(&old.device_id);
        let _slot = slot.lock().await;

        let current = self.get_key(&old.id)?;
        if !current.is_active() {
            return Err(ValidationError::KeyNotActive {
                key_id: current.id,
                state: current.state.to_string(),
            }
            .into());
        }

        let new_key = self
            .create_key(&current.device_id, current.spec(), Some(&current))
            .await
            .map_err(|e| match e {
                Error::Provider(p @ ProviderError::RotationFailed(_)) => Error::Provider(p),
                Error::Provider(p) => Error::Provider(ProviderError::RotationFailed(p.to_string())),
                other => other,
            })?;
        self.set_state(&current.id, KeyState::Inactive)?;
        Ok(new_key)
    }

    /// Deactivates every active key whose handle no longer resolves on the
    /// provider, e.g. simulated keys after a restart over a file store. Each
    /// one is audited as a failed `reconcile_key`. Keys the provider cannot
    /// answer for are left alone.
    pub async fn reconcile(&self, context: &OperationContext) -> Result<Vec<Key>> {
        let provider = self.selector.provider().await?;
        let mut deactivated = Vec::new();
        for key in self.store.keys.filter(Key::is_active) {
            let gate = self.gate(&key.id);
            let _exclusive = gate.write().await;
            // Changed while we waited for the gate.
            if !self.get_key(&key.id).is_ok_and(|current| current.is_active()) {
                continue;
            }
            let resolves = with_timeout(
                "has_key",
                self.timeouts.crypto(),
                provider.has_key(&key.handle),
            )
            .await;
            match resolves {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key_id = %key.id, error = %e, "could not check key material");
                    continue;
                }
            }

            let pending = self.audit.begin(
                OperationType::ReconcileKey,
                &key.device_id,
                Some(key.id.as_str()),
                Some(key.algorithm.clone()),
                0,
                context,
            )?;
            let missing = Error::from(ProviderError::UnknownHandle(key.handle.clone()));
            match self.set_state(&key.id, KeyState::Inactive) {
                Ok(updated) => {
                    self.audit.record_failure(pending, &missing);
                    tracing::warn!(
                        key_id = %key.id,
                        device_id = %key.device_id,
                        "key material missing from provider, key deactivated"
                    );
                    deactivated.push(updated);
                }
                Err(e) => {
                    self.audit.record_failure(pending, &e);
                    return Err(e);
                }
            }
        }
        Ok(deactivated)
    }

    fn set_state(&self, key_id: &str, to: KeyState) -> Result<Key> {
        let mut from = None;
        let key = self
            .store
            .keys
            .try_update(key_id, |k| {
                if !k.state.can_transition_to(to) {
                    return Err(Error::from(ValidationError::InvalidKeyTransition {
                        from: k.state.to_string(),
                        to: to.to_string(),
                    }));
                }
                from = Some(k.state);
                k.state = to;
                k.state_changed_at = Utc::now();
                Ok(())
            })?
            .ok_or_else(|| NotFoundError::Key(key_id.to_string()))?;

        if let Some(from) = from {
            tracing::info!(key_id, %from, %to, "key state changed");
            self.events.publish(HsmEvent::KeyStateChanged {
                key_id: key_id.to_string(),
                from,
                to,
            });
        }
        Ok(key)
    }

    pub(crate) fn record_use(&self, key_id: &str) -> Result<()> {
        self.store.keys.update(key_id, |k| k.usage_count += 1)?;
        Ok(())
    }
}
