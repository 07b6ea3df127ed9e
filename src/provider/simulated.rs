//! In-process simulated provider.
//!
//! Keys are random byte strings held in a `DashMap`. Encryption and MAC
//! subkeys are derived from the key material with HKDF-SHA256, so one key
//! serves both ciphers and HMAC signing. Material is zeroized when a key is
//! destroyed or the provider is closed.

use super::{CryptoProvider, Mechanism, ProviderKind};
use crate::device::Capabilities;
use crate::error::ProviderError;
use aes_gcm::aead::{self, AeadInPlace, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use async_trait::async_trait;
use dashmap::DashMap;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::TryRngCore;
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const DERIVED_KEY_SIZE: usize = 32;
const MIN_KEY_SIZE: usize = 16;
const MAX_KEY_SIZE: usize = 64;

const ENCRYPTION_INFO: &[u8] = b"seal-hsm/simulated/encrypt";
const SIGNING_INFO: &[u8] = b"seal-hsm/simulated/sign";
const ASSOCIATED_DATA: &[u8] = b"seal-hsm";

struct SimulatedKey {
    material: Zeroizing<Vec<u8>>,
    label: String,
}

impl SimulatedKey {
    fn derive(&self, info: &[u8]) -> Result<Zeroizing<[u8; DERIVED_KEY_SIZE]>, String> {
        let hk = Hkdf::<Sha256>::new(None, &self.material);
        let mut okm = Zeroizing::new([0u8; DERIVED_KEY_SIZE]);
        hk.expand(info, okm.as_mut()).map_err(|e| e.to_string())?;
        Ok(okm)
    }
}

/// Software provider backed by an in-memory key table.
pub struct SimulatedProvider {
    keys: DashMap<String, SimulatedKey>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for SimulatedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedProvider")
            .field("keys", &self.keys.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn ensure_open(&self) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProviderError::Closed);
        }
        Ok(())
    }

    fn random_material(size_bytes: usize) -> Result<Zeroizing<Vec<u8>>, ProviderError> {
        if !(MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&size_bytes) {
            return Err(ProviderError::KeyGeneration(format!(
                "key size must be between {MIN_KEY_SIZE} and {MAX_KEY_SIZE} bytes, got {size_bytes}"
            )));
        }
        let mut material = Zeroizing::new(vec![0u8; size_bytes]);
        rand_core::OsRng
            .try_fill_bytes(&mut material)
            .map_err(|e| ProviderError::KeyGeneration(e.to_string()))?;
        Ok(material)
    }

    fn insert(&self, material: Zeroizing<Vec<u8>>, label: &str) -> String {
        let handle = format!("sim:{}", Uuid::new_v4());
        self.keys.insert(
            handle.clone(),
            SimulatedKey {
                material,
                label: label.to_string(),
            },
        );
        handle
    }

    /// Derives the subkey for `info` from the key behind `handle`.
    fn subkey(
        &self,
        handle: &str,
        info: &[u8],
    ) -> Result<Zeroizing<[u8; DERIVED_KEY_SIZE]>, ProviderError> {
        self.ensure_open()?;
        let key = self
            .keys
            .get(handle)
            .ok_or_else(|| ProviderError::UnknownHandle(handle.to_string()))?;
        key.derive(info).map_err(ProviderError::Unavailable)
    }
}

fn seal_with<C>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, String>
where
    C: KeyInit + AeadInPlace,
{
    let cipher = C::new_from_slice(key).map_err(|e| e.to_string())?;
    let nonce = C::generate_nonce(&mut OsRng);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, ASSOCIATED_DATA, &mut buffer)
        .map_err(|e| e.to_string())?;

    let mut output = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + buffer.len());
    output.extend_from_slice(nonce.as_slice());
    output.extend_from_slice(tag.as_slice());
    output.extend_from_slice(&buffer);
    Ok(output)
}

fn open_with<C>(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, String>
where
    C: KeyInit + AeadInPlace,
{
    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err("ciphertext is too short".to_string());
    }
    let cipher = C::new_from_slice(key).map_err(|e| e.to_string())?;

    let (nonce, rest) = ciphertext.split_at(NONCE_SIZE);
    let (tag, body) = rest.split_at(TAG_SIZE);

    let mut buffer = body.to_vec();
    cipher
        .decrypt_in_place_detached(
            aead::Nonce::<C>::from_slice(nonce),
            ASSOCIATED_DATA,
            &mut buffer,
            aead::Tag::<C>::from_slice(tag),
        )
        .map_err(|_| "authentication tag mismatch".to_string())?;
    Ok(buffer)
}

#[async_trait]
impl CryptoProvider for SimulatedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Simulated
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        self.ensure_open()?;
        if !self.initialized.swap(true, Ordering::AcqRel) {
            tracing::debug!("simulated provider initialized");
        }
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProviderError::Unavailable(
                "simulated provider is closed".to_string(),
            ));
        }
        Ok(())
    }

    async fn generate_key(&self, size_bytes: usize, label: &str) -> Result<String, ProviderError> {
        self.ensure_open()?;
        let material = Self::random_material(size_bytes)?;
        let handle = self.insert(material, label);
        tracing::debug!(%handle, label, size_bytes, "simulated key generated");
        Ok(handle)
    }

    async fn encrypt(
        &self,
        handle: &str,
        plaintext: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError> {
        let key = self.subkey(handle, ENCRYPTION_INFO)?;
        let result = match mechanism {
            Mechanism::Aes256Gcm => seal_with::<Aes256Gcm>(key.as_ref(), plaintext),
            #[cfg(feature = "chacha")]
            Mechanism::ChaCha20Poly1305 => {
                seal_with::<chacha20poly1305::ChaCha20Poly1305>(key.as_ref(), plaintext)
            }
            other => Err(format!("mechanism {other} is not supported for encryption")),
        };
        result.map_err(ProviderError::EncryptionFailed)
    }

    async fn decrypt(
        &self,
        handle: &str,
        ciphertext: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError> {
        let key = self.subkey(handle, ENCRYPTION_INFO)?;
        let result = match mechanism {
            Mechanism::Aes256Gcm => open_with::<Aes256Gcm>(key.as_ref(), ciphertext),
            #[cfg(feature = "chacha")]
            Mechanism::ChaCha20Poly1305 => {
                open_with::<chacha20poly1305::ChaCha20Poly1305>(key.as_ref(), ciphertext)
            }
            other => Err(format!("mechanism {other} is not supported for decryption")),
        };
        result.map_err(ProviderError::DecryptionFailed)
    }

    async fn sign(
        &self,
        handle: &str,
        data: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError> {
        if mechanism != Mechanism::HmacSha256 {
            return Err(ProviderError::SigningFailed(format!(
                "mechanism {mechanism} is not supported for signing"
            )));
        }
        let key = self.subkey(handle, SIGNING_INFO)?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_ref())
            .map_err(|e| ProviderError::SigningFailed(e.to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    async fn verify(
        &self,
        handle: &str,
        data: &[u8],
        signature: &[u8],
        mechanism: Mechanism,
    ) -> Result<bool, ProviderError> {
        if mechanism != Mechanism::HmacSha256 {
            return Err(ProviderError::VerificationFailed(format!(
                "mechanism {mechanism} is not supported for verification"
            )));
        }
        let key = self.subkey(handle, SIGNING_INFO)?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_ref())
            .map_err(|e| ProviderError::VerificationFailed(e.to_string()))?;
        mac.update(data);
        // 常量时间比较
        Ok(mac.verify_slice(signature).is_ok())
    }

    async fn rotate_key(&self, handle: &str) -> Result<String, ProviderError> {
        self.ensure_open()?;
        let (size, label) = {
            let key = self
                .keys
                .get(handle)
                .ok_or_else(|| ProviderError::UnknownHandle(handle.to_string()))?;
            (key.material.len(), key.label.clone())
        };
        let material =
            Self::random_material(size).map_err(|e| ProviderError::RotationFailed(e.to_string()))?;
        let new_handle = self.insert(material, &label);
        tracing::debug!(old = handle, new = %new_handle, "simulated key rotated");
        Ok(new_handle)
    }

    async fn destroy_key(&self, handle: &str) -> Result<(), ProviderError> {
        self.ensure_open()?;
        self.keys
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| ProviderError::UnknownHandle(handle.to_string()))
    }

    async fn has_key(&self, handle: &str) -> Result<bool, ProviderError> {
        self.ensure_open()?;
        Ok(self.keys.contains_key(handle))
    }

    async fn close(&self) -> Result<(), ProviderError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.keys.clear();
            tracing::debug!("simulated provider closed");
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        let mut algorithms = vec!["AES", "HMAC"];
        if cfg!(feature = "chacha") {
            algorithms.push("CHACHA20");
        }
        Capabilities::new(algorithms, [16, 24, 32], 1024, 1024)
    }

    fn default_cipher(&self, key_algorithm: &str) -> Mechanism {
        if cfg!(feature = "chacha") && key_algorithm.eq_ignore_ascii_case("CHACHA20") {
            Mechanism::ChaCha20Poly1305
        } else {
            Mechanism::Aes256Gcm
        }
    }
}
