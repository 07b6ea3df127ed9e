//! Cryptographic provider abstraction.
//!
//! A [`CryptoProvider`] owns key material (or references to it, for a
//! hardware module) and performs the raw cryptographic work. Everything above
//! this layer deals only in opaque key handles.
//!
//! - [`simulated::SimulatedProvider`]: in-process keys, AEAD encryption and
//!   HMAC signatures. For development and tests.
//! - `pkcs11::Pkcs11Provider` (feature `hardware`): one PKCS#11 session
//!   against a configured module and slot.
//! - [`selector::ProviderSelector`]: resolves configuration to a provider,
//!   applying the strict/fallback policy.

pub mod selector;
pub mod simulated;

#[cfg(feature = "hardware")]
pub mod pkcs11;

pub use selector::{ActiveProvider, HardwareFactory, ProviderSelector};
pub use simulated::SimulatedProvider;

#[cfg(feature = "hardware")]
pub use pkcs11::Pkcs11Provider;

use crate::device::Capabilities;
use crate::error::{ProviderError, ValidationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

/// Which family of provider is serving requests.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Simulated,
    Hardware,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Simulated => f.write_str("simulated"),
            ProviderKind::Hardware => f.write_str("hardware"),
        }
    }
}

/// A concrete cryptographic mechanism requested for an operation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// AES-256-GCM, envelope `nonce ‖ tag ‖ ciphertext`.
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    /// ChaCha20-Poly1305, envelope `nonce ‖ tag ‖ ciphertext`.
    #[serde(rename = "CHACHA20-POLY1305")]
    ChaCha20Poly1305,
    /// AES-CBC with PKCS#7 padding, envelope `iv ‖ ciphertext`.
    #[serde(rename = "AES-CBC-PAD")]
    AesCbcPad,
    /// HMAC over SHA-256.
    #[serde(rename = "HMAC-SHA256")]
    HmacSha256,
}

impl Mechanism {
    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::Aes256Gcm => "AES-256-GCM",
            Mechanism::ChaCha20Poly1305 => "CHACHA20-POLY1305",
            Mechanism::AesCbcPad => "AES-CBC-PAD",
            Mechanism::HmacSha256 => "HMAC-SHA256",
        }
    }

    /// Whether this mechanism encrypts (as opposed to authenticates).
    pub fn is_cipher(&self) -> bool {
        !matches!(self, Mechanism::HmacSha256)
    }

    /// Layout of the bytes this mechanism produces.
    pub fn output_format(&self) -> &'static str {
        match self {
            Mechanism::Aes256Gcm | Mechanism::ChaCha20Poly1305 => "nonce||tag||ciphertext",
            Mechanism::AesCbcPad => "iv||ciphertext",
            Mechanism::HmacSha256 => "mac",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mechanism {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "AES-256-GCM" | "AES-GCM" | "AES256GCM" => Ok(Mechanism::Aes256Gcm),
            "CHACHA20-POLY1305" | "CHACHA20" => Ok(Mechanism::ChaCha20Poly1305),
            "AES-CBC-PAD" | "AES-CBC" => Ok(Mechanism::AesCbcPad),
            "HMAC-SHA256" | "HMAC" | "SHA256-HMAC" => Ok(Mechanism::HmacSha256),
            _ => Err(ValidationError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Uniform contract over software and hardware key stores.
///
/// Handles returned by [`CryptoProvider::generate_key`] are opaque strings that
/// only the issuing provider can resolve.
#[async_trait]
pub trait CryptoProvider: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProviderKind;

    /// Loads the module, opens sessions, logs in. Idempotent.
    async fn initialize(&self) -> Result<(), ProviderError>;

    /// Lightweight liveness probe.
    async fn test_connection(&self) -> Result<(), ProviderError>;

    /// Creates a secret key of `size_bytes` bytes and returns its handle.
    async fn generate_key(&self, size_bytes: usize, label: &str) -> Result<String, ProviderError>;

    async fn encrypt(
        &self,
        handle: &str,
        plaintext: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError>;

    async fn decrypt(
        &self,
        handle: &str,
        ciphertext: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError>;

    async fn sign(
        &self,
        handle: &str,
        data: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError>;

    /// `Ok(false)` means the signature does not match; `Err` means the
    /// provider could not perform the check.
    async fn verify(
        &self,
        handle: &str,
        data: &[u8],
        signature: &[u8],
        mechanism: Mechanism,
    ) -> Result<bool, ProviderError>;

    /// Creates a replacement key with the same size and label, returning the
    /// new handle. The old handle stays resolvable.
    async fn rotate_key(&self, handle: &str) -> Result<String, ProviderError>;

    async fn destroy_key(&self, handle: &str) -> Result<(), ProviderError>;

    /// Whether `handle` still resolves to key material. `Err` means the
    /// provider could not answer.
    async fn has_key(&self, handle: &str) -> Result<bool, ProviderError>;

    /// Releases sessions. Later calls fail with [`ProviderError::Closed`].
    async fn close(&self) -> Result<(), ProviderError>;

    /// What this provider can do when a device declares no capabilities.
    fn capabilities(&self) -> Capabilities;

    /// Cipher used when the caller names none, for keys of `key_algorithm`.
    fn default_cipher(&self, key_algorithm: &str) -> Mechanism;

    fn default_mac(&self) -> Mechanism {
        Mechanism::HmacSha256
    }
}

/// Runs a provider call under a deadline, mapping expiry to
/// [`ProviderError::Timeout`].
pub async fn with_timeout<T, F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout { operation, after }),
    }
}
