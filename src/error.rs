//! Defines the custom error types for the `seal-hsm` crate.
//!
//! Every error maps to a stable, caller-visible code through [`Error::code`].
//! Detail that should stay internal is logged, never carried in [`ErrorBody`].

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The main error type for the `seal-hsm` crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Malformed or out-of-range input. Always caller-fixable, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("session timeout must be positive")]
    InvalidSessionTimeout,

    #[error("session limit must be positive")]
    InvalidSessionLimit,

    #[error("endpoint must not be empty")]
    EmptyEndpoint,

    #[error("port {0} is outside 1..=65535")]
    InvalidPort(u32),

    #[error("a device with serial number {0} is already registered")]
    DuplicateDevice(String),

    #[error("algorithm {0} is not supported by the device")]
    UnsupportedAlgorithm(String),

    #[error("key size {0} bytes is not supported by the device")]
    UnsupportedKeySize(usize),

    #[error("device key storage is full ({capacity} slots)")]
    StorageExceeded { capacity: usize },

    #[error("device {device_id} is not online (status: {status})")]
    DeviceOffline { device_id: String, status: String },

    #[error("key {key_id} is not active (state: {state})")]
    KeyNotActive { key_id: String, state: String },

    #[error("key {key_id} is not authorized for {usage}")]
    KeyNotAuthorized { key_id: String, usage: String },

    #[error("key {key_id} does not belong to device {device_id}")]
    KeyDeviceMismatch { key_id: String, device_id: String },

    #[error("illegal key state transition from {from} to {to}")]
    InvalidKeyTransition { from: String, to: String },

    #[error("key {0} is not destroyable")]
    KeyNotDestroyable(String),

    #[error("illegal certificate status transition from {from} to {to}")]
    InvalidCertificateTransition { from: String, to: String },

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid cluster topology: {0}")]
    InvalidClusterTopology(String),

    #[error("device {device_id} has reached its session limit of {limit}")]
    SessionLimitExceeded { device_id: String, limit: u32 },

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("health score {0} is outside 0..=100")]
    InvalidHealthScore(u8),

    #[error("cluster {0} has no node available for selection")]
    NoAvailableNode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failures originating in a cryptographic provider.
///
/// These carry the provider's message and are surfaced to the caller as-is;
/// the crate never retries them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider initialization failed: {0}")]
    Init(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("key rotation failed: {0}")]
    RotationFailed(String),

    #[error("unknown key handle: {0}")]
    UnknownHandle(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("provider is closed")]
    Closed,
}

/// An unknown identifier. Terminal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("device {0}")]
    Device(String),

    #[error("key {0}")]
    Key(String),

    #[error("certificate {0}")]
    Certificate(String),

    #[error("cluster {0}")]
    Cluster(String),

    #[error("session {0}")]
    Session(String),

    #[error("backup {0}")]
    Backup(String),

    #[error("operation {0}")]
    Operation(String),

    #[error("cluster {cluster_id} has no node for device {device_id}")]
    ClusterNode {
        cluster_id: String,
        device_id: String,
    },
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("journal writer has stopped")]
    WriterStopped,
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(e) => e.code(),
            Error::Provider(e) => e.code(),
            Error::NotFound(e) => e.code(),
            Error::Store(_) => "STORE_ERROR",
        }
    }

    /// The caller-visible form of this error.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn is_provider(&self) -> bool {
        matches!(self, Error::Provider(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidSessionTimeout => "INVALID_SESSION_TIMEOUT",
            ValidationError::InvalidSessionLimit => "INVALID_SESSION_LIMIT",
            ValidationError::EmptyEndpoint => "EMPTY_ENDPOINT",
            ValidationError::InvalidPort(_) => "INVALID_PORT",
            ValidationError::DuplicateDevice(_) => "DUPLICATE_DEVICE",
            ValidationError::UnsupportedAlgorithm(_) => "UNSUPPORTED_ALGORITHM",
            ValidationError::UnsupportedKeySize(_) => "UNSUPPORTED_KEY_SIZE",
            ValidationError::StorageExceeded { .. } => "STORAGE_EXCEEDED",
            ValidationError::DeviceOffline { .. } => "DEVICE_OFFLINE",
            ValidationError::KeyNotActive { .. } => "KEY_NOT_ACTIVE",
            ValidationError::KeyNotAuthorized { .. } => "KEY_NOT_AUTHORIZED",
            ValidationError::KeyDeviceMismatch { .. } => "KEY_DEVICE_MISMATCH",
            ValidationError::InvalidKeyTransition { .. } => "INVALID_KEY_TRANSITION",
            ValidationError::KeyNotDestroyable(_) => "KEY_NOT_DESTROYABLE",
            ValidationError::InvalidCertificateTransition { .. } => {
                "INVALID_CERTIFICATE_TRANSITION"
            }
            ValidationError::InvalidCertificate(_) => "INVALID_CERTIFICATE",
            ValidationError::InvalidClusterTopology(_) => "INVALID_CLUSTER_TOPOLOGY",
            ValidationError::SessionLimitExceeded { .. } => "SESSION_LIMIT_EXCEEDED",
            ValidationError::SessionClosed(_) => "SESSION_CLOSED",
            ValidationError::InvalidHealthScore(_) => "INVALID_HEALTH_SCORE",
            ValidationError::NoAvailableNode(_) => "NO_AVAILABLE_NODE",
            ValidationError::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Init(_) => "PROVIDER_INIT_FAILED",
            ProviderError::Unavailable(_) => "PROVIDER_UNAVAILABLE",
            ProviderError::KeyGeneration(_) => "KEY_GENERATION_FAILED",
            ProviderError::EncryptionFailed(_) => "ENCRYPTION_FAILED",
            ProviderError::DecryptionFailed(_) => "DECRYPTION_FAILED",
            ProviderError::SigningFailed(_) => "SIGNING_FAILED",
            ProviderError::VerificationFailed(_) => "VERIFICATION_FAILED",
            ProviderError::RotationFailed(_) => "KEY_ROTATION_FAILED",
            ProviderError::UnknownHandle(_) => "UNKNOWN_KEY_HANDLE",
            ProviderError::Timeout { .. } => "PROVIDER_TIMEOUT",
            ProviderError::Closed => "PROVIDER_CLOSED",
        }
    }
}

impl NotFoundError {
    pub fn code(&self) -> &'static str {
        match self {
            NotFoundError::Device(_) => "DEVICE_NOT_FOUND",
            NotFoundError::Key(_) => "KEY_NOT_FOUND",
            NotFoundError::Certificate(_) => "CERTIFICATE_NOT_FOUND",
            NotFoundError::Cluster(_) => "CLUSTER_NOT_FOUND",
            NotFoundError::Session(_) => "SESSION_NOT_FOUND",
            NotFoundError::Backup(_) => "BACKUP_NOT_FOUND",
            NotFoundError::Operation(_) => "OPERATION_NOT_FOUND",
            NotFoundError::ClusterNode { .. } => "CLUSTER_NODE_NOT_FOUND",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Store(StoreError::Io(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Store(StoreError::Serialization(err))
    }
}

/// Error representation handed to external callers: a stable code plus a
/// human-readable message.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}
