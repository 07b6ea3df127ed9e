//! # Seal-HSM: key management and audited crypto operations over HSMs
//!
//! `seal-hsm` orchestrates one or more cryptographic providers (an in-process
//! simulated provider, or a PKCS#11 module behind the `hardware` feature) and
//! manages the devices, keys, certificates, clusters and backups around them.
//! Every encrypt/decrypt/sign/verify call produces exactly one audit record.
//!
//! 中文: 基于 HSM 的密钥管理与可审计加密操作子系统。
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use seal_hsm::prelude::*;
//!
//! # async fn run() -> seal_hsm::Result<()> {
//! let service = HsmService::new(HsmConfig::simulated())?;
//! let device = service
//!     .register_device(DeviceSpec {
//!         identity: DeviceIdentity {
//!             name: "records-hsm".into(),
//!             vendor: "Acme".into(),
//!             model: "Vault 9000".into(),
//!             serial_number: "SN-0001".into(),
//!             firmware_version: "2.1.0".into(),
//!         },
//!         configuration: DeviceConfiguration::default(),
//!         connection: ConnectionParams::new("hsm.local", 1792),
//!         capabilities: Some(Capabilities::new(["AES"], [32], 16, 16)),
//!     })
//!     .await?;
//!
//! let key = service.generate_key(&device.id, KeySpec::aes(32)).await?;
//! let sealed = service.encrypt(&device.id, &key.id, b"hello", None).await?;
//! let opened = service.decrypt(&device.id, &key.id, &sealed.ciphertext, None).await?;
//! assert_eq!(opened.plaintext, b"hello");
//!
//! service.cleanup().await?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod certificate;
pub mod cluster;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod key;
pub mod operation;
pub mod provider;
pub mod scheduler;
pub mod service;
pub mod store;

pub use config::HsmConfig;
pub use error::{Error, Result};
pub use service::{HealthStatus, HsmService, HsmServiceBuilder};

/// The version of the `seal-hsm` crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// --- Prelude ---
// The types most callers need.
pub mod prelude {
    pub use crate::certificate::{CertificateSpec, CertificateStatus};
    pub use crate::cluster::{ClusterSpec, ClusterStatus, LoadBalancingPolicy, NodeRole, NodeSpec};
    pub use crate::config::{HsmConfig, ProviderMode};
    pub use crate::device::{
        Capabilities, ConnectionParams, DeviceConfiguration, DeviceIdentity, DeviceSpec,
        DeviceStatus,
    };
    pub use crate::error::{Error, Result};
    pub use crate::events::HsmEvent;
    pub use crate::key::{KeySpec, KeyState, KeyUsage};
    pub use crate::operation::OperationContext;
    pub use crate::provider::{CryptoProvider, Mechanism, ProviderKind};
    pub use crate::service::HsmService;
}
