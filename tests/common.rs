//!
//! 集成测试的通用辅助函数
//!
#![allow(dead_code)]

use async_trait::async_trait;
use seal_hsm::device::{
    Capabilities, ConnectionParams, DeviceConfiguration, DeviceIdentity, DeviceSpec,
};
use seal_hsm::error::ProviderError;
use seal_hsm::provider::{CryptoProvider, Mechanism, ProviderKind, SimulatedProvider};
use seal_hsm::{HsmConfig, HsmService};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 一个描述完整、可直接注册的设备。
pub fn device_spec(serial: &str) -> DeviceSpec {
    DeviceSpec {
        identity: DeviceIdentity {
            name: format!("hsm-{serial}"),
            vendor: "Acme".to_string(),
            model: "Vault 9000".to_string(),
            serial_number: serial.to_string(),
            firmware_version: "2.1.0".to_string(),
        },
        configuration: DeviceConfiguration::default(),
        connection: ConnectionParams::new("hsm.internal", 1792),
        capabilities: None,
    }
}

/// 声明了能力的设备。
pub fn device_spec_with(serial: &str, capabilities: Capabilities) -> DeviceSpec {
    DeviceSpec {
        capabilities: Some(capabilities),
        ..device_spec(serial)
    }
}

/// 使用内存存储与模拟提供者的服务。
pub fn simulated_service() -> HsmService {
    HsmService::new(HsmConfig::simulated()).unwrap()
}

/// 包装模拟提供者并统计加解密/签名/验证调用次数。
#[derive(Debug, Default)]
pub struct CountingProvider {
    inner: SimulatedProvider,
    calls: AtomicUsize,
}

impl CountingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn crypto_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CryptoProvider for CountingProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Simulated
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        self.inner.initialize().await
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        self.inner.test_connection().await
    }

    async fn generate_key(&self, size_bytes: usize, label: &str) -> Result<String, ProviderError> {
        self.inner.generate_key(size_bytes, label).await
    }

    async fn encrypt(
        &self,
        handle: &str,
        plaintext: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError> {
        self.count();
        self.inner.encrypt(handle, plaintext, mechanism).await
    }

    async fn decrypt(
        &self,
        handle: &str,
        ciphertext: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError> {
        self.count();
        self.inner.decrypt(handle, ciphertext, mechanism).await
    }

    async fn sign(
        &self,
        handle: &str,
        data: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError> {
        self.count();
        self.inner.sign(handle, data, mechanism).await
    }

    async fn verify(
        &self,
        handle: &str,
        data: &[u8],
        signature: &[u8],
        mechanism: Mechanism,
    ) -> Result<bool, ProviderError> {
        self.count();
        self.inner.verify(handle, data, signature, mechanism).await
    }

    async fn rotate_key(&self, handle: &str) -> Result<String, ProviderError> {
        self.inner.rotate_key(handle).await
    }

    async fn destroy_key(&self, handle: &str) -> Result<(), ProviderError> {
        self.inner.destroy_key(handle).await
    }

    async fn has_key(&self, handle: &str) -> Result<bool, ProviderError> {
        self.inner.has_key(handle).await
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.inner.close().await
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn default_cipher(&self, key_algorithm: &str) -> Mechanism {
        self.inner.default_cipher(key_algorithm)
    }
}
