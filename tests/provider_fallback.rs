//!
//! 提供者选择集成测试
//!
//! 验证严格模式与回退模式在硬件初始化失败时的行为。
//!

mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::device_spec;
use seal_hsm::config::{HardwareConfig, ProviderMode};
use seal_hsm::device::{Capabilities, Device, DeviceProbe, DeviceStatus, ProbeReport};
use seal_hsm::error::ProviderError;
use seal_hsm::events::HsmEvent;
use seal_hsm::key::{Key, KeySpec, KeyState, KeyType, KeyUsage};
use seal_hsm::operation::OperationStatus;
use seal_hsm::provider::{CryptoProvider, HardwareFactory, ProviderKind};
use seal_hsm::store::Store;
use seal_hsm::{HsmConfig, HsmService};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// 辅助函数：一个总是加载失败的硬件工厂，并记录调用次数
fn failing_factory(calls: Arc<AtomicUsize>) -> HardwareFactory {
    Arc::new(move |_: &HardwareConfig| -> Result<Arc<dyn CryptoProvider>, ProviderError> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Init("module not found".to_string()))
    })
}

// 设备连接检查总是成功，使请求能走到提供者解析这一步
#[derive(Debug)]
struct ReachableDevice;

#[async_trait]
impl DeviceProbe for ReachableDevice {
    async fn probe(&self, _: &Device) -> Result<ProbeReport, ProviderError> {
        Ok(ProbeReport {
            capabilities: Capabilities::new(["AES"], [32], 8, 8),
            latency: Duration::from_millis(1),
        })
    }
}

fn stored_key(device_id: &str) -> Key {
    let now = Utc::now();
    Key {
        id: "key-strict".to_string(),
        device_id: device_id.to_string(),
        handle: "hw:strict".to_string(),
        label: "strict".to_string(),
        algorithm: "AES".to_string(),
        size: 32,
        key_type: KeyType::Symmetric,
        usage: [KeyUsage::Encrypt, KeyUsage::Decrypt].into_iter().collect(),
        attributes: Default::default(),
        owner: Default::default(),
        state: KeyState::Active,
        created_at: now,
        activated_at: Some(now),
        state_changed_at: now,
        usage_count: 0,
        rotated_from: None,
    }
}

fn hardware_config(strict: bool) -> HsmConfig {
    HsmConfig {
        provider: ProviderMode::Hardware,
        strict,
        ..HsmConfig::simulated()
    }
}

#[tokio::test]
async fn test_lenient_mode_falls_back_to_simulated() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = HsmService::builder(hardware_config(false))
        .hardware_factory(failing_factory(calls.clone()))
        .build()
        .unwrap();
    let mut events = service.subscribe();

    service.start().await.unwrap();
    assert_eq!(service.provider_kind().await.unwrap(), ProviderKind::Simulated);

    match events.recv().await.unwrap() {
        HsmEvent::ProviderFallback { reason } => assert!(reason.contains("module not found")),
        other => panic!("unexpected event: {other:?}"),
    }

    let health = service.health_status().await;
    assert!(health.provider.fallback_reason.is_some());
    assert_eq!(health.provider.kind, Some(ProviderKind::Simulated));

    // 回退后照常工作
    let device = service.register_device(device_spec("SN-FB")).await.unwrap();
    let key = service
        .generate_key(&device.id, KeySpec::aes(32))
        .await
        .unwrap();
    let sealed = service
        .encrypt(&device.id, &key.id, b"hello", None)
        .await
        .unwrap();
    let opened = service
        .decrypt(&device.id, &key.id, &sealed.ciphertext, None)
        .await
        .unwrap();
    assert_eq!(opened.plaintext, b"hello");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_strict_mode_never_downgrades() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = HsmService::builder(hardware_config(true))
        .hardware_factory(failing_factory(calls.clone()))
        .build()
        .unwrap();

    let err = service.start().await.unwrap_err();
    assert_eq!(err.code(), "PROVIDER_INIT_FAILED");

    // 失败结果被缓存，之后的调用得到同样的错误
    let err = service.provider_kind().await.unwrap_err();
    assert_eq!(err.code(), "PROVIDER_INIT_FAILED");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let health = service.health_status().await;
    assert!(!health.healthy);
    assert_eq!(health.provider.kind, None);
    assert!(health.provider.error.is_some());
}

#[tokio::test]
async fn test_simulated_mode_ignores_hardware_factory() {
    let calls = Arc::new(AtomicUsize::new(0));
    let service = HsmService::builder(HsmConfig::simulated())
        .hardware_factory(failing_factory(calls.clone()))
        .build()
        .unwrap();

    service.start().await.unwrap();
    assert_eq!(service.provider_kind().await.unwrap(), ProviderKind::Simulated);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    service.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_strict_mode_fails_crypto_calls_without_simulated_fallback() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(Store::memory());
    let service = HsmService::builder(hardware_config(true))
        .store(store.clone())
        .hardware_factory(failing_factory(calls.clone()))
        .probe(Arc::new(ReachableDevice))
        .build()
        .unwrap();
    let mut events = service.subscribe();

    let device = service.register_device(device_spec("SN-STRICT")).await.unwrap();
    assert_eq!(device.status, DeviceStatus::Online);

    let err = service
        .generate_key(&device.id, KeySpec::aes(32))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PROVIDER_INIT_FAILED");
    assert!(service.list_keys(&device.id).is_empty());

    let key = stored_key(&device.id);
    store.keys.insert(key.clone()).unwrap();
    let err = service
        .encrypt(&device.id, &key.id, b"secret", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PROVIDER_INIT_FAILED");
    assert_eq!(service.get_key(&key.id).unwrap().usage_count, 0);

    // 两次请求都被审计为失败
    let log = service.audit_log(Some(device.id.as_str()));
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|o| o.status == OperationStatus::Failed));

    // 工厂只被调用一次，且从未降级到模拟提供者
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(service.provider_kind().await.is_err());
    assert_eq!(service.health_status().await.provider.kind, None);
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, HsmEvent::ProviderFallback { .. }),
            "strict mode fell back: {event:?}"
        );
    }
}
