//!
//! 生命周期集成测试
//!
//! 设备容量、密钥轮换、证书、集群拓扑、备份以及文件存储的持久化。
//!

mod common;

use chrono::{Duration, Utc};
use common::{device_spec, device_spec_with, simulated_service};
use seal_hsm::certificate::{CertificateSpec, CertificateStatus};
use seal_hsm::cluster::{ClusterSpec, ClusterStatus, LoadBalancingPolicy, NodeRole, NodeSpec, SyncStatus};
use seal_hsm::device::{Capabilities, DeviceStatus};
use seal_hsm::events::HsmEvent;
use seal_hsm::key::{KeySpec, KeyState};
use seal_hsm::operation::{OperationStatus, OperationType};
use seal_hsm::{HsmConfig, HsmService};
use tempfile::tempdir;

// === 设备能力与容量 ===

#[tokio::test]
async fn test_key_capacity_is_enforced() {
    let service = simulated_service();
    let device = service
        .register_device(device_spec_with("SN-CAP", Capabilities::new(["AES"], [32], 1, 1)))
        .await
        .unwrap();
    assert_eq!(device.status, DeviceStatus::Online);

    let first = service
        .generate_key(&device.id, KeySpec::aes(32))
        .await
        .unwrap();
    let err = service
        .generate_key(&device.id, KeySpec::aes(32))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STORAGE_EXCEEDED");

    // 销毁后释放槽位
    service
        .transition_key(&first.id, KeyState::Archived)
        .await
        .unwrap();
    service.destroy_key(&first.id).await.unwrap();
    service
        .generate_key(&device.id, KeySpec::aes(32))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unsupported_algorithm_and_size_are_rejected() {
    let service = simulated_service();
    let device = service
        .register_device(device_spec_with("SN-UNS", Capabilities::new(["AES"], [32], 8, 8)))
        .await
        .unwrap();

    let rsa = KeySpec {
        algorithm: "RSA".to_string(),
        ..KeySpec::aes(32)
    };
    let err = service.generate_key(&device.id, rsa).await.unwrap_err();
    assert_eq!(err.code(), "UNSUPPORTED_ALGORITHM");

    let err = service
        .generate_key(&device.id, KeySpec::aes(16))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNSUPPORTED_KEY_SIZE");

    // 失败的生成同样被审计
    let log = service.audit_log(Some(&device.id));
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|op| op.error_code.is_some()));
}

#[tokio::test]
async fn test_duplicate_serial_is_rejected() {
    let service = simulated_service();
    service.register_device(device_spec("SN-DUP")).await.unwrap();
    let err = service
        .register_device(device_spec("SN-DUP"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_DEVICE");
    assert_eq!(service.list_devices().len(), 1);
}

#[tokio::test]
async fn test_device_status_report() {
    let service = simulated_service();
    let device = service.register_device(device_spec("SN-REP")).await.unwrap();
    let key = service
        .generate_key(&device.id, KeySpec::aes(32))
        .await
        .unwrap();
    let session = service.open_session(&device.id, "ops").await.unwrap();
    for i in 0..12u8 {
        service
            .encrypt(&device.id, &key.id, &[i], None)
            .await
            .unwrap();
    }

    let report = service.get_device_status(&device.id).unwrap();
    assert_eq!(report.device.id, device.id);
    assert_eq!(report.keys.len(), 1);
    assert_eq!(report.sessions[0].id, session.id);
    // 只保留最近十条，最新的在前
    assert_eq!(report.recent_operations.len(), 10);
    assert!(report
        .recent_operations
        .windows(2)
        .all(|w| w[0].started_at >= w[1].started_at));

    let err = service.get_device_status("missing").unwrap_err();
    assert_eq!(err.code(), "DEVICE_NOT_FOUND");
}

// === 密钥轮换 ===

#[tokio::test]
async fn test_rotation_replaces_the_active_key() {
    let service = simulated_service();
    let device = service.register_device(device_spec("SN-ROT")).await.unwrap();
    let old = service
        .generate_key(&device.id, KeySpec::aes(32).with_label("payments"))
        .await
        .unwrap();
    let sealed = service
        .encrypt(&device.id, &old.id, b"before rotation", None)
        .await
        .unwrap();

    let new = service.rotate_key(&old.id).await.unwrap();
    assert_ne!(new.id, old.id);
    assert_eq!(new.rotated_from.as_deref(), Some(old.id.as_str()));
    assert_eq!(new.size, old.size);
    assert_eq!(new.label, "payments");
    assert_eq!(service.get_key(&old.id).unwrap().state, KeyState::Inactive);

    // 旧密钥不再可用，新密钥可用
    let err = service
        .decrypt(&device.id, &old.id, &sealed.ciphertext, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "KEY_NOT_ACTIVE");
    service
        .encrypt(&device.id, &new.id, b"after rotation", None)
        .await
        .unwrap();

    // 只能轮换活动密钥
    let err = service.rotate_key(&old.id).await.unwrap_err();
    assert_eq!(err.code(), "KEY_NOT_ACTIVE");
}

// === 证书 ===

fn certificate(serial: &str, key_id: Option<String>) -> CertificateSpec {
    let now = Utc::now();
    CertificateSpec {
        subject: "CN=payments.internal".to_string(),
        issuer: "CN=Internal CA".to_string(),
        serial_number: serial.to_string(),
        not_before: now - Duration::days(1),
        not_after: now + Duration::days(365),
        private_key_id: key_id,
    }
}

#[tokio::test]
async fn test_certificate_import_and_lifecycle() {
    let service = simulated_service();
    let device = service
        .register_device(device_spec_with("SN-CERT", Capabilities::new(["AES"], [32], 4, 1)))
        .await
        .unwrap();
    let key = service
        .generate_key(&device.id, KeySpec::aes(32))
        .await
        .unwrap();

    let cert = service
        .import_certificate(&device.id, certificate("01", Some(key.id.clone())))
        .await
        .unwrap();
    assert_eq!(cert.status, CertificateStatus::Valid);

    // 证书槽位已满
    let err = service
        .import_certificate(&device.id, certificate("02", None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STORAGE_EXCEEDED");

    let revoked = service
        .set_certificate_status(&cert.id, CertificateStatus::Revoked)
        .unwrap();
    assert_eq!(revoked.status, CertificateStatus::Revoked);
    let err = service
        .set_certificate_status(&cert.id, CertificateStatus::Valid)
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_CERTIFICATE_TRANSITION");

    // 吊销后槽位释放；已过期的证书以 expired 状态导入
    let mut lapsed = certificate("03", None);
    lapsed.not_before = Utc::now() - Duration::days(30);
    lapsed.not_after = Utc::now() - Duration::days(1);
    let lapsed = service.import_certificate(&device.id, lapsed).await.unwrap();
    assert_eq!(lapsed.status, CertificateStatus::Expired);
}

#[tokio::test]
async fn test_certificate_rejects_foreign_key() {
    let service = simulated_service();
    let owner = service.register_device(device_spec("SN-CK1")).await.unwrap();
    let other = service.register_device(device_spec("SN-CK2")).await.unwrap();
    let key = service
        .generate_key(&owner.id, KeySpec::aes(32))
        .await
        .unwrap();

    let err = service
        .import_certificate(&other.id, certificate("10", Some(key.id)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "KEY_DEVICE_MISMATCH");
}

// === 集群 ===

#[tokio::test]
async fn test_cluster_topology_and_health() {
    let service = simulated_service();
    let a = service.register_device(device_spec("SN-CA")).await.unwrap();
    let b = service.register_device(device_spec("SN-CB")).await.unwrap();

    let err = service
        .create_cluster(ClusterSpec {
            name: "no-primary".to_string(),
            nodes: vec![
                NodeSpec::new(&a.id, NodeRole::Secondary),
                NodeSpec::new(&b.id, NodeRole::Secondary),
            ],
            policy: LoadBalancingPolicy::RoundRobin,
        })
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_CLUSTER_TOPOLOGY");

    let cluster = service
        .create_cluster(ClusterSpec {
            name: "payments".to_string(),
            nodes: vec![
                NodeSpec::new(&a.id, NodeRole::Primary),
                NodeSpec::new(&b.id, NodeRole::Secondary),
            ],
            policy: LoadBalancingPolicy::RoundRobin,
        })
        .unwrap();
    assert_eq!(cluster.status, ClusterStatus::Healthy);

    // 轮询依次选择两个节点
    let first = service.select_node(&cluster.id).unwrap();
    let second = service.select_node(&cluster.id).unwrap();
    assert_ne!(first.device_id, second.device_id);

    let degraded = service.update_node_health(&cluster.id, &b.id, 10).unwrap();
    assert_eq!(degraded.status, ClusterStatus::Degraded);
    for _ in 0..3 {
        assert_eq!(service.select_node(&cluster.id).unwrap().device_id, a.id);
    }

    let recovered = service.update_node_health(&cluster.id, &b.id, 90).unwrap();
    assert_eq!(recovered.status, ClusterStatus::Healthy);
    let out_of_sync = service
        .record_sync(&cluster.id, &b.id, SyncStatus::OutOfSync)
        .unwrap();
    assert_eq!(out_of_sync.status, ClusterStatus::Degraded);

    let failed = service.update_node_health(&cluster.id, &a.id, 0).unwrap();
    assert_eq!(failed.status, ClusterStatus::Failed);
    let err = service.select_node(&cluster.id).unwrap_err();
    assert_eq!(err.code(), "NO_AVAILABLE_NODE");

    let err = service.update_node_health(&cluster.id, &a.id, 101).unwrap_err();
    assert_eq!(err.code(), "INVALID_HEALTH_SCORE");
}

#[tokio::test]
async fn test_health_pass_folds_device_status_into_clusters() {
    let service = simulated_service();
    let a = service.register_device(device_spec("SN-HA")).await.unwrap();
    let b = service.register_device(device_spec("SN-HB")).await.unwrap();
    let cluster = service
        .create_cluster(ClusterSpec {
            name: "ha".to_string(),
            nodes: vec![
                NodeSpec::new(&a.id, NodeRole::Primary),
                NodeSpec::new(&b.id, NodeRole::Backup),
            ],
            policy: LoadBalancingPolicy::PrimaryOnly,
        })
        .unwrap();
    service.update_node_health(&cluster.id, &a.id, 0).unwrap();
    assert_eq!(service.get_cluster(&cluster.id).unwrap().status, ClusterStatus::Failed);

    // 探测成功后节点恢复
    service.run_health_checks().await;
    let cluster = service.get_cluster(&cluster.id).unwrap();
    assert_eq!(cluster.status, ClusterStatus::Healthy);
    assert_eq!(service.select_node(&cluster.id).unwrap().device_id, a.id);

    let health = service.health_status().await;
    assert!(health.healthy);
    assert_eq!(health.devices_online, 2);
    assert_eq!(health.clusters, 1);
}

#[tokio::test]
async fn test_health_pass_keeps_operator_offline() {
    let service = simulated_service();
    let device = service.register_device(device_spec("SN-OFF")).await.unwrap();
    service
        .set_device_status(&device.id, DeviceStatus::Offline)
        .unwrap();

    // 设备本身可达，但运维设置的离线状态必须保留
    service.run_health_checks().await;
    let status = service.get_device_status(&device.id).unwrap();
    assert_eq!(status.device.status, DeviceStatus::Offline);
    let err = service
        .generate_key(&device.id, KeySpec::aes(32))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "DEVICE_OFFLINE");

    // 运维恢复后健康检查照常进行
    service
        .set_device_status(&device.id, DeviceStatus::Online)
        .unwrap();
    service.run_health_checks().await;
    assert_eq!(
        service.get_device_status(&device.id).unwrap().device.status,
        DeviceStatus::Online
    );
}

// === 备份 ===

#[tokio::test]
async fn test_backup_checksum_verifies_and_excludes_handles() {
    let dir = tempdir().unwrap();
    let mut config = HsmConfig::simulated();
    config.storage.backup_dir = dir.path().to_path_buf();
    let service = HsmService::new(config).unwrap();

    let device = service.register_device(device_spec("SN-BAK")).await.unwrap();
    let key = service
        .generate_key(&device.id, KeySpec::aes(32))
        .await
        .unwrap();
    let cert = service
        .import_certificate(&device.id, certificate("20", Some(key.id.clone())))
        .await
        .unwrap();

    let backup = service.create_backup(&device.id).await.unwrap();
    assert!(backup.verified);
    assert_eq!(backup.key_count, 1);
    assert_eq!(backup.certificate_count, 1);
    assert_eq!(backup.checksum.len(), 64);
    assert!(backup.location.starts_with(dir.path()));

    let manifest = std::fs::read_to_string(&backup.location).unwrap();
    assert!(manifest.contains(&key.id));
    assert!(manifest.contains(&cert.id));
    assert!(!manifest.contains(&key.handle));

    // 篡改清单后校验失败
    std::fs::write(&backup.location, manifest.replace(&key.id, "tampered")).unwrap();
    assert!(!service.verify_backup(&backup.id).await.unwrap());
    assert_eq!(service.list_backups(&device.id).len(), 1);
}

// === 持久化 ===

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempdir().unwrap();
    let mut config = HsmConfig::simulated();
    config.storage.data_dir = Some(dir.path().join("data"));
    config.storage.backup_dir = dir.path().join("backups");

    let (device_id, key_id) = {
        let service = HsmService::new(config.clone()).unwrap();
        let device = service.register_device(device_spec("SN-PER")).await.unwrap();
        let key = service
            .generate_key(&device.id, KeySpec::aes(32))
            .await
            .unwrap();
        service.cleanup().await.unwrap();
        (device.id, key.id)
    };

    let reopened = HsmService::new(config).unwrap();
    let devices = reopened.list_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, device_id);
    assert_eq!(devices[0].identity.serial_number, "SN-PER");
    assert_eq!(reopened.get_key(&key_id).unwrap().device_id, device_id);

    // 审计序号在重启后继续递增
    let before = reopened.audit_log(None);
    let err = reopened
        .register_device(device_spec("SN-PER"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_DEVICE");
    let probe = reopened
        .generate_key(&device_id, KeySpec::aes(8))
        .await
        .unwrap_err();
    assert_eq!(probe.code(), "UNSUPPORTED_KEY_SIZE");
    let after = reopened.audit_log(None);
    assert_eq!(after.len(), before.len() + 1);
    assert!(after.last().unwrap().sequence > before.last().unwrap().sequence);
}

#[tokio::test]
async fn test_restart_deactivates_keys_without_material() {
    let dir = tempdir().unwrap();
    let mut config = HsmConfig::simulated();
    config.storage.data_dir = Some(dir.path().join("data"));
    config.storage.backup_dir = dir.path().join("backups");

    let (device_id, key_id) = {
        let service = HsmService::new(config.clone()).unwrap();
        service.start().await.unwrap();
        let device = service.register_device(device_spec("SN-RST")).await.unwrap();
        let key = service
            .generate_key(&device.id, KeySpec::aes(32))
            .await
            .unwrap();
        service.encrypt(&device.id, &key.id, b"before", None).await.unwrap();
        service.cleanup().await.unwrap();
        (device.id, key.id)
    };

    // 模拟提供者的密钥材料不会持久化，重启后记录仍在但句柄已失效
    let reopened = HsmService::new(config).unwrap();
    assert_eq!(reopened.get_key(&key_id).unwrap().state, KeyState::Active);
    let mut events = reopened.subscribe();
    reopened.start().await.unwrap();

    assert_eq!(reopened.get_key(&key_id).unwrap().state, KeyState::Inactive);
    let mut changed = false;
    while let Ok(event) = events.try_recv() {
        if let HsmEvent::KeyStateChanged { key_id: id, from, to } = event {
            assert_eq!(id, key_id);
            assert_eq!((from, to), (KeyState::Active, KeyState::Inactive));
            changed = true;
        }
    }
    assert!(changed);

    let audited = reopened
        .audit_log(Some(device_id.as_str()))
        .into_iter()
        .find(|o| o.operation_type == OperationType::ReconcileKey)
        .unwrap();
    assert_eq!(audited.key_id.as_deref(), Some(key_id.as_str()));
    assert_eq!(audited.status, OperationStatus::Failed);
    assert_eq!(audited.error_code.as_deref(), Some("KEY_MATERIAL_MISSING"));

    // 不再出现 UNKNOWN_KEY_HANDLE，而是明确的状态错误
    let err = reopened
        .encrypt(&device_id, &key_id, b"after", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "KEY_NOT_ACTIVE");

    // 设备仍可生成新密钥
    let fresh = reopened
        .generate_key(&device_id, KeySpec::aes(32))
        .await
        .unwrap();
    reopened.encrypt(&device_id, &fresh.id, b"after", None).await.unwrap();
    reopened.cleanup().await.unwrap();
}
