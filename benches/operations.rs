use criterion::{criterion_group, criterion_main, Criterion};
use seal_hsm::device::{ConnectionParams, DeviceConfiguration, DeviceIdentity, DeviceSpec};
use seal_hsm::key::{KeySpec, KeyUsage};
use seal_hsm::{HsmConfig, HsmService};
use std::hint::black_box;
use tokio::runtime::Runtime;

fn setup(rt: &Runtime, usage: &[KeyUsage]) -> (HsmService, String, String) {
    rt.block_on(async {
        let service = HsmService::new(HsmConfig::simulated()).unwrap();
        let device = service
            .register_device(DeviceSpec {
                identity: DeviceIdentity {
                    name: "bench".to_string(),
                    vendor: "Acme".to_string(),
                    model: "Vault 9000".to_string(),
                    serial_number: "SN-BENCH".to_string(),
                    firmware_version: "1.0.0".to_string(),
                },
                configuration: DeviceConfiguration::default(),
                connection: ConnectionParams::new("localhost", 1792),
                capabilities: None,
            })
            .await
            .unwrap();
        let key = service
            .generate_key(&device.id, KeySpec::aes(32).with_usage(usage.iter().copied()))
            .await
            .unwrap();
        (service, device.id, key.id)
    })
}

fn bench_encrypt(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (service, device_id, key_id) = setup(&rt, &[KeyUsage::Encrypt, KeyUsage::Decrypt]);
    let data = vec![0u8; 1024];
    c.bench_function("simulated encrypt 1KB (audited)", |b| {
        b.to_async(&rt).iter(|| async {
            service
                .encrypt(&device_id, &key_id, black_box(&data), None)
                .await
                .unwrap()
        });
    });
}

fn bench_decrypt(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (service, device_id, key_id) = setup(&rt, &[KeyUsage::Encrypt, KeyUsage::Decrypt]);
    let data = vec![0u8; 1024];
    let sealed = rt
        .block_on(service.encrypt(&device_id, &key_id, &data, None))
        .unwrap();
    c.bench_function("simulated decrypt 1KB (audited)", |b| {
        b.to_async(&rt).iter(|| async {
            service
                .decrypt(&device_id, &key_id, black_box(&sealed.ciphertext), None)
                .await
                .unwrap()
        });
    });
}

fn bench_sign(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (service, device_id, key_id) = setup(&rt, &[KeyUsage::Sign, KeyUsage::Verify]);
    let data = vec![0u8; 1024];
    c.bench_function("simulated sign 1KB (audited)", |b| {
        b.to_async(&rt).iter(|| async {
            service
                .sign(&device_id, &key_id, black_box(&data), None)
                .await
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_encrypt, bench_decrypt, bench_sign);
criterion_main!(benches);
