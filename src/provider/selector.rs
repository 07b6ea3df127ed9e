//! Resolves configuration to a live provider.
//!
//! 中文: 根据配置解析出可用的加密提供者，并执行严格/回退策略。
//!
//! Resolution happens once, on first use. In hardware mode a failed module
//! load, initialization or connection test either falls back to the simulated
//! provider (lenient) or is cached and returned to every caller (strict).

use super::{with_timeout, CryptoProvider, ProviderKind, SimulatedProvider};
use crate::config::{HardwareConfig, HsmConfig, ProviderMode, TimeoutConfig};
use crate::error::ProviderError;
use crate::events::{EventBus, HsmEvent};
use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Builds a hardware provider from its configuration. Injectable so callers
/// can substitute their own module bindings.
pub type HardwareFactory =
    Arc<dyn Fn(&HardwareConfig) -> Result<Arc<dyn CryptoProvider>, ProviderError> + Send + Sync>;

/// The provider currently serving requests.
#[derive(Debug)]
pub struct ActiveProvider {
    pub provider: Arc<dyn CryptoProvider>,
    pub kind: ProviderKind,
    /// Why hardware was abandoned, when a fallback happened.
    pub fallback_reason: Option<String>,
}

/// Snapshot of the selector for health reporting.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ProviderStatus {
    pub mode: ProviderMode,
    pub strict: bool,
    pub initialized: bool,
    pub kind: Option<ProviderKind>,
    pub fallback_reason: Option<String>,
    pub error: Option<String>,
}

pub struct ProviderSelector {
    mode: ProviderMode,
    strict: bool,
    hardware: HardwareConfig,
    timeouts: TimeoutConfig,
    factory: HardwareFactory,
    fixed: Option<Arc<dyn CryptoProvider>>,
    events: Option<EventBus>,
    resolved: OnceCell<Result<Arc<ActiveProvider>, ProviderError>>,
    active: ArcSwapOption<ActiveProvider>,
}

impl std::fmt::Debug for ProviderSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSelector")
            .field("mode", &self.mode)
            .field("strict", &self.strict)
            .field("initialized", &self.resolved.initialized())
            .finish_non_exhaustive()
    }
}

fn default_hardware_factory() -> HardwareFactory {
    Arc::new(|config: &HardwareConfig| -> Result<Arc<dyn CryptoProvider>, ProviderError> {
        #[cfg(feature = "hardware")]
        {
            let provider = super::Pkcs11Provider::new(config.clone())?;
            Ok(Arc::new(provider) as Arc<dyn CryptoProvider>)
        }
        #[cfg(not(feature = "hardware"))]
        {
            let _ = config;
            Err(ProviderError::Init(
                "hardware support is not compiled in (enable the `hardware` feature)".to_string(),
            ))
        }
    })
}

impl ProviderSelector {
    pub fn new(config: &HsmConfig) -> Self {
        Self {
            mode: config.provider,
            strict: config.strict,
            hardware: config.hardware.clone(),
            timeouts: config.timeouts.clone(),
            factory: default_hardware_factory(),
            fixed: None,
            events: None,
            resolved: OnceCell::new(),
            active: ArcSwapOption::empty(),
        }
    }

    /// Always serves `provider`, regardless of mode.
    pub fn fixed(provider: Arc<dyn CryptoProvider>) -> Self {
        let mut selector = Self::new(&HsmConfig::simulated());
        selector.mode = match provider.kind() {
            ProviderKind::Simulated => ProviderMode::Simulated,
            ProviderKind::Hardware => ProviderMode::Hardware,
        };
        selector.fixed = Some(provider);
        selector
    }

    pub fn with_hardware_factory(mut self, factory: HardwareFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// The active provider, resolving it on first call.
    pub async fn provider(&self) -> Result<Arc<dyn CryptoProvider>, ProviderError> {
        self.active().await.map(|active| active.provider.clone())
    }

    pub async fn active(&self) -> Result<Arc<ActiveProvider>, ProviderError> {
        self.resolved
            .get_or_init(|| self.resolve())
            .await
            .clone()
    }

    /// Non-blocking view of the resolution outcome so far.
    pub fn status(&self) -> ProviderStatus {
        let active = self.active.load_full();
        ProviderStatus {
            mode: self.mode,
            strict: self.strict,
            initialized: self.resolved.initialized(),
            kind: active.as_ref().map(|a| a.kind),
            fallback_reason: active.as_ref().and_then(|a| a.fallback_reason.clone()),
            error: self
                .resolved
                .get()
                .and_then(|r| r.as_ref().err().map(|e| e.to_string())),
        }
    }

    /// Releases the active provider's sessions.
    pub async fn close(&self) -> Result<(), ProviderError> {
        match self.active.swap(None) {
            Some(active) => {
                tracing::info!(kind = %active.kind, "closing crypto provider");
                active.provider.close().await
            }
            None => Ok(()),
        }
    }

    async fn resolve(&self) -> Result<Arc<ActiveProvider>, ProviderError> {
        let active = match (&self.fixed, self.mode) {
            (Some(provider), _) => {
                provider.initialize().await?;
                ActiveProvider {
                    provider: provider.clone(),
                    kind: provider.kind(),
                    fallback_reason: None,
                }
            }
            (None, ProviderMode::Simulated) => self.simulated(None).await?,
            (None, ProviderMode::Hardware) => match self.hardware().await {
                Ok(provider) => ActiveProvider {
                    provider,
                    kind: ProviderKind::Hardware,
                    fallback_reason: None,
                },
                Err(e) if self.strict => {
                    tracing::error!(error = %e, "hardware provider unavailable and strict mode is set");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "hardware provider unavailable, falling back to simulated provider"
                    );
                    if let Some(events) = &self.events {
                        events.publish(HsmEvent::ProviderFallback {
                            reason: e.to_string(),
                        });
                    }
                    self.simulated(Some(e.to_string())).await?
                }
            },
        };

        tracing::info!(kind = %active.kind, fallback = active.fallback_reason.is_some(), "crypto provider ready");
        let active = Arc::new(active);
        self.active.store(Some(active.clone()));
        Ok(active)
    }

    async fn simulated(&self, fallback_reason: Option<String>) -> Result<ActiveProvider, ProviderError> {
        let provider = Arc::new(SimulatedProvider::new());
        provider.initialize().await?;
        Ok(ActiveProvider {
            provider,
            kind: ProviderKind::Simulated,
            fallback_reason,
        })
    }

    async fn hardware(&self) -> Result<Arc<dyn CryptoProvider>, ProviderError> {
        let provider = (self.factory)(&self.hardware)?;

        let initialized = with_timeout("initialize", self.timeouts.connection(), provider.initialize())
            .await
            .map_err(|e| match e {
                ProviderError::Timeout { .. } => ProviderError::Init(e.to_string()),
                other => other,
            });
        if let Err(e) = initialized {
            Self::discard(provider.as_ref()).await;
            return Err(e);
        }

        let tested = with_timeout(
            "test_connection",
            self.timeouts.connection(),
            provider.test_connection(),
        )
        .await;
        if let Err(e) = tested {
            Self::discard(provider.as_ref()).await;
            return Err(match e {
                ProviderError::Unavailable(_) => e,
                other => ProviderError::Unavailable(other.to_string()),
            });
        }

        Ok(provider)
    }

    async fn discard(provider: &dyn CryptoProvider) {
        if let Err(e) = provider.close().await {
            tracing::debug!(error = %e, "closing failed hardware provider");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Capabilities;
    use crate::provider::Mechanism;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Loads fine but never answers a connection test.
    #[derive(Debug, Default)]
    struct DeadModule {
        closed: AtomicBool,
    }

    #[async_trait]
    impl CryptoProvider for DeadModule {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Hardware
        }
        async fn initialize(&self) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn test_connection(&self) -> Result<(), ProviderError> {
            Err(ProviderError::Unavailable("token removed".into()))
        }
        async fn generate_key(&self, _: usize, _: &str) -> Result<String, ProviderError> {
            Err(ProviderError::KeyGeneration("dead".into()))
        }
        async fn encrypt(&self, _: &str, _: &[u8], _: Mechanism) -> Result<Vec<u8>, ProviderError> {
            Err(ProviderError::EncryptionFailed("dead".into()))
        }
        async fn decrypt(&self, _: &str, _: &[u8], _: Mechanism) -> Result<Vec<u8>, ProviderError> {
            Err(ProviderError::DecryptionFailed("dead".into()))
        }
        async fn sign(&self, _: &str, _: &[u8], _: Mechanism) -> Result<Vec<u8>, ProviderError> {
            Err(ProviderError::SigningFailed("dead".into()))
        }
        async fn verify(&self, _: &str, _: &[u8], _: &[u8], _: Mechanism) -> Result<bool, ProviderError> {
            Err(ProviderError::VerificationFailed("dead".into()))
        }
        async fn rotate_key(&self, _: &str) -> Result<String, ProviderError> {
            Err(ProviderError::RotationFailed("dead".into()))
        }
        async fn destroy_key(&self, _: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn has_key(&self, _: &str) -> Result<bool, ProviderError> {
            Err(ProviderError::Unavailable("token removed".into()))
        }
        async fn close(&self) -> Result<(), ProviderError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::new(["AES"], [32], 1, 1)
        }
        fn default_cipher(&self, _: &str) -> Mechanism {
            Mechanism::AesCbcPad
        }
    }

    fn hardware_config(strict: bool) -> HsmConfig {
        HsmConfig {
            provider: ProviderMode::Hardware,
            strict,
            ..HsmConfig::simulated()
        }
    }

    fn missing_module() -> HardwareFactory {
        Arc::new(|_: &HardwareConfig| -> Result<Arc<dyn CryptoProvider>, ProviderError> {
            Err(ProviderError::Init("libsofthsm2.so not found".into()))
        })
    }

    #[tokio::test]
    async fn simulated_mode_needs_no_hardware() {
        let selector = ProviderSelector::new(&HsmConfig::simulated());
        let active = selector.active().await.unwrap();
        assert_eq!(active.kind, ProviderKind::Simulated);
        assert!(active.fallback_reason.is_none());
    }

    #[tokio::test]
    async fn lenient_mode_falls_back_and_reports_it() {
        let events = EventBus::new(4);
        let mut rx = events.subscribe();
        let selector = ProviderSelector::new(&hardware_config(false))
            .with_hardware_factory(missing_module())
            .with_events(events);

        let active = selector.active().await.unwrap();
        assert_eq!(active.kind, ProviderKind::Simulated);
        assert!(active.fallback_reason.as_deref().unwrap().contains("libsofthsm2.so"));
        assert!(matches!(rx.recv().await.unwrap(), HsmEvent::ProviderFallback { .. }));

        let status = selector.status();
        assert_eq!(status.kind, Some(ProviderKind::Simulated));
        assert!(status.fallback_reason.is_some());
    }

    #[tokio::test]
    async fn strict_mode_never_downgrades() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory: HardwareFactory = Arc::new(move |_: &HardwareConfig| -> Result<Arc<dyn CryptoProvider>, ProviderError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Init("libsofthsm2.so not found".into()))
        });
        let selector = ProviderSelector::new(&hardware_config(true)).with_hardware_factory(factory);

        assert!(matches!(selector.provider().await, Err(ProviderError::Init(_))));
        assert!(matches!(selector.provider().await, Err(ProviderError::Init(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let status = selector.status();
        assert!(status.kind.is_none());
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn failed_connection_test_closes_module() {
        let module = Arc::new(DeadModule::default());
        let handle = module.clone();
        let factory: HardwareFactory =
            Arc::new(move |_: &HardwareConfig| -> Result<Arc<dyn CryptoProvider>, ProviderError> {
                Ok(handle.clone() as Arc<dyn CryptoProvider>)
            });

        let selector = ProviderSelector::new(&hardware_config(true)).with_hardware_factory(factory);
        assert!(matches!(selector.provider().await, Err(ProviderError::Unavailable(_))));
        assert!(module.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fixed_provider_is_served_as_is() {
        let selector = ProviderSelector::fixed(Arc::new(SimulatedProvider::new()));
        let provider = selector.provider().await.unwrap();
        assert_eq!(provider.kind(), ProviderKind::Simulated);
        selector.close().await.unwrap();
        assert!(selector.status().kind.is_none());
    }
}
