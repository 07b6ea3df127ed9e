//! PKCS#11 provider (hardware HSM or SoftHSM2) via `cryptoki`.
//!
//! One read-write session is opened against the configured slot and shared
//! behind a mutex. Keys are AES secret keys addressed by their label, which is
//! also the handle handed back to callers. All PKCS#11 calls are blocking and
//! run on tokio's blocking pool.

use super::{CryptoProvider, Mechanism, ProviderKind};
use crate::config::HardwareConfig;
use crate::device::Capabilities;
use crate::error::ProviderError;
use async_trait::async_trait;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as Pkcs11Error, RvError};
use cryptoki::mechanism::Mechanism as Pkcs11Mechanism;
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::{AuthPin, Ulong};
use rand_core::TryRngCore;
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const IV_SIZE: usize = 16;

struct ModuleSession {
    // Keeps the module loaded for as long as the session lives.
    _module: Pkcs11,
    session: Mutex<Session>,
}

impl ModuleSession {
    fn open(module_path: PathBuf, slot_index: usize, pin: String) -> Result<Self, ProviderError> {
        let module = Pkcs11::new(&module_path).map_err(|e| {
            ProviderError::Init(format!(
                "cannot load PKCS#11 module {}: {e}",
                module_path.display()
            ))
        })?;
        module
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| ProviderError::Init(format!("C_Initialize failed: {e}")))?;

        let slots = module
            .get_slots_with_token()
            .map_err(|e| ProviderError::Init(format!("cannot list slots: {e}")))?;
        let slot = slots.get(slot_index).copied().ok_or_else(|| {
            ProviderError::Init(format!(
                "slot index {slot_index} not available ({} slots with token)",
                slots.len()
            ))
        })?;

        let session = module
            .open_rw_session(slot)
            .map_err(|e| ProviderError::Init(format!("cannot open session: {e}")))?;
        session
            .login(UserType::User, Some(&AuthPin::new(pin.into())))
            .map_err(|e| ProviderError::Init(format!("login failed: {e}")))?;

        Ok(Self {
            _module: module,
            session: Mutex::new(session),
        })
    }
}

fn find_secret_key(session: &Session, label: &str) -> Result<ObjectHandle, ProviderError> {
    let template = vec![
        Attribute::Class(ObjectClass::SECRET_KEY),
        Attribute::Label(label.as_bytes().to_vec()),
    ];
    session
        .find_objects(&template)
        .map_err(|e| ProviderError::Unavailable(e.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::UnknownHandle(label.to_string()))
}

/// The label a handle was generated from: the handle minus its `-<uuid>`
/// suffix. Handles without one are returned unchanged.
fn base_label(handle: &str) -> &str {
    const SUFFIX_LEN: usize = 37;
    let Some(split) = handle.len().checked_sub(SUFFIX_LEN) else {
        return handle;
    };
    match (handle.get(..split), handle.get(split..)) {
        (Some(base), Some(suffix))
            if suffix.starts_with('-') && Uuid::parse_str(&suffix[1..]).is_ok() =>
        {
            base
        }
        _ => handle,
    }
}

fn secret_key_template(label: &str, size_bytes: usize) -> Vec<Attribute> {
    vec![
        Attribute::Class(ObjectClass::SECRET_KEY),
        Attribute::KeyType(KeyType::AES),
        Attribute::ValueLen(Ulong::from(size_bytes as u64)),
        Attribute::Label(label.as_bytes().to_vec()),
        Attribute::Token(true),
        Attribute::Private(true),
        Attribute::Sensitive(true),
        Attribute::Extractable(false),
        Attribute::Encrypt(true),
        Attribute::Decrypt(true),
        Attribute::Sign(true),
        Attribute::Verify(true),
    ]
}

fn random_iv() -> Result<[u8; IV_SIZE], String> {
    let mut iv = [0u8; IV_SIZE];
    rand_core::OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| e.to_string())?;
    Ok(iv)
}

/// Provider that delegates to a PKCS#11 module.
pub struct Pkcs11Provider {
    config: HardwareConfig,
    inner: Mutex<Option<Arc<ModuleSession>>>,
}

impl std::fmt::Debug for Pkcs11Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs11Provider")
            .field("module_path", &self.config.module_path)
            .field("slot", &self.config.slot)
            .finish_non_exhaustive()
    }
}

impl Pkcs11Provider {
    /// Builds an uninitialized provider. Fails when module path, slot or PIN
    /// is missing from `config`.
    pub fn new(config: HardwareConfig) -> Result<Self, ProviderError> {
        if config.module_path.is_none() {
            return Err(ProviderError::Init("PKCS#11 module path is not configured".into()));
        }
        if config.slot.is_none() {
            return Err(ProviderError::Init("PKCS#11 slot is not configured".into()));
        }
        if config.pin.is_none() {
            return Err(ProviderError::Init("PKCS#11 PIN is not configured".into()));
        }
        Ok(Self {
            config,
            inner: Mutex::new(None),
        })
    }

    fn session(&self) -> Result<Arc<ModuleSession>, ProviderError> {
        self.inner
            .lock()
            .map_err(|_| ProviderError::Unavailable("provider state lock poisoned".into()))?
            .clone()
            .ok_or(ProviderError::Closed)
    }

    /// Runs `f` against the shared session on the blocking pool.
    async fn with_session<T, F>(&self, f: F) -> Result<T, ProviderError>
    where
        F: FnOnce(&Session) -> Result<T, ProviderError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.session()?;
        tokio::task::spawn_blocking(move || {
            let session = inner
                .session
                .lock()
                .map_err(|_| ProviderError::Unavailable("session lock poisoned".into()))?;
            f(&session)
        })
        .await
        .map_err(|e| ProviderError::Unavailable(format!("PKCS#11 task failed: {e}")))?
    }
}

#[async_trait]
impl CryptoProvider for Pkcs11Provider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Hardware
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        if self.session().is_ok() {
            return Ok(());
        }
        let module_path = self
            .config
            .module_path
            .clone()
            .ok_or_else(|| ProviderError::Init("PKCS#11 module path is not configured".into()))?;
        let slot = self
            .config
            .slot
            .ok_or_else(|| ProviderError::Init("PKCS#11 slot is not configured".into()))?;
        let pin = self
            .config
            .pin
            .as_ref()
            .map(|p| p.expose_secret().to_string())
            .ok_or_else(|| ProviderError::Init("PKCS#11 PIN is not configured".into()))?;

        let opened = tokio::task::spawn_blocking(move || ModuleSession::open(module_path, slot, pin))
            .await
            .map_err(|e| ProviderError::Init(format!("PKCS#11 task failed: {e}")))??;

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ProviderError::Init("provider state lock poisoned".into()))?;
        *inner = Some(Arc::new(opened));
        tracing::info!(slot, "PKCS#11 session opened");
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        let inner = self
            .session()
            .map_err(|_| ProviderError::Unavailable("PKCS#11 session is not open".into()))?;
        tokio::task::spawn_blocking(move || {
            let session = inner
                .session
                .lock()
                .map_err(|_| ProviderError::Unavailable("session lock poisoned".into()))?;
            session
                .get_session_info()
                .map(|_| ())
                .map_err(|e| ProviderError::Unavailable(e.to_string()))
        })
        .await
        .map_err(|e| ProviderError::Unavailable(e.to_string()))?
    }

    async fn generate_key(&self, size_bytes: usize, label: &str) -> Result<String, ProviderError> {
        let handle = format!("{label}-{}", Uuid::new_v4());
        let object_label = handle.clone();
        self.with_session(move |session| {
            session
                .generate_key(
                    &Pkcs11Mechanism::AesKeyGen,
                    &secret_key_template(&object_label, size_bytes),
                )
                .map(|_| ())
                .map_err(|e| ProviderError::KeyGeneration(e.to_string()))
        })
        .await?;
        Ok(handle)
    }

    async fn encrypt(
        &self,
        handle: &str,
        plaintext: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError> {
        if mechanism != Mechanism::AesCbcPad {
            return Err(ProviderError::EncryptionFailed(format!(
                "mechanism {mechanism} is not supported by the PKCS#11 provider"
            )));
        }
        let label = handle.to_string();
        let plaintext = plaintext.to_vec();
        self.with_session(move |session| {
            let key = find_secret_key(session, &label)?;
            let iv = random_iv().map_err(ProviderError::EncryptionFailed)?;
            let body = session
                .encrypt(&Pkcs11Mechanism::AesCbcPad(iv), key, &plaintext)
                .map_err(|e| ProviderError::EncryptionFailed(e.to_string()))?;
            let mut output = Vec::with_capacity(IV_SIZE + body.len());
            output.extend_from_slice(&iv);
            output.extend_from_slice(&body);
            Ok(output)
        })
        .await
    }

    async fn decrypt(
        &self,
        handle: &str,
        ciphertext: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError> {
        if mechanism != Mechanism::AesCbcPad {
            return Err(ProviderError::DecryptionFailed(format!(
                "mechanism {mechanism} is not supported by the PKCS#11 provider"
            )));
        }
        if ciphertext.len() <= IV_SIZE {
            return Err(ProviderError::DecryptionFailed("ciphertext is too short".into()));
        }
        let label = handle.to_string();
        let ciphertext = ciphertext.to_vec();
        self.with_session(move |session| {
            let key = find_secret_key(session, &label)?;
            let (iv, body) = ciphertext.split_at(IV_SIZE);
            let mut iv_block = [0u8; IV_SIZE];
            iv_block.copy_from_slice(iv);
            session
                .decrypt(&Pkcs11Mechanism::AesCbcPad(iv_block), key, body)
                .map_err(|e| ProviderError::DecryptionFailed(e.to_string()))
        })
        .await
    }

    async fn sign(
        &self,
        handle: &str,
        data: &[u8],
        mechanism: Mechanism,
    ) -> Result<Vec<u8>, ProviderError> {
        if mechanism != Mechanism::HmacSha256 {
            return Err(ProviderError::SigningFailed(format!(
                "mechanism {mechanism} is not supported by the PKCS#11 provider"
            )));
        }
        let label = handle.to_string();
        let data = data.to_vec();
        self.with_session(move |session| {
            let key = find_secret_key(session, &label)?;
            session
                .sign(&Pkcs11Mechanism::Sha256Hmac, key, &data)
                .map_err(|e| ProviderError::SigningFailed(e.to_string()))
        })
        .await
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
                "mechanism {mechanism} is not supported by the PKCS#11 provider"
            )));
        }
        let label = handle.to_string();
        let data = data.to_vec();
        let signature = signature.to_vec();
        self.with_session(move |session| {
            let key = find_secret_key(session, &label)?;
            match session.verify(&Pkcs11Mechanism::Sha256Hmac, key, &data, &signature) {
                Ok(()) => Ok(true),
                Err(Pkcs11Error::Pkcs11(RvError::SignatureInvalid | RvError::SignatureLenRange, ..)) => {
                    Ok(false)
                }
                Err(e) => Err(ProviderError::VerificationFailed(e.to_string())),
            }
        })
        .await
    }

    async fn rotate_key(&self, handle: &str) -> Result<String, ProviderError> {
        let label = handle.to_string();
        let size = self
            .with_session(move |session| {
                let key = find_secret_key(session, &label)?;
                let attributes = session
                    .get_attributes(key, &[AttributeType::ValueLen])
                    .map_err(|e| ProviderError::RotationFailed(e.to_string()))?;
                attributes
                    .iter()
                    .find_map(|attribute| match attribute {
                        Attribute::ValueLen(len) => Some(u64::from(*len) as usize),
                        _ => None,
                    })
                    .ok_or_else(|| ProviderError::RotationFailed("key has no CKA_VALUE_LEN".into()))
            })
            .await?;

        self.generate_key(size, base_label(handle))
            .await
            .map_err(|e| ProviderError::RotationFailed(e.to_string()))
    }

    async fn destroy_key(&self, handle: &str) -> Result<(), ProviderError> {
        let label = handle.to_string();
        self.with_session(move |session| {
            let key = find_secret_key(session, &label)?;
            session
                .destroy_object(key)
                .map_err(|e| ProviderError::Unavailable(e.to_string()))
        })
        .await
    }

    async fn has_key(&self, handle: &str) -> Result<bool, ProviderError> {
        let label = handle.to_string();
        self.with_session(move |session| match find_secret_key(session, &label) {
            Ok(_) => Ok(true),
            Err(ProviderError::UnknownHandle(_)) => Ok(false),
            Err(e) => Err(e),
        })
        .await
    }

    async fn close(&self) -> Result<(), ProviderError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| ProviderError::Unavailable("provider state lock poisoned".into()))?
            .take();
        let Some(inner) = inner else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || {
            if let Ok(session) = inner.session.lock()
                && let Err(e) = session.logout()
            {
                tracing::warn!(error = %e, "PKCS#11 logout failed");
            }
            // Dropping the last reference closes the session and finalizes the module.
            drop(inner);
        })
        .await
        .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        tracing::info!("PKCS#11 session closed");
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new(["AES", "HMAC"], [16, 24, 32], 256, 256)
    }

    fn default_cipher(&self, _key_algorithm: &str) -> Mechanism {
        Mechanism::AesCbcPad
    }
}
