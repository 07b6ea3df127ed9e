//!
//! # 操作执行与审计
//!
//! Runs encrypt/decrypt/sign/verify against a device + key and records every
//! invocation, successful or not, as exactly one [`Operation`].
//!
//! Records are written in `processing` when the invocation starts and
//! finalized once. Finalization assigns a monotonically increasing sequence
//! number, so the audit log orders records by completion.
//!
use crate::config::TimeoutConfig;
use crate::device::DeviceRegistry;
use crate::error::{Error, NotFoundError, Result, ValidationError};
use crate::events::{EventBus, HsmEvent};
use crate::key::{Key, KeyRegistry, KeyUsage};
use crate::provider::{with_timeout, CryptoProvider, Mechanism, ProviderSelector};
use crate::store::{Record, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    GenerateKey,
    /// Start-up check that a stored key still resolves on the provider.
    ReconcileKey,
}

impl OperationType {
    /// The key usage an operation of this type needs.
    pub fn required_usage(self) -> Option<KeyUsage> {
        match self {
            OperationType::Encrypt => Some(KeyUsage::Encrypt),
            OperationType::Decrypt => Some(KeyUsage::Decrypt),
            OperationType::Sign => Some(KeyUsage::Sign),
            OperationType::Verify => Some(KeyUsage::Verify),
            OperationType::GenerateKey | OperationType::ReconcileKey => None,
        }
    }

    pub fn is_cipher(self) -> bool {
        matches!(self, OperationType::Encrypt | OperationType::Decrypt)
    }

    /// Code recorded when the provider fails this operation.
    pub fn failure_code(self) -> &'static str {
        match self {
            OperationType::Encrypt => "ENCRYPTION_FAILED",
            OperationType::Decrypt => "DECRYPTION_FAILED",
            OperationType::Sign => "SIGNING_FAILED",
            OperationType::Verify => "VERIFICATION_FAILED",
            OperationType::GenerateKey => "KEY_GENERATION_FAILED",
            OperationType::ReconcileKey => "KEY_MATERIAL_MISSING",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationType::Encrypt => "encrypt",
            OperationType::Decrypt => "decrypt",
            OperationType::Sign => "sign",
            OperationType::Verify => "verify",
            OperationType::GenerateKey => "generate_key",
            OperationType::ReconcileKey => "reconcile_key",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// Audit record of one invocation. Holds sizes, never payloads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub id: String,
    pub operation_type: OperationType,
    pub device_id: String,
    pub key_id: Option<String>,
    pub algorithm: Option<String>,
    pub input_size: usize,
    pub output_size: Option<usize>,
    pub output_format: Option<String>,
    pub status: OperationStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub actor: Option<String>,
    pub session_id: Option<String>,
    /// Position in the audit log, assigned at finalization.
    pub sequence: Option<u64>,
}

impl Record for Operation {
    const TABLE: &'static str = "operations";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Who is asking, for the audit log.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationContext {
    pub actor: Option<String>,
    /// When set, the session must be open on the target device.
    pub session_id: Option<String>,
}

impl OperationContext {
    pub fn actor(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// An operation that has started but not been finalized.
#[derive(Debug)]
#[must_use = "an operation must be completed or failed"]
pub struct PendingOperation {
    record: Operation,
    started: Instant,
}

impl PendingOperation {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub(crate) fn set_key(&mut self, key_id: &str) {
        self.record.key_id = Some(key_id.to_string());
    }

    pub(crate) fn set_algorithm(&mut self, algorithm: &str) {
        self.record.algorithm = Some(algorithm.to_string());
    }
}

/// Append-ordered log of [`Operation`]s.
#[derive(Debug)]
pub struct AuditTrail {
    store: Arc<Store>,
    events: EventBus,
    sequence: Mutex<u64>,
}

impl AuditTrail {
    pub fn new(store: Arc<Store>, events: EventBus) -> Self {
        let last = store
            .operations
            .values()
            .iter()
            .filter_map(|o| o.sequence)
            .max()
            .unwrap_or(0);
        Self {
            store,
            events,
            sequence: Mutex::new(last),
        }
    }

    /// Persists a `processing` record.
    pub fn begin(
        &self,
        operation_type: OperationType,
        device_id: &str,
        key_id: Option<&str>,
        algorithm: Option<String>,
        input_size: usize,
        context: &OperationContext,
    ) -> Result<PendingOperation> {
        let record = Operation {
            id: Uuid::new_v4().to_string(),
            operation_type,
            device_id: device_id.to_string(),
            key_id: key_id.map(str::to_string),
            algorithm,
            input_size,
            output_size: None,
            output_format: None,
            status: OperationStatus::Processing,
            error_code: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            actor: context.actor.clone(),
            session_id: context.session_id.clone(),
            sequence: None,
        };
        self.store.operations.insert(record.clone())?;
        Ok(PendingOperation {
            record,
            started: Instant::now(),
        })
    }

    pub fn complete(
        &self,
        pending: PendingOperation,
        output_size: usize,
        output_format: &str,
    ) -> Result<Operation> {
        let PendingOperation { mut record, started } = pending;
        record.status = OperationStatus::Completed;
        record.output_size = Some(output_size);
        record.output_format = Some(output_format.to_string());
        self.finalize(record, started)
    }

    /// Provider failures are recorded under the operation's own failure code;
    /// everything else under the error's code.
    pub fn fail(&self, pending: PendingOperation, error: &Error) -> Result<Operation> {
        let PendingOperation { mut record, started } = pending;
        let code = match error {
            Error::Provider(_) => record.operation_type.failure_code(),
            other => other.code(),
        };
        record.status = OperationStatus::Failed;
        record.error_code = Some(code.to_string());
        record.error_message = Some(error.to_string());
        let record = self.finalize(record, started)?;
        tracing::warn!(
            operation_id = %record.id,
            operation = %record.operation_type,
            code,
            error = %error,
            "operation failed"
        );
        Ok(record)
    }

    /// [`AuditTrail::fail`] for callers already returning `error`. A failed
    /// audit write is logged and does not replace `error`.
    pub fn record_failure(&self, pending: PendingOperation, error: &Error) {
        let operation_id = pending.id().to_string();
        if let Err(audit_error) = self.fail(pending, error) {
            tracing::error!(
                operation_id = %operation_id,
                error = %error,
                audit_error = %audit_error,
                "could not record operation failure"
            );
        }
    }

    fn finalize(&self, mut record: Operation, started: Instant) -> Result<Operation> {
        let elapsed = started.elapsed();
        record.duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        record.completed_at = Some(Utc::now());

        {
            let mut sequence = self
                .sequence
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *sequence += 1;
            record.sequence = Some(*sequence);
            self.store.operations.insert(record.clone())?;
        }

        tracing::debug!(
            operation_id = %record.id,
            operation = %record.operation_type,
            status = ?record.status,
            sequence = record.sequence,
            duration_ms = record.duration_ms,
            "operation finalized"
        );
        self.events.publish(HsmEvent::OperationFinished {
            operation_id: record.id.clone(),
            operation_type: record.operation_type,
            status: record.status,
        });
        Ok(record)
    }

    pub fn get_operation(&self, operation_id: &str) -> Result<Operation> {
        self.store
            .operations
            .get(operation_id)
            .ok_or_else(|| NotFoundError::Operation(operation_id.to_string()).into())
    }

    /// Finalized records in audit order, optionally for one device.
    pub fn log(&self, device_id: Option<&str>) -> Vec<Operation> {
        let mut records = self.store.operations.filter(|o| {
            o.sequence.is_some() && device_id.is_none_or(|id| o.device_id == id)
        });
        records.sort_by_key(|o| o.sequence);
        records
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptOutput {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub operation_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecryptOutput {
    #[serde(with = "base64_bytes")]
    pub plaintext: Vec<u8>,
    pub operation_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignOutput {
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    pub operation_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyOutput {
    pub valid: bool,
    pub operation_id: String,
}

enum Request<'a> {
    Encrypt(&'a [u8]),
    Decrypt(&'a [u8]),
    Sign(&'a [u8]),
    Verify { data: &'a [u8], signature: &'a [u8] },
}

impl Request<'_> {
    fn operation_type(&self) -> OperationType {
        match self {
            Request::Encrypt(_) => OperationType::Encrypt,
            Request::Decrypt(_) => OperationType::Decrypt,
            Request::Sign(_) => OperationType::Sign,
            Request::Verify { .. } => OperationType::Verify,
        }
    }

    fn input_size(&self) -> usize {
        match self {
            Request::Encrypt(data) | Request::Decrypt(data) | Request::Sign(data) => data.len(),
            Request::Verify { data, signature } => data.len() + signature.len(),
        }
    }
}

enum Outcome {
    Bytes(Vec<u8>),
    Verdict(bool),
}

impl Outcome {
    fn size(&self) -> usize {
        match self {
            Outcome::Bytes(bytes) => bytes.len(),
            Outcome::Verdict(_) => 1,
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            Outcome::Bytes(bytes) => bytes,
            Outcome::Verdict(_) => Vec::new(),
        }
    }

    fn verdict(&self) -> bool {
        match self {
            Outcome::Bytes(_) => true,
            Outcome::Verdict(valid) => *valid,
        }
    }
}

/// Resolves the mechanism for `operation` on `key`. A request naming the
/// key's own algorithm (e.g. `"AES"`) gets the provider's default.
fn resolve_mechanism(
    operation: OperationType,
    requested: Option<&str>,
    provider: &dyn CryptoProvider,
    key: &Key,
) -> Result<Mechanism, ValidationError> {
    let requested = requested
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case(&key.algorithm));
    let mechanism = match requested {
        Some(name) => name.parse::<Mechanism>()?,
        None if operation.is_cipher() => provider.default_cipher(&key.algorithm),
        None => provider.default_mac(),
    };
    if mechanism.is_cipher() != operation.is_cipher() {
        return Err(ValidationError::UnsupportedAlgorithm(format!(
            "{mechanism} cannot be used to {operation}"
        )));
    }
    Ok(mechanism)
}

/// Executes crypto operations with validation and auditing.
#[derive(Debug)]
pub struct OperationExecutor {
    devices: Arc<DeviceRegistry>,
    keys: Arc<KeyRegistry>,
    selector: Arc<ProviderSelector>,
    audit: Arc<AuditTrail>,
    timeouts: TimeoutConfig,
}

impl OperationExecutor {
    pub fn new(
        devices: Arc<DeviceRegistry>,
        keys: Arc<KeyRegistry>,
        selector: Arc<ProviderSelector>,
        audit: Arc<AuditTrail>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            devices,
            keys,
            selector,
            audit,
            timeouts,
        }
    }

    pub async fn encrypt(
        &self,
        device_id: &str,
        key_id: &str,
        plaintext: &[u8],
        algorithm: Option<&str>,
        context: &OperationContext,
    ) -> Result<EncryptOutput> {
        let (outcome, operation_id) = self
            .execute(device_id, key_id, algorithm, Request::Encrypt(plaintext), context)
            .await?;
        Ok(EncryptOutput {
            ciphertext: outcome.into_bytes(),
            operation_id,
        })
    }

    pub async fn decrypt(
        &self,
        device_id: &str,
        key_id: &str,
        ciphertext: &[u8],
        algorithm: Option<&str>,
        context: &OperationContext,
    ) -> Result<DecryptOutput> {
        let (outcome, operation_id) = self
            .execute(device_id, key_id, algorithm, Request::Decrypt(ciphertext), context)
            .await?;
        Ok(DecryptOutput {
            plaintext: outcome.into_bytes(),
            operation_id,
        })
    }

    pub async fn sign(
        &self,
        device_id: &str,
        key_id: &str,
        data: &[u8],
        algorithm: Option<&str>,
        context: &OperationContext,
    ) -> Result<SignOutput> {
        let (outcome, operation_id) = self
            .execute(device_id, key_id, algorithm, Request::Sign(data), context)
            .await?;
        Ok(SignOutput {
            signature: outcome.into_bytes(),
            operation_id,
        })
    }

    /// A signature that does not match is a successful operation with
    /// `valid == false`.
    pub async fn verify(
        &self,
        device_id: &str,
        key_id: &str,
        data: &[u8],
        signature: &[u8],
        algorithm: Option<&str>,
        context: &OperationContext,
    ) -> Result<VerifyOutput> {
        let (outcome, operation_id) = self
            .execute(
                device_id,
                key_id,
                algorithm,
                Request::Verify { data, signature },
                context,
            )
            .await?;
        Ok(VerifyOutput {
            valid: outcome.verdict(),
            operation_id,
        })
    }

    async fn execute(
        &self,
        device_id: &str,
        key_id: &str,
        algorithm: Option<&str>,
        request: Request<'_>,
        context: &OperationContext,
    ) -> Result<(Outcome, String)> {
        let operation_type = request.operation_type();
        let mut pending = self.audit.begin(
            operation_type,
            device_id,
            Some(key_id),
            algorithm.map(str::to_string),
            request.input_size(),
            context,
        )?;

        match self
            .dispatch(device_id, key_id, algorithm, request, context, &mut pending)
            .await
        {
            Ok((outcome, mechanism)) => {
                let format = match operation_type {
                    OperationType::Verify => "boolean",
                    _ => mechanism.output_format(),
                };
                let record = self.audit.complete(pending, outcome.size(), format)?;
                Ok((outcome, record.id))
            }
            Err(e) => {
                self.audit.record_failure(pending, &e);
                Err(e)
            }
        }
    }

    /// Everything between the `processing` record and finalization. All
    /// checks run before the provider sees the request.
    async fn dispatch(
        &self,
        device_id: &str,
        key_id: &str,
        algorithm: Option<&str>,
        request: Request<'_>,
        context: &OperationContext,
        pending: &mut PendingOperation,
    ) -> Result<(Outcome, Mechanism)> {
        let operation_type = request.operation_type();
        if let Some(session_id) = &context.session_id {
            self.devices.touch_session(session_id, device_id).await?;
        }

        // Unknown keys never get a gate.
        self.keys.get_key(key_id)?;
        let _gate = self.keys.read_gate(key_id).await;

        self.devices.require_online(device_id)?;
        let key = self.keys.get_key(key_id)?;
        if key.device_id != device_id {
            return Err(ValidationError::KeyDeviceMismatch {
                key_id: key.id,
                device_id: device_id.to_string(),
            }
            .into());
        }
        if !key.is_active() {
            return Err(ValidationError::KeyNotActive {
                key_id: key.id,
                state: key.state.to_string(),
            }
            .into());
        }
        if let Some(usage) = operation_type.required_usage()
            && !key.allows(usage)
        {
            return Err(ValidationError::KeyNotAuthorized {
                key_id: key.id,
                usage: usage.to_string(),
            }
            .into());
        }

        let provider = self.selector.provider().await?;
        let mechanism = resolve_mechanism(operation_type, algorithm, provider.as_ref(), &key)?;
        pending.set_algorithm(mechanism.name());

        let budget = self.timeouts.crypto();
        let handle = key.handle.as_str();
        let outcome = match request {
            Request::Encrypt(data) => Outcome::Bytes(
                with_timeout("encrypt", budget, provider.encrypt(handle, data, mechanism)).await?,
            ),
            Request::Decrypt(data) => Outcome::Bytes(
                with_timeout("decrypt", budget, provider.decrypt(handle, data, mechanism)).await?,
            ),
            Request::Sign(data) => Outcome::Bytes(
                with_timeout("sign", budget, provider.sign(handle, data, mechanism)).await?,
            ),
            Request::Verify { data, signature } => Outcome::Verdict(
                with_timeout(
                    "verify",
                    budget,
                    provider.verify(handle, data, signature, mechanism),
                )
                .await?,
            ),
        };

        // The provider has already done the work; a lost counter update must
        // not turn it into a failure.
        if let Err(e) = self.keys.record_use(&key.id) {
            tracing::warn!(key_id = %key.id, error = %e, "could not record key usage");
        }
        Ok((outcome, mechanism))
    }
}
