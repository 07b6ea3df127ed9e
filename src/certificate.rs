//! Certificate inventory.
//! 中文: 证书清单与状态管理。

use crate::device::DeviceRegistry;
use crate::error::{Error, NotFoundError, Result, ValidationError};
use crate::events::{EventBus, HsmEvent};
use crate::store::{Record, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Valid,
    Expired,
    Revoked,
    Suspended,
}

impl CertificateStatus {
    /// Revoked and expired are terminal; a suspension can be lifted.
    pub fn can_transition_to(self, to: CertificateStatus) -> bool {
        use CertificateStatus::*;
        matches!(
            (self, to),
            (Valid, Suspended | Revoked | Expired) | (Suspended, Valid | Revoked)
        )
    }

    /// Whether the certificate still occupies a slot on its device.
    fn holds_slot(self) -> bool {
        matches!(self, CertificateStatus::Valid | CertificateStatus::Suspended)
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CertificateStatus::Valid => "valid",
            CertificateStatus::Expired => "expired",
            CertificateStatus::Revoked => "revoked",
            CertificateStatus::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Certificate {
    pub id: String,
    pub device_id: String,
    pub private_key_id: Option<String>,
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub status: CertificateStatus,
    pub created_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
}

impl Record for Certificate {
    const TABLE: &'static str = "certificates";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CertificateSpec {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(default)]
    pub private_key_id: Option<String>,
}

#[derive(Debug)]
pub struct CertificateRegistry {
    store: Arc<Store>,
    devices: Arc<DeviceRegistry>,
    events: EventBus,
    import: Mutex<()>,
}

impl CertificateRegistry {
    pub fn new(store: Arc<Store>, devices: Arc<DeviceRegistry>, events: EventBus) -> Self {
        Self {
            store,
            devices,
            events,
            import: Mutex::new(()),
        }
    }

    /// Stores a certificate on an online device. A certificate already past
    /// `not_after` is stored as expired.
    pub async fn import_certificate(&self, device_id: &str, spec: CertificateSpec) -> Result<Certificate> {
        if spec.subject.trim().is_empty() {
            return Err(ValidationError::InvalidCertificate("subject is empty".into()).into());
        }
        if spec.serial_number.trim().is_empty() {
            return Err(ValidationError::InvalidCertificate("serial number is empty".into()).into());
        }
        if spec.not_before >= spec.not_after {
            return Err(ValidationError::InvalidCertificate(
                "not_before must precede not_after".into(),
            )
            .into());
        }

        let _guard = self.import.lock().await;
        let device = self.devices.require_online(device_id)?;
        if let Some(key_id) = &spec.private_key_id {
            let key = self
                .store
                .keys
                .get(key_id)
                .ok_or_else(|| NotFoundError::Key(key_id.clone()))?;
            if key.device_id != device.id {
                return Err(ValidationError::KeyDeviceMismatch {
                    key_id: key.id,
                    device_id: device.id,
                }
                .into());
            }
        }

        let held = self
            .store
            .certificates
            .count(|c| c.device_id == device_id && c.status.holds_slot());
        if held >= device.capabilities.certificate_slots {
            return Err(ValidationError::StorageExceeded {
                capacity: device.capabilities.certificate_slots,
            }
            .into());
        }

        let now = Utc::now();
        let status = if spec.not_after <= now {
            CertificateStatus::Expired
        } else {
            CertificateStatus::Valid
        };
        let certificate = Certificate {
            id: Uuid::new_v4().to_string(),
            device_id: device.id,
            private_key_id: spec.private_key_id,
            subject: spec.subject,
            issuer: spec.issuer,
            serial_number: spec.serial_number,
            not_before: spec.not_before,
            not_after: spec.not_after,
            status,
            created_at: now,
            status_changed_at: now,
        };
        self.store.certificates.insert(certificate.clone())?;
        tracing::info!(
            certificate_id = %certificate.id,
            device_id = %certificate.device_id,
            subject = %certificate.subject,
            "certificate imported"
        );
        Ok(certificate)
    }

    pub fn get_certificate(&self, certificate_id: &str) -> Result<Certificate> {
        self.store
            .certificates
            .get(certificate_id)
            .ok_or_else(|| NotFoundError::Certificate(certificate_id.to_string()).into())
    }

    pub fn list_certificates(&self, device_id: &str) -> Vec<Certificate> {
        let mut certificates = self.store.certificates.filter(|c| c.device_id == device_id);
        certificates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        certificates
    }

    pub fn set_certificate_status(
        &self,
        certificate_id: &str,
        to: CertificateStatus,
    ) -> Result<Certificate> {
        let mut from = None;
        let certificate = self
            .store
            .certificates
            .try_update(certificate_id, |c| {
                if !c.status.can_transition_to(to) {
                    return Err(Error::from(ValidationError::InvalidCertificateTransition {
                        from: c.status.to_string(),
                        to: to.to_string(),
                    }));
                }
                from = Some(c.status);
                c.status = to;
                c.status_changed_at = Utc::now();
                Ok(())
            })?
            .ok_or_else(|| NotFoundError::Certificate(certificate_id.to_string()))?;

        if let Some(from) = from {
            tracing::info!(certificate_id, %from, %to, "certificate status changed");
            self.events.publish(HsmEvent::CertificateStatusChanged {
                certificate_id: certificate_id.to_string(),
                from,
                to,
            });
        }
        Ok(certificate)
    }

    /// Marks valid certificates past `not_after` as expired. Returns their ids.
    pub fn refresh_certificate_expiry(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let due = self
            .store
            .certificates
            .filter(|c| c.status == CertificateStatus::Valid && c.not_after <= now);
        let mut expired = Vec::with_capacity(due.len());
        for certificate in due {
            self.set_certificate_status(&certificate.id, CertificateStatus::Expired)?;
            expired.push(certificate.id);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        use CertificateStatus::*;
        assert!(Valid.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Valid));
        assert!(Suspended.can_transition_to(Revoked));
        assert!(!Revoked.can_transition_to(Valid));
        assert!(!Expired.can_transition_to(Valid));
        assert!(!Suspended.can_transition_to(Expired));
    }
}
