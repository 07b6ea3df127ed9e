//! Typed notifications for observers of the subsystem.
//! 中文: 供外部观察者订阅的类型化事件。

use crate::certificate::CertificateStatus;
use crate::cluster::ClusterStatus;
use crate::device::DeviceStatus;
use crate::key::KeyState;
use crate::operation::{OperationStatus, OperationType};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel. Slow subscribers that fall this
/// far behind observe `RecvError::Lagged`.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HsmEvent {
    DeviceRegistered {
        device_id: String,
        name: String,
        status: DeviceStatus,
    },
    DeviceStatusChanged {
        device_id: String,
        from: DeviceStatus,
        to: DeviceStatus,
    },
    KeyGenerated {
        key_id: String,
        device_id: String,
        algorithm: String,
        size: usize,
    },
    KeyStateChanged {
        key_id: String,
        from: KeyState,
        to: KeyState,
    },
    KeyRotated {
        old_key_id: String,
        new_key_id: String,
    },
    CertificateStatusChanged {
        certificate_id: String,
        from: CertificateStatus,
        to: CertificateStatus,
    },
    OperationFinished {
        operation_id: String,
        operation_type: OperationType,
        status: OperationStatus,
    },
    ClusterCreated {
        cluster_id: String,
        name: String,
        status: ClusterStatus,
    },
    ClusterStatusChanged {
        cluster_id: String,
        from: ClusterStatus,
        to: ClusterStatus,
    },
    BackupCreated {
        backup_id: String,
        device_id: String,
        key_count: usize,
        certificate_count: usize,
    },
    ProviderFallback {
        reason: String,
    },
}

/// Fan-out channel for [`HsmEvent`]s.
///
/// Publishing never blocks and never fails; events sent while nobody is
/// subscribed are dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<HsmEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HsmEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: HsmEvent) {
        tracing::trace!(?event, "publishing event");
        // Err only means there are no subscribers right now.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(HsmEvent::ProviderFallback {
            reason: "module missing".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            HsmEvent::ProviderFallback {
                reason: "module missing".into()
            }
        );
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(HsmEvent::KeyRotated {
            old_key_id: "a".into(),
            new_key_id: "b".into(),
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(HsmEvent::DeviceStatusChanged {
            device_id: "d1".into(),
            from: DeviceStatus::Online,
            to: DeviceStatus::Error,
        })
        .unwrap();
        assert_eq!(json["event"], "device_status_changed");
        assert_eq!(json["to"], "error");
    }
}
