//! Notification transports for persisted violations.
//!
//! Publishing is best-effort: the finalizer logs a failed publish and moves on.

mod mqtt;

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::violation::PersistedRecord;

pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, MqttNotificationBus};

pub trait NotificationBus: Send + Sync {
    fn publish(&self, record: &PersistedRecord) -> Result<()>;
}

/// Drops every record. Used when no broker is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullBus;

impl NotificationBus for NullBus {
    fn publish(&self, _record: &PersistedRecord) -> Result<()> {
        Ok(())
    }
}

/// In-process fan-out to any number of subscribers.
///
/// Subscribers whose receiver was dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub struct BroadcastBus {
    subscribers: Mutex<Vec<Sender<PersistedRecord>>>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Result<Receiver<PersistedRecord>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .map_err(|_| anyhow!("broadcast bus lock poisoned"))?
            .push(tx);
        Ok(rx)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl NotificationBus for BroadcastBus {
    fn publish(&self, record: &PersistedRecord) -> Result<()> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| anyhow!("broadcast bus lock poisoned"))?;
        subscribers.retain(|tx| tx.send(record.clone()).is_ok());
        Ok(())
    }
}
