//! Async channel bridge carrying device hot-plug events
//!
//! The USB polling thread is a plain OS thread; consumers live in the Tokio
//! runtime. Events are fanned out to every subscriber over bounded
//! `async_channel` queues: the thread side sends with `send_blocking`, the
//! async side receives with `recv().await`.

use async_channel::{Receiver, Sender, bounded};
use protocol::{BusId, ExportedDevice};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Default per-subscriber queue depth
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Device change reported by the enumeration backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device connected, or its descriptor changed
    Added {
        /// Fresh device snapshot
        device: ExportedDevice,
    },

    /// Device disconnected
    Removed {
        /// Bus id the device occupied
        bus_id: BusId,
    },
}

impl DeviceEvent {
    /// Bus id the event refers to
    pub fn bus_id(&self) -> &BusId {
        match self {
            DeviceEvent::Added { device } => &device.bus_id,
            DeviceEvent::Removed { bus_id } => bus_id,
        }
    }
}

/// Registry of event subscribers
#[derive(Clone)]
pub struct DeviceEventHub {
    subscribers: Arc<Mutex<Vec<Sender<DeviceEvent>>>>,
    capacity: usize,
}

impl Default for DeviceEventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl DeviceEventHub {
    /// Create a hub whose subscriber queues hold `capacity` events each
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber
    ///
    /// The subscriber only sees events published after this call.
    pub fn subscribe(&self) -> crate::Result<Receiver<DeviceEvent>> {
        let (tx, rx) = bounded(self.capacity);
        self.lock()?.push(tx);
        Ok(rx)
    }

    /// Create a publishing handle for the USB thread
    pub fn publisher(&self) -> DeviceEventPublisher {
        DeviceEventPublisher { hub: self.clone() }
    }

    /// Number of subscribers that have not been dropped
    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> crate::Result<std::sync::MutexGuard<'_, Vec<Sender<DeviceEvent>>>> {
        self.subscribers
            .lock()
            .map_err(|e| crate::Error::Channel(format!("subscriber list poisoned: {}", e)))
    }

    /// Snapshot live senders, pruning subscribers whose receiver was dropped
    fn live_senders(&self) -> crate::Result<Vec<Sender<DeviceEvent>>> {
        let mut subs = self.lock()?;
        subs.retain(|tx| !tx.is_closed());
        Ok(subs.clone())
    }
}

/// Sending half used by the USB polling thread
#[derive(Clone)]
pub struct DeviceEventPublisher {
    hub: DeviceEventHub,
}

impl DeviceEventPublisher {
    /// Send an event to every subscriber, blocking while a queue is full
    ///
    /// Returns the number of subscribers that received the event. Must not be
    /// called from inside the async runtime.
    pub fn publish_blocking(&self, event: DeviceEvent) -> crate::Result<usize> {
        let mut delivered = 0;
        for tx in self.hub.live_senders()? {
            if tx.send_blocking(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        trace!("Published {:?} to {} subscriber(s)", event.bus_id(), delivered);
        Ok(delivered)
    }

    /// Send an event to every subscriber from async code
    pub async fn publish(&self, event: DeviceEvent) -> crate::Result<usize> {
        let mut delivered = 0;
        for tx in self.hub.live_senders()? {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_mock_exported_device;

    #[tokio::test]
    async fn test_event_from_thread() {
        let hub = DeviceEventHub::new(8);
        let rx = hub.subscribe().unwrap();
        let publisher = hub.publisher();

        let handle = std::thread::spawn(move || {
            publisher
                .publish_blocking(DeviceEvent::Removed {
                    bus_id: BusId::new("1-1"),
                })
                .unwrap()
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.bus_id().as_str(), "1-1");
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned() {
        let hub = DeviceEventHub::new(8);
        let rx1 = hub.subscribe().unwrap();
        let rx2 = hub.subscribe().unwrap();
        assert_eq!(hub.subscriber_count(), 2);

        drop(rx1);
        let delivered = hub
            .publisher()
            .publish(DeviceEvent::Added {
                device: create_mock_exported_device("2-1", 0x1234, 0x5678),
            })
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert!(matches!(rx2.recv().await, Ok(DeviceEvent::Added { .. })));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = DeviceEventHub::default();
        let delivered = hub
            .publisher()
            .publish_blocking(DeviceEvent::Removed {
                bus_id: BusId::new("3-1"),
            })
            .unwrap();
        assert_eq!(delivered, 0);
    }
}
