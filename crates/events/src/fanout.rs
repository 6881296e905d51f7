//! In-process bounded fan-out bus.

use std::sync::Mutex;
use std::sync::mpsc::{self, SyncSender, TrySendError};

use crate::bus::{EventBus, ObserverId, Subscription};

/// Default length of each observer's queue.
pub const DEFAULT_OBSERVER_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum FanoutError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

#[derive(Debug)]
struct Observer<M> {
    id: ObserverId,
    tx: SyncSender<M>,
}

#[derive(Debug)]
struct Registry<M> {
    next_id: u64,
    observers: Vec<Observer<M>>,
}

/// In-memory pub/sub bus with a bounded queue per observer.
///
/// - No IO / no async
/// - `publish` never blocks: it uses `try_send` on every queue
/// - a full queue (slow consumer) or a closed queue (gone consumer) removes
///   that observer; the others still receive the event
#[derive(Debug)]
pub struct FanoutBus<M> {
    capacity: usize,
    registry: Mutex<Registry<M>>,
}

impl<M> FanoutBus<M> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OBSERVER_CAPACITY)
    }

    /// Bus whose observers each buffer at most `capacity` undelivered events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            registry: Mutex::new(Registry {
                next_id: 1,
                observers: Vec::new(),
            }),
        }
    }

    /// Number of currently registered observers.
    pub fn observer_count(&self) -> usize {
        self.registry
            .lock()
            .map(|r| r.observers.len())
            .unwrap_or(0)
    }
}

impl<M> Default for FanoutBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for FanoutBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = FanoutError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut registry = self.registry.lock().map_err(|_| FanoutError::Poisoned)?;

        registry.observers.retain(|observer| match observer.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(observer = observer.id.value(), "dropping slow observer");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!(observer = observer.id.value(), "observer disconnected");
                false
            }
        });

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);

        // A poisoned registry still hands out a subscription; it is simply
        // never fed and reports `Disconnected` once `tx` is dropped here.
        let id = match self.registry.lock() {
            Ok(mut registry) => {
                let id = ObserverId::new(registry.next_id);
                registry.next_id += 1;
                registry.observers.push(Observer { id, tx });
                id
            }
            Err(_) => ObserverId::new(0),
        };

        Subscription::new(id, rx)
    }

    fn unsubscribe(&self, id: ObserverId) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.observers.retain(|o| o.id != id);
        }
    }
}
