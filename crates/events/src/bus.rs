//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **fan-out pattern**: a pub/sub mechanism that
//! distributes committed transition events to every live observer.
//!
//! ## Delivery Semantics
//!
//! - **At-most-once**: an event is handed to each observer at most one time
//! - **Best-effort**: a slow or disconnected observer is dropped instead of
//!   stalling the publisher
//! - **No replay**: an observer registered after an event was published never
//!   sees that event
//! - **No persistence**: the bus is for distribution, the movement ledger is
//!   the source of truth

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Identifier of a registered observer, unique per bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// A subscription to an event stream.
///
/// Each subscription receives a copy of every event published while it is
/// registered. Dropping the subscription deregisters it: the bus notices the
/// closed queue on the next publish and forgets the observer.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe();
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => forward(event)?,
///         Err(RecvTimeoutError::Timeout) => continue,       // heartbeat / shutdown check
///         Err(RecvTimeoutError::Disconnected) => break,     // dropped by the bus
///     }
/// }
/// ```
///
/// A `Disconnected` error also means the bus dropped this observer for being
/// too slow; the observer must re-subscribe (and re-read state) to continue.
#[derive(Debug)]
pub struct Subscription<M> {
    id: ObserverId,
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(id: ObserverId, receiver: Receiver<M>) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Domain-agnostic fan-out bus.
///
/// ## Architecture Role
///
/// ```text
/// Move → Registry + Ledger (commit) → EventBus (publish) → Observers
///                                                           ├─ SSE/WebSocket clients
///                                                           └─ in-process listeners
/// ```
///
/// Events are **committed first**, then **published**. A publish failure never
/// undoes or fails the commit.
///
/// ## Thread Safety
///
/// Implementations are `Send + Sync`; publishing, subscribing and
/// unsubscribing may all happen concurrently.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;

    /// Explicitly deregister an observer. Unknown ids are ignored.
    fn unsubscribe(&self, id: ObserverId);
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }

    fn unsubscribe(&self, id: ObserverId) {
        (**self).unsubscribe(id)
    }
}
