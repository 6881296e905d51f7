//! Committed-transition events and their real-time distribution.
//!
//! - `event`: the domain-agnostic [`Event`] contract
//! - `bus`: the pub/sub abstraction ([`EventBus`], [`Subscription`])
//! - `fanout`: the in-process bounded fan-out bus used for live observers

pub mod bus;
pub mod event;
pub mod fanout;

pub use bus::{EventBus, ObserverId, Subscription};
pub use event::Event;
pub use fanout::{FanoutBus, FanoutError, DEFAULT_OBSERVER_CAPACITY};
