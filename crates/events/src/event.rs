use chrono::{DateTime, Utc};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - published only **after** the state change they describe was committed
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "unit.moved").
    fn event_type(&self) -> &'static str;

    /// When the event occurred (commit time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
