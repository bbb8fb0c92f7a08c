//! Alert dispatch: rate limiting, multi-channel delivery, alert records
//!
//! A triggered sample becomes at most one [`AlertEvent`]. Channels that are
//! rate limited are left out; if none remain the alert is suppressed.

pub mod dispatcher;
pub mod model;
pub mod notifier;
pub mod rate_limiter;

pub use dispatcher::AlertDispatcher;
pub use model::{AlertEvent, AlertLevel, AlertMetadata, Channel};
pub use notifier::{AlertSink, DeliveryError, Notifier};
pub use rate_limiter::{RateDecision, RateLimiter};
