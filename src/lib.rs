//! Forwards live blockchain event streams to webhooks.
//!
//! Each configured subscription runs its own **resilient, resumable**
//! loop: read the stored cursor, open a live stream at that position,
//! hand every event to a bounded pool of webhook deliveries, and persist
//! the new cursor before reading the next event. Connection failures are
//! retried forever with capped exponential backoff.
//!
//! ## Guarantees
//! - Restarts resume from the last persisted cursor
//! - Bounded delivery concurrency per subscription
//! - Per-subscription isolation
//! - Cursor writes in stream order, never moving backwards
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordered delivery
//! - Delivery retries or a dead-letter queue
//! - Graceful shutdown

mod backoff;
mod config;
mod cursor;
mod error;
mod forwarder;
mod limiter;
mod runner;
mod source;
mod supervisor;
mod types;

pub use backoff::RetryState;
pub use config::{Config, RetryPolicy, API_KEY_ENV, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
pub use cursor::{CursorStore, FileCursorStore, InMemoryCursorStore};
pub use error::{DeliveryOutcome, FailureReason, RelayError, Result};
pub use forwarder::WebhookForwarder;
pub use limiter::DispatchLimiter;
pub use runner::{RunnerSettings, SubscriptionRunner};
pub use source::{EventSource, EventStream, LiveQueryClient, StreamRequest, DEFAULT_API_URL};
pub use supervisor::Supervisor;
pub use types::{ChainId, Event, HttpMethod, Subscription, Webhook, SOURCE_CURSOR_KEY};
