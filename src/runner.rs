use std::convert::Infallible;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{error, info, warn};

use crate::backoff::RetryState;
use crate::config::{Config, RetryPolicy};
use crate::cursor::{CursorStore, FileCursorStore};
use crate::error::{RelayError, Result};
use crate::forwarder::WebhookForwarder;
use crate::limiter::DispatchLimiter;
use crate::source::{EventSource, StreamRequest};
use crate::types::{Event, Subscription};

/// The slice of [`Config`] every runner needs.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub api_key: String,
    pub max_parallel: usize,
    pub retry: RetryPolicy,
}

impl From<&Config> for RunnerSettings {
    fn from(config: &Config) -> Self {
        Self {
            api_key: config.api_key.clone(),
            max_parallel: config.max_parallel,
            retry: config.retry,
        }
    }
}

/// Connect/stream/backoff loop for one subscription.
///
/// Each cycle reads the cursor, opens a stream at that position and
/// consumes it in order. Per event the delivery is handed to the
/// subscription's [`DispatchLimiter`] without waiting, then the event's
/// position is persisted before the next event is read. Any failure ends
/// the cycle and the runner reconnects after a capped exponential delay.
///
/// Cursor writes do not wait for deliveries. A crash can therefore skip an
/// event whose delivery was still in flight or had failed, and a failed
/// cursor write can make a later restart deliver an event twice.
pub struct SubscriptionRunner {
    subscription: Arc<Subscription>,
    api_key: String,
    max_parallel: usize,
    retry: RetryState,
    source: Arc<dyn EventSource>,
    cursor: Arc<dyn CursorStore>,
    forwarder: WebhookForwarder,
    last_persisted: Option<u64>,
}

impl SubscriptionRunner {
    /// Runner persisting to the subscription's cursor file.
    pub fn new(
        subscription: Subscription,
        settings: &RunnerSettings,
        source: Arc<dyn EventSource>,
        forwarder: WebhookForwarder,
    ) -> Self {
        let cursor = Arc::new(FileCursorStore::new(
            subscription.cursor_file.clone(),
            subscription.name.clone(),
        ));
        Self {
            subscription: Arc::new(subscription),
            api_key: settings.api_key.clone(),
            max_parallel: settings.max_parallel,
            retry: RetryState::new(settings.retry),
            source,
            cursor,
            forwarder,
            last_persisted: None,
        }
    }

    /// Replace the cursor store, e.g. with an in-memory one.
    pub fn with_cursor_store(mut self, cursor: Arc<dyn CursorStore>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Run forever. Every error is handled inside the loop.
    pub async fn run(mut self) {
        let limiter = DispatchLimiter::new(self.subscription.name.clone(), self.max_parallel);

        loop {
            let err = match self.run_cycle(&limiter).await {
                Ok(never) => match never {},
                Err(err) => err,
            };

            let delay = self.retry.next_delay();
            error!(
                subscription = %self.subscription.name,
                attempt = self.retry.attempts(),
                delay_ms = delay.as_millis() as u64,
                backlog = limiter.backlog(),
                error = %err,
                "subscription error, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One connect + stream pass. Only returns on failure.
    async fn run_cycle(&mut self, limiter: &DispatchLimiter) -> Result<Infallible> {
        info!(subscription = %self.subscription.name, "starting live query");

        let start = self.cursor.read(self.subscription.fallback_position()).await?;
        let mut stream = self.source.open(self.stream_request(start)).await?;

        while let Some(item) = stream.next().await {
            self.handle_event(item?, limiter).await;
        }

        Err(RelayError::StreamEnded)
    }

    fn stream_request(&self, start_position: u64) -> StreamRequest {
        StreamRequest {
            api_key: self.api_key.clone(),
            chain_id: self.subscription.chain_id,
            query: self.subscription.query.clone(),
            signatures: self.subscription.signatures.clone(),
            start_position,
        }
    }

    async fn handle_event(&mut self, event: Event, limiter: &DispatchLimiter) {
        if self.retry.reset() {
            info!(subscription = %self.subscription.name, "reconnected successfully");
        }

        let position = event.position(self.subscription.chain_id);

        let forwarder = self.forwarder.clone();
        let subscription = self.subscription.clone();
        limiter.submit(async move {
            forwarder.deliver(&subscription, &event).await;
        });

        match position {
            Some(position) => self.persist(position).await,
            None => warn!(
                subscription = %self.subscription.name,
                chain_id = %self.subscription.chain_id,
                "cursor did not contain chain id, skipping cursor write"
            ),
        }
    }

    async fn persist(&mut self, position: u64) {
        if let Some(last) = self.last_persisted {
            if position < last {
                warn!(
                    subscription = %self.subscription.name,
                    position,
                    last,
                    "cursor moved backwards, keeping the stored position"
                );
                return;
            }
        }

        if self.cursor.write(position).await {
            self.last_persisted = Some(position);
        }
    }
}
