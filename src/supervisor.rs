use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::forwarder::WebhookForwarder;
use crate::runner::{RunnerSettings, SubscriptionRunner};
use crate::source::EventSource;

/// Starts one runner task per subscription and watches for any that stop.
///
/// Runners never return on their own, so a runner that exits or panics is
/// treated as fatal for the whole process.
pub struct Supervisor {
    config: Arc<Config>,
    source: Arc<dyn EventSource>,
    forwarder: WebhookForwarder,
}

/// How a runner task finished: its subscription name and, if it panicked,
/// the panic message.
type RunnerExit = (String, Option<String>);

impl Supervisor {
    pub fn new(config: Config, source: Arc<dyn EventSource>, forwarder: WebhookForwarder) -> Self {
        Self {
            config: Arc::new(config),
            source,
            forwarder,
        }
    }

    /// Spawn every runner without waiting on any of them.
    pub fn spawn_all(&self) -> JoinSet<RunnerExit> {
        let settings = RunnerSettings::from(self.config.as_ref());
        let mut runners = JoinSet::new();

        for subscription in &self.config.subscriptions {
            let name = subscription.name.clone();
            let runner = SubscriptionRunner::new(
                subscription.clone(),
                &settings,
                self.source.clone(),
                self.forwarder.clone(),
            );
            info!(subscription = %name, chain_id = %subscription.chain_id, "starting subscription");

            runners.spawn(async move {
                let panic = AssertUnwindSafe(runner.run())
                    .catch_unwind()
                    .await
                    .err()
                    .map(panic_message);
                (name, panic)
            });
        }

        runners
    }

    /// Run until a runner stops. Returns `Ok` only when there is nothing to
    /// run.
    pub async fn run(self) -> Result<()> {
        let mut runners = self.spawn_all();
        if runners.is_empty() {
            warn!("no subscriptions configured");
            return Ok(());
        }

        let err = match runners.join_next().await {
            None => return Ok(()),
            Some(Ok((name, None))) => RelayError::RunnerExited { name },
            Some(Ok((name, Some(message)))) => RelayError::RunnerPanicked { name, message },
            Some(Err(join_err)) => RelayError::RunnerPanicked {
                name: "<unknown>".to_string(),
                message: join_err.to_string(),
            },
        };
        runners.abort_all();
        Err(err)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
