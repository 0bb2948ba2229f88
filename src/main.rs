use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webhook_relay::{Config, LiveQueryClient, Result, Supervisor, WebhookForwarder};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webhook_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run().await {
        error!(error = %err, "a fatal error occurred");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let (path, config) = Config::from_env()?;
    info!(
        count = config.subscriptions.len(),
        path = %path.display(),
        "loaded subscriptions"
    );

    let source = Arc::new(LiveQueryClient::new(config.api_url.as_deref())?);
    let forwarder = WebhookForwarder::new()?;

    Supervisor::new(config, source, forwarder).run().await
}
