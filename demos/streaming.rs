//! Push stream explorer.
//!
//! Connects to a push server, subscribes to market updates and notifications, and logs
//! every event the connection manager emits, including reconnects.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,realtime_client=debug cargo run --example streaming --features tracing
//! ```
//!
//! Point it at another server with `REALTIME_URL`, and authenticate with `REALTIME_TOKEN`:
//! ```sh
//! REALTIME_URL=wss://push.example.com REALTIME_TOKEN=... RUST_LOG=info cargo run --example streaming --features tracing
//! ```

use futures::StreamExt as _;
use realtime_client::events::{Event, Topic, names};
use realtime_client::ws::config::Config;
use realtime_client::{ConnectionManager, SubscriptionOptions};
use secrecy::SecretString;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() -> realtime_client::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let url = std::env::var("REALTIME_URL").unwrap_or_else(|_| "ws://localhost:3001".to_owned());
    let token = std::env::var("REALTIME_TOKEN").ok().map(SecretString::from);

    let manager = ConnectionManager::new(Config::builder().url(url).build())?;

    let handle = manager.downgrade();
    manager.on(names::RECONNECT, move |event: &Event| {
        if let Some(manager) = handle.upgrade() {
            info!(?event, state = %manager.state().state, "reconnected");
        }
        Ok(())
    });
    manager.on(names::RECONNECT_FAILED, |event: &Event| {
        warn!(?event, "giving up");
        Ok(())
    });

    manager.subscribe(
        Topic::MarketUpdate.as_ref(),
        json!({ "symbols": ["BTC", "ETH"] }),
        SubscriptionOptions::default(),
    )?;
    manager.subscribe(
        Topic::Notification.as_ref(),
        serde_json::Value::Null,
        SubscriptionOptions::builder().auto_reconnect(false).build(),
    )?;
    manager.connect(token).await?;
    info!(subscriptions = manager.subscriptions().await?.len(), "connected");

    let mut events = Box::pin(manager.events());
    let mut count = 0_u32;

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "event stream lagged");
                continue;
            }
        };
        count += 1;

        match &event {
            Event::Message { topic, payload } => info!(%topic, %payload, count, "push"),
            Event::Latency(rtt) => info!(?rtt, "heartbeat"),
            Event::ReconnectFailed { .. } => break,
            other => info!(event = other.name(), "lifecycle"),
        }
    }

    let stats = manager.stats().await?;
    info!(?stats, count, "done");
    manager.close();

    Ok(())
}
