//! Crawl Relay - Kafka Event Bus Example
//!
//! A scheduler publishes crawl requests to `agent-requests`; a downloader
//! agent consumes them and answers on `agent-responses`, where the
//! scheduler logs the results.
//!
//! # Running the Example
//!
//! ```bash
//! docker run -d -p 9092:9092 apache/kafka:latest
//! KAFKA_PARTITION_TOPICS=agent-requests:4 cargo run -p crawl-relay
//! ```
//!
//! All `KAFKA_*` variables understood by `BusConfig::from_env` apply.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};
use spider_bus_core::config::BusConfig;
use spider_bus_core::event::Event;
use spider_bus_core::event_bus::{EventBus, handler};
use spider_bus_kafka::KafkaEventBus;
use spider_bus_runtime::metrics::MetricsServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const REQUESTS: &str = "agent-requests";
const RESPONSES: &str = "agent-responses";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CrawlRequest {
    url: String,
    depth: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CrawlResponse {
    url: String,
    status: u16,
    bytes: usize,
}

/// Pretend to download `request`.
fn download(request: &CrawlRequest) -> CrawlResponse {
    CrawlResponse {
        url: request.url.clone(),
        status: 200,
        bytes: request.url.len() * 1024,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,spider_bus=debug,crawl_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut metrics = MetricsServer::new(([0, 0, 0, 0], 9000).into());
    metrics.start()?;

    // 2. Build the bus from KAFKA_* variables
    let config = BusConfig::from_env()?;
    let bus = Arc::new(KafkaEventBus::from_config(config)?);
    tracing::info!(
        brokers = bus.brokers(),
        group = bus.consumer_group(),
        "✓ Event bus ready"
    );

    // 3. Downloader agent: handlers are synchronous, so requests are handed
    //    to a task that publishes the responses.
    let (tx, mut rx) = mpsc::unbounded_channel::<CrawlRequest>();
    bus.subscribe(
        REQUESTS,
        handler(move |event| {
            let request: CrawlRequest = event.data()?;
            tracing::info!(url = %request.url, depth = request.depth, "Downloading");
            Ok(tx.send(request)?)
        }),
    )
    .await?;

    let agent_bus = Arc::clone(&bus);
    let agent = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let response = download(&request);
            match Event::with_data("Response", &response) {
                Ok(event) => {
                    if let Err(e) = agent_bus.publish(RESPONSES, Some(event)).await {
                        tracing::warn!(url = %response.url, error = %e, "Failed to publish response");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to encode response"),
            }
        }
    });

    // 4. Scheduler side: log every response
    bus.subscribe(
        RESPONSES,
        handler(|event| {
            let response: CrawlResponse = event.data()?;
            tracing::info!(
                url = %response.url,
                status = response.status,
                bytes = response.bytes,
                published_at = event.timestamp_millis,
                "Crawled"
            );
            Ok(())
        }),
    )
    .await?;

    // 5. Schedule a few requests
    for (depth, url) in ["https://example.com", "https://example.org", "https://example.net"]
        .into_iter()
        .enumerate()
    {
        let request = CrawlRequest {
            url: url.to_string(),
            depth: u32::try_from(depth)?,
        };
        bus.publish(REQUESTS, Some(Event::with_data("Request", &request)?))
            .await?;
    }
    tracing::info!("✓ Requests scheduled, press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping...");

    for topic in bus.subscriptions().await {
        if let Some(status) = bus.subscription_status(&topic).await {
            tracing::info!(
                topic = %status.topic,
                handled = status.messages_handled,
                failures = status.handler_failures,
                "Subscription summary"
            );
        }
    }

    // 6. Graceful shutdown
    bus.shutdown(Duration::from_secs(5)).await?;
    agent.abort();

    if let Some(rendered) = metrics.render() {
        tracing::debug!(metrics = %rendered, "Final metrics");
    }
    tracing::info!("✓ Clean shutdown complete");

    Ok(())
}
