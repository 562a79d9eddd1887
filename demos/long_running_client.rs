// ABOUTME: Long-running NATS client example demonstrating a persistent subscription
// ABOUTME: Shows reconnect-free operation under the engine's built-in PING/PONG keepalive

//! # Long-Running NATS Client
//!
//! Connects once, subscribes to a subject, and stays up for a configurable
//! duration, logging every message it receives and periodically publishing
//! a heartbeat. Server-initiated PING/PONG keepalive (SPEC_FULL.md §4.C) is
//! handled entirely inside the engine; this example only demonstrates that
//! the connection survives unattended for the run duration.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --example long_running_client -- --subject heartbeats --run-seconds 300
//! ```

use argh::FromArgs;
use natsc::client::{ClientOptions, NatsClient};
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{interval, sleep};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Example application demonstrating a long-lived subscription and periodic heartbeat publish
#[derive(FromArgs)]
struct CliArgs {
    /// the hostname or IP address of the NATS server (default: localhost)
    #[argh(option)]
    host: Option<String>,

    /// the port to use when connecting to the NATS server (default: 4222)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// the subject to subscribe to and publish heartbeats on
    #[argh(option, short = 's')]
    subject: Option<String>,

    /// how often to publish a heartbeat message, in seconds (default: 30)
    #[argh(option)]
    heartbeat_interval: Option<u64>,

    /// total time to stay connected before exiting cleanly, in seconds (default: 300)
    #[argh(option)]
    run_seconds: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let host = cli_args.host.unwrap_or_else(|| "localhost".to_string());
    let port = cli_args.port.unwrap_or(4222);
    let subject = cli_args.subject.unwrap_or_else(|| "heartbeats".to_string());
    let heartbeat_interval = Duration::from_secs(cli_args.heartbeat_interval.unwrap_or(30));
    let run_duration = Duration::from_secs(cli_args.run_seconds.unwrap_or(300));

    let mut client = NatsClient::start(ClientOptions::new(host, port)).await?;

    let received = Arc::new(AtomicU64::new(0));
    let received_cb = received.clone();
    client.add_callback(
        Arc::new(move |frame| {
            received_cb.fetch_add(1, Ordering::Relaxed);
            info!(?frame, "message received");
        }),
        &subject,
    );
    client.subscribe(&subject, None).await?;

    let mut ticker = interval(heartbeat_interval);
    let deadline = tokio::time::Instant::now() + run_duration;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                info!(total_received = received.load(Ordering::Relaxed), "run duration elapsed, shutting down");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = client.publish(&subject, b"heartbeat", None, None).await {
                    tracing::warn!(error = %e, "heartbeat publish failed");
                }
            }
        }
    }

    // Let in-flight deliveries settle before tearing the connection down.
    sleep(Duration::from_millis(100)).await;
    client.close().await;
    Ok(())
}
