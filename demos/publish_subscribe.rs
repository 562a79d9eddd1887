// ABOUTME: Example application demonstrating a basic publish/subscribe round-trip
// ABOUTME: Shows ClientOptions + NatsClient::start for the simplest connect/subscribe/publish flow

use argh::FromArgs;
use natsc::client::{ClientOptions, NatsClient};
use std::error::Error;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// Example application showing the simplest publish/subscribe round-trip against a NATS server
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the hostname or IP address of the NATS server (default: localhost)
    #[argh(option)]
    host: Option<String>,

    /// the port to use when connecting to the NATS server (default: 4222)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// the subject to subscribe and publish to
    #[argh(option, short = 's')]
    subject: String,

    /// the payload to publish
    #[argh(option, short = 'm')]
    message: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let level = if cli_args.debugging { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let host = cli_args.host.unwrap_or_else(|| "localhost".to_string());
    let port = cli_args.port.unwrap_or(4222);

    let mut client = NatsClient::start(ClientOptions::new(host, port)).await?;

    let subject = cli_args.subject.clone();
    client.add_callback(
        Arc::new(move |frame| info!(?frame, "received message")),
        &subject,
    );
    client.subscribe(&cli_args.subject, None).await?;

    client
        .publish(&cli_args.subject, cli_args.message.as_bytes(), None, None)
        .await?;

    // Give the round-trip a moment to complete before tearing down.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    client.close().await;
    Ok(())
}
