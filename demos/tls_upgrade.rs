// ABOUTME: Example application demonstrating a TLS-upgraded connection to a NATS server
// ABOUTME: Shows supplying a rustls::ClientConfig via ClientOptions for the in-place TLS upgrade

use argh::FromArgs;
use natsc::client::{ClientOptions, NatsClient};
use std::error::Error;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Example application connecting to a TLS-requiring NATS server
#[derive(FromArgs)]
struct CliArgs {
    /// the hostname of the NATS server; also used as the TLS server-name for verification
    #[argh(option)]
    host: String,

    /// the port to use when connecting to the NATS server (default: 4222)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// path to a PEM file of additional trusted root certificates
    #[argh(option)]
    ca_file: Option<String>,
}

/// Builds a `rustls::ClientConfig` trusting the platform's native roots plus, optionally,
/// an extra PEM bundle. Loading TLS material from disk is the caller's job per SPEC_FULL.md
/// §1's scope boundary -- this crate only consumes the finished `ClientConfig`.
fn build_tls_config(ca_file: Option<&str>) -> Result<Arc<rustls::ClientConfig>, Box<dyn Error>> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    if let Some(path) = ca_file {
        let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
        for cert in rustls_pemfile::certs(&mut reader) {
            roots.add(cert?)?;
        }
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let tls_config = build_tls_config(cli_args.ca_file.as_deref())?;
    let port = cli_args.port.unwrap_or(4222);

    let options = ClientOptions::new(cli_args.host, port).with_tls_config(tls_config);
    let mut client = NatsClient::start(options).await?;

    println!("connected over TLS, state = {:?}", client.state());
    client.close().await;
    Ok(())
}
