// ABOUTME: NATS client facade binding the wire codec, transport, and protocol engine together
// ABOUTME: Thin composition layer presenting start/close/publish/subscribe/unsubscribe/add-callback/remove-callback

//! Client facade for the NATS core client.
//!
//! [`NatsClient`] is intentionally thin (SPEC_FULL.md §4.D): it owns the
//! [`Transport`] and [`ProtocolEngine`], runs one background task that pumps
//! inbound frames from the transport into the engine and any resulting
//! outbound bytes back out, and forwards each public method to the engine.
//!
//! ```rust,no_run
//! use natsc::client::{ClientOptions, NatsClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = NatsClient::start(ClientOptions::new("localhost", 4222)).await?;
//!
//! client.subscribe("greetings", None).await?;
//! client.add_callback(std::sync::Arc::new(|frame| println!("{frame:?}")), "greetings");
//!
//! client.publish("greetings", b"hello", None, None).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod error;

pub use builder::{Callback, ClientOptions};
pub use error::{ClientError, ClientResult};

use std::time::Duration;

use tracing::error;

use crate::codec::{self, Frame, Headers};
use crate::engine::{CallbackId, EngineState, HandleOutcome, ProtocolEngine};
use crate::transport::{CancellationToken, Transport, TransportSender};

/// Deadline for enqueueing onto the transport's bounded `send_queue` before a
/// caller-facing operation fails with [`ClientError::Backpressure`].
const SEND_TIMEOUT: Duration = Duration::from_millis(10);

/// A connected NATS client. Construct with [`NatsClient::start`].
pub struct NatsClient {
    engine: std::sync::Arc<ProtocolEngine>,
    sender: TransportSender,
    shutdown: CancellationToken,
    engine_task: Option<tokio::task::JoinHandle<Transport>>,
}

impl NatsClient {
    /// Connects to `options.host:options.port`, drives the INFO/CONNECT
    /// handshake (including an in-place TLS upgrade if the server requires
    /// it), and returns once the engine reaches `Ready` -- or a
    /// [`ClientError::Handshake`] if the handshake hits a fatal condition.
    ///
    /// Corresponds to the source's synchronous `start()` that blocks until
    /// connected: readiness here is a [`tokio::sync::Notify`] completed by
    /// the engine rather than a raw blocking wait (SPEC_FULL.md §9).
    pub async fn start(options: ClientOptions) -> ClientResult<Self> {
        let transport = Transport::connect(&options.host, options.port).await?;
        let shutdown = transport.shutdown_handle();
        let sender = transport.sender();

        let credentials = options.credentials.clone();
        let tls_configured = options.tls_config.is_some();
        let engine = std::sync::Arc::new(ProtocolEngine::new(credentials, tls_configured));

        if let Some(catchall) = options.catchall_callback.clone() {
            engine.add_callback("", catchall);
        }

        // Create the `Notified` future before spawning the task that may
        // complete the handshake, so a fast (e.g. loopback) server can't
        // call `notify_waiters` before we start waiting on it -- see
        // `Notify`'s documented "create-before-spawn" pattern.
        let ready = engine.ready_signal();
        let notified = ready.notified();
        let engine_task = tokio::spawn(run_engine(
            transport,
            engine.clone(),
            options.tls_config.clone(),
            options.host.clone(),
        ));

        notified.await;

        match engine.state() {
            EngineState::Ready => Ok(NatsClient {
                engine,
                sender,
                shutdown,
                engine_task: Some(engine_task),
            }),
            _ => {
                let reason = engine.fatal_reason();
                if let Ok(transport) = engine_task.await {
                    transport.close().await;
                }
                match reason {
                    Some(reason) => Err(ClientError::Handshake(reason)),
                    None => Err(ClientError::NotConnected),
                }
            }
        }
    }

    /// Signals the engine task to stop, joins it, and closes the
    /// underlying socket. Idempotent: calling it twice is a no-op the
    /// second time since the handles have already been taken.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.engine_task.take() {
            if let Ok(transport) = task.await {
                transport.close().await;
            }
        }
    }

    /// Current handshake/connection state.
    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    /// Publishes `payload` to `subject`. Headers are dropped with a warning
    /// if the server's INFO indicated it doesn't support them. Rejects
    /// payloads larger than the server's `max_payload`. Blocks (with a short
    /// timeout) on enqueueing to the bounded outbound queue, failing with
    /// [`ClientError::Backpressure`] if it stays full.
    pub async fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        headers: Option<Headers>,
        reply_to: Option<&str>,
    ) -> ClientResult<()> {
        codec::validate_subject(subject).map_err(|e| ClientError::BadArgument(e.to_string()))?;
        let info = self.engine.info().ok_or(ClientError::NotConnected)?;
        if payload.len() as u64 > info.max_payload {
            return Err(ClientError::PayloadTooLarge {
                len: payload.len(),
                max: info.max_payload,
            });
        }

        let headers = headers.filter(|h| !h.is_empty());
        let bytes = match &headers {
            Some(headers) if info.headers => codec::build_hpub(subject, payload, headers, reply_to)?,
            Some(_) => {
                tracing::warn!(subject, "server does not support headers; publishing as PUB");
                codec::build_pub(subject, payload, reply_to)?
            }
            None => codec::build_pub(subject, payload, reply_to)?,
        };

        self.enqueue(bytes).await
    }

    /// Subscribes to `subject`. Returns `false` if a subscription for this
    /// subject already exists.
    pub async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> ClientResult<bool> {
        match self.engine.subscribe(subject, queue_group) {
            Some((_, bytes)) => {
                self.enqueue(bytes).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Unsubscribes from `subject`. `max_msgs`, if given, tells the server
    /// to deliver up to that many more messages before terminating the
    /// subscription server-side (not enforced client-side, per SPEC_FULL.md
    /// §9 Open Question 1). Callbacks registered for the subject are left in
    /// place and a warning is logged if any remain.
    pub async fn unsubscribe(&self, subject: &str, max_msgs: Option<u64>) -> ClientResult<bool> {
        match self.engine.unsubscribe(subject, max_msgs) {
            Some(bytes) => {
                self.enqueue(bytes).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Registers `callback` in `subject`'s bucket (the empty string is the
    /// catch-all bucket) and returns its id.
    ///
    /// Callbacks run while the registry lock is held and so stall dispatch
    /// of subsequent messages; they should enqueue to a caller-owned queue
    /// rather than do real work inline (SPEC_FULL.md §4.D.1).
    pub fn add_callback(&self, callback: Callback, subject: &str) -> CallbackId {
        self.engine.add_callback(subject, callback)
    }

    /// Removes a callback previously returned by [`NatsClient::add_callback`].
    pub fn remove_callback(&self, id: CallbackId, subject: &str) -> bool {
        self.engine.remove_callback(subject, id)
    }

    async fn enqueue(&self, bytes: bytes::Bytes) -> ClientResult<()> {
        self.sender.send(bytes, SEND_TIMEOUT).await.map_err(|e| match e {
            crate::transport::TransportError::Backpressure => ClientError::Backpressure,
            other => ClientError::Transport(other),
        })
    }
}

/// Pumps frames from the transport into the engine, forwarding any resulting
/// outbound bytes (and TLS upgrades) back out, until cancelled or the
/// transport closes. Returns the transport so `close()` can shut it down.
async fn run_engine(
    mut transport: Transport,
    engine: std::sync::Arc<ProtocolEngine>,
    tls_config: Option<std::sync::Arc<rustls::ClientConfig>>,
    host: String,
) -> Transport {
    let shutdown = transport.shutdown_handle();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            maybe = transport.recv() => {
                match maybe {
                    Some(frame) => {
                        if !handle_one(&mut transport, &engine, &tls_config, &host, frame).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    transport
}

async fn handle_one(
    transport: &mut Transport,
    engine: &ProtocolEngine,
    tls_config: &Option<std::sync::Arc<rustls::ClientConfig>>,
    host: &str,
    frame: Frame,
) -> bool {
    match engine.handle_frame(frame) {
        HandleOutcome::None => true,
        HandleOutcome::Send(bytes) => send_or_log(transport, bytes).await,
        HandleOutcome::UpgradeThenSend(bytes) => {
            let Some(config) = tls_config.clone() else {
                error!("handshake requested TLS upgrade but no TLS config is held");
                return false;
            };
            if let Err(e) = transport.wrap_socket(config, host).await {
                error!(error = %e, "TLS upgrade failed");
                return false;
            }
            send_or_log(transport, bytes).await
        }
        HandleOutcome::Fatal(reason) => {
            error!(%reason, "handshake failed");
            false
        }
    }
}

async fn send_or_log(transport: &mut Transport, bytes: bytes::Bytes) -> bool {
    if let Err(e) = transport.send(bytes, SEND_TIMEOUT).await {
        error!(error = %e, "failed to enqueue outbound bytes");
        return false;
    }
    true
}

impl Drop for NatsClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
