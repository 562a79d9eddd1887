// ABOUTME: Owns the TCP (and, after upgrade, TLS) socket and the reader/writer tasks
// ABOUTME: that drain it; exposes bounded frame/byte queues and an in-place TLS upgrade

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::codec::{self, CodecError, Frame, ParseOutcome};

/// Queue capacity for both the inbound frame queue and the outbound byte
/// queue, per the bounded-queue contract.
pub const QUEUE_CAPACITY: usize = 50;

const READ_CHUNK: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid server hostname for tls: {0}")]
    InvalidServerName(String),
    #[error("outbound queue is full")]
    Backpressure,
    #[error("transport is closed")]
    Closed,
    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Consolidates the source's dual close-pipe-plus-exit-flag scheme (Open
/// Question 4, see DESIGN.md) into a single shutdown signal: an atomic
/// latch so a cancellation arriving before a task starts waiting is not
/// missed, plus a `Notify` so a task already waiting wakes immediately.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// A socket that may or may not be TLS-wrapped; lets the reader/writer
/// tasks stay generic across the in-place TLS upgrade.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

type BoxedStream = Box<dyn AsyncReadWrite>;

type WriterExit = (WriteHalf<BoxedStream>, mpsc::Receiver<Bytes>);

pub struct Transport {
    send_tx: mpsc::Sender<Bytes>,
    recv_rx: mpsc::Receiver<Frame>,
    recv_tx: mpsc::Sender<Frame>,
    /// Per-generation cancellation: stops the *current* reader/writer task
    /// pair and is replaced with a fresh token on every `wrap_socket` call.
    cancel: CancellationToken,
    /// Stable for the transport's whole lifetime; `close()` is the only
    /// thing that fires it. Lets a caller hold a handle across TLS upgrades
    /// without it going stale the way a clone of `cancel` would.
    shutdown: CancellationToken,
    reader: Option<JoinHandle<ReadHalf<BoxedStream>>>,
    writer: Option<JoinHandle<WriterExit>>,
}

impl Transport {
    /// Connects to `host:port` and starts the reader/writer tasks. The
    /// returned transport is not yet handshaked -- the protocol engine
    /// drives INFO/CONNECT over `recv_queue`/`send_queue`.
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(Box::new(stream)))
    }

    fn from_stream(stream: BoxedStream) -> Self {
        let (send_tx, send_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (recv_tx, recv_rx) = mpsc::channel(QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        let (rd, wr) = tokio::io::split(stream);
        let reader = tokio::spawn(run_reader(rd, recv_tx.clone(), cancel.clone()));
        let writer = tokio::spawn(run_writer(wr, send_rx, cancel.clone()));

        Transport {
            send_tx,
            recv_rx,
            recv_tx,
            cancel,
            shutdown: CancellationToken::new(),
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// A clone of the transport's stable shutdown signal, safe to hold
    /// across TLS upgrades (unlike a clone of the per-generation reader/
    /// writer cancellation token).
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A cheap, cloneable handle for enqueueing outbound bytes, usable
    /// independently of the `Transport` value itself (which is normally
    /// moved into the task that drives `recv`/`wrap_socket`).
    pub fn sender(&self) -> TransportSender {
        TransportSender {
            send_tx: self.send_tx.clone(),
        }
    }

    /// Enqueues raw bytes for the writer task, failing with `Backpressure`
    /// if the outbound queue stays full past `timeout`.
    pub async fn send(&self, bytes: Bytes, timeout: std::time::Duration) -> Result<(), TransportError> {
        self.sender().send(bytes, timeout).await
    }

    /// Awaits the next parsed frame. Resolves to `None` once the reader
    /// task has exited and drained its sender.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.recv_rx.recv().await
    }

    /// Performs the in-place TLS upgrade described in SPEC_FULL.md §4.B:
    /// join both I/O tasks, reassemble the plain socket, wrap it in TLS,
    /// then restart the tasks against the wrapped stream. `recv_queue` and
    /// `send_queue` (and their buffered contents) are preserved across the
    /// upgrade since only the stream underneath the tasks changes.
    pub async fn wrap_socket(
        &mut self,
        tls_config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<(), TransportError> {
        self.cancel.cancel();
        let rd = self.reader.take().expect("transport already upgraded").await.map_err(io_join_err)?;
        let (wr, send_rx) = self.writer.take().expect("transport already upgraded").await.map_err(io_join_err)?;
        let stream = rd.unsplit(wr);

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TransportError::InvalidServerName(server_name.to_string()))?;
        let connector = tokio_rustls::TlsConnector::from(tls_config);
        let tls_stream = connector.connect(name, stream).await?;

        self.cancel = CancellationToken::new();
        let (rd, wr) = tokio::io::split(Box::new(tls_stream) as BoxedStream);
        self.reader = Some(tokio::spawn(run_reader(rd, self.recv_tx.clone(), self.cancel.clone())));
        self.writer = Some(tokio::spawn(run_writer(wr, send_rx, self.cancel.clone())));
        Ok(())
    }

    /// Signals both I/O tasks to exit and joins them. Idempotent socket
    /// shutdown is implicit: dropping the reassembled stream closes it.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.shutdown.cancel();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }
}

/// Cheap, cloneable handle for enqueueing outbound bytes without holding
/// onto the rest of the `Transport` value.
#[derive(Clone)]
pub struct TransportSender {
    send_tx: mpsc::Sender<Bytes>,
}

impl TransportSender {
    pub async fn send(&self, bytes: Bytes, timeout: std::time::Duration) -> Result<(), TransportError> {
        match tokio::time::timeout(timeout, self.send_tx.send(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Backpressure),
        }
    }
}

fn io_join_err(e: tokio::task::JoinError) -> TransportError {
    TransportError::Io(io::Error::other(e))
}

async fn run_reader(
    mut rd: ReadHalf<BoxedStream>,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> ReadHalf<BoxedStream> {
    let mut buf = BytesMut::with_capacity(4 * 1024);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reader task cancelled");
                break;
            }
            result = rd.read_buf(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("reader task observed clean eof");
                        break;
                    }
                    Ok(_) => {
                        if !drain(&mut buf, &tx).await {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "reader task socket error");
                        break;
                    }
                }
            }
        }
    }
    rd
}

/// Repeatedly invokes the codec against the accumulated buffer, enqueueing
/// each produced frame and advancing past resynced garbage, until the
/// codec reports `NeedMore`. Returns `false` if the receiving end of
/// `recv_queue` has been dropped, signaling the caller to stop reading.
async fn drain(buf: &mut BytesMut, tx: &mpsc::Sender<Frame>) -> bool {
    loop {
        match codec::parse(buf) {
            Ok(ParseOutcome::Frame { frame, consumed }) => {
                bytes::Buf::advance(buf, consumed);
                if tx.send(frame).await.is_err() {
                    return false;
                }
            }
            Ok(ParseOutcome::NeedMore) => return true,
            Ok(ParseOutcome::Resync { consumed }) => {
                warn!(consumed, "discarding unparseable bytes, resyncing to next frame boundary");
                bytes::Buf::advance(buf, consumed);
            }
            Err(e) => {
                error!(error = %e, "fatal codec error, closing reader");
                return false;
            }
        }
    }
}

async fn run_writer(
    mut wr: WriteHalf<BoxedStream>,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> WriterExit {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("writer task cancelled");
                break;
            }
            maybe = rx.recv() => {
                match maybe {
                    Some(bytes) => {
                        if let Err(e) = wr.write_all(&bytes).await {
                            error!(error = %e, "writer task socket error");
                            break;
                        }
                    }
                    None => {
                        debug!("writer task observed sender drop");
                        break;
                    }
                }
            }
        }
    }
    (wr, rx)
}
