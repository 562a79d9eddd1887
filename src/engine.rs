// ABOUTME: Drives the handshake state machine, tracks subscriptions, and dispatches
// ABOUTME: MSG/HMSG frames to registered callbacks under a single shared lock

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::codec::{self, ConnectOptions, Frame, InfoOptions};

/// A registered callback. Boxed so callers can close over arbitrary state;
/// invoked with the frame that triggered dispatch (`Msg` or `Hmsg`).
pub type Callback = Arc<dyn Fn(&Frame) + Send + Sync>;

pub type CallbackId = u64;

/// The empty-subject bucket is the catch-all, per SPEC_FULL.md §3.
pub const CATCHALL: &str = "";

#[derive(Debug, Clone, Default)]
pub enum Credentials {
    #[default]
    None,
    UserPassword {
        user: String,
        password: String,
    },
    Token(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disconnected,
    AwaitingInfo,
    Connecting,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FatalReason {
    #[error("server requires TLS but no TLS configuration was supplied")]
    TlsRequired,
    #[error("server requires authentication but no credentials were supplied")]
    AuthMissing,
}

/// `subject -> sid`. At most one active subscription per subject.
type SubscriptionTable = IndexMap<String, String>;
/// `subject -> callback_id -> callback`, iterated in insertion order.
type CallbackBuckets = IndexMap<String, IndexMap<CallbackId, Callback>>;

struct Registry {
    subscriptions: SubscriptionTable,
    callbacks: CallbackBuckets,
}

/// Consumes inbound frames, drives the INFO/CONNECT handshake, and owns the
/// subscription table and callback registry. Does not own the transport --
/// callers drive `handle_frame` from whatever pulls frames off
/// `Transport::recv`, and the engine pushes outbound bytes back out via the
/// `send` closure supplied at construction (typically `Transport::send`).
pub struct ProtocolEngine {
    state: Mutex<EngineState>,
    info: Mutex<Option<InfoOptions>>,
    registry: Mutex<Registry>,
    next_sid: AtomicU64,
    next_callback_id: AtomicU64,
    credentials: Credentials,
    tls_configured: bool,
    ready: Arc<Notify>,
    fatal: Mutex<Option<FatalReason>>,
}

impl ProtocolEngine {
    pub fn new(credentials: Credentials, tls_configured: bool) -> Self {
        ProtocolEngine {
            state: Mutex::new(EngineState::AwaitingInfo),
            info: Mutex::new(None),
            registry: Mutex::new(Registry {
                subscriptions: SubscriptionTable::new(),
                callbacks: CallbackBuckets::new(),
            }),
            next_sid: AtomicU64::new(1),
            next_callback_id: AtomicU64::new(1),
            credentials,
            tls_configured,
            ready: Arc::new(Notify::new()),
            fatal: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn info(&self) -> Option<InfoOptions> {
        self.info.lock().clone()
    }

    /// Set only if the handshake hit a fatal condition (§4.C); `start()` on
    /// the facade consults this after waking on `ready_signal` to tell a
    /// clean `Ready` apart from a failed handshake.
    pub fn fatal_reason(&self) -> Option<FatalReason> {
        *self.fatal.lock()
    }

    /// Completed once the handshake either reaches `Ready` or hits a fatal
    /// condition; `start()` on the facade awaits this and then consults
    /// `state()`/`fatal_reason()` to tell the two apart.
    pub fn ready_signal(&self) -> Arc<Notify> {
        self.ready.clone()
    }

    /// Handles one inbound frame, returning any outbound bytes the caller
    /// should hand to the transport's send queue, or a fatal reason if the
    /// handshake cannot proceed (TLS/auth missing). On `Fatal`, the caller
    /// must still close the transport; the engine has already transitioned
    /// to `Closed`.
    pub fn handle_frame(&self, frame: Frame) -> HandleOutcome {
        match frame {
            Frame::Info(opts) => self.handle_info(opts),
            Frame::Ping => HandleOutcome::Send(codec::build_pong()),
            Frame::Ok => {
                debug!("server acknowledged with +OK");
                HandleOutcome::None
            }
            Frame::Err(message) => self.handle_err(message),
            Frame::Msg(msg) => {
                self.dispatch(&msg.subject, &Frame::Msg(msg));
                HandleOutcome::None
            }
            Frame::Hmsg(hmsg) => {
                self.dispatch(&hmsg.subject, &Frame::Hmsg(hmsg));
                HandleOutcome::None
            }
        }
    }

    fn handle_info(&self, opts: InfoOptions) -> HandleOutcome {
        *self.state.lock() = EngineState::Connecting;

        if opts.tls_required && !self.tls_configured {
            *self.state.lock() = EngineState::Closed;
            *self.fatal.lock() = Some(FatalReason::TlsRequired);
            self.ready.notify_waiters();
            return HandleOutcome::Fatal(FatalReason::TlsRequired);
        }

        let mut connect = ConnectOptions::new(opts.tls_required);
        if opts.auth_required {
            match &self.credentials {
                Credentials::UserPassword { user, password } => {
                    connect.user = Some(user.clone());
                    connect.pass = Some(password.clone());
                }
                Credentials::Token(token) => {
                    connect.auth_token = Some(token.clone());
                }
                Credentials::None => {
                    *self.state.lock() = EngineState::Closed;
                    *self.fatal.lock() = Some(FatalReason::AuthMissing);
                    self.ready.notify_waiters();
                    return HandleOutcome::Fatal(FatalReason::AuthMissing);
                }
            }
        }

        *self.info.lock() = Some(opts.clone());
        let bytes = match codec::build_connect(&connect) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize CONNECT options");
                return HandleOutcome::None;
            }
        };

        *self.state.lock() = EngineState::Ready;
        self.ready.notify_waiters();

        if opts.tls_required {
            HandleOutcome::UpgradeThenSend(bytes)
        } else {
            HandleOutcome::Send(bytes)
        }
    }

    fn handle_err(&self, message: String) -> HandleOutcome {
        warn!(message = %message, "server sent -ERR");
        if message.to_ascii_lowercase().contains("authorization violation") {
            *self.state.lock() = EngineState::Closed;
        }
        HandleOutcome::None
    }

    /// Invokes every callback in `registry[subject]` then every callback in
    /// `registry[""]`, both in insertion order, holding the lock only long
    /// enough to snapshot the invocation list -- callbacks run outside the
    /// lock so a slow callback doesn't stall concurrent `subscribe`/
    /// `unsubscribe` calls (though it does stall dispatch of the *next*
    /// frame, since the engine loop is single-threaded; see rustdoc on
    /// `add_callback`).
    fn dispatch(&self, subject: &str, frame: &Frame) {
        let invocations: Vec<Callback> = {
            let registry = self.registry.lock();
            let mut list: Vec<Callback> = Vec::new();
            if let Some(bucket) = registry.callbacks.get(subject) {
                list.extend(bucket.values().cloned());
            }
            if subject != CATCHALL {
                if let Some(bucket) = registry.callbacks.get(CATCHALL) {
                    list.extend(bucket.values().cloned());
                }
            }
            list
        };
        for callback in invocations {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(frame)));
            if let Err(payload) = outcome {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "callback panicked".to_string());
                warn!(subject, message, "callback panicked; isolated, dispatch continuing");
            }
        }
    }

    /// Returns `None` if `subject` is already subscribed; otherwise the
    /// fresh `sid` and the `SUB` bytes to enqueue.
    pub fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Option<(String, Bytes)> {
        let mut registry = self.registry.lock();
        if registry.subscriptions.contains_key(subject) {
            return None;
        }
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst).to_string();
        let bytes = codec::build_sub(subject, &sid, queue_group).ok()?;
        registry.subscriptions.insert(subject.to_string(), sid.clone());
        Some((sid, bytes))
    }

    /// Returns `None` if `subject` was not subscribed; otherwise the
    /// `UNSUB` bytes to enqueue. Leaves any registered callbacks for the
    /// subject in place (§4.C); logs a warning if any remain.
    pub fn unsubscribe(&self, subject: &str, max_msgs: Option<u64>) -> Option<Bytes> {
        let mut registry = self.registry.lock();
        let sid = registry.subscriptions.shift_remove(subject)?;
        let remaining_callbacks = registry
            .callbacks
            .get(subject)
            .map(|bucket| !bucket.is_empty())
            .unwrap_or(false);
        drop(registry);
        if remaining_callbacks {
            warn!(subject, "callbacks remain registered after unsubscribe");
        }
        Some(codec::build_unsub(&sid, max_msgs))
    }

    pub fn add_callback(&self, subject: &str, callback: Callback) -> CallbackId {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        let mut registry = self.registry.lock();
        registry
            .callbacks
            .entry(subject.to_string())
            .or_default()
            .insert(id, callback);
        id
    }

    pub fn remove_callback(&self, subject: &str, id: CallbackId) -> bool {
        let mut registry = self.registry.lock();
        match registry.callbacks.get_mut(subject) {
            Some(bucket) => bucket.shift_remove(&id).is_some(),
            None => false,
        }
    }

    pub fn is_subscribed(&self, subject: &str) -> bool {
        self.registry.lock().subscriptions.contains_key(subject)
    }
}

/// What the caller should do with the outcome of [`ProtocolEngine::handle_frame`].
pub enum HandleOutcome {
    /// Nothing to send.
    None,
    /// Enqueue these bytes on the transport's send queue.
    Send(Bytes),
    /// The handshake requires a TLS upgrade before the CONNECT bytes can be
    /// sent; the caller must call `Transport::wrap_socket` first, then send.
    UpgradeThenSend(Bytes),
    /// The handshake cannot proceed; the engine has already transitioned to
    /// `Closed`. The caller should close the transport.
    Fatal(FatalReason),
}
