// ABOUTME: Builder for NATS client connection options (host, credentials, TLS, catch-all callback)
// ABOUTME: The typed equivalent of the language-neutral `new(...)` constructor in SPEC_FULL.md §6

use std::sync::Arc;

use crate::codec::Frame;
use crate::engine::Credentials;

/// A registered callback, boxed so callers can close over arbitrary state.
pub type Callback = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Connection parameters for [`NatsClient::start`](crate::client::NatsClient::start).
///
/// Bundles everything the source's `new(host, port, user?, password?,
/// auth_token?, tls_config?, catchall_callback?)` constructor took as loose
/// positional arguments into one typed, fluently-built value, following the
/// same builder-struct-plus-fluent-method pattern this lineage already used
/// for SMPP bind credentials.
#[derive(Clone)]
pub struct ClientOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) credentials: Credentials,
    pub(crate) tls_config: Option<Arc<rustls::ClientConfig>>,
    pub(crate) catchall_callback: Option<Callback>,
}

impl ClientOptions {
    /// Starts from a bare `host:port` with no credentials, no TLS, and no
    /// catch-all callback -- the minimal connection SPEC_FULL.md §6 allows.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientOptions {
            host: host.into(),
            port,
            credentials: Credentials::None,
            tls_config: None,
            catchall_callback: None,
        }
    }

    /// Supplies `user`/`pass` CONNECT credentials, used if the server's INFO
    /// indicates `auth_required`.
    pub fn with_user_password(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Credentials::UserPassword {
            user: user.into(),
            password: password.into(),
        };
        self
    }

    /// Supplies an `auth_token` CONNECT credential.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.credentials = Credentials::Token(token.into());
        self
    }

    /// Supplies a pre-built TLS client configuration (certificates, key, CA
    /// trust store, hostname verification policy already baked in). Loading
    /// that material from disk or environment is the caller's job, per
    /// SPEC_FULL.md §1's scope boundary.
    pub fn with_tls_config(mut self, tls_config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    /// Registers `callback` in the empty-subject bucket before the client
    /// ever connects, so it's in place for the very first MSG/HMSG delivered.
    pub fn with_catchall_callback(mut self, callback: Callback) -> Self {
        self.catchall_callback = Some(callback);
        self
    }
}
