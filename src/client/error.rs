// ABOUTME: Client-facing error type for NATS client operations
// ABOUTME: Wraps transport/codec failures and the caller-facing conditions from SPEC_FULL.md §7

use thiserror::Error;

use crate::codec::CodecError;
use crate::engine::FatalReason;
use crate::transport::TransportError;

/// Errors a caller can observe from [`crate::client::NatsClient`] methods.
///
/// Transport- and engine-internal failures that aren't surfaced synchronously
/// (socket errors mid-connection, `-ERR` frames) are logged instead; see
/// SPEC_FULL.md §7's propagation policy.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Non-string subject, non-map headers, or other caller input that fails
    /// validation before anything is sent.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// The outbound queue stayed full past the enqueue deadline.
    #[error("send queue is full")]
    Backpressure,

    /// `len(payload) > InfoOptions.max_payload`.
    #[error("payload of {len} bytes exceeds server max_payload of {max}")]
    PayloadTooLarge { len: usize, max: u64 },

    /// The handshake could not proceed; see [`FatalReason`] for which
    /// condition triggered it.
    #[error("handshake failed: {0}")]
    Handshake(#[from] FatalReason),

    /// The transport reported an error (connection reset, TLS failure, …).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame failed to decode or encode.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// `start()`/`publish()`/etc. were called on a client that is not (or no
    /// longer) connected.
    #[error("client is not connected")]
    NotConnected,
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
