// NATS wire codec - separates byte-level framing from the protocol engine
//
// Frames are CRLF-delimited ASCII headers; MSG/HMSG/PUB/HPUB carry a binary
// payload body whose length is declared in the header and is authoritative.
// `parse` is a pure function over a byte slice: it never blocks and never
// mutates its input, mirroring `Frame::check`/`Frame::parse` in the SMPP
// codec this crate is descended from, but working against CRLF text headers
// instead of a fixed 16-byte binary header.

use bytes::{BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ordered header map: HMSG/HPUB header blocks preserve insertion order and
/// the last value wins on a duplicate name, so a plain `HashMap` won't do.
pub type Headers = IndexMap<String, String>;

/// A header line longer than this without a terminating CRLF is treated as
/// garbage rather than held indefinitely awaiting more bytes.
const MAX_HEADER_LINE: usize = 4096;

/// Snapshot of the server's `INFO` options, captured once at handshake.
///
/// Every field but the handful the protocol always sends defaults when
/// absent from the JSON object, matching the source's `InfoOptions.build()`
/// which treats the whole options dict as best-effort.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InfoOptions {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub proto: i64,
    pub max_payload: u64,
    #[serde(default)]
    pub headers: bool,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub tls_verify: bool,
    #[serde(default)]
    pub connect_urls: Vec<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub ldm: bool,
    #[serde(default)]
    pub jetstream: bool,
    #[serde(default)]
    pub client_id: Option<u64>,
}

/// Options serialized into the outbound `CONNECT` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectOptions {
    pub lang: &'static str,
    pub version: &'static str,
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    pub headers: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl ConnectOptions {
    pub fn new(tls_required: bool) -> Self {
        ConnectOptions {
            lang: "rust",
            version: env!("CARGO_PKG_VERSION"),
            verbose: true,
            pedantic: false,
            tls_required,
            headers: true,
            user: None,
            pass: None,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MsgFrame {
    pub subject: String,
    pub sid: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HmsgFrame {
    pub subject: String,
    pub sid: String,
    pub reply_to: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

/// A single parsed frame from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Info(InfoOptions),
    Msg(MsgFrame),
    Hmsg(HmsgFrame),
    Ping,
    Ok,
    Err(String),
}

/// Result of handing a buffer to [`parse`].
#[derive(Debug, PartialEq)]
pub enum ParseOutcome {
    /// A complete frame was found; `consumed` bytes (including trailing
    /// CRLF and any payload) should be advanced off the front of the buffer.
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds the start of a frame but not all of it yet. Zero
    /// bytes consumed; call again once more bytes have arrived.
    NeedMore,
    /// The buffer does not begin with a recognized frame tag. `consumed`
    /// bytes (up to and including the next CRLF) should be dropped; this is
    /// logged by the transport but is not itself a fatal condition.
    Resync { consumed: usize },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed {0} header: {1}")]
    MalformedHeader(&'static str, String),
    #[error("invalid byte count in {0} header")]
    InvalidByteCount(&'static str),
    #[error("non-utf8 field in frame header")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid INFO/CONNECT JSON")]
    Json(#[from] serde_json::Error),
    #[error("subject fails grammar: {0:?}")]
    InvalidSubject(String),
    #[error("bad argument: {0}")]
    BadArgument(String),
}

/// Parse at most one frame from the front of `buf`. Never mutates `buf`;
/// the caller advances its own buffer by `consumed` on a `Frame` or
/// `Resync` result.
pub fn parse(buf: &[u8]) -> Result<ParseOutcome, CodecError> {
    if buf.is_empty() {
        return Ok(ParseOutcome::NeedMore);
    }

    let Some(header_end) = find_crlf(buf) else {
        if buf.len() > MAX_HEADER_LINE {
            return Ok(ParseOutcome::Resync { consumed: buf.len() });
        }
        return Ok(ParseOutcome::NeedMore);
    };
    let header = &buf[..header_end];
    let header_total = header_end + 2;

    if header == b"PING" {
        return Ok(ParseOutcome::Frame {
            frame: Frame::Ping,
            consumed: header_total,
        });
    }
    if header == b"+OK" {
        return Ok(ParseOutcome::Frame {
            frame: Frame::Ok,
            consumed: header_total,
        });
    }
    if let Some(rest) = strip_tag(header, b"-ERR") {
        let msg = std::str::from_utf8(trim_ascii(rest))?.trim_matches('\'').to_string();
        return Ok(ParseOutcome::Frame {
            frame: Frame::Err(msg),
            consumed: header_total,
        });
    }
    if let Some(rest) = strip_tag(header, b"INFO") {
        let opts: InfoOptions = serde_json::from_slice(trim_ascii(rest))?;
        return Ok(ParseOutcome::Frame {
            frame: Frame::Info(opts),
            consumed: header_total,
        });
    }
    if let Some(rest) = strip_tag(header, b"HMSG") {
        return parse_hmsg(buf, rest, header_total);
    }
    if let Some(rest) = strip_tag(header, b"MSG") {
        return parse_msg(buf, rest, header_total);
    }

    Ok(ParseOutcome::Resync {
        consumed: header_total,
    })
}

fn parse_msg(buf: &[u8], rest: &[u8], header_total: usize) -> Result<ParseOutcome, CodecError> {
    let tokens = split_ws(rest);
    let (subject, sid, reply_to, nbytes) = match tokens.as_slice() {
        [subject, sid, nbytes] => (*subject, *sid, None, *nbytes),
        [subject, sid, reply_to, nbytes] => (*subject, *sid, Some(*reply_to), *nbytes),
        _ => return Err(CodecError::MalformedHeader("MSG", lossy(rest))),
    };
    let n = parse_usize(nbytes, "MSG")?;
    let total_needed = header_total + n + 2;
    if buf.len() < total_needed {
        return Ok(ParseOutcome::NeedMore);
    }
    if &buf[header_total + n..total_needed] != b"\r\n" {
        return Err(CodecError::MalformedHeader(
            "MSG",
            "payload missing trailing CRLF".to_string(),
        ));
    }
    let payload = Bytes::copy_from_slice(&buf[header_total..header_total + n]);
    Ok(ParseOutcome::Frame {
        frame: Frame::Msg(MsgFrame {
            subject: to_utf8(subject)?,
            sid: to_utf8(sid)?,
            reply_to: reply_to.map(to_utf8).transpose()?,
            payload,
        }),
        consumed: total_needed,
    })
}

fn parse_hmsg(buf: &[u8], rest: &[u8], header_total: usize) -> Result<ParseOutcome, CodecError> {
    let tokens = split_ws(rest);
    let (subject, sid, reply_to, hdr_bytes, total_bytes) = match tokens.as_slice() {
        [subject, sid, hdr_bytes, total_bytes] => (*subject, *sid, None, *hdr_bytes, *total_bytes),
        [subject, sid, reply_to, hdr_bytes, total_bytes] => {
            (*subject, *sid, Some(*reply_to), *hdr_bytes, *total_bytes)
        }
        _ => return Err(CodecError::MalformedHeader("HMSG", lossy(rest))),
    };
    let hdr_len = parse_usize(hdr_bytes, "HMSG")?;
    let total_len = parse_usize(total_bytes, "HMSG")?;
    if total_len < hdr_len {
        return Err(CodecError::InvalidByteCount("HMSG"));
    }
    let total_needed = header_total + total_len + 2;
    if buf.len() < total_needed {
        return Ok(ParseOutcome::NeedMore);
    }
    if &buf[header_total + total_len..total_needed] != b"\r\n" {
        return Err(CodecError::MalformedHeader(
            "HMSG",
            "payload missing trailing CRLF".to_string(),
        ));
    }
    let hdr_block = &buf[header_total..header_total + hdr_len];
    let payload = Bytes::copy_from_slice(&buf[header_total + hdr_len..header_total + total_len]);
    let headers = parse_header_block(hdr_block)?;
    Ok(ParseOutcome::Frame {
        frame: Frame::Hmsg(HmsgFrame {
            subject: to_utf8(subject)?,
            sid: to_utf8(sid)?,
            reply_to: reply_to.map(to_utf8).transpose()?,
            headers,
            payload,
        }),
        consumed: total_needed,
    })
}

/// Parses a `NATS/1.0\r\nName: Value\r\n...\r\n` block. The leading status
/// line is discarded; later lines are split on the first `:` with both
/// sides trimmed. Last value wins on a duplicate name.
fn parse_header_block(block: &[u8]) -> Result<Headers, CodecError> {
    let mut headers = Headers::new();
    let mut lines = block.split(|&b| b == b'\n');
    lines.next(); // NATS/1.0[...] status line
    for line in lines {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = std::str::from_utf8(trim_ascii(&line[..colon]))?.to_string();
        let value = std::str::from_utf8(trim_ascii(&line[colon + 1..]))?.to_string();
        headers.insert(name, value);
    }
    Ok(headers)
}

pub fn build_connect(opts: &ConnectOptions) -> Result<Bytes, CodecError> {
    let json = serde_json::to_string(opts)?;
    let mut out = BytesMut::with_capacity(json.len() + 16);
    out.put_slice(b"CONNECT ");
    out.put_slice(json.as_bytes());
    out.put_slice(b"\r\n");
    Ok(out.freeze())
}

pub fn build_pub(subject: &str, payload: &[u8], reply_to: Option<&str>) -> Result<Bytes, CodecError> {
    validate_subject(subject)?;
    let mut out = BytesMut::with_capacity(subject.len() + payload.len() + 32);
    out.put_slice(b"PUB ");
    out.put_slice(subject.as_bytes());
    if let Some(reply) = reply_to {
        out.put_u8(b' ');
        out.put_slice(reply.as_bytes());
    }
    out.put_slice(format!(" {}\r\n", payload.len()).as_bytes());
    out.put_slice(payload);
    out.put_slice(b"\r\n");
    Ok(out.freeze())
}

pub fn build_hpub(
    subject: &str,
    payload: &[u8],
    headers: &Headers,
    reply_to: Option<&str>,
) -> Result<Bytes, CodecError> {
    validate_subject(subject)?;
    let mut hdr_block = BytesMut::new();
    hdr_block.put_slice(b"NATS/1.0\r\n");
    for (name, value) in headers {
        hdr_block.put_slice(name.as_bytes());
        hdr_block.put_slice(b": ");
        hdr_block.put_slice(value.as_bytes());
        hdr_block.put_slice(b"\r\n");
    }
    hdr_block.put_slice(b"\r\n");
    let hdr_len = hdr_block.len();
    let total_len = hdr_len + payload.len();

    let mut out = BytesMut::with_capacity(subject.len() + hdr_len + payload.len() + 48);
    out.put_slice(b"HPUB ");
    out.put_slice(subject.as_bytes());
    if let Some(reply) = reply_to {
        out.put_u8(b' ');
        out.put_slice(reply.as_bytes());
    }
    out.put_slice(format!(" {hdr_len} {total_len}\r\n").as_bytes());
    out.put_slice(&hdr_block);
    out.put_slice(payload);
    out.put_slice(b"\r\n");
    Ok(out.freeze())
}

/// Unlike `build_pub`/`build_hpub`, this does not run the publish subject
/// grammar through `validate_subject`: `SUB` subjects may carry the server
/// wildcards `*`/`>` (SPEC_FULL.md §4.A/§6), and no pack reference client
/// validates subscribe-subject syntax either.
pub fn build_sub(subject: &str, sid: &str, queue_group: Option<&str>) -> Result<Bytes, CodecError> {
    if subject.is_empty() {
        return Err(CodecError::InvalidSubject(subject.to_string()));
    }
    let mut s = format!("SUB {subject}");
    if let Some(group) = queue_group {
        s.push(' ');
        s.push_str(group);
    }
    s.push(' ');
    s.push_str(sid);
    s.push_str("\r\n");
    Ok(Bytes::from(s))
}

pub fn build_unsub(sid: &str, max_msgs: Option<u64>) -> Bytes {
    let mut s = format!("UNSUB {sid}");
    if let Some(max) = max_msgs {
        s.push_str(&format!(" {max}"));
    }
    s.push_str("\r\n");
    Bytes::from(s)
}

pub fn build_pong() -> Bytes {
    Bytes::from_static(b"PONG\r\n")
}

/// Subject grammar: one or more `[A-Za-z0-9_]+` tokens joined by `.`.
/// Server wildcards `*`/`>` are accepted by the server but are not produced
/// or required client-side, so they are rejected here deliberately --
/// publishing a wildcard subject is always a caller mistake.
pub fn validate_subject(subject: &str) -> Result<(), CodecError> {
    if subject.is_empty() {
        return Err(CodecError::InvalidSubject(subject.to_string()));
    }
    let valid = subject.split('.').all(|token| {
        !token.is_empty()
            && token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    });
    if valid {
        Ok(())
    } else {
        Err(CodecError::InvalidSubject(subject.to_string()))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn strip_tag<'a>(header: &'a [u8], tag: &[u8]) -> Option<&'a [u8]> {
    let rest = header.strip_prefix(tag)?;
    if rest.first().is_some_and(u8::is_ascii_whitespace) {
        Some(rest)
    } else {
        None
    }
}

fn trim_ascii(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|c| !c.is_ascii_whitespace()).unwrap_or(b.len());
    let end = b.iter().rposition(|c| !c.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &b[start..end]
}

fn split_ws(b: &[u8]) -> Vec<&[u8]> {
    trim_ascii(b)
        .split(|c| c.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
        .collect()
}

fn parse_usize(token: &[u8], frame: &'static str) -> Result<usize, CodecError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CodecError::InvalidByteCount(frame))
}

fn to_utf8(b: &[u8]) -> Result<String, CodecError> {
    Ok(std::str::from_utf8(b)?.to_string())
}

fn lossy(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}
