//! Minimal HTTP/1.1 wire encode/decode.
//!
//! The hard part of this crate is the range-fetch pipeline, not HTTP parsing
//! — so this module stays deliberately small: read a head (request or
//! response) off a buffered socket with `httparse`, store it in an
//! [`http`](http) [`HeaderMap`] for typed manipulation, and write a head back
//! out by hand. Bodies are handled by the caller (`Content-Length`-driven
//! reads, or a raw byte copy when the length is open-ended), since the
//! range coordinator needs to interleave body reads with its own
//! reassembly logic rather than have a library buffer the whole thing.

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use smol::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EngineError, Result};

pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// A request as it will be written to an upstream connection.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    /// The request-target exactly as it should appear on the wire: an
    /// origin-form path (`/index.html`), an absolute-form URI
    /// (`http://host/index.html`, used when forwarding via another HTTP
    /// proxy), or an authority-form `host:port` (CONNECT).
    pub target: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_header(&mut self, name: &'static str, value: String) {
        if let Ok(hv) = HeaderValue::from_str(&value) {
            self.headers
                .insert(HeaderName::from_static(name), hv);
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    /// Strips the full RFC 7230 hop-by-hop header set. The source only
    /// stripped `Proxy-Connection`; a correct forwarder strips all of them.
    pub fn strip_hop_by_hop(&mut self) {
        for name in HOP_BY_HOP {
            self.headers.remove(*name);
        }
    }

    /// Deep clone, independent of `self` — used to build each range
    /// worker's private request rather than the source's serialize/reparse
    /// trick.
    pub fn deep_clone(&self) -> RawRequest {
        RawRequest {
            method: self.method.clone(),
            target: self.target.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", self.method.as_str(), self.target).as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() && self.headers.get("content-length").is_none() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        w.write_all(&out).await.map_err(EngineError::Write)?;
        w.flush().await.map_err(EngineError::Write)
    }
}

pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
];

/// A response head, read off the wire. The body is left for the caller.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_header(&mut self, name: &'static str, value: String) {
        if let Ok(hv) = HeaderValue::from_str(&value) {
            self.headers.insert(HeaderName::from_static(name), hv);
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    pub fn connection_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }

    /// Serializes the head (status line + headers + trailing CRLF) without a
    /// body. Callers stream the body separately.
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        let reason = if self.reason.is_empty() {
            self.status.canonical_reason().unwrap_or("")
        } else {
            self.reason.as_str()
        };
        out.extend_from_slice(
            format!("HTTP/1.1 {} {reason}\r\n", self.status.as_u16()).as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    pub async fn write_head_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.head_bytes()).await.map_err(EngineError::Write)?;
        w.flush().await.map_err(EngineError::Write)
    }
}

/// Reads a byte stream up to and including the terminating `\r\n\r\n`,
/// bounded by [`MAX_HEAD_BYTES`]. Returns the head bytes (including the
/// terminator) and any bytes read past it — the start of the body, already
/// pulled off the socket and buffered in memory.
async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut tmp = [0u8; 1024];
    loop {
        let n = reader.read(&mut tmp).await.map_err(EngineError::Read)?;
        if n == 0 {
            return Err(EngineError::Protocol("peer closed before a full head".into()));
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > MAX_HEAD_BYTES {
            return Err(EngineError::Protocol("head exceeds size limit".into()));
        }
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            let leftover = buf[pos + 4..].to_vec();
            buf.truncate(pos + 4);
            return Ok((buf, leftover));
        }
    }
}

/// Reads and parses an HTTP/1.1 response status line + headers.
///
/// The second element of the returned tuple holds any bytes read past the
/// head terminator (the start of the body, already buffered in memory) so
/// the caller doesn't lose them.
pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(RawResponse, Vec<u8>)> {
    let (head, leftover) = read_head(reader).await?;
    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers_buf);
    let status = resp
        .parse(&head)
        .map_err(|e| EngineError::Protocol(format!("bad response head: {e}")))?;
    if status.is_partial() {
        return Err(EngineError::Protocol("incomplete response head".into()));
    }
    let code = resp
        .code
        .ok_or_else(|| EngineError::Protocol("missing status code".into()))?;
    let reason = resp.reason.unwrap_or("").to_string();
    let mut headers = HeaderMap::new();
    for h in resp.headers.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(h.name.as_bytes()),
            HeaderValue::from_bytes(h.value),
        ) {
            headers.append(name, value);
        }
    }
    let status = StatusCode::from_u16(code)
        .map_err(|_| EngineError::Protocol(format!("invalid status code {code}")))?;
    Ok((RawResponse { status, reason, headers }, leftover))
}

/// Reads exactly `len` bytes of body, consuming `leftover` (bytes already
/// pulled off the socket by [`read_response`]) first and erroring on short
/// read.
pub async fn read_exact_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    leftover: Vec<u8>,
    len: usize,
) -> Result<Vec<u8>> {
    if leftover.len() >= len {
        return Ok(leftover[..len].to_vec());
    }
    let mut buf = leftover;
    buf.reserve(len - buf.len());
    let start = buf.len();
    buf.resize(len, 0);
    reader
        .read_exact(&mut buf[start..])
        .await
        .map_err(EngineError::Read)?;
    Ok(buf)
}

/// Parses a `Range: bytes=a-b` (or `bytes=a-`) header value. Returns
/// `(start, end)` where `end = None` means open-ended.
pub fn parse_range_header(value: &str) -> Option<(i64, Option<i64>)> {
    let rest = value.strip_prefix("bytes=")?;
    let (a, b) = rest.split_once('-')?;
    let start: i64 = a.trim().parse().ok()?;
    if b.trim().is_empty() {
        Some((start, None))
    } else {
        Some((start, Some(b.trim().parse().ok()?)))
    }
}

/// Parses a `Content-Range: bytes start-end/total` header value.
pub fn parse_content_range(value: &str) -> Option<(i64, i64, i64)> {
    let rest = value.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some((
        start.trim().parse().ok()?,
        end.trim().parse().ok()?,
        total.trim().parse().ok()?,
    ))
}

pub fn format_range_header(start: i64, end: i64) -> String {
    format!("bytes={start}-{end}")
}

pub fn format_content_range(start: i64, end: i64, total: i64) -> String {
    format!("bytes {start}-{end}/{total}")
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Races `fut` against a timer, turning an elapsed deadline into a
/// [`EngineError::Read`] timeout. The source left this as a commented-out
/// 30-second read deadline on worker reads; here it's a real, configurable
/// one (§9).
pub async fn with_deadline<T>(
    fut: impl std::future::Future<Output = Result<T>>,
    dur: std::time::Duration,
) -> Result<T> {
    smol::future::or(fut, async move {
        smol::Timer::after(dur).await;
        Err(EngineError::Read(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "read deadline exceeded",
        )))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_open_ended() {
        assert_eq!(parse_range_header("bytes=10-"), Some((10, None)));
    }

    #[test]
    fn range_header_bounded() {
        assert_eq!(parse_range_header("bytes=2-7"), Some((2, Some(7))));
    }

    #[test]
    fn range_header_rejects_garbage() {
        assert_eq!(parse_range_header("nonsense"), None);
    }

    #[test]
    fn content_range_roundtrip() {
        let formatted = format_content_range(2, 7, 10);
        assert_eq!(formatted, "bytes 2-7/10");
        assert_eq!(parse_content_range(&formatted), Some((2, 7, 10)));
    }

    #[test]
    fn hop_by_hop_includes_full_rfc7230_set() {
        for name in [
            "Connection",
            "Keep-Alive",
            "TE",
            "Trailer",
            "Transfer-Encoding",
            "Upgrade",
            "Proxy-Authenticate",
            "Proxy-Authorization",
            "Proxy-Connection",
        ] {
            assert!(HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()));
        }
    }
}
