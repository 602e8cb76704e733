//! The request orchestrator (§4.3): the single place that ties the upstream
//! session, the tunnel relay and the range prefetch coordinator together
//! into the per-request decision the inbound listener drives.

use std::sync::Arc;

use smol::io::AsyncWriteExt;
use smol::net::TcpStream;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::iface::{Dialer, HostPolicy, Resolver};
use crate::range::coordinator::{self, PrefetchInput};
use crate::session::UpstreamSession;
use crate::tunnel::{self, CONNECTION_ESTABLISHED};
use crate::wire::{self, RawRequest};

/// What the caller should do with the client connection once a request has
/// been handled.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionDirective {
    /// Keep reading further requests off the same client connection.
    AwaitNextRequest,
    /// The client side is done; tear the connection down.
    Close,
}

/// Bundles the collaborators an inbound listener supplies once per accepted
/// connection (§1): DNS resolution, dialing, and host policy predicates are
/// all external to this crate.
pub struct Orchestrator {
    config: Arc<EngineConfig>,
    host_policy: Arc<dyn HostPolicy>,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<EngineConfig>,
        host_policy: Arc<dyn HostPolicy>,
        resolver: Arc<dyn Resolver>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self { config, host_policy, resolver, dialer }
    }

    /// Handles an HTTPS `CONNECT host:port` session: dials the origin, sends
    /// the `200 Connection established` line, then hands both sockets to the
    /// tunnel relay. Runs to completion — there is no next request on a
    /// tunneled connection.
    pub async fn handle_connect(
        &self,
        session: &UpstreamSession,
        authority: &str,
        mut client: TcpStream,
    ) -> Result<()> {
        let hostport = ensure_port(authority, 443);
        session.open(&hostport).await?;
        let upstream = session.raw_stream().await?;

        client
            .write_all(CONNECTION_ESTABLISHED)
            .await
            .map_err(crate::error::EngineError::Write)?;

        let result = tunnel::relay(client, upstream).await;
        session.close().await;
        result
    }

    /// Handles one HTTP request-response cycle on `session`/`client` (§4.3
    /// steps 1-7). Returns whether the caller may read another request off
    /// the same client connection.
    pub async fn handle_http(
        &self,
        session: &UpstreamSession,
        req: &mut RawRequest,
        client: &mut TcpStream,
    ) -> Result<SessionDirective> {
        let host = req
            .header("host")
            .ok_or_else(|| crate::error::EngineError::Protocol("request missing Host header".into()))?
            .to_string();
        let hostport = ensure_port(&host, 80);

        session.open(&hostport).await?;

        let direct_mode = !session.is_over_proxy();
        if direct_mode && self.host_policy.inject_crlf(&host) {
            session.write_crlf_evasion().await?;
        }

        let request_wants_close = header_says_close(req.header("connection"))
            || header_says_close(req.header("proxy-connection"));

        req.strip_hop_by_hop();

        let orig_range = req.header("range").map(|s| s.to_string());
        let injected_range = direct_mode && self.maybe_inject_range(req, &host, &orig_range);

        session.write_request(req).await?;

        let (resp, leftover) = session.read_response().await?;
        let response_wants_close = resp.connection_close() || request_wants_close;

        if injected_range {
            if let Some(content_range) = resp.header("content-range").map(|s| s.to_string()) {
                let input = PrefetchInput {
                    resp,
                    req,
                    orig_range,
                    content_range,
                    host: host.clone(),
                };
                let mut conn = session.lock_conn().await;
                let reader = conn.reader()?;
                let session_closed = session.closed_flag();
                let outcome = coordinator::run_coordinator(
                    input,
                    reader,
                    leftover,
                    client,
                    self.config.clone(),
                    self.host_policy.clone(),
                    self.resolver.clone(),
                    self.dialer.clone(),
                    session_closed,
                )
                .await;
                drop(conn);
                outcome?;
                // A range-prefetch response always ends the connection: the
                // dedicated origin connection the coordinator used is not
                // the one callers resume on for a next request.
                session.close().await;
                return Ok(SessionDirective::Close);
            }
            log::debug!("injected Range for {host} went unhonored by the origin");
        }

        let written = {
            let mut conn = session.lock_conn().await;
            stream_response_body(&resp, leftover, &mut conn, client).await
        };

        match written {
            Ok(()) => {
                if response_wants_close {
                    session.close().await;
                    Ok(SessionDirective::Close)
                } else {
                    Ok(SessionDirective::AwaitNextRequest)
                }
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// Injects a bounded `Range` request per §4.3's range-injection policy:
    /// only in direct mode, only when the host policy allows it, and only
    /// when the client's own range (if any) is wider than the configured
    /// per-chunk limit.
    fn maybe_inject_range(&self, req: &mut RawRequest, host: &str, orig_range: &Option<String>) -> bool {
        if !self.host_policy.inject_range(host) {
            return false;
        }
        let limit = self.config.host_range_fetch_limit_size as i64;
        match orig_range {
            None => {
                req.set_header("range", wire::format_range_header(0, limit - 1));
                true
            }
            Some(raw) => match wire::parse_range_header(raw) {
                Some((a, None)) => {
                    req.set_header("range", wire::format_range_header(a, a + limit - 1));
                    true
                }
                Some((a, Some(b))) if b - a + 1 > limit => {
                    req.set_header("range", wire::format_range_header(a, a + limit - 1));
                    true
                }
                _ => false,
            },
        }
    }
}

/// Streams a non-range response body straight through to the client:
/// `Content-Length`-bounded when known, a raw copy to EOF otherwise.
async fn stream_response_body(
    resp: &crate::wire::RawResponse,
    leftover: Vec<u8>,
    conn: &mut crate::session::ConnGuard<'_>,
    client: &mut TcpStream,
) -> Result<()> {
    resp.write_head_to(client).await?;

    let reader = conn.reader()?;
    match resp.content_length() {
        Some(total) => {
            let body = wire::read_exact_body(reader, leftover, total as usize).await?;
            client
                .write_all(&body)
                .await
                .map_err(crate::error::EngineError::Write)?;
        }
        None => {
            if !leftover.is_empty() {
                client
                    .write_all(&leftover)
                    .await
                    .map_err(crate::error::EngineError::Write)?;
            }
            smol::io::copy(reader, client)
                .await
                .map_err(crate::error::EngineError::Read)?;
        }
    }
    Ok(())
}

/// True when a `Connection`/`Proxy-Connection` header value asks for the
/// connection to be closed after this request.
fn header_says_close(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("close"))
}

/// Appends `default_port` when `hostport` carries no explicit port.
fn ensure_port(hostport: &str, default_port: u16) -> String {
    if hostport.rsplit_once(':').is_some_and(|(_, p)| p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty()) {
        hostport.to_string()
    } else {
        format!("{hostport}:{default_port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_port_adds_default_when_missing() {
        assert_eq!(ensure_port("example.test", 80), "example.test:80");
    }

    #[test]
    fn ensure_port_keeps_explicit_port() {
        assert_eq!(ensure_port("example.test:8080", 80), "example.test:8080");
    }

    #[test]
    fn ensure_port_handles_ipv6_host_without_port() {
        // no trailing ":digits", so the default is appended verbatim
        assert_eq!(ensure_port("::1", 443), "::1:443");
    }

    #[test]
    fn header_says_close_is_case_insensitive() {
        assert!(header_says_close(Some("Close")));
        assert!(header_says_close(Some("close")));
        assert!(!header_says_close(Some("keep-alive")));
        assert!(!header_says_close(None));
    }
}
