//! A single range worker (§4.5): owns one dedicated origin connection and
//! issues sequential range sub-requests on a stride, handling redirects and
//! retries, emitting chunks on a shared channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use smol::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use smol::net::TcpStream;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::iface::{Dialer, HostPolicy, Resolver};
use crate::range::RangeChunk;
use crate::session::dial_with_retry;
use crate::wire::{self, RawRequest};

const DRAIN_ON_ERROR_BYTES: usize = 4096;

pub struct WorkerParams {
    pub index: u32,
    /// The host the original request targeted; sub-requests dial `host:80`.
    pub host: String,
    /// `start_i`: this worker's first byte offset.
    pub start: i64,
    /// `N·S`: the gap between this worker's successive sub-requests.
    pub stride: i64,
    /// Last byte index of the resource, inclusive.
    pub limit: i64,
    pub request_template: RawRequest,
}

/// Runs the worker loop to completion and emits exactly one sentinel chunk
/// on exit, whatever the reason (success, retries exhausted, or the
/// session closing).
pub async fn run(
    params: WorkerParams,
    config: Arc<EngineConfig>,
    host_policy: Arc<dyn HostPolicy>,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
    closed: Arc<AtomicBool>,
    chunk_tx: async_channel::Sender<RangeChunk>,
) {
    if let Err(e) = run_inner(
        &params,
        &config,
        &*host_policy,
        &*resolver,
        &*dialer,
        &closed,
        &chunk_tx,
    )
    .await
    {
        log::debug!("range worker[{}] stopping for {e}", params.index);
    }
    let _ = chunk_tx.send(RangeChunk::sentinel()).await;
}

async fn run_inner(
    params: &WorkerParams,
    config: &EngineConfig,
    host_policy: &dyn HostPolicy,
    resolver: &dyn Resolver,
    dialer: &dyn Dialer,
    closed: &AtomicBool,
    chunk_tx: &async_channel::Sender<RangeChunk>,
) -> Result<()> {
    let mut host = params.host.clone();
    let mut clonereq = params.request_template.deep_clone();
    let mut conn: Option<(TcpStream, BufReader<TcpStream>)> = None;
    let mut last_addr: Option<SocketAddr> = None;
    let mut cursor = params.start;
    let mut retries: u32 = 0;
    let mut redirect_hops: u32 = 0;

    while cursor < params.limit - 1 && !closed.load(Ordering::Acquire) && retries <= 2 {
        let endpos = std::cmp::min(
            cursor + config.host_range_fetch_limit_size as i64 - 1,
            params.limit,
        );

        let hostport = format!("{host}:80");
        let current_addr = resolver.resolve(&hostport).await;
        if current_addr != last_addr {
            log::debug!(
                "range worker[{}] address for {host} changed, dropping stale connection",
                params.index
            );
            last_addr = current_addr;
            conn = None;
        }

        if conn.is_none() {
            let Some(addr) = last_addr else {
                log::warn!("range worker[{}] failed to resolve {hostport}", params.index);
                retries += 1;
                continue;
            };
            match dial_with_retry(dialer, resolver, addr, config).await {
                Ok(stream) => {
                    let reader = BufReader::new(stream.clone());
                    conn = Some((stream, reader));
                }
                Err(e) => {
                    log::debug!("range worker[{}] dial failed: {e}", params.index);
                    retries += 1;
                    continue;
                }
            }
        }

        let (stream, reader) = conn.as_mut().expect("connection ensured above");

        if host_policy.inject_crlf(&host) && stream.write_all(b"\r\n").await.is_err() {
            conn = None;
            retries += 1;
            continue;
        }

        clonereq.set_header("range", wire::format_range_header(cursor, endpos));
        if clonereq.write_to(stream).await.is_err() {
            conn = None;
            retries += 1;
            continue;
        }

        let read_result =
            wire::with_deadline(wire::read_response(reader), config.read_timeout).await;
        let (resp, leftover) = match read_result {
            Ok(pair) => pair,
            Err(e) => {
                log::debug!(
                    "range worker[{}] failed to read chunk[{cursor}:{endpos}]: {e}",
                    params.index
                );
                conn = None;
                retries += 1;
                continue;
            }
        };

        if resp.status.as_u16() == 302 {
            redirect_hops += 1;
            if redirect_hops > config.max_redirect_hops {
                log::warn!(
                    "range worker[{}] exceeded {} redirect hops, giving up",
                    params.index,
                    config.max_redirect_hops
                );
                break;
            }
            if let Some(location) = resp.header("location") {
                apply_redirect(&mut clonereq, &mut host, location);
            }
            conn = None;
            // Redirect is not counted against the retry budget.
            continue;
        }

        if resp.status.as_u16() > 206 {
            if let Some((stream, _)) = conn.as_mut() {
                let mut drain = [0u8; DRAIN_ON_ERROR_BYTES];
                let _ = stream.read(&mut drain).await;
            }
            log::debug!(
                "range worker[{}] upstream status {} for chunk[{cursor}:{endpos}]",
                params.index,
                resp.status
            );
            conn = None;
            retries += 1;
            continue;
        }

        let want = (endpos - cursor + 1) as usize;
        let body_result = wire::with_deadline(
            wire::read_exact_body(reader, leftover, want),
            config.read_timeout,
        )
        .await;
        match body_result {
            Ok(content) => {
                if config.debug_enable {
                    log::debug!(
                        "range worker[{}] fetched {} bytes chunk[{cursor}-{endpos}] from {host}",
                        params.index,
                        content.len()
                    );
                }
                if chunk_tx
                    .send(RangeChunk { start: cursor, content })
                    .await
                    .is_err()
                {
                    // Coordinator gone; nothing left to do but stop.
                    return Ok(());
                }
            }
            Err(e) => {
                log::debug!(
                    "range worker[{}] short read for chunk[{cursor}:{endpos}]: {e}",
                    params.index
                );
                conn = None;
                retries += 1;
                continue;
            }
        }

        cursor += params.stride;
    }

    Ok(())
}

/// Rewrites `clonereq`'s target (and `host`, if the redirect crossed hosts)
/// from a `Location` header value.
fn apply_redirect(clonereq: &mut RawRequest, host: &mut String, location: &str) {
    match location.parse::<http::Uri>() {
        Ok(uri) => {
            if let Some(authority) = uri.authority() {
                *host = authority.host().to_string();
                clonereq.set_header("host", authority.as_str().to_string());
            }
            let path = uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            clonereq.target = path;
        }
        Err(_) => log::debug!("range worker received unparsable redirect location: {location}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn template() -> RawRequest {
        RawRequest {
            method: Method::GET,
            target: "/file.bin".into(),
            headers: http::HeaderMap::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn redirect_updates_host_and_path() {
        let mut host = "a.test".to_string();
        let mut req = template();
        apply_redirect(&mut req, &mut host, "http://b.test/other.bin");
        assert_eq!(host, "b.test");
        assert_eq!(req.target, "/other.bin");
    }

    #[test]
    fn redirect_relative_path_keeps_host() {
        let mut host = "a.test".to_string();
        let mut req = template();
        apply_redirect(&mut req, &mut host, "/moved.bin");
        assert_eq!(host, "a.test");
        assert_eq!(req.target, "/moved.bin");
    }
}
