//! The range prefetch coordinator (§4.4): rewrites the response headers for
//! the client, streams the origin's first-range body through, then spawns
//! `N` range workers and reassembles their out-of-order chunks into a
//! strictly increasing, gapless byte stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use http::StatusCode;
use smol::io::{AsyncWrite, AsyncWriteExt, BufReader};
use smol::net::TcpStream;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::iface::{Dialer, HostPolicy, Resolver};
use crate::range::RangeChunk;
use crate::range::worker::{self, WorkerParams};
use crate::wire::{self, RawRequest, RawResponse};

/// Everything the coordinator needs to take over the client response once
/// the orchestrator has detected an injected `Range` honored by the origin.
pub struct PrefetchInput<'a> {
    pub resp: RawResponse,
    pub req: &'a mut RawRequest,
    /// The client's original `Range` header value, if it sent one.
    pub orig_range: Option<String>,
    /// The origin's `Content-Range` header value on the first-range response.
    pub content_range: String,
    pub host: String,
}

/// Drives §4.4 to completion. `first_body_reader`/`first_body_leftover` are
/// the still-open upstream connection and any bytes already buffered past
/// the response head, used to stream the first range chunk through.
#[allow(clippy::too_many_arguments)]
pub async fn run_coordinator<W: AsyncWrite + Unpin>(
    input: PrefetchInput<'_>,
    first_body_reader: &mut BufReader<TcpStream>,
    first_body_leftover: Vec<u8>,
    client: &mut W,
    config: Arc<EngineConfig>,
    host_policy: Arc<dyn HostPolicy>,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
    session_closed: Arc<AtomicBool>,
) -> Result<()> {
    let PrefetchInput { mut resp, req, orig_range, content_range, host } = input;

    let (_first_start, first_end, total) = wire::parse_content_range(&content_range)
        .ok_or_else(|| EngineError::Protocol(format!("unparsable Content-Range: {content_range}")))?;
    let first_range_size = resp.content_length().unwrap_or(0) as usize;
    let mut limit = total - 1;

    resp.remove_header("content-range");
    match orig_range.as_deref() {
        None => {
            resp.status = StatusCode::OK;
            resp.reason.clear();
            req.remove_header("range");
            resp.set_header("content-length", total.to_string());
        }
        Some(orig) => {
            let (a, b) = wire::parse_range_header(orig)
                .ok_or_else(|| EngineError::Protocol(format!("unparsable Range: {orig}")))?;
            let content_length = match b {
                None => total - a,
                Some(end) => {
                    limit = end;
                    end - a + 1
                }
            };
            resp.set_header("content-length", content_length.to_string());
            resp.set_header(
                "content-range",
                wire::format_content_range(a, a + content_length - 1, total),
            );
        }
    }

    resp.write_head_to(client).await?;

    let first_chunk = wire::read_exact_body(first_body_reader, first_body_leftover, first_range_size).await;
    match first_chunk {
        Ok(bytes) => {
            if let Err(e) = client.write_all(&bytes).await {
                log::warn!("failed to stream first-range body to client: {e}");
                session_closed.store(true, Ordering::Release);
                return Err(EngineError::Write(e));
            }
        }
        Err(e) => {
            log::warn!("failed to read first-range chunk from origin: {e}");
            session_closed.store(true, Ordering::Release);
            return Err(e);
        }
    }

    let n_workers = config.host_range_concurrent_fetchers;
    let s = config.host_range_fetch_limit_size as i64;
    let (chunk_tx, chunk_rx) = async_channel::bounded::<RangeChunk>(10);

    log::info!("starting {n_workers} range workers for {host} ({content_range})");

    let request_template = {
        let mut t = req.deep_clone();
        t.remove_header("range");
        t
    };

    let mut tasks = Vec::with_capacity(n_workers as usize);
    for i in 0..n_workers {
        let params = WorkerParams {
            index: i,
            host: host.clone(),
            start: first_end + 1 + i as i64 * s,
            stride: n_workers as i64 * s,
            limit,
            request_template: request_template.clone(),
        };
        let task = smol::spawn(worker::run(
            params,
            config.clone(),
            host_policy.clone(),
            resolver.clone(),
            dialer.clone(),
            session_closed.clone(),
            chunk_tx.clone(),
        ));
        tasks.push(task);
    }
    drop(chunk_tx);

    let mut pending: HashMap<i64, Vec<u8>> = HashMap::new();
    let mut stopped_workers: u32 = 0;
    let mut expected_pos = first_end + 1;
    let mut client_failed = false;

    while let Ok(chunk) = chunk_rx.recv().await {
        if chunk.is_sentinel() {
            stopped_workers += 1;
        } else {
            pending.insert(chunk.start, chunk.content);
        }

        while let Some(content) = pending.remove(&expected_pos) {
            let advance = content.len() as i64;
            if !client_failed {
                if let Err(e) = client.write_all(&content).await {
                    log::warn!("client write failed during reassembly: {e}");
                    client_failed = true;
                    session_closed.store(true, Ordering::Release);
                }
            }
            expected_pos += advance;
        }

        if stopped_workers >= n_workers {
            if !pending.is_empty() {
                log::warn!(
                    "{} unwritten chunks remain at expectedPos={expected_pos}",
                    pending.len()
                );
            }
            break;
        }
    }

    for t in tasks {
        t.await;
    }

    if client_failed {
        return Err(EngineError::Closed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_math_for_bounded_client_range() {
        // S4 from the testable-properties scenarios: orig=bytes=2-7, S=4,
        // first sub-request returns bytes 2-5/10.
        let (first_start, first_end, total) = wire::parse_content_range("bytes 2-5/10").unwrap();
        assert_eq!((first_start, first_end, total), (2, 5, 10));
        let (a, b) = wire::parse_range_header("bytes=2-7").unwrap();
        assert_eq!((a, b), (2, Some(7)));
        let content_length = b.unwrap() - a + 1;
        assert_eq!(content_length, 6);
        assert_eq!(
            wire::format_content_range(a, a + content_length - 1, total),
            "bytes 2-7/10"
        );
    }

    #[test]
    fn content_length_for_unranged_client_request() {
        let (_, _, total) = wire::parse_content_range("bytes 0-3/10").unwrap();
        assert_eq!(total, 10);
    }
}
