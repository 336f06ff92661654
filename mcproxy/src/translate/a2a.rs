// Copyright (C) 2026  mcproxy authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Ascii-to-ascii propagation: commands re-rendered as text lines onto the
//! owning socket, reply lines forwarded back mostly verbatim. Multi-gets
//! de-duplicate the same way as the binary path; broadcasts forward the
//! original command (so `flush_all <exptime>` and `stats <args>` survive
//! this hop) and swallow the per-host terminators.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::FuturesUnordered;
use futures::StreamExt;

use mcproxy_logging::macros::*;

use memcache_proto::text::{self, Request, Response};

use crate::downstream::{Downstream, DownstreamConn, ReplyFrame};
use crate::scheduler::Waiter;
use crate::stats::{bump, ProxyStats};
use crate::translate::{
    maybe_timeout, merge::StatsMerger, ForwardResult, ERR_PARSE, SUFFIX_END, SUFFIX_OK,
    SUFFIX_RESET,
};

pub async fn forward(
    d: &mut Downstream,
    ups: &[Waiter],
    stats: &Arc<ProxyStats>,
) -> ForwardResult {
    match &ups[0].request {
        Request::Get { .. } => multiget(d, ups, stats).await,
        Request::Storage { .. } | Request::Delete { .. } | Request::Arith { .. } => {
            keyed(d, &ups[0], stats).await
        }
        Request::FlushAll { .. } => {
            broadcast(d, &ups[0], stats, /* merge: */ false, SUFFIX_OK).await
        }
        Request::Stats { args } => match args {
            Some(args) if args.as_ref() == b"reset" => {
                broadcast(d, &ups[0], stats, false, SUFFIX_RESET).await
            }
            // Plain `stats` and argument forms both merge per-host lines.
            _ => broadcast(d, &ups[0], stats, true, SUFFIX_END).await,
        },
        _ => ForwardResult::BadRequest(ERR_PARSE),
    }
}

/// Re-renders a command as its text line (plus data block for the storage
/// family), byte-compatible with what the client sent.
pub(crate) fn render_line(request: &Request) -> Option<Bytes> {
    let mut line = BytesMut::new();
    match request {
        Request::Storage {
            verb,
            key,
            flags,
            exptime,
            bytes,
            cas,
            noreply,
            data,
        } => {
            line.extend_from_slice(verb.as_str().as_bytes());
            line.extend_from_slice(b" ");
            line.extend_from_slice(key);
            line.extend_from_slice(format!(" {} {} {}", flags, exptime, bytes).as_bytes());
            if let Some(cas) = cas {
                line.extend_from_slice(format!(" {}", cas).as_bytes());
            }
            if *noreply {
                line.extend_from_slice(b" noreply");
            }
            line.extend_from_slice(b"\r\n");
            line.extend_from_slice(data);
            line.extend_from_slice(b"\r\n");
        }
        Request::Delete { key, noreply } => {
            line.extend_from_slice(b"delete ");
            line.extend_from_slice(key);
            if *noreply {
                line.extend_from_slice(b" noreply");
            }
            line.extend_from_slice(b"\r\n");
        }
        Request::Arith {
            verb,
            key,
            delta,
            noreply,
        } => {
            line.extend_from_slice(verb.as_str().as_bytes());
            line.extend_from_slice(b" ");
            line.extend_from_slice(key);
            line.extend_from_slice(format!(" {}", delta).as_bytes());
            if *noreply {
                line.extend_from_slice(b" noreply");
            }
            line.extend_from_slice(b"\r\n");
        }
        Request::FlushAll { exptime, noreply } => {
            line.extend_from_slice(b"flush_all");
            if let Some(exptime) = exptime {
                line.extend_from_slice(format!(" {}", exptime).as_bytes());
            }
            if *noreply {
                line.extend_from_slice(b" noreply");
            }
            line.extend_from_slice(b"\r\n");
        }
        Request::Stats { args } => {
            line.extend_from_slice(b"stats");
            if let Some(args) = args {
                line.extend_from_slice(b" ");
                line.extend_from_slice(args);
            }
            line.extend_from_slice(b"\r\n");
        }
        _ => return None,
    }
    Some(line.freeze())
}

/// Renders one parsed reply frame back into wire form.
fn render_reply(response: &Response, dst: &mut BytesMut) {
    match response {
        Response::Value {
            key,
            flags,
            cas,
            data,
        } => {
            text::render_value_header(dst, key, *flags, data.len(), *cas);
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        Response::Stat { name, value } => text::render_stat_line(dst, name, value),
        Response::End => dst.extend_from_slice(b"END\r\n"),
        Response::Line(raw) => {
            dst.extend_from_slice(raw);
            dst.extend_from_slice(b"\r\n");
        }
    }
}

enum ReadOutcome {
    Frame(Response),
    Garbage,
    Closed,
}

fn into_text(reply: Option<memcache_proto::Result<ReplyFrame>>) -> ReadOutcome {
    match reply {
        Some(Ok(ReplyFrame::Ascii(response))) => ReadOutcome::Frame(response),
        Some(Ok(ReplyFrame::Binary(_))) | Some(Err(_)) => ReadOutcome::Garbage,
        None => ReadOutcome::Closed,
    }
}

/// Single-destination commands: forward the line, forward the one reply
/// line back.
async fn keyed(d: &mut Downstream, waiter: &Waiter, stats: &Arc<ProxyStats>) -> ForwardResult {
    let noreply = waiter.request.noreply();
    let line = match render_line(&waiter.request) {
        Some(line) => line,
        None => return ForwardResult::BadRequest(ERR_PARSE),
    };
    let key = match waiter.request.key() {
        Some(key) => key.clone(),
        None => return ForwardResult::BadRequest(ERR_PARSE),
    };

    let index = d.index_for_key(&key);
    let mut conn = match d.take_connected(index).await {
        Some(conn) => conn,
        None => return ForwardResult::NoWrite,
    };

    if let Err(e) = conn.send(line).await {
        debug!("a2a: downstream write failed: {}", e);
        bump(&stats.tot_downstream_quit_server);
        return ForwardResult::Broken {
            any_reply: false,
            single_conn: true,
            suffix: None,
        };
    }

    if noreply {
        d.put_conn(index, conn);
        return ForwardResult::Complete;
    }

    let timeout = d.behavior.downstream_timeout.to_duration();
    let outcome = match maybe_timeout(timeout, conn.next_reply()).await {
        Ok(reply) => into_text(reply),
        Err(_) => {
            // Timed out with nothing received: the socket is closed and
            // the request stays eligible for its one-shot retry.
            debug!("a2a: downstream timeout on keyed command");
            ReadOutcome::Closed
        }
    };

    match outcome {
        ReadOutcome::Frame(response) => {
            let mut chunk = BytesMut::new();
            render_reply(&response, &mut chunk);
            waiter.reply_chunk(chunk.freeze());
            d.put_conn(index, conn);
            ForwardResult::Complete
        }
        ReadOutcome::Garbage => {
            bump(&stats.tot_downstream_quit_server);
            ForwardResult::Broken {
                any_reply: true,
                single_conn: true,
                suffix: None,
            }
        }
        ReadOutcome::Closed => {
            bump(&stats.tot_downstream_quit_server);
            ForwardResult::Broken {
                any_reply: false,
                single_conn: true,
                suffix: None,
            }
        }
    }
}

enum DrainOutcome {
    Done {
        index: usize,
        conn: DownstreamConn,
        replied: bool,
        stat_pairs: Vec<(Bytes, Bytes)>,
    },
    Broken {
        replied: bool,
    },
}

/// Reads one socket's share of a multi-get: VALUE blocks are routed to
/// their requesters, the per-host END is swallowed (the pairing writes the
/// shared terminator once).
async fn drain_get(
    index: usize,
    mut conn: DownstreamConn,
    line: Bytes,
    ups: &[Waiter],
    dedup: Option<&HashMap<Bytes, Vec<usize>>>,
) -> DrainOutcome {
    if conn.send(line).await.is_err() {
        return DrainOutcome::Broken { replied: false };
    }

    let mut replied = false;
    loop {
        let response = match into_text(conn.next_reply().await) {
            ReadOutcome::Frame(response) => response,
            ReadOutcome::Garbage => return DrainOutcome::Broken { replied: true },
            ReadOutcome::Closed => return DrainOutcome::Broken { replied },
        };
        replied = true;

        match &response {
            Response::Value { key, .. } => {
                let mut chunk = BytesMut::new();
                render_reply(&response, &mut chunk);
                let chunk = chunk.freeze();
                match dedup {
                    Some(map) => {
                        if let Some(targets) = map.get(key) {
                            for &target in targets {
                                ups[target].reply_chunk(chunk.clone());
                            }
                        }
                    }
                    None => {
                        for waiter in ups {
                            waiter.reply_chunk(chunk.clone());
                        }
                    }
                }
            }
            // END finishes this socket; an error line does too, there is
            // nothing more coming for this request.
            Response::End | Response::Line(_) | Response::Stat { .. } => {
                return DrainOutcome::Done {
                    index,
                    conn,
                    replied,
                    stat_pairs: Vec::new(),
                };
            }
        }
    }
}

async fn multiget(d: &mut Downstream, ups: &[Waiter], stats: &Arc<ProxyStats>) -> ForwardResult {
    let gets = matches!(ups[0].request, Request::Get { gets: true, .. });

    let mut dedup: Option<HashMap<Bytes, Vec<usize>>> = if ups.len() > 1 {
        Some(HashMap::new())
    } else {
        None
    };

    let mut batches: Vec<Vec<Bytes>> = vec![Vec::new(); d.server_count()];
    for (upstream_index, waiter) in ups.iter().enumerate() {
        let keys = match &waiter.request {
            Request::Get { keys, .. } => keys,
            _ => continue,
        };
        for key in keys {
            let mut first_request = true;
            if let Some(map) = dedup.as_mut() {
                let entry = map.entry(key.clone()).or_insert_with(Vec::new);
                if !entry.is_empty() {
                    first_request = false;
                    trace!("a2a: multiget squash");
                }
                entry.push(upstream_index);
            }
            if first_request {
                batches[d.index_for_key(key)].push(key.clone());
            }
        }
    }

    let mut inflight = FuturesUnordered::new();
    for (index, keys) in batches.iter().enumerate() {
        if keys.is_empty() {
            continue;
        }
        let conn = match d.take_connected(index).await {
            Some(conn) => conn,
            None => continue,
        };
        let mut line = BytesMut::new();
        line.extend_from_slice(if gets { &b"gets"[..] } else { &b"get"[..] });
        for key in keys {
            line.extend_from_slice(b" ");
            line.extend_from_slice(key);
        }
        line.extend_from_slice(b"\r\n");
        inflight.push(drain_get(index, conn, line.freeze(), ups, dedup.as_ref()));
    }

    if inflight.is_empty() {
        return ForwardResult::NoWrite;
    }
    let single_conn = inflight.len() == 1;

    let timeout = d.behavior.downstream_timeout.to_duration();
    let mut any_reply = false;
    let mut broken = 0usize;
    let drive = async {
        while let Some(outcome) = inflight.next().await {
            match outcome {
                DrainOutcome::Done {
                    index,
                    conn,
                    replied,
                    ..
                } => {
                    any_reply |= replied;
                    d.put_conn(index, conn);
                }
                DrainOutcome::Broken { replied } => {
                    any_reply |= replied;
                    broken += 1;
                    bump(&stats.tot_downstream_quit_server);
                }
            }
        }
    };
    if maybe_timeout(timeout, drive).await.is_err() {
        debug!("a2a: downstream timeout on multiget, closing sockets");
        let remaining = inflight.len();
        broken += remaining;
        stats
            .tot_downstream_quit_server
            .fetch_add(remaining as u64, std::sync::atomic::Ordering::Relaxed);
        drop(inflight);
    }

    if broken > 0 {
        return ForwardResult::Broken {
            any_reply,
            single_conn,
            suffix: Some(SUFFIX_END),
        };
    }
    for waiter in ups {
        waiter.reply_chunk(Bytes::from_static(SUFFIX_END));
    }
    ForwardResult::Complete
}

/// Reads one socket's share of a broadcast: STAT lines accumulate, any
/// terminator line (`END`, `OK`, `RESET`, errors) finishes the socket.
async fn drain_broadcast(index: usize, mut conn: DownstreamConn, line: Bytes) -> DrainOutcome {
    if conn.send(line).await.is_err() {
        return DrainOutcome::Broken { replied: false };
    }

    let mut stat_pairs = Vec::new();
    let mut replied = false;
    loop {
        let response = match into_text(conn.next_reply().await) {
            ReadOutcome::Frame(response) => response,
            ReadOutcome::Garbage => return DrainOutcome::Broken { replied: true },
            ReadOutcome::Closed => return DrainOutcome::Broken { replied },
        };
        replied = true;

        match response {
            Response::Stat { name, value } => stat_pairs.push((name, value)),
            Response::End | Response::Line(_) => break,
            // A VALUE frame has no business here; drop it and keep going.
            Response::Value { .. } => {}
        }
    }

    DrainOutcome::Done {
        index,
        conn,
        replied,
        stat_pairs,
    }
}

/// Broadcasts forward the client's own command line to every socket, so
/// tokens the binary hop drops (flush expiration, stats arguments) pass
/// through on this one.
async fn broadcast(
    d: &mut Downstream,
    waiter: &Waiter,
    stats: &Arc<ProxyStats>,
    merge: bool,
    suffix: &'static [u8],
) -> ForwardResult {
    let noreply = waiter.request.noreply();
    let line = match render_line(&waiter.request) {
        Some(line) => line,
        None => return ForwardResult::BadRequest(ERR_PARSE),
    };

    if noreply {
        let mut wrote = false;
        for index in 0..d.server_count() {
            if let Some(mut conn) = d.take_connected(index).await {
                match conn.send(line.clone()).await {
                    Ok(()) => {
                        wrote = true;
                        d.put_conn(index, conn);
                    }
                    Err(_) => bump(&stats.tot_downstream_quit_server),
                }
            }
        }
        return if wrote {
            ForwardResult::Complete
        } else {
            ForwardResult::NoWrite
        };
    }

    let mut inflight = FuturesUnordered::new();
    for index in 0..d.server_count() {
        let conn = match d.take_connected(index).await {
            Some(conn) => conn,
            None => continue,
        };
        inflight.push(drain_broadcast(index, conn, line.clone()));
    }
    if inflight.is_empty() {
        return ForwardResult::NoWrite;
    }
    let single_conn = inflight.len() == 1;

    let mut merger = if merge { Some(StatsMerger::new()) } else { None };

    let timeout = d.behavior.downstream_timeout.to_duration();
    let mut any_reply = false;
    let mut broken = 0usize;
    let drive = async {
        while let Some(outcome) = inflight.next().await {
            match outcome {
                DrainOutcome::Done {
                    index,
                    conn,
                    replied,
                    stat_pairs,
                } => {
                    any_reply |= replied;
                    if let Some(merger) = merger.as_mut() {
                        for (name, value) in stat_pairs {
                            merger.fold(name, value);
                        }
                    }
                    d.put_conn(index, conn);
                }
                DrainOutcome::Broken { replied } => {
                    any_reply |= replied;
                    broken += 1;
                    bump(&stats.tot_downstream_quit_server);
                }
            }
        }
    };
    if maybe_timeout(timeout, drive).await.is_err() {
        debug!("a2a: downstream timeout on broadcast, closing sockets");
        let remaining = inflight.len();
        broken += remaining;
        stats
            .tot_downstream_quit_server
            .fetch_add(remaining as u64, std::sync::atomic::Ordering::Relaxed);
        drop(inflight);
    }

    if let Some(merger) = &merger {
        if !merger.is_empty() {
            let mut out = BytesMut::new();
            merger.render(&mut out);
            waiter.reply_chunk(out.freeze());
        }
    }

    if broken > 0 {
        return ForwardResult::Broken {
            any_reply,
            single_conn,
            suffix: Some(suffix),
        };
    }
    waiter.reply_chunk(Bytes::from_static(suffix));
    ForwardResult::Complete
}
