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

//! Ascii-to-binary propagation: text commands re-framed as binary
//! requests, binary responses reassembled into text replies.
//!
//! Multi-gets are de-duplicated across batched upstreams and fanned out as
//! one `GETKQ` per distinct key with a terminating `GETK` per socket.
//! `flush_all` and `stats` broadcast to every socket; `stats` folds the
//! per-host `STAT` frames into a merger that is flushed before the
//! terminator.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::FuturesUnordered;
use futures::StreamExt;

use mcproxy_logging::macros::*;

use memcache_proto::binary::{self, Opcode, Status};
use memcache_proto::text::{self, ArithVerb, Request, StorageVerb};

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
        Request::FlushAll { .. } => broadcast(d, &ups[0], stats, BroadcastKind::Flush).await,
        Request::Stats { args } => match args {
            None => broadcast(d, &ups[0], stats, BroadcastKind::Stats).await,
            Some(args) if args.as_ref() == b"reset" => {
                broadcast(d, &ups[0], stats, BroadcastKind::StatsReset).await
            }
            Some(_) => ForwardResult::BadRequest(ERR_PARSE),
        },
        _ => ForwardResult::BadRequest(ERR_PARSE),
    }
}

fn pick(opcode: Opcode, noreply: bool) -> Opcode {
    if noreply {
        opcode.quiet()
    } else {
        opcode
    }
}

/// Binary framing for single-destination commands, per the translation
/// table: `cas` maps to SET with the cas header field left zero, append
/// and prepend skip the flags/exptime extras, arithmetic carries
/// delta/initial/expiration extras with expiration pinned to `0xffffffff`
/// so a missing key reports `NOT_FOUND` instead of being created.
pub(crate) fn build_request(request: &Request, noreply: bool) -> Option<Bytes> {
    let frame = match request {
        Request::Storage {
            verb,
            key,
            flags,
            exptime,
            data,
            ..
        } => {
            let (opcode, has_extras) = match verb {
                StorageVerb::Set | StorageVerb::Cas => (Opcode::Set, true),
                StorageVerb::Add => (Opcode::Add, true),
                StorageVerb::Replace => (Opcode::Replace, true),
                StorageVerb::Append => (Opcode::Append, false),
                StorageVerb::Prepend => (Opcode::Prepend, false),
            };
            let extras = if has_extras {
                let mut extras = BytesMut::with_capacity(8);
                extras.put_u32(*flags);
                extras.put_u32(*exptime);
                extras.freeze()
            } else {
                Bytes::new()
            };
            binary::Request {
                opcode: pick(opcode, noreply),
                key: key.clone(),
                extras,
                value: data.clone(),
                opaque: 0,
                cas: 0,
            }
        }
        Request::Delete { key, .. } => {
            binary::Request::simple(pick(Opcode::Delete, noreply), key.clone())
        }
        Request::Arith {
            verb, key, delta, ..
        } => {
            let opcode = match verb {
                ArithVerb::Incr => Opcode::Increment,
                ArithVerb::Decr => Opcode::Decrement,
            };
            let mut extras = BytesMut::with_capacity(20);
            extras.put_u64(*delta);
            extras.put_u64(0);
            extras.put_u32(0xffff_ffff);
            binary::Request {
                opcode: pick(opcode, noreply),
                key: key.clone(),
                extras: extras.freeze(),
                value: Bytes::new(),
                opaque: 0,
                cas: 0,
            }
        }
        _ => return None,
    };
    Some(frame.to_bytes())
}

/// Maps a store-family response status onto its text reply line.
pub(crate) fn store_status_line(status: Status) -> &'static [u8] {
    match status {
        Status::Ok => b"STORED\r\n",
        Status::KeyEexists => b"EXISTS\r\n",
        Status::KeyEnoent => b"NOT_FOUND\r\n",
        Status::NotStored => b"NOT_STORED\r\n",
        _ => b"SERVER_ERROR a2b error\r\n",
    }
}

fn arith_reply(response: &binary::Response) -> Bytes {
    match response.status {
        Status::Ok => match response.counter() {
            Some(value) => {
                let mut line = BytesMut::with_capacity(24);
                line.extend_from_slice(value.to_string().as_bytes());
                line.extend_from_slice(b"\r\n");
                line.freeze()
            }
            None => Bytes::from_static(b"SERVER_ERROR a2b arith error\r\n"),
        },
        Status::KeyEexists => Bytes::from_static(b"EXISTS\r\n"),
        Status::KeyEnoent => Bytes::from_static(b"NOT_FOUND\r\n"),
        Status::NotStored => Bytes::from_static(b"NOT_STORED\r\n"),
        _ => Bytes::from_static(b"SERVER_ERROR a2b arith error\r\n"),
    }
}

/// Dispatch of one complete single-destination response (quiet opcodes
/// mapped back to their plain form first).
fn render_simple_reply(response: &binary::Response, waiter: &Waiter) {
    let line = match response.opcode.unquiet() {
        Opcode::Set
        | Opcode::Add
        | Opcode::Replace
        | Opcode::Delete
        | Opcode::Append
        | Opcode::Prepend => Bytes::from_static(store_status_line(response.status)),
        Opcode::Increment | Opcode::Decrement => arith_reply(response),
        _ => Bytes::from_static(b"SERVER_ERROR a2b error\r\n"),
    };
    waiter.reply_chunk(line);
}

fn into_binary(reply: Option<memcache_proto::Result<ReplyFrame>>) -> ReadOutcome {
    match reply {
        Some(Ok(ReplyFrame::Binary(response))) => ReadOutcome::Frame(response),
        Some(Ok(ReplyFrame::Ascii(_))) | Some(Err(_)) => ReadOutcome::Garbage,
        None => ReadOutcome::Closed,
    }
}

enum ReadOutcome {
    Frame(binary::Response),
    /// Bytes arrived but no usable frame; disqualifies the retry.
    Garbage,
    Closed,
}

/// Storage / delete / arithmetic: one binary request on the socket owning
/// the key, one response back.
async fn keyed(d: &mut Downstream, waiter: &Waiter, stats: &Arc<ProxyStats>) -> ForwardResult {
    let noreply = waiter.request.noreply();
    let frame = match build_request(&waiter.request, noreply) {
        Some(frame) => frame,
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

    if let Err(e) = conn.send(frame).await {
        debug!("a2b: downstream write failed: {}", e);
        bump(&stats.tot_downstream_quit_server);
        return ForwardResult::Broken {
            any_reply: false,
            single_conn: true,
            suffix: None,
        };
    }

    if noreply {
        // The upstream was detached before the write; the quiet opcode
        // keeps the socket silent, so there is nothing to read.
        d.put_conn(index, conn);
        return ForwardResult::Complete;
    }

    let timeout = d.behavior.downstream_timeout.to_duration();
    let read = maybe_timeout(timeout, conn.next_reply()).await;
    let outcome = match read {
        Ok(reply) => into_binary(reply),
        Err(_) => {
            // Timed out with nothing received: the socket is closed and
            // the request stays eligible for its one-shot retry.
            debug!("a2b: downstream timeout on keyed command");
            ReadOutcome::Closed
        }
    };

    match outcome {
        ReadOutcome::Frame(response) => {
            render_simple_reply(&response, waiter);
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

/// Reads one socket's GETK batch: quiet hits keep coming, the terminating
/// non-quiet GETK response finishes the socket. Hits are routed by the
/// de-duplication map when several upstreams share the fan-out.
async fn drain_get_batch(
    index: usize,
    mut conn: DownstreamConn,
    frames: Bytes,
    ups: &[Waiter],
    dedup: Option<&HashMap<Bytes, Vec<usize>>>,
    gets: bool,
) -> DrainOutcome {
    if conn.send(frames).await.is_err() {
        return DrainOutcome::Broken { replied: false };
    }

    let mut replied = false;
    loop {
        let response = match into_binary(conn.next_reply().await) {
            ReadOutcome::Frame(response) => response,
            ReadOutcome::Garbage => return DrainOutcome::Broken { replied: true },
            ReadOutcome::Closed => return DrainOutcome::Broken { replied },
        };
        replied = true;
        let final_frame = !response.opcode.is_quiet();

        match response.status {
            Status::Ok => {
                let mut chunk =
                    BytesMut::with_capacity(response.key.len() + response.value.len() + 48);
                text::render_value_header(
                    &mut chunk,
                    &response.key,
                    response.flags(),
                    response.value.len(),
                    if gets { Some(response.cas) } else { None },
                );
                chunk.extend_from_slice(&response.value);
                chunk.extend_from_slice(b"\r\n");
                let chunk = chunk.freeze();

                match dedup {
                    Some(map) => {
                        if let Some(targets) = map.get(&response.key) {
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
            // A miss is swallowed; so is any unexpected status.
            Status::KeyEnoent => {}
            _ => {}
        }

        if final_frame {
            return DrainOutcome::Done {
                index,
                conn,
                replied,
                stat_pairs: Vec::new(),
            };
        }
    }
}

/// The multi-get fan-out: each distinct key is requested once, on the
/// socket its hash selects.
async fn multiget(d: &mut Downstream, ups: &[Waiter], stats: &Arc<ProxyStats>) -> ForwardResult {
    let gets = matches!(ups[0].request, Request::Get { gets: true, .. });

    // Key → requesting upstream indexes; allocated only when several
    // upstreams were batched onto this bundle. Repeated keys append an
    // entry and are not re-requested.
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
                    trace!("a2b: multiget squash");
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
        // An unreachable host drops its keys on the floor; the upstream
        // sees them as misses under the shared END terminator.
        let conn = match d.take_connected(index).await {
            Some(conn) => conn,
            None => continue,
        };
        let mut frames = BytesMut::new();
        for (i, key) in keys.iter().enumerate() {
            let opcode = if i + 1 == keys.len() {
                Opcode::GetK
            } else {
                Opcode::GetKQ
            };
            binary::Request::simple(opcode, key.clone()).encode(&mut frames);
        }
        inflight.push(drain_get_batch(
            index,
            conn,
            frames.freeze(),
            ups,
            dedup.as_ref(),
            gets,
        ));
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
        debug!("a2b: downstream timeout on multiget, closing sockets");
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BroadcastKind {
    Flush,
    Stats,
    StatsReset,
}

/// Reads one socket's share of a broadcast. FLUSH completes on its single
/// response; STAT data frames accumulate until the empty-key terminator.
async fn drain_broadcast(
    index: usize,
    mut conn: DownstreamConn,
    frame: Bytes,
    kind: BroadcastKind,
) -> DrainOutcome {
    if conn.send(frame).await.is_err() {
        return DrainOutcome::Broken { replied: false };
    }

    let mut stat_pairs = Vec::new();
    let mut replied = false;
    loop {
        let response = match into_binary(conn.next_reply().await) {
            ReadOutcome::Frame(response) => response,
            ReadOutcome::Garbage => return DrainOutcome::Broken { replied: true },
            ReadOutcome::Closed => return DrainOutcome::Broken { replied },
        };
        replied = true;

        match kind {
            BroadcastKind::Flush => break,
            BroadcastKind::Stats | BroadcastKind::StatsReset => {
                if response.key.is_empty() {
                    break;
                }
                stat_pairs.push((response.key.clone(), response.value.clone()));
            }
        }
    }

    DrainOutcome::Done {
        index,
        conn,
        replied,
        stat_pairs,
    }
}

/// `flush_all` / `stats` fan out to every socket. The `flush_all`
/// expiration token is deliberately not carried onto the binary hop.
async fn broadcast(
    d: &mut Downstream,
    waiter: &Waiter,
    stats: &Arc<ProxyStats>,
    kind: BroadcastKind,
) -> ForwardResult {
    let noreply = waiter.request.noreply();
    let (opcode, key, suffix) = match kind {
        BroadcastKind::Flush => (Opcode::Flush, Bytes::new(), SUFFIX_OK),
        BroadcastKind::Stats => (Opcode::Stat, Bytes::new(), SUFFIX_END),
        BroadcastKind::StatsReset => (Opcode::Stat, Bytes::from_static(b"reset"), SUFFIX_RESET),
    };
    let frame = binary::Request::simple(pick(opcode, noreply), key).to_bytes();

    if noreply {
        let mut wrote = false;
        for index in 0..d.server_count() {
            if let Some(mut conn) = d.take_connected(index).await {
                match conn.send(frame.clone()).await {
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
        inflight.push(drain_broadcast(index, conn, frame.clone(), kind));
    }
    if inflight.is_empty() {
        return ForwardResult::NoWrite;
    }
    let single_conn = inflight.len() == 1;

    let mut merger = if kind == BroadcastKind::Stats {
        Some(StatsMerger::new())
    } else {
        None
    };

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
        debug!("a2b: downstream timeout on broadcast, closing sockets");
        let remaining = inflight.len();
        broken += remaining;
        stats
            .tot_downstream_quit_server
            .fetch_add(remaining as u64, std::sync::atomic::Ordering::Relaxed);
        drop(inflight);
    }

    // Merged stats go out ahead of the terminator, even on partial
    // failure.
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
