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

//! Shared helpers for the proxy integration tests: in-process fake
//! memcached backends (binary and text flavors), a raw text-protocol test
//! client, and a proxy harness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::codec::Framed;

use memcache_proto::binary::{self, Opcode, Status};
use memcache_proto::text;

use mcproxy::config::Behavior;
use mcproxy::proxy::Proxy;
use mcproxy::server::ProxyServer;
use mcproxy::stats::ProxyStats;

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

type Store = Arc<Mutex<HashMap<Vec<u8>, (u32, Vec<u8>)>>>;

/// Knobs for a fake binary backend.
pub struct BackendBuilder {
    /// Close this many connections right after accepting them.
    reset_first: usize,
    /// Park GETK responses for this key until [`BinaryBackend::release`]
    /// is notified.
    hold_key: Option<Vec<u8>>,
    /// Value reported as `STAT curr_items`.
    stats_items: u64,
}

impl BackendBuilder {
    pub fn new() -> BackendBuilder {
        BackendBuilder {
            reset_first: 0,
            hold_key: None,
            stats_items: 0,
        }
    }

    pub fn reset_first(mut self, count: usize) -> Self {
        self.reset_first = count;
        self
    }

    pub fn hold_key(mut self, key: &[u8]) -> Self {
        self.hold_key = Some(key.to_vec());
        self
    }

    pub fn stats_items(mut self, count: u64) -> Self {
        self.stats_items = count;
        self
    }

    pub async fn start(self) -> BinaryBackend {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("backend bind");
        let addr = listener.local_addr().expect("backend addr").to_string();
        let backend = BinaryBackend {
            addr,
            log: Arc::new(Mutex::new(Vec::new())),
            accepted: Arc::new(AtomicUsize::new(0)),
            store: Arc::new(Mutex::new(HashMap::new())),
            release: Arc::new(Notify::new()),
        };

        let log = backend.log.clone();
        let accepted = backend.accepted.clone();
        let store = backend.store.clone();
        let release = backend.release.clone();
        let hold_key = self.hold_key.clone();
        let stats_items = self.stats_items;
        let reset_first = Arc::new(AtomicUsize::new(self.reset_first));

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                if reset_first
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    drop(stream);
                    continue;
                }
                tokio::spawn(serve_binary_conn(
                    stream,
                    log.clone(),
                    store.clone(),
                    hold_key.clone(),
                    release.clone(),
                    stats_items,
                ));
            }
        });

        backend
    }
}

pub struct BinaryBackend {
    pub addr: String,
    /// Every decoded request, in arrival order.
    pub log: Arc<Mutex<Vec<binary::Request>>>,
    pub accepted: Arc<AtomicUsize>,
    pub store: Store,
    /// Releases responses parked by `hold_key`.
    pub release: Arc<Notify>,
}

impl BinaryBackend {
    pub async fn start() -> BinaryBackend {
        BackendBuilder::new().start().await
    }

    pub async fn insert(&self, key: &[u8], flags: u32, value: &[u8]) {
        self.store
            .lock()
            .await
            .insert(key.to_vec(), (flags, value.to_vec()));
    }

    /// `(opcode, key)` pairs of every logged request.
    pub async fn log_keys(&self) -> Vec<(Opcode, Vec<u8>)> {
        self.log
            .lock()
            .await
            .iter()
            .map(|req| (req.opcode, req.key.to_vec()))
            .collect()
    }
}

async fn serve_binary_conn(
    stream: TcpStream,
    log: Arc<Mutex<Vec<binary::Request>>>,
    store: Store,
    hold_key: Option<Vec<u8>>,
    release: Arc<Notify>,
    stats_items: u64,
) {
    let mut framed = Framed::new(stream, binary::RequestCodec::default());
    while let Some(Ok(request)) = framed.next().await {
        log.lock().await.push(request.clone());
        let quiet = request.opcode.is_quiet();
        let mut replies: Vec<binary::Response> = Vec::new();

        match request.opcode.unquiet() {
            Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::Append | Opcode::Prepend => {
                let flags = if request.extras.len() >= 4 {
                    u32::from_be_bytes([
                        request.extras[0],
                        request.extras[1],
                        request.extras[2],
                        request.extras[3],
                    ])
                } else {
                    0
                };
                store
                    .lock()
                    .await
                    .insert(request.key.to_vec(), (flags, request.value.to_vec()));
                if !quiet {
                    replies.push(binary::Response::simple(request.opcode, Status::Ok));
                }
            }
            Opcode::GetK => {
                if hold_key.as_deref() == Some(request.key.as_ref()) {
                    release.notified().await;
                }
                let hit = store.lock().await.get(request.key.as_ref()).cloned();
                match hit {
                    Some((flags, value)) => {
                        let mut extras = BytesMut::new();
                        extras.put_u32(flags);
                        replies.push(binary::Response {
                            opcode: request.opcode,
                            status: Status::Ok,
                            opaque: request.opaque,
                            cas: 1,
                            extras: extras.freeze(),
                            key: request.key.clone(),
                            value: Bytes::from(value),
                        });
                    }
                    None => {
                        // Quiet misses are silent; that is the contract
                        // multi-get batching relies on.
                        if !quiet {
                            let mut miss =
                                binary::Response::simple(request.opcode, Status::KeyEnoent);
                            miss.key = request.key.clone();
                            replies.push(miss);
                        }
                    }
                }
            }
            Opcode::Delete => {
                let removed = store.lock().await.remove(request.key.as_ref()).is_some();
                if !quiet {
                    let status = if removed { Status::Ok } else { Status::KeyEnoent };
                    replies.push(binary::Response::simple(request.opcode, status));
                }
            }
            Opcode::Increment | Opcode::Decrement => {
                let delta = u64::from_be_bytes([
                    request.extras[0],
                    request.extras[1],
                    request.extras[2],
                    request.extras[3],
                    request.extras[4],
                    request.extras[5],
                    request.extras[6],
                    request.extras[7],
                ]);
                let mut store = store.lock().await;
                let response = match store.get_mut(request.key.as_ref()) {
                    Some((_, value)) => {
                        let current: u64 = String::from_utf8_lossy(value).parse().unwrap_or(0);
                        let next = if request.opcode.unquiet() == Opcode::Increment {
                            current.wrapping_add(delta)
                        } else {
                            current.saturating_sub(delta)
                        };
                        *value = next.to_string().into_bytes();
                        let mut body = BytesMut::new();
                        body.put_u64(next);
                        let mut ok = binary::Response::simple(request.opcode, Status::Ok);
                        ok.value = body.freeze();
                        ok
                    }
                    None => binary::Response::simple(request.opcode, Status::KeyEnoent),
                };
                if !quiet {
                    replies.push(response);
                }
            }
            Opcode::Flush => {
                store.lock().await.clear();
                if !quiet {
                    replies.push(binary::Response::simple(request.opcode, Status::Ok));
                }
            }
            Opcode::Stat => {
                if request.key.is_empty() {
                    let mut stat = binary::Response::simple(Opcode::Stat, Status::Ok);
                    stat.key = Bytes::from_static(b"curr_items");
                    stat.value = Bytes::from(stats_items.to_string());
                    replies.push(stat);
                }
                // Terminator: empty key, empty body.
                replies.push(binary::Response::simple(Opcode::Stat, Status::Ok));
            }
            _ => {
                replies.push(binary::Response::simple(
                    request.opcode,
                    Status::Unknown(0x0081),
                ));
            }
        }

        for reply in replies {
            if framed.send(reply.to_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// A fake text-protocol backend for a2a tests, parsing commands with the
/// same request codec the proxy's upstream side uses.
pub struct AsciiBackend {
    pub addr: String,
    pub store: Store,
}

impl AsciiBackend {
    pub async fn start() -> AsciiBackend {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("backend bind");
        let addr = listener.local_addr().expect("backend addr").to_string();
        let backend = AsciiBackend {
            addr,
            store: Arc::new(Mutex::new(HashMap::new())),
        };

        let store = backend.store.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(serve_ascii_conn(stream, store.clone()));
            }
        });

        backend
    }

    pub async fn insert(&self, key: &[u8], flags: u32, value: &[u8]) {
        self.store
            .lock()
            .await
            .insert(key.to_vec(), (flags, value.to_vec()));
    }
}

async fn serve_ascii_conn(stream: TcpStream, store: Store) {
    use text::Request;

    let mut framed = Framed::new(stream, text::RequestCodec::new());
    while let Some(Ok(request)) = framed.next().await {
        let mut out = BytesMut::new();
        match request {
            Request::Storage {
                key,
                flags,
                noreply,
                data,
                ..
            } => {
                store
                    .lock()
                    .await
                    .insert(key.to_vec(), (flags, data.to_vec()));
                if !noreply {
                    out.extend_from_slice(b"STORED\r\n");
                }
            }
            Request::Get { gets, keys } => {
                let store = store.lock().await;
                for key in &keys {
                    if let Some((flags, value)) = store.get(key.as_ref()) {
                        text::render_value_header(
                            &mut out,
                            key,
                            *flags,
                            value.len(),
                            if gets { Some(1) } else { None },
                        );
                        out.extend_from_slice(value);
                        out.extend_from_slice(b"\r\n");
                    }
                }
                out.extend_from_slice(b"END\r\n");
            }
            Request::Delete { key, noreply } => {
                let removed = store.lock().await.remove(key.as_ref()).is_some();
                if !noreply {
                    out.extend_from_slice(if removed {
                        &b"DELETED\r\n"[..]
                    } else {
                        &b"NOT_FOUND\r\n"[..]
                    });
                }
            }
            Request::FlushAll { noreply, .. } => {
                store.lock().await.clear();
                if !noreply {
                    out.extend_from_slice(b"OK\r\n");
                }
            }
            Request::Stats { .. } => {
                let items = store.lock().await.len();
                text::render_stat_line(&mut out, b"curr_items", items.to_string().as_bytes());
                out.extend_from_slice(b"END\r\n");
            }
            Request::Quit => return,
            _ => out.extend_from_slice(b"ERROR\r\n"),
        }
        if !out.is_empty() && framed.send(out.freeze()).await.is_err() {
            return;
        }
    }
}

/// A raw text-protocol client.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: &str) -> TestClient {
        let stream = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        TestClient { stream }
    }

    pub async fn send(&mut self, data: &[u8]) {
        tokio::time::timeout(IO_TIMEOUT, self.stream.write_all(data))
            .await
            .expect("write timed out")
            .expect("write failed");
    }

    /// Reads exactly `expected.len()` bytes and asserts they match.
    pub async fn expect(&mut self, expected: &[u8]) {
        let mut got = vec![0u8; expected.len()];
        tokio::time::timeout(IO_TIMEOUT, self.stream.read_exact(&mut got))
            .await
            .expect("read timed out")
            .expect("read failed");
        assert_eq!(
            String::from_utf8_lossy(&got),
            String::from_utf8_lossy(expected),
        );
    }

    /// Reads until the buffer ends with `suffix` and returns it all.
    pub async fn read_until(&mut self, suffix: &[u8]) -> Vec<u8> {
        tokio::time::timeout(IO_TIMEOUT, async {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = self.stream.read(&mut chunk).await.expect("read failed");
                assert!(n > 0, "connection closed while waiting for response");
                buf.extend_from_slice(&chunk[..n]);
                if buf.ends_with(suffix) {
                    return buf;
                }
            }
        })
        .await
        .expect("read timed out")
    }
}

pub struct ProxyHarness {
    pub addr: String,
    pub proxy: Arc<Proxy>,
    /// Worker 0's counter block (tests run single-worker).
    pub stats: Arc<ProxyStats>,
    quit: mpsc::Sender<()>,
}

impl ProxyHarness {
    pub async fn start(cluster: &str, behavior: Behavior) -> ProxyHarness {
        // Keep the async drain alive for the whole test process.
        if let Some(guard) = mcproxy_logging::init_test_logging() {
            std::mem::forget(guard);
        }

        let proxy = Arc::new(Proxy::new(
            "test".to_string(),
            "127.0.0.1:0".to_string(),
            cluster.to_string(),
            0,
            behavior,
        ));
        let server = ProxyServer::listen(proxy.clone())
            .await
            .expect("proxy listen failed");
        let addr = server.local_addr().expect("proxy addr").to_string();
        let stats = server.worker_stats(0);
        let quit = server.quit_channel();
        tokio::spawn(server.run());

        ProxyHarness {
            addr,
            proxy,
            stats,
            quit,
        }
    }

    pub async fn stop(&self) {
        let _ = self.quit.send(()).await;
    }
}

/// Single-worker behavior used by most scenarios; scheduling is then
/// deterministic.
pub fn test_behavior(downstream_max: usize) -> Behavior {
    Behavior {
        nthreads: 1,
        downstream_max,
        ..Behavior::default()
    }
}
