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

//! The downstream bundle: the proxy's unit of pool reservation. One bundle
//! owns a lazily-connected socket per backend host plus the configuration
//! snapshot it was created from.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use mcproxy_logging::macros::*;

use memcache_proto::{binary, text};

use crate::config::{Behavior, DownstreamProtocol};
use crate::error::Result;
use crate::proxy::ConfigSnapshot;
use crate::server_set::{Address, ServerSet};
use crate::stats::{bump, ProxyStats};

/// A decoded backend reply in either downstream protocol.
#[derive(Debug)]
pub enum ReplyFrame {
    Binary(binary::Response),
    Ascii(text::Response),
}

/// Codec over a backend socket. Requests are written as pre-rendered
/// bytes; replies decode according to the configured downstream protocol.
#[derive(Debug)]
pub enum BackendCodec {
    Binary(binary::ResponseCodec),
    Ascii(text::ResponseCodec),
}

impl BackendCodec {
    fn new(prot: DownstreamProtocol) -> BackendCodec {
        match prot {
            DownstreamProtocol::Binary => BackendCodec::Binary(binary::ResponseCodec::default()),
            DownstreamProtocol::Ascii => BackendCodec::Ascii(text::ResponseCodec::new()),
        }
    }
}

impl Decoder for BackendCodec {
    type Item = ReplyFrame;
    type Error = memcache_proto::Error;

    fn decode(&mut self, src: &mut BytesMut) -> memcache_proto::Result<Option<ReplyFrame>> {
        match self {
            BackendCodec::Binary(codec) => Ok(codec.decode(src)?.map(ReplyFrame::Binary)),
            BackendCodec::Ascii(codec) => Ok(codec.decode(src)?.map(ReplyFrame::Ascii)),
        }
    }
}

impl Encoder<Bytes> for BackendCodec {
    type Error = memcache_proto::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> memcache_proto::Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// One live socket to a backend host. The connection gauge is RAII: it is
/// incremented on connect and decremented on drop.
#[derive(Debug)]
pub struct DownstreamConn {
    framed: Framed<TcpStream, BackendCodec>,
    stats: Arc<ProxyStats>,
}

impl DownstreamConn {
    async fn connect(
        addr: &Address,
        prot: DownstreamProtocol,
        stats: Arc<ProxyStats>,
    ) -> std::io::Result<DownstreamConn> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        stream.set_nodelay(true)?;
        stats.num_downstream_conn.fetch_add(1, Ordering::Relaxed);
        bump(&stats.tot_downstream_conn);
        Ok(DownstreamConn {
            framed: Framed::new(stream, BackendCodec::new(prot)),
            stats,
        })
    }

    /// Writes one pre-rendered request frame (or batch of frames) and
    /// flushes it.
    pub async fn send(&mut self, frame: Bytes) -> memcache_proto::Result<()> {
        self.framed.send(frame).await
    }

    /// Next decoded reply; `None` on a closed socket.
    pub async fn next_reply(&mut self) -> Option<memcache_proto::Result<ReplyFrame>> {
        self.framed.next().await
    }
}

impl Drop for DownstreamConn {
    fn drop(&mut self) {
        self.stats.num_downstream_conn.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The reservation unit: a socket slot per host in the server set, plus the
/// configuration snapshot taken at creation time. Per-request scratch state
/// lives in the pairing that holds the bundle, so a released bundle has
/// none by construction.
#[derive(Debug)]
pub struct Downstream {
    pub cluster: String,
    pub config_ver: u32,
    pub behavior: Behavior,
    pub server_set: ServerSet,
    conns: Vec<Option<DownstreamConn>>,
    stats: Arc<ProxyStats>,
}

impl Downstream {
    /// Builds a bundle with all socket slots unconnected. The cluster
    /// string is re-parsed here on every creation.
    pub fn new(snapshot: ConfigSnapshot, stats: Arc<ProxyStats>) -> Result<Downstream> {
        let server_set = ServerSet::parse(&snapshot.cluster)?;
        let conns = (0..server_set.len()).map(|_| None).collect();
        Ok(Downstream {
            cluster: snapshot.cluster,
            config_ver: snapshot.config_ver,
            behavior: snapshot.behavior,
            server_set,
            conns,
            stats,
        })
    }

    pub fn server_count(&self) -> usize {
        self.conns.len()
    }

    pub fn index_for_key(&self, key: &[u8]) -> usize {
        self.server_set.key_index(key)
    }

    /// Takes the socket for slot `index`, connecting it first if needed.
    /// Returns `None` when the host is unreachable; the slot stays empty
    /// and is retried on next use.
    pub async fn take_connected(&mut self, index: usize) -> Option<DownstreamConn> {
        if self.conns[index].is_none() {
            let addr = self.server_set.get(index);
            match DownstreamConn::connect(addr, self.behavior.downstream_prot, self.stats.clone())
                .await
            {
                Ok(conn) => self.conns[index] = Some(conn),
                Err(e) => {
                    debug!("downstream connect to {} failed: {}", addr, e);
                }
            }
        }
        self.conns[index].take()
    }

    /// Returns a still-healthy socket to its slot after use.
    pub fn put_conn(&mut self, index: usize, conn: DownstreamConn) {
        self.conns[index] = Some(conn);
    }
}
