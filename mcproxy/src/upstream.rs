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

//! One upstream (client) session: decode text commands, park them on the
//! owning worker's wait queue, stream the reply chunks back. One request
//! is outstanding at a time; `noreply` commands skip the reply stream
//! entirely and the session moves straight to the next command.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use mcproxy_logging::macros::*;

use memcache_proto::text::{self, Request};

use crate::scheduler::{OpTx, Waiter, WorkerOp};
use crate::stats::{bump, ProxyStats};

pub struct UpstreamSession {
    framed: Framed<TcpStream, text::RequestCodec>,
    ops: OpTx,
    stats: Arc<ProxyStats>,
}

impl UpstreamSession {
    /// Spawns the session task for an accepted client socket. The session
    /// is pinned to the worker behind `ops` for its whole lifetime.
    pub fn spawn(stream: TcpStream, ops: OpTx, stats: Arc<ProxyStats>) {
        stats.num_upstream.fetch_add(1, Ordering::Relaxed);
        bump(&stats.tot_upstream);
        let session = UpstreamSession {
            framed: Framed::new(stream, text::RequestCodec::new()),
            ops,
            stats,
        };
        tokio::spawn(session.run());
    }

    async fn run(mut self) {
        if let Err(e) = self.serve().await {
            debug!("upstream session closed: {}", e);
        }
        self.stats.num_upstream.fetch_sub(1, Ordering::Relaxed);
    }

    async fn serve(&mut self) -> crate::Result<()> {
        loop {
            let request = match self.framed.next().await {
                Some(Ok(request)) => request,
                Some(Err(e)) => {
                    debug!("upstream protocol error: {}", e);
                    return Ok(());
                }
                None => return Ok(()),
            };

            match request {
                Request::Quit => return Ok(()),
                Request::Version => {
                    let line = format!("VERSION {}\r\n", env!("CARGO_PKG_VERSION"));
                    self.framed.send(Bytes::from(line)).await?;
                }
                Request::Invalid(message) => self.send_line(message).await?,
                Request::Unknown => self.send_line("ERROR").await?,
                Request::Stats { ref args } if local_stats_reset(args) => {
                    self.stats.reset();
                    self.send_line("RESET").await?;
                }
                Request::Stats { ref args } if local_stats(args) => {
                    self.send_proxy_stats().await?;
                }
                request => self.proxy_request(request).await?,
            }
        }
    }

    /// Hands the request to the worker and pumps reply chunks until the
    /// pairing drops its sender.
    async fn proxy_request(&mut self, request: Request) -> crate::Result<()> {
        if request.noreply() {
            let waiter = Waiter::new(request, None);
            if self.ops.send(WorkerOp::Enqueue(waiter)).is_err() {
                return Ok(());
            }
            self.note_pipelined_input();
            return Ok(());
        }

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let waiter = Waiter::new(request, Some(reply_tx));
        if self.ops.send(WorkerOp::Enqueue(waiter)).is_err() {
            // Worker is gone, the proxy is shutting down.
            self.send_line("SERVER_ERROR proxy write to downstream").await?;
            return Ok(());
        }

        while let Some(chunk) = reply_rx.recv().await {
            self.framed.send(chunk).await?;
        }
        self.note_pipelined_input();
        Ok(())
    }

    /// The client wrote ahead while a request was still in flight.
    fn note_pipelined_input(&self) {
        if !self.framed.read_buffer().is_empty() {
            bump(&self.stats.tot_reset_upstream_avail);
        }
    }

    /// `stats proxy`: this worker's counter block, no backend hop.
    async fn send_proxy_stats(&mut self) -> crate::Result<()> {
        let mut out = BytesMut::new();
        for (name, value) in self.stats.entries() {
            text::render_stat_line(&mut out, name.as_bytes(), value.to_string().as_bytes());
        }
        out.extend_from_slice(b"END\r\n");
        self.framed.send(out.freeze()).await?;
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> crate::Result<()> {
        let mut out = BytesMut::with_capacity(line.len() + 2);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.framed.send(out.freeze()).await?;
        Ok(())
    }
}

fn local_stats(args: &Option<Bytes>) -> bool {
    matches!(args, Some(args) if args.as_ref() == b"proxy")
}

fn local_stats_reset(args: &Option<Bytes>) -> bool {
    matches!(args, Some(args) if args.as_ref() == b"proxy reset")
}
