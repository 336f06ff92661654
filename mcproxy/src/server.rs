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

//! The proxy server task: a listening socket, a fixed set of worker
//! tasks, and an accept loop that pins every client connection to one
//! worker round-robin.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use mcproxy_logging::macros::*;

use crate::error::Result;
use crate::proxy::Proxy;
use crate::scheduler::{OpTx, Worker};
use crate::stats::ProxyStats;
use crate::upstream::UpstreamSession;

struct WorkerEntry {
    ops: OpTx,
    stats: Arc<ProxyStats>,
}

/// Structure representing the main server task.
///
/// Created by binding the listening socket; `run()` turns it into the
/// accept loop. The quit channel terminates the loop from outside.
pub struct ProxyServer {
    listener: TcpListener,
    proxy: Arc<Proxy>,
    workers: Vec<WorkerEntry>,
    next_worker: usize,
    quit_tx: mpsc::Sender<()>,
    quit_rx: mpsc::Receiver<()>,
}

impl ProxyServer {
    /// Binds the listening socket and spawns `behavior.nthreads` workers,
    /// each with its own pool, wait queue and counter block.
    pub async fn listen(proxy: Arc<Proxy>) -> Result<ProxyServer> {
        let listener = TcpListener::bind(proxy.listen()).await?;
        let nthreads = proxy.behavior().nthreads.max(1);
        let workers = (0..nthreads)
            .map(|_| {
                let stats = Arc::new(ProxyStats::default());
                let ops = Worker::spawn(proxy.clone(), stats.clone());
                WorkerEntry { ops, stats }
            })
            .collect();
        let (quit_tx, quit_rx) = mpsc::channel(1);

        Ok(ProxyServer {
            listener,
            proxy,
            workers,
            next_worker: 0,
            quit_tx,
            quit_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Obtain the quit channel transmit end,
    /// which can be used to terminate the server task.
    pub fn quit_channel(&self) -> mpsc::Sender<()> {
        self.quit_tx.clone()
    }

    /// Counter block of one worker, mostly useful to tests and the
    /// `stats proxy` command.
    pub fn worker_stats(&self, index: usize) -> Arc<ProxyStats> {
        self.workers[index].stats.clone()
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        trace!("proxy: connection accepted from {}", peer);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("proxy: set_nodelay failed for {}: {}", peer, e);
        }
        let entry = &self.workers[self.next_worker];
        self.next_worker = (self.next_worker + 1) % self.workers.len();
        UpstreamSession::spawn(stream, entry.ops.clone(), entry.stats.clone());
    }

    /// The accept loop with default error handling; runs until the quit
    /// channel fires.
    pub async fn run(mut self) {
        info!(
            "memcached proxy `{}` listening on {} ({} workers)",
            self.proxy.name(),
            self.proxy.listen(),
            self.workers.len()
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => {
                        warn!("proxy: accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = self.quit_rx.recv() => {
                    break;
                }
            }
        }

        info!("memcached proxy `{}` terminated", self.proxy.name());
    }
}
