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

//! Per-worker scheduling: the wait queue, the downstream pool, and the
//! pairing engine.
//!
//! Each worker is a single task owning all of its pool state. Upstream
//! sessions enqueue waiters on the worker's channel; pairings hand their
//! bundle back the same way. Because releases arrive as messages rather
//! than as synchronous calls, the assign loop can never re-enter itself.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;

use mcproxy_logging::macros::*;

use memcache_proto::text::Request;

use crate::downstream::Downstream;
use crate::pairing::Pairing;
use crate::proxy::{Proxy, Validity};
use crate::stats::{bump, ProxyStats};

/// Sender half of one upstream request's reply stream. Chunks are raw
/// response bytes; dropping the sender terminates the response.
pub type ReplyTx = mpsc::UnboundedSender<Bytes>;

/// An upstream request parked on the wait queue or attached to a pairing.
#[derive(Debug)]
pub struct Waiter {
    pub request: Request,
    /// `None` for noreply requests, which never see a response.
    pub reply: Option<ReplyTx>,
    /// Capped at 1; a request is retried at most once.
    pub retries: u8,
    pub enqueued: Instant,
}

impl Waiter {
    pub fn new(request: Request, reply: Option<ReplyTx>) -> Waiter {
        Waiter {
            request,
            reply,
            retries: 0,
            enqueued: Instant::now(),
        }
    }

    /// Streams one chunk of response bytes; silently dropped when the
    /// upstream has gone away.
    pub fn reply_chunk(&self, chunk: Bytes) {
        if let Some(tx) = &self.reply {
            let _ = tx.send(chunk);
        }
    }

    /// True when the upstream hung up while this request was parked.
    pub fn is_abandoned(&self) -> bool {
        match &self.reply {
            Some(tx) => tx.is_closed(),
            None => false,
        }
    }
}

/// Emits the could-not-reach-a-downstream error: `END` for get family
/// commands, a server error line otherwise.
pub(crate) fn upstream_error(waiter: &Waiter) {
    let line: &'static [u8] = if waiter.request.is_get() {
        b"END\r\n"
    } else {
        b"SERVER_ERROR proxy write to downstream\r\n"
    };
    waiter.reply_chunk(Bytes::from_static(line));
}

/// Messages processed by a worker.
pub enum WorkerOp {
    Enqueue(Waiter),
    Release {
        downstream: Downstream,
        /// A waiter to re-queue for its one-shot retry.
        retry: Option<Waiter>,
    },
}

pub type OpTx = mpsc::UnboundedSender<WorkerOp>;

/// Two paused plain `get` requests can share one multi-get fan-out.
/// `gets` (cas) is excluded, as are retried and hung-up requests (both
/// sides are checked, callers need not pre-filter).
fn is_compatible(existing: &Waiter, candidate: &Waiter) -> bool {
    fn plain_get(waiter: &Waiter) -> bool {
        matches!(waiter.request, Request::Get { gets: false, .. })
    }

    existing.retries == 0
        && candidate.retries == 0
        && !existing.request.noreply()
        && !candidate.request.noreply()
        && plain_get(existing)
        && plain_get(candidate)
        && !existing.is_abandoned()
        && !candidate.is_abandoned()
}

/// One worker's scheduling state (reserved/released pool, wait queue,
/// counters). Owned exclusively by the worker task.
pub struct Worker {
    proxy: Arc<Proxy>,
    stats: Arc<ProxyStats>,
    ops_rx: mpsc::UnboundedReceiver<WorkerOp>,
    ops_tx: OpTx,
    waiting: VecDeque<Waiter>,
    released: VecDeque<Downstream>,
    downstream_num: usize,
    downstream_max: usize,
    downstream_tot: u64,
    wait_deadline: Option<TokioInstant>,
}

impl Worker {
    /// Spawns the worker task and returns the channel upstream sessions
    /// and pairings talk to it through.
    pub fn spawn(proxy: Arc<Proxy>, stats: Arc<ProxyStats>) -> OpTx {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let downstream_max = proxy.behavior().downstream_max.max(1);
        let worker = Worker {
            proxy,
            stats,
            ops_rx,
            ops_tx: ops_tx.clone(),
            waiting: VecDeque::new(),
            released: VecDeque::new(),
            downstream_num: 0,
            downstream_max,
            downstream_tot: 0,
            wait_deadline: None,
        };
        tokio::spawn(worker.run());
        ops_tx
    }

    async fn run(mut self) {
        loop {
            let op = match self.wait_deadline {
                Some(deadline) => {
                    tokio::select! {
                        op = self.ops_rx.recv() => match op {
                            Some(op) => Some(op),
                            None => break,
                        },
                        _ = tokio::time::sleep_until(deadline) => None,
                    }
                }
                None => match self.ops_rx.recv().await {
                    Some(op) => Some(op),
                    None => break,
                },
            };

            match op {
                Some(WorkerOp::Enqueue(waiter)) => self.enqueue(waiter),
                Some(WorkerOp::Release { downstream, retry }) => {
                    self.handle_release(downstream, retry)
                }
                None => self.wait_queue_timeout(),
            }

            self.assign();
        }
    }

    /// Parks the request on the wait queue and arms the wait-queue timer
    /// if it is not already running.
    fn enqueue(&mut self, waiter: Waiter) {
        self.waiting.push_back(waiter);
        if self.wait_deadline.is_none() {
            if let Some(timeout) = self.proxy.behavior().wait_queue_timeout.to_duration() {
                self.wait_deadline = Some(TokioInstant::now() + timeout);
            }
        }
    }

    fn handle_release(&mut self, downstream: Downstream, retry: Option<Waiter>) {
        if let Some(mut waiter) = retry {
            waiter.retries = 1;
            bump(&self.stats.tot_retry);
            trace!("worker: retrying upstream request once");
            self.enqueue(waiter);
        }
        self.release_downstream(downstream, false);
    }

    /// Returns the bundle to the free list, or frees it when its config
    /// has drifted from the proxy's.
    fn release_downstream(&mut self, mut downstream: Downstream, force: bool) {
        bump(&self.stats.tot_downstream_released);
        match self
            .proxy
            .check_downstream(&downstream.cluster, downstream.config_ver)
        {
            Validity::Current => self.released.push_back(downstream),
            Validity::Upgraded {
                config_ver,
                behavior,
            } => {
                downstream.config_ver = config_ver;
                downstream.behavior = behavior;
                self.released.push_back(downstream);
            }
            Validity::Stale if force => self.released.push_back(downstream),
            Validity::Stale => self.free_downstream(downstream),
        }
    }

    fn free_downstream(&mut self, downstream: Downstream) {
        bump(&self.stats.tot_downstream_freed);
        self.downstream_num -= 1;
        // Dropping the bundle closes its sockets and settles the gauges.
        drop(downstream);
    }

    /// Creates one bundle if the pool cap allows. Silently does nothing
    /// when the proxy is shutting down.
    fn add_downstream(&mut self) {
        if self.downstream_num >= self.downstream_max {
            bump(&self.stats.tot_downstream_max_reached);
            return;
        }
        let snapshot = match self.proxy.snapshot() {
            Some(snapshot) => snapshot,
            None => return,
        };
        match Downstream::new(snapshot, self.stats.clone()) {
            Ok(downstream) => {
                self.downstream_tot += 1;
                self.downstream_num += 1;
                trace!(
                    "worker: downstream bundle created ({}/{} live, {} ever)",
                    self.downstream_num,
                    self.downstream_max,
                    self.downstream_tot
                );
                // Force: a just-built bundle goes on the free list even if
                // the config moved while it was being built.
                self.release_downstream(downstream, true);
            }
            Err(e) => {
                bump(&self.stats.tot_downstream_create_failed);
                warn!("worker: downstream create failed: {}", e);
            }
        }
    }

    /// Pops a valid bundle off the free list, creating or discarding stale
    /// ones as needed.
    fn reserve_downstream(&mut self) -> Option<Downstream> {
        loop {
            if self.released.is_empty() {
                self.add_downstream();
            }
            let mut downstream = self.released.pop_front()?;
            match self
                .proxy
                .check_downstream(&downstream.cluster, downstream.config_ver)
            {
                Validity::Current => {}
                Validity::Upgraded {
                    config_ver,
                    behavior,
                } => {
                    downstream.config_ver = config_ver;
                    downstream.behavior = behavior;
                }
                Validity::Stale => {
                    self.free_downstream(downstream);
                    continue;
                }
            }
            bump(&self.stats.tot_downstream_reserved);
            return Some(downstream);
        }
    }

    /// The pairing engine: serve the wait queue in FIFO order, batching
    /// compatible requests onto one bundle, until either runs out.
    fn assign(&mut self) {
        loop {
            while matches!(self.waiting.front(), Some(waiter) if waiter.is_abandoned()) {
                self.waiting.pop_front();
            }
            if self.waiting.is_empty() {
                self.wait_deadline = None;
                return;
            }

            let downstream = match self.reserve_downstream() {
                Some(downstream) => downstream,
                None => return,
            };

            let head = self
                .waiting
                .pop_front()
                .expect("BUG: wait queue emptied during assign");
            bump(&self.stats.tot_assign_downstream);
            bump(&self.stats.tot_assign_upstream);

            let mut batch = vec![head];
            while let Some(next) = self.waiting.front() {
                if !is_compatible(&batch[0], next) {
                    break;
                }
                let next = self
                    .waiting
                    .pop_front()
                    .expect("BUG: wait queue emptied during batching");
                bump(&self.stats.tot_assign_upstream);
                batch.push(next);
            }

            trace!("worker: assigned {} upstream(s) to a downstream", batch.len());
            Pairing::spawn(downstream, batch, self.stats.clone(), self.ops_tx.clone());
        }
    }

    /// Evicts waiters that sat on the queue longer than the configured
    /// timeout and re-arms the timer while anyone is still waiting.
    fn wait_queue_timeout(&mut self) {
        self.wait_deadline = None;
        let timeout = match self.proxy.behavior().wait_queue_timeout.to_duration() {
            Some(timeout) => timeout,
            None => return,
        };

        let now = Instant::now();
        let mut keep = VecDeque::with_capacity(self.waiting.len());
        while let Some(waiter) = self.waiting.pop_front() {
            if waiter.is_abandoned() {
                continue;
            }
            if now.duration_since(waiter.enqueued) >= timeout {
                debug!("worker: wait queue timeout, erroring an upstream");
                upstream_error(&waiter);
            } else {
                keep.push_back(waiter);
            }
        }
        self.waiting = keep;

        if !self.waiting.is_empty() {
            self.wait_deadline = Some(TokioInstant::now() + timeout);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn get_waiter(keys: &[&str], gets: bool) -> (Waiter, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let waiter = Waiter::new(
            Request::Get {
                gets,
                keys: keys
                    .iter()
                    .map(|k| Bytes::copy_from_slice(k.as_bytes()))
                    .collect(),
            },
            Some(tx),
        );
        (waiter, rx)
    }

    #[test]
    fn test_plain_gets_are_compatible() {
        let (a, _rx_a) = get_waiter(&["a", "b"], false);
        let (b, _rx_b) = get_waiter(&["b", "c"], false);
        assert!(is_compatible(&a, &b));
    }

    #[test]
    fn test_cas_get_and_retry_break_compatibility() {
        let (a, _rx_a) = get_waiter(&["a"], false);
        let (gets, _rx_b) = get_waiter(&["b"], true);
        assert!(!is_compatible(&a, &gets));

        let (mut retried, _rx_c) = get_waiter(&["b"], false);
        retried.retries = 1;
        assert!(!is_compatible(&a, &retried));
    }

    #[test]
    fn test_abandoned_waiter_detection() {
        let waiter = {
            let (tx, rx) = mpsc::unbounded_channel();
            drop(rx);
            Waiter::new(Request::Get { gets: false, keys: vec![] }, Some(tx))
        };
        assert!(waiter.is_abandoned());

        let noreply = Waiter::new(Request::Version, None);
        assert!(!noreply.is_abandoned());
    }
}
