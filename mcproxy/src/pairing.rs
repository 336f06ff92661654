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

//! One pairing: a reserved downstream bundle serving one upstream request
//! (or a batch of compatible ones) to completion, then handing the bundle
//! back to its worker.

use std::sync::Arc;

use bytes::Bytes;

use mcproxy_logging::macros::*;

use crate::config::DownstreamProtocol;
use crate::downstream::Downstream;
use crate::scheduler::{upstream_error, OpTx, Waiter, WorkerOp};
use crate::stats::ProxyStats;
use crate::translate::{a2a, a2b, ForwardResult};

pub struct Pairing {
    downstream: Downstream,
    upstreams: Vec<Waiter>,
    stats: Arc<ProxyStats>,
    ops: OpTx,
}

impl Pairing {
    pub fn spawn(
        downstream: Downstream,
        upstreams: Vec<Waiter>,
        stats: Arc<ProxyStats>,
        ops: OpTx,
    ) {
        let pairing = Pairing {
            downstream,
            upstreams,
            stats,
            ops,
        };
        tokio::spawn(pairing.run());
    }

    async fn run(mut self) {
        let result = match self.downstream.behavior.downstream_prot {
            DownstreamProtocol::Binary => {
                a2b::forward(&mut self.downstream, &self.upstreams, &self.stats).await
            }
            DownstreamProtocol::Ascii => {
                a2a::forward(&mut self.downstream, &self.upstreams, &self.stats).await
            }
        };

        let mut retry = None;
        match result {
            ForwardResult::Complete => {}
            ForwardResult::BadRequest(line) => {
                for waiter in &self.upstreams {
                    waiter.reply_chunk(Bytes::from_static(line));
                }
            }
            ForwardResult::NoWrite => {
                debug!("pairing: could not forward to any downstream socket");
                for waiter in &self.upstreams {
                    upstream_error(waiter);
                }
            }
            ForwardResult::Broken {
                any_reply,
                single_conn,
                suffix,
            } => {
                // One-shot retry: nothing came back yet, a single socket
                // was involved and a single un-retried upstream waits.
                let eligible = !any_reply
                    && single_conn
                    && self.upstreams.len() == 1
                    && self.upstreams[0].retries == 0
                    && !self.upstreams[0].request.noreply()
                    && !self.upstreams[0].is_abandoned();
                if eligible {
                    retry = self.upstreams.pop();
                } else {
                    let line =
                        suffix.unwrap_or(b"SERVER_ERROR proxy downstream closed\r\n" as &[u8]);
                    for waiter in &self.upstreams {
                        waiter.reply_chunk(Bytes::copy_from_slice(line));
                    }
                }
            }
        }

        // Response streams end when the waiters (and their senders) drop
        // with this pairing.
        let _ = self.ops.send(WorkerOp::Release {
            downstream: self.downstream,
            retry,
        });
    }
}
