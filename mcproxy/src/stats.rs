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

//! Per-worker counter block. `num_*` fields are gauges, `tot_*` fields are
//! cumulative and only cleared by an explicit reset.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ProxyStats {
    pub num_upstream: AtomicU64,
    pub num_downstream_conn: AtomicU64,

    pub tot_upstream: AtomicU64,
    pub tot_downstream_conn: AtomicU64,
    pub tot_downstream_released: AtomicU64,
    pub tot_downstream_reserved: AtomicU64,
    pub tot_downstream_freed: AtomicU64,
    pub tot_downstream_quit_server: AtomicU64,
    pub tot_downstream_max_reached: AtomicU64,
    pub tot_downstream_create_failed: AtomicU64,
    pub tot_assign_downstream: AtomicU64,
    pub tot_assign_upstream: AtomicU64,
    pub tot_reset_upstream_avail: AtomicU64,
    pub tot_oom: AtomicU64,
    pub tot_retry: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ProxyStats {
    /// Clears the `tot_*` counters; gauges are left alone.
    pub fn reset(&self) {
        self.tot_upstream.store(0, Ordering::Relaxed);
        self.tot_downstream_conn.store(0, Ordering::Relaxed);
        self.tot_downstream_released.store(0, Ordering::Relaxed);
        self.tot_downstream_reserved.store(0, Ordering::Relaxed);
        self.tot_downstream_freed.store(0, Ordering::Relaxed);
        self.tot_downstream_quit_server.store(0, Ordering::Relaxed);
        self.tot_downstream_max_reached.store(0, Ordering::Relaxed);
        self.tot_downstream_create_failed.store(0, Ordering::Relaxed);
        self.tot_assign_downstream.store(0, Ordering::Relaxed);
        self.tot_assign_upstream.store(0, Ordering::Relaxed);
        self.tot_reset_upstream_avail.store(0, Ordering::Relaxed);
        self.tot_oom.store(0, Ordering::Relaxed);
        self.tot_retry.store(0, Ordering::Relaxed);
    }

    /// Name/value pairs in a stable order, for `stats proxy` rendering.
    pub fn entries(&self) -> Vec<(&'static str, u64)> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        vec![
            ("num_upstream", load(&self.num_upstream)),
            ("num_downstream_conn", load(&self.num_downstream_conn)),
            ("tot_upstream", load(&self.tot_upstream)),
            ("tot_downstream_conn", load(&self.tot_downstream_conn)),
            (
                "tot_downstream_released",
                load(&self.tot_downstream_released),
            ),
            (
                "tot_downstream_reserved",
                load(&self.tot_downstream_reserved),
            ),
            ("tot_downstream_freed", load(&self.tot_downstream_freed)),
            (
                "tot_downstream_quit_server",
                load(&self.tot_downstream_quit_server),
            ),
            (
                "tot_downstream_max_reached",
                load(&self.tot_downstream_max_reached),
            ),
            (
                "tot_downstream_create_failed",
                load(&self.tot_downstream_create_failed),
            ),
            ("tot_assign_downstream", load(&self.tot_assign_downstream)),
            ("tot_assign_upstream", load(&self.tot_assign_upstream)),
            (
                "tot_reset_upstream_avail",
                load(&self.tot_reset_upstream_avail),
            ),
            ("tot_oom", load(&self.tot_oom)),
            ("tot_retry", load(&self.tot_retry)),
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reset_spares_gauges() {
        let stats = ProxyStats::default();
        bump(&stats.num_upstream);
        bump(&stats.tot_upstream);
        bump(&stats.tot_retry);

        stats.reset();

        assert_eq!(stats.num_upstream.load(Ordering::Relaxed), 1);
        assert_eq!(stats.tot_upstream.load(Ordering::Relaxed), 0);
        assert_eq!(stats.tot_retry.load(Ordering::Relaxed), 0);
    }
}
