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

//! Proxy configuration: the TOML file model and the behavior block that is
//! snapshotted into every downstream bundle.

use std::time::Duration;

use serde::Deserialize;

/// Which protocol the downstream hop speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownstreamProtocol {
    Ascii,
    Binary,
}

impl Default for DownstreamProtocol {
    fn default() -> Self {
        DownstreamProtocol::Binary
    }
}

/// Seconds + microseconds pair; all zeros disables the timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeval {
    pub sec: u64,
    pub usec: u32,
}

impl Timeval {
    pub fn new(sec: u64, usec: u32) -> Timeval {
        Timeval { sec, usec }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    /// `None` when the timeout is disabled.
    pub fn to_duration(&self) -> Option<Duration> {
        if self.is_zero() {
            None
        } else {
            Some(Duration::new(self.sec, self.usec.saturating_mul(1000)))
        }
    }
}

/// Tunables snapshotted from the proxy into each downstream bundle at
/// creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Behavior {
    /// Worker count.
    pub nthreads: usize,
    /// Downstream bundle cap per worker.
    pub downstream_max: usize,
    pub downstream_prot: DownstreamProtocol,
    /// How long an upstream may sit on the wait queue.
    pub wait_queue_timeout: Timeval,
    /// How long a dispatched downstream request may take.
    pub downstream_timeout: Timeval,
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior {
            nthreads: 4,
            downstream_max: 4,
            downstream_prot: DownstreamProtocol::default(),
            wait_queue_timeout: Timeval::default(),
            downstream_timeout: Timeval::default(),
        }
    }
}

/// The configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_name")]
    pub name: String,
    /// Listen address, `host:port`.
    pub listen: String,
    /// Downstream cluster: `host[:port]` separated by commas.
    pub cluster: String,
    #[serde(default)]
    pub behavior: Behavior,
}

fn default_name() -> String {
    "default".to_string()
}
