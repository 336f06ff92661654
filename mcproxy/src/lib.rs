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

//! Memcached-aware proxy.
//!
//! Clients speak the classic text protocol; the proxy multiplexes them over
//! a bounded per-worker pool of downstream bundles (one socket per backend
//! host), translating to the binary protocol where configured, squashing
//! compatible multi-gets and merging broadcast results on the way back.

pub mod config;
pub mod downstream;
pub mod error;
pub mod pairing;
pub mod proxy;
pub mod scheduler;
pub mod server;
pub mod server_set;
pub mod stats;
pub mod translate;
pub mod upstream;

pub use error::{Error, Result};
