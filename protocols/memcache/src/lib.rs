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

//! Memcached wire protocol support: the classic text protocol spoken by
//! clients and the binary protocol spoken by servers, with
//! `tokio_util::codec` framing for both.

pub mod binary;
pub mod error;
pub mod text;

pub use error::{Error, Result};

/// Longest key either protocol variant accepts.
pub const MAX_KEY_LENGTH: usize = 250;
