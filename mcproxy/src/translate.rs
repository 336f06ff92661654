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

//! Command translation onto the downstream hop: ascii-to-binary (a2b) and
//! ascii-to-ascii (a2a) propagation, plus the broadcast stats merger.

use std::future::Future;
use std::time::Duration;

use tokio::time::error::Elapsed;

pub mod a2a;
pub mod a2b;
pub mod merge;

#[cfg(test)]
mod test;

pub(crate) const SUFFIX_END: &[u8] = b"END\r\n";
pub(crate) const SUFFIX_OK: &[u8] = b"OK\r\n";
pub(crate) const SUFFIX_RESET: &[u8] = b"RESET\r\n";
pub(crate) const ERR_PARSE: &[u8] = b"CLIENT_ERROR a2b parse request\r\n";

/// Outcome of one forwarding attempt over a reserved downstream bundle.
#[derive(Debug)]
pub enum ForwardResult {
    /// Responses handled and terminated; the bundle is clean.
    Complete,
    /// No downstream socket could be written at all.
    NoWrite,
    /// The command cannot be expressed on the downstream hop; the payload
    /// is the error line for the upstream(s).
    BadRequest(&'static [u8]),
    /// Socket(s) died or the downstream timeout fired mid-request.
    Broken {
        /// Whether any reply frame arrived before the failure; a request
        /// that saw none may be retried transparently.
        any_reply: bool,
        /// Whether exactly one socket was written.
        single_conn: bool,
        /// Terminator already owed to the upstream(s) (`END`, `OK`, …);
        /// `None` means the generic downstream-closed error applies.
        suffix: Option<&'static [u8]>,
    },
}

/// Runs `fut` under the per-request downstream timeout; a zero timeout
/// (`None`) disables the clock entirely.
pub(crate) async fn maybe_timeout<F>(timeout: Option<Duration>, fut: F) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut).await,
        None => Ok(fut.await),
    }
}
