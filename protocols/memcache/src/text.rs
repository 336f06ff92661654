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

//! The classic memcached text protocol: request and response models plus
//! the codecs framing them.

use arrayvec::ArrayVec;
use bytes::{BufMut, Bytes, BytesMut};

use crate::MAX_KEY_LENGTH;

pub mod codec;

pub use codec::{RequestCodec, ResponseCodec};

/// Commands carry at most this many space-separated tokens; multi-key `get`
/// lines are scanned separately and are not subject to the cap.
pub const MAX_TOKENS: usize = 9;

/// Values above this are refused outright, before reading the data block.
pub const MAX_VALUE_SIZE: usize = 8 * 1024 * 1024;

pub(crate) const BAD_FORMAT: &str = "CLIENT_ERROR bad command line format";
pub(crate) const BAD_DATA_CHUNK: &str = "CLIENT_ERROR bad data chunk";
pub(crate) const BAD_DELTA: &str = "CLIENT_ERROR invalid numeric delta argument";
pub(crate) const TOO_LARGE: &str = "SERVER_ERROR object too large for cache";

/// Storage command family; all of these carry a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StorageVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageVerb::Set => "set",
            StorageVerb::Add => "add",
            StorageVerb::Replace => "replace",
            StorageVerb::Append => "append",
            StorageVerb::Prepend => "prepend",
            StorageVerb::Cas => "cas",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithVerb {
    Incr,
    Decr,
}

impl ArithVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            ArithVerb::Incr => "incr",
            ArithVerb::Decr => "decr",
        }
    }
}

/// One parsed client command.
///
/// Recoverable garbage is represented in-band (`Invalid`, `Unknown`) so a
/// parse problem answers an error line without tearing the connection down.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Storage {
        verb: StorageVerb,
        key: Bytes,
        flags: u32,
        exptime: u32,
        bytes: usize,
        cas: Option<u64>,
        noreply: bool,
        data: Bytes,
    },
    Get {
        gets: bool,
        keys: Vec<Bytes>,
    },
    Delete {
        key: Bytes,
        noreply: bool,
    },
    Arith {
        verb: ArithVerb,
        key: Bytes,
        delta: u64,
        noreply: bool,
    },
    FlushAll {
        exptime: Option<u32>,
        noreply: bool,
    },
    Stats {
        args: Option<Bytes>,
    },
    Version,
    Quit,
    /// Parse problem; the payload is the full error line to answer with.
    Invalid(&'static str),
    /// A verb this proxy does not handle.
    Unknown,
}

impl Request {
    pub fn noreply(&self) -> bool {
        match self {
            Request::Storage { noreply, .. }
            | Request::Delete { noreply, .. }
            | Request::Arith { noreply, .. }
            | Request::FlushAll { noreply, .. } => *noreply,
            _ => false,
        }
    }

    /// The key a single-destination command is routed by.
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Request::Storage { key, .. }
            | Request::Delete { key, .. }
            | Request::Arith { key, .. } => Some(key),
            _ => None,
        }
    }

    pub fn is_get(&self) -> bool {
        matches!(self, Request::Get { .. })
    }
}

/// One parsed server reply (used when the downstream hop speaks the text
/// protocol as well).
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Value {
        key: Bytes,
        flags: u32,
        cas: Option<u64>,
        data: Bytes,
    },
    Stat {
        name: Bytes,
        value: Bytes,
    },
    End,
    /// Any other single-line reply, verbatim without the CRLF:
    /// `STORED`, `DELETED`, numeric counters, error lines…
    Line(Bytes),
}

/// Bounded tokenizer over a single command line; splits on spaces, skips
/// runs of them, stops silently at [`MAX_TOKENS`].
pub fn scan_tokens(line: &[u8]) -> ArrayVec<&[u8], MAX_TOKENS> {
    let mut tokens = ArrayVec::new();
    for tok in line.split(|&b| b == b' ') {
        if tok.is_empty() {
            continue;
        }
        if tokens.try_push(tok).is_err() {
            break;
        }
    }
    tokens
}

pub(crate) fn parse_num<T: std::str::FromStr>(token: &[u8]) -> Option<T> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

pub(crate) fn key_ok(key: &[u8]) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LENGTH
}

/// Renders `VALUE <key> <flags> <bytes>[ <cas>]\r\n`.
pub fn render_value_header(
    dst: &mut BytesMut,
    key: &[u8],
    flags: u32,
    len: usize,
    cas: Option<u64>,
) {
    dst.reserve(key.len() + 40);
    dst.extend_from_slice(b"VALUE ");
    dst.extend_from_slice(key);
    dst.extend_from_slice(format!(" {} {}", flags, len).as_bytes());
    if let Some(cas) = cas {
        dst.extend_from_slice(format!(" {}", cas).as_bytes());
    }
    dst.extend_from_slice(b"\r\n");
}

/// Renders `STAT <name> <value>\r\n`.
pub fn render_stat_line(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    dst.reserve(name.len() + value.len() + 8);
    dst.extend_from_slice(b"STAT ");
    dst.extend_from_slice(name);
    dst.put_u8(b' ');
    dst.extend_from_slice(value);
    dst.extend_from_slice(b"\r\n");
}
