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

//! Broadcast stats aggregation: per-host `STAT` replies folded into one
//! set before anything reaches the upstream.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use memcache_proto::text::render_stat_line;

#[derive(Debug)]
enum MergedValue {
    /// Numeric stats are summed across hosts.
    Sum(u64),
    /// Non-numeric stats keep the first host's answer.
    Raw(Bytes),
}

/// Keyed by stat name; iteration order (and thus output order) is stable.
#[derive(Debug, Default)]
pub struct StatsMerger {
    entries: BTreeMap<Bytes, MergedValue>,
}

impl StatsMerger {
    pub fn new() -> StatsMerger {
        StatsMerger::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fold(&mut self, name: Bytes, value: Bytes) {
        use std::collections::btree_map::Entry;

        let parsed = parse_u64(&value);
        match self.entries.entry(name) {
            Entry::Vacant(slot) => {
                slot.insert(match parsed {
                    Some(number) => MergedValue::Sum(number),
                    None => MergedValue::Raw(value),
                });
            }
            Entry::Occupied(mut slot) => {
                if let (MergedValue::Sum(total), Some(number)) = (slot.get_mut(), parsed) {
                    *total += number;
                }
            }
        }
    }

    /// Renders the aggregated `STAT` lines (no terminator).
    pub fn render(&self, dst: &mut BytesMut) {
        for (name, value) in &self.entries {
            match value {
                MergedValue::Sum(total) => {
                    dst.reserve(name.len() + 32);
                    dst.extend_from_slice(b"STAT ");
                    dst.extend_from_slice(name);
                    dst.put_u8(b' ');
                    dst.extend_from_slice(total.to_string().as_bytes());
                    dst.extend_from_slice(b"\r\n");
                }
                MergedValue::Raw(raw) => render_stat_line(dst, name, raw),
            }
        }
    }
}

fn parse_u64(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}
