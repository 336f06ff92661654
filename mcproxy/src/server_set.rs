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

//! The backend server set: an ordered host list parsed from the cluster
//! string, and the key → host-index hash.

use std::fmt;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 11211;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordered backend list; the order is significant, keys hash to an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSet {
    servers: Vec<Address>,
}

impl ServerSet {
    /// Parses `host[:port]` entries separated by commas. The cluster string
    /// is re-parsed for every downstream bundle created from it.
    pub fn parse(cluster: &str) -> Result<ServerSet> {
        let mut servers = Vec::new();
        for part in cluster.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (host, port) = match part.rfind(':') {
                Some(pos) => {
                    let port = part[pos + 1..].parse().map_err(|_| {
                        Error::Config(format!("invalid port in server `{}`", part))
                    })?;
                    (&part[..pos], port)
                }
                None => (part, DEFAULT_PORT),
            };
            if host.is_empty() {
                return Err(Error::Config(format!("empty host in server `{}`", part)));
            }
            servers.push(Address {
                host: host.to_string(),
                port,
            });
        }
        if servers.is_empty() {
            return Err(Error::Config(format!(
                "no servers in cluster `{}`",
                cluster
            )));
        }
        Ok(ServerSet { servers })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, index: usize) -> &Address {
        &self.servers[index]
    }

    /// Host index owning `key`.
    pub fn key_index(&self, key: &[u8]) -> usize {
        (hash_one_at_a_time(key) as usize) % self.servers.len()
    }
}

/// Jenkins one-at-a-time, the classic client-library default for key
/// distribution; the index is the hash modulo the host count.
fn hash_one_at_a_time(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in key {
        hash = hash.wrapping_add(u32::from(byte));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_cluster() {
        let set = ServerSet::parse("cache1:11222, cache2 ,cache3:11211").expect("parse failed");
        assert_eq!(set.len(), 3);
        assert_eq!(
            set.get(0),
            &Address {
                host: "cache1".to_string(),
                port: 11222,
            }
        );
        assert_eq!(set.get(1).port, DEFAULT_PORT);
        assert_eq!(set.get(2).to_string(), "cache3:11211");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ServerSet::parse("").is_err());
        assert!(ServerSet::parse(" , ").is_err());
        assert!(ServerSet::parse("cache1:notaport").is_err());
        assert!(ServerSet::parse(":11211").is_err());
    }

    #[test]
    fn test_key_index_is_stable_and_bounded() {
        let set = ServerSet::parse("a,b,c").expect("parse failed");
        for key in [&b"alpha"[..], b"beta", b"gamma", b"delta", b""].iter() {
            let index = set.key_index(key);
            assert!(index < set.len());
            assert_eq!(index, set.key_index(key));
        }
    }

    #[test]
    fn test_key_index_spreads_keys() {
        let set = ServerSet::parse("a,b,c,d").expect("parse failed");
        let mut seen = [false; 4];
        for i in 0..64u32 {
            let key = format!("key-{}", i);
            seen[set.key_index(key.as_bytes())] = true;
        }
        assert!(seen.iter().all(|&hit| hit), "some hosts never selected");
    }
}
