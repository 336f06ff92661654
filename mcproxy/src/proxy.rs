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

//! Process-wide proxy state: identity plus the live cluster configuration.
//!
//! The configuration is an opaque cluster string with a monotonically
//! increasing version. Workers snapshot it under the lock when creating
//! downstream bundles and validate bundles against it on every reserve and
//! release.

use std::sync::Mutex;

use crate::config::Behavior;

#[derive(Debug, Clone)]
struct Shared {
    /// `None` once the proxy is shutting down; bundle creation then
    /// silently refuses.
    cluster: Option<String>,
    config_ver: u32,
    behavior: Behavior,
}

/// Everything downstream creation needs, copied out under the lock.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub cluster: String,
    pub config_ver: u32,
    pub behavior: Behavior,
}

/// Verdict on a downstream bundle's recorded configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Current,
    /// The version moved but the cluster string is byte-identical; the
    /// bundle keeps its sockets and adopts the new version in place.
    Upgraded {
        config_ver: u32,
        behavior: Behavior,
    },
    Stale,
}

#[derive(Debug)]
pub struct Proxy {
    name: String,
    listen: String,
    shared: Mutex<Shared>,
}

impl Proxy {
    pub fn new(
        name: String,
        listen: String,
        cluster: String,
        config_ver: u32,
        behavior: Behavior,
    ) -> Proxy {
        Proxy {
            name,
            listen,
            shared: Mutex::new(Shared {
                cluster: Some(cluster),
                config_ver,
                behavior,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listen(&self) -> &str {
        &self.listen
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("BUG: proxy lock poisoned")
    }

    pub fn config_ver(&self) -> u32 {
        self.lock().config_ver
    }

    pub fn behavior(&self) -> Behavior {
        self.lock().behavior
    }

    /// `None` once the proxy is shutting down.
    pub fn snapshot(&self) -> Option<ConfigSnapshot> {
        let shared = self.lock();
        shared.cluster.as_ref().map(|cluster| ConfigSnapshot {
            cluster: cluster.clone(),
            config_ver: shared.config_ver,
            behavior: shared.behavior,
        })
    }

    /// Atomically replaces the configuration, bumping the version.
    /// Returns the new version.
    pub fn update_config(&self, cluster: String, behavior: Behavior) -> u32 {
        let mut shared = self.lock();
        shared.cluster = Some(cluster);
        shared.behavior = behavior;
        shared.config_ver += 1;
        shared.config_ver
    }

    /// Marks the proxy as shutting down: no new downstream bundles will be
    /// created, existing ones are freed as they release.
    pub fn shutdown_config(&self) {
        self.lock().cluster = None;
    }

    /// The validity rule applied at both reserve and release time: a bundle
    /// created at version V is still valid at V' iff the versions match, or
    /// the cluster strings compare equal byte-for-byte (then V upgrades in
    /// place to V').
    pub fn check_downstream(&self, cluster: &str, config_ver: u32) -> Validity {
        let shared = self.lock();
        if shared.config_ver == config_ver {
            return Validity::Current;
        }
        match &shared.cluster {
            Some(current) if current == cluster => Validity::Upgraded {
                config_ver: shared.config_ver,
                behavior: shared.behavior,
            },
            _ => Validity::Stale,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn proxy() -> Proxy {
        Proxy::new(
            "test".to_string(),
            "127.0.0.1:0".to_string(),
            "a:1,b:2".to_string(),
            3,
            Behavior::default(),
        )
    }

    #[test]
    fn test_matching_version_is_current() {
        assert_eq!(proxy().check_downstream("whatever", 3), Validity::Current);
    }

    #[test]
    fn test_same_string_upgrades_in_place() {
        let p = proxy();
        let ver = p.update_config("a:1,b:2".to_string(), Behavior::default());
        assert_eq!(ver, 4);
        match p.check_downstream("a:1,b:2", 3) {
            Validity::Upgraded { config_ver, .. } => assert_eq!(config_ver, 4),
            other => panic!("unexpected validity: {:?}", other),
        }
    }

    #[test]
    fn test_changed_string_is_stale() {
        let p = proxy();
        p.update_config("c:3".to_string(), Behavior::default());
        assert_eq!(p.check_downstream("a:1,b:2", 3), Validity::Stale);
    }

    #[test]
    fn test_shutdown_refuses_snapshots() {
        let p = proxy();
        assert!(p.snapshot().is_some());
        p.shutdown_config();
        assert!(p.snapshot().is_none());
        // Version mismatch with no cluster at all is stale, not upgraded.
        assert_eq!(p.check_downstream("a:1,b:2", 0), Validity::Stale);
    }
}
