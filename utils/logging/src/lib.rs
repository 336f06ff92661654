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

//! The workspace's root logger.
//!
//! One process-wide `slog` logger behind an asynchronous drain, filtered
//! through `RUST_LOG` (via `slog-envlogger`), exposed only through the
//! `trace!`..`crit!` macros below.
//!
//! The logger is built lazily on first use from whatever [`Options`] were
//! installed by then, so `init()`/`setup_for_app()` must run before the
//! first log record. When nothing was installed the test preset applies;
//! the Rust test harness has no setup hook, so the untouched default has
//! to be the one that keeps test output off the terminal.

use std::env;
use std::fs::OpenOptions;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use lazy_static::lazy_static;
use slog::{o, Drain, Logger};
use slog_async::{Async, AsyncGuard};

// Re-exported for the macros and for dependers that want raw slog access.
pub use slog;
pub use slog::Level;

/// Where the root logger writes.
#[derive(Clone, Debug)]
pub enum Sink {
    Stderr,
    File(PathBuf),
}

/// Root logger options, consumed when the logger is first touched.
#[derive(Clone, Debug)]
pub struct Options {
    pub sink: Sink,
    /// Baseline level; `RUST_LOG` overrides it when set and non-empty.
    pub level: Level,
    /// Async drain queue length; bursts beyond it drop records.
    pub async_queue: usize,
}

impl Options {
    /// Preset for binaries: stderr, `Debug` in debug builds, `Info`
    /// otherwise.
    pub fn app(async_queue: usize) -> Options {
        Options {
            sink: Sink::Stderr,
            level: if cfg!(debug_assertions) {
                Level::Debug
            } else {
                Level::Info
            },
            async_queue,
        }
    }

    /// Preset for test runs: everything, into a file under the system tmp
    /// directory, away from the test harness output.
    pub fn test() -> Options {
        Options {
            sink: Sink::File(env::temp_dir().join("mcproxy-test.log")),
            level: Level::Trace,
            async_queue: 128,
        }
    }
}

impl Default for Options {
    fn default() -> Options {
        Options::test()
    }
}

/// Flushes and stops the async drain when dropped; hold it for the
/// program's lifetime, typically in `main()`.
#[must_use = "dropping LogGuard flushes and stops the logger"]
pub struct LogGuard(Option<AsyncGuard>);

static BUILT: AtomicBool = AtomicBool::new(false);

/// Installs `options` and forces the root logger into existence.
///
/// # Panics
///
/// Panics when the logger was already built; the configuration is fixed
/// from that point on.
pub fn init(options: Options) -> LogGuard {
    {
        let mut pending = PENDING.lock().expect("BUG: logger options lock poisoned");
        assert!(
            !BUILT.load(Ordering::SeqCst),
            "BUG: logger already built, too late to configure it"
        );
        *pending = Some(options);
    }
    LOGGER.take_guard()
}

/// [`init`] with the application preset. Convenience for `main()`.
pub fn setup_for_app(async_queue: usize) -> LogGuard {
    init(Options::app(async_queue))
}

/// Test-friendly setup: installs the test preset exactly once per process
/// and never panics, no matter how many tests race through it.
pub fn init_test_logging() -> Option<LogGuard> {
    static INSTALLED: AtomicBool = AtomicBool::new(false);

    if INSTALLED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return None;
    }
    if BUILT.load(Ordering::SeqCst) {
        // Something logged before any test called in here; the untouched
        // default is the test preset anyway.
        return None;
    }
    Some(init(Options::test()))
}

/// Formatted sink for one options set, wrapped in env filtering and the
/// async drain. Returns the drain together with its flush guard.
fn build_drain(options: &Options) -> (Async, AsyncGuard) {
    match &options.sink {
        Sink::Stderr => {
            let decorator = slog_term::TermDecorator::new().stderr().build();
            finish_drain(slog_term::FullFormat::new(decorator).build(), options)
        }
        Sink::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| {
                    panic!("cannot open log file `{}`: {}", path.display(), e)
                });
            let decorator = slog_term::PlainDecorator::new(file);
            finish_drain(slog_term::FullFormat::new(decorator).build(), options)
        }
    }
}

fn finish_drain<D>(format: D, options: &Options) -> (Async, AsyncGuard)
where
    D: Drain<Ok = (), Err = std::io::Error> + Send + 'static,
{
    let filters = env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| options.level.as_short_str().to_string());
    let filtered = slog_envlogger::LogBuilder::new(format.fuse())
        .parse(&filters)
        .build();
    Async::new(filtered.fuse())
        .chan_size(options.async_queue)
        .build_with_guard()
}

/// The built root logger plus the one flush guard it hands out.
pub struct RootLogger {
    logger: Logger,
    guard: Mutex<Option<AsyncGuard>>,
}

impl RootLogger {
    fn build(options: Options) -> RootLogger {
        let (drain, guard) = build_drain(&options);
        RootLogger {
            logger: Logger::root(drain.fuse(), o!()),
            guard: Mutex::new(Some(guard)),
        }
    }

    /// The flush guard, once; later calls get an empty guard.
    pub fn take_guard(&self) -> LogGuard {
        LogGuard(
            self.guard
                .lock()
                .expect("BUG: logger guard lock poisoned")
                .take(),
        )
    }
}

impl Deref for RootLogger {
    type Target = Logger;

    fn deref(&self) -> &Logger {
        &self.logger
    }
}

lazy_static! {
    static ref PENDING: Mutex<Option<Options>> = Mutex::new(None);

    /// The process-wide logger everything in the workspace logs through.
    pub static ref LOGGER: RootLogger = {
        let options = {
            let mut pending = PENDING.lock().expect("BUG: logger options lock poisoned");
            BUILT.store(true, Ordering::SeqCst);
            pending.take().unwrap_or_default()
        };
        RootLogger::build(options)
    };
}

/// Common expansion of the level macros below.
#[macro_export]
macro_rules! proxy_log(
    ($lvl:expr, $($args:tt)*) => {
        $crate::slog::slog_log!($crate::LOGGER, $lvl, "", $($args)*)
    };
);

#[macro_export]
macro_rules! crit(
    ($($args:tt)*) => { $crate::proxy_log!($crate::Level::Critical, $($args)*) };
);

#[macro_export]
macro_rules! error(
    ($($args:tt)*) => { $crate::proxy_log!($crate::Level::Error, $($args)*) };
);

#[macro_export]
macro_rules! warn(
    ($($args:tt)*) => { $crate::proxy_log!($crate::Level::Warning, $($args)*) };
);

#[macro_export]
macro_rules! info(
    ($($args:tt)*) => { $crate::proxy_log!($crate::Level::Info, $($args)*) };
);

#[macro_export]
macro_rules! debug(
    ($($args:tt)*) => { $crate::proxy_log!($crate::Level::Debug, $($args)*) };
);

#[macro_export]
macro_rules! trace(
    ($($args:tt)*) => { $crate::proxy_log!($crate::Level::Trace, $($args)*) };
);

/// Glob-import target for callers: `use mcproxy_logging::macros::*;`.
pub mod macros {
    pub use super::{crit, debug, error, info, trace, warn};
}
