//! Runner options and their environment-derived defaults.
//!
//! `GARGS_PROCESS_BUFFER` and `GARGS_WAIT_MULTIPLIER` are read once, on
//! first use, and feed the defaults of [`Options`]. Tests (and embedders)
//! can set the fields directly instead of mutating process globals.

use std::fmt;
use std::sync::OnceLock;

use crate::capture::Callback;

/// Exit code reported when the real exit status of a command is unknown:
/// spawn failure, capture I/O failure, or death by signal.
pub const UNKNOWN_EXIT: i32 = 1;

/// Default capture buffer size B. Output up to this many bytes stays in
/// memory; anything larger spills to a compressed temp file.
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 20;

/// Default waiting multiplier M for the ordered runner: up to M·W finished
/// handles may queue behind a slow predecessor before the pipeline blocks.
pub const DEFAULT_WAIT_MULTIPLIER: usize = 4;

/// Capture buffer size, honoring `GARGS_PROCESS_BUFFER`.
pub fn buffer_size_from_env() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| parse_env("GARGS_PROCESS_BUFFER", DEFAULT_BUFFER_SIZE, 1))
}

/// Ordered-mode waiting multiplier, honoring `GARGS_WAIT_MULTIPLIER`.
pub fn wait_multiplier_from_env() -> usize {
    static MULT: OnceLock<usize> = OnceLock::new();
    *MULT.get_or_init(|| parse_env("GARGS_WAIT_MULTIPLIER", DEFAULT_WAIT_MULTIPLIER, 1))
}

fn parse_env(name: &str, default: usize, floor: usize) -> usize {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n >= floor => n,
            _ => {
                tracing::warn!(name, value = %raw, "ignoring invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Options accepted by [`run`](crate::run) and
/// [`run_commands`](crate::run_commands).
#[derive(Clone)]
pub struct Options {
    /// Extra attempts when a command exits non-zero. Zero means exactly one
    /// attempt.
    pub retries: u32,
    /// Emit handles in submission order instead of completion order.
    pub ordered: bool,
    /// Worker pool size W. Defaults to the available parallelism.
    pub workers: usize,
    /// Capture buffer size B.
    pub buffer_size: usize,
    /// Ordered-mode waiting multiplier M (≥ 1).
    pub wait_multiplier: usize,
    /// Optional per-command stdout transformer; see [`Callback`].
    pub callback: Option<Callback>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            retries: 0,
            ordered: false,
            workers: default_workers(),
            buffer_size: buffer_size_from_env(),
            wait_multiplier: wait_multiplier_from_env(),
            callback: None,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("retries", &self.retries)
            .field("ordered", &self.ordered)
            .field("workers", &self.workers)
            .field("buffer_size", &self.buffer_size)
            .field("wait_multiplier", &self.wait_multiplier)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
