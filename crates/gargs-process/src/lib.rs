//! gargs-process: the process runner behind gargs.
//!
//! This crate provides:
//!
//! - **Capture**: run one shell command and realize its full stdout, in
//!   memory for small outputs and through a compressed temp-file spill for
//!   large ones
//! - **Command**: the per-command result handle (readable output, exit code,
//!   error, duration)
//! - **Runner**: a fixed-size worker pool with unordered (completion-order)
//!   and ordered (submission-order) delivery
//! - **Pipe**: a bounded in-process byte pipe for the optional per-command
//!   stdout callback
//! - **Cleanup**: spill-file bookkeeping, fatal-signal sweep, panic hook
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        run_commands                          │
//! │  commands ──▶ ┌────────┐                                     │
//! │   (mpsc)      │ worker │──▶ capture ──▶ Command ─┐           │
//! │               │ worker │──▶ capture ──▶ Command ─┼──▶ out    │
//! │               │  ...   │                         │   (mpsc)  │
//! │               └────────┘     ordered mode: oneshot slots     │
//! │                              drained in submission order     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Child stderr is inherited from the parent and interleaves freely; child
//! stdout is fully captured before a handle becomes visible downstream.

pub mod capture;
pub mod cleanup;
pub mod command;
mod error;
pub mod options;
pub mod pipe;
pub mod runner;
pub mod shell;

pub use capture::{run, Callback, CallbackFuture};
pub use command::Command;
pub use error::ProcessError;
pub use options::{Options, DEFAULT_BUFFER_SIZE, DEFAULT_WAIT_MULTIPLIER, UNKNOWN_EXIT};
pub use runner::{run_commands, PROCESS_INDEX_ENV};
