//! Error taxonomy for a single command execution.

use std::io;

use crate::options::UNKNOWN_EXIT;

/// Terminating error attached to a [`Command`](crate::Command) handle.
///
/// The runner never aborts on a child's failure; it records the error here
/// and leaves the decision to the downstream consumer.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The child could not be started.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: io::Error,
    },

    /// The child ran to completion and exited non-zero.
    #[error("exit status {code}")]
    Exit { code: i32 },

    /// The child was killed by a signal before reporting an exit code.
    #[error("terminated by signal {signal}")]
    Signaled { signal: i32 },

    /// The capture pipeline failed: pipe read, spill write, or reopening the
    /// spill file for decompression.
    #[error("output capture failed: {0}")]
    Capture(#[source] io::Error),

    /// The per-command callback reported an error.
    #[error("callback failed: {0}")]
    Callback(#[source] io::Error),
}

impl ProcessError {
    /// The exit code this error maps to: the child's own code for
    /// [`ProcessError::Exit`], the unknown sentinel for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProcessError::Exit { code } => *code,
            _ => UNKNOWN_EXIT,
        }
    }
}
