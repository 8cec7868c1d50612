//! The per-command result handle.
//!
//! A [`Command`] becomes visible downstream only after its child has
//! terminated and its stdout is fully realized: in memory when it fit the
//! capture buffer, or behind a decompressing reader over the spill file
//! otherwise. The handle owns the spill file; [`Command::cleanup`] (or
//! dropping the handle) removes it.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::Path;
use std::time::Duration;

use flate2::read::GzDecoder;
use tempfile::NamedTempFile;

use crate::error::ProcessError;

/// Bytes of output shown by the `Display` rendering.
const SAMPLE_LEN: usize = 20;
/// Command strings longer than this are truncated in the rendering.
const RENDER_CMD_MAX: usize = 100;
/// Truncated command strings keep this many leading characters.
const RENDER_CMD_KEEP: usize = 80;

/// Realized stdout of a finished command.
pub(crate) enum OutputReader {
    /// Output fit the capture buffer.
    Memory(Cursor<Vec<u8>>),
    /// Output spilled to a compressed temp file.
    Spilled(BufReader<GzDecoder<BufReader<File>>>),
}

impl Read for OutputReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            OutputReader::Memory(r) => r.read(buf),
            OutputReader::Spilled(r) => r.read(buf),
        }
    }
}

impl BufRead for OutputReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self {
            OutputReader::Memory(r) => r.fill_buf(),
            OutputReader::Spilled(r) => r.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            OutputReader::Memory(r) => r.consume(amt),
            OutputReader::Spilled(r) => r.consume(amt),
        }
    }
}

/// Handle to one executed command.
///
/// Reading the handle ([`Read`]/[`BufRead`]) yields exactly the bytes the
/// child wrote to stdout. [`Command::exit_code`] is zero iff
/// [`Command::error`] is `None`.
pub struct Command {
    cmd_str: String,
    reader: Option<OutputReader>,
    /// First bytes of the output, kept aside so rendering never consumes
    /// from the reader.
    sample: Vec<u8>,
    err: Option<ProcessError>,
    duration: Duration,
    tmp: Option<NamedTempFile>,
}

impl Command {
    /// A handle for a command that never produced readable output
    /// (spawn failure, peek failure).
    pub(crate) fn from_error(cmd_str: &str, err: ProcessError) -> Self {
        Self {
            cmd_str: cmd_str.to_string(),
            reader: None,
            sample: Vec::new(),
            err: Some(err),
            duration: Duration::ZERO,
            tmp: None,
        }
    }

    /// A handle whose full output fit the capture buffer.
    pub(crate) fn buffered(cmd_str: &str, bytes: Vec<u8>, err: Option<ProcessError>) -> Self {
        let sample = bytes[..bytes.len().min(SAMPLE_LEN)].to_vec();
        Self {
            cmd_str: cmd_str.to_string(),
            reader: Some(OutputReader::Memory(Cursor::new(bytes))),
            sample,
            err,
            duration: Duration::ZERO,
            tmp: None,
        }
    }

    /// A handle whose output spilled to `tmp`. `head` is the peeked prefix,
    /// used for the rendering sample and as a fallback if the spill file
    /// cannot be reopened.
    pub(crate) fn spilled(
        cmd_str: &str,
        head: Vec<u8>,
        tmp: NamedTempFile,
        err: Option<ProcessError>,
    ) -> Self {
        match tmp.reopen() {
            Ok(file) => {
                let decoder = GzDecoder::new(BufReader::new(file));
                let sample = head[..head.len().min(SAMPLE_LEN)].to_vec();
                Self {
                    cmd_str: cmd_str.to_string(),
                    reader: Some(OutputReader::Spilled(BufReader::new(decoder))),
                    sample,
                    err,
                    duration: Duration::ZERO,
                    tmp: Some(tmp),
                }
            }
            Err(reopen_err) => {
                // Keep at least the in-memory prefix readable.
                let mut cmd = Command::buffered(cmd_str, head, err);
                if cmd.err.is_none() {
                    cmd.err = Some(ProcessError::Capture(reopen_err));
                }
                cmd.tmp = Some(tmp);
                cmd
            }
        }
    }

    /// The command string this handle was produced from.
    pub fn command(&self) -> &str {
        &self.cmd_str
    }

    /// The terminating error, if any.
    pub fn error(&self) -> Option<&ProcessError> {
        self.err.as_ref()
    }

    /// Exit code: zero when no error, the child's code for a non-zero exit,
    /// the unknown sentinel otherwise.
    pub fn exit_code(&self) -> i32 {
        match &self.err {
            None => 0,
            Some(e) => e.exit_code(),
        }
    }

    /// Wall-clock duration across all attempts.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub(crate) fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    /// Path of the spill file, if the output overflowed the capture buffer.
    pub fn spill_path(&self) -> Option<&Path> {
        self.tmp.as_ref().map(|t| t.path())
    }

    /// Remove the spill file now. Idempotent; dropping the handle does the
    /// same if this is never called.
    pub fn cleanup(&mut self) {
        if let Some(tmp) = self.tmp.take() {
            let path = tmp.path().to_path_buf();
            if let Err(e) = tmp.close() {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove spill file");
            }
        }
    }
}

impl Read for Command {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.reader {
            Some(r) => r.read(buf),
            None => Ok(0),
        }
    }
}

impl BufRead for Command {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match &mut self.reader {
            Some(r) => r.fill_buf(),
            None => Ok(&[]),
        }
    }

    fn consume(&mut self, amt: usize) {
        if let Some(r) = &mut self.reader {
            r.consume(amt);
        }
    }
}

impl fmt::Display for Command {
    /// Diagnostic one-liner: truncated command, output sample with escaped
    /// newlines, exit code when non-zero, error when present, run time.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command('")?;
        if self.cmd_str.chars().count() > RENDER_CMD_MAX {
            let kept: String = self.cmd_str.chars().take(RENDER_CMD_KEEP).collect();
            write!(f, "{kept}...")?;
        } else {
            write!(f, "{}", self.cmd_str)?;
        }
        write!(f, "'")?;

        if self.reader.is_some() {
            let shown = String::from_utf8_lossy(&self.sample).replace('\n', "\\n");
            write!(f, ", stdout[:{SAMPLE_LEN}]: '{shown}'")?;
        } else {
            write!(f, ", [no stdout]")?;
        }

        let code = self.exit_code();
        if code != 0 {
            write!(f, ", exit-code: {code}")?;
        }
        if let Some(err) = &self.err {
            write!(f, ", error: {err}")?;
        }
        write!(f, ", run-time: {:?})", self.duration)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("command", &self.cmd_str)
            .field("exit_code", &self.exit_code())
            .field("spilled", &self.tmp.is_some())
            .field("duration", &self.duration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_round_trip() {
        let mut cmd = Command::buffered("echo hi", b"hi\n".to_vec(), None);
        let mut out = String::new();
        cmd.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hi\n");
        assert_eq!(cmd.exit_code(), 0);
        assert!(cmd.spill_path().is_none());
    }

    #[test]
    fn test_empty_output_is_valid() {
        let mut cmd = Command::buffered("true", Vec::new(), None);
        let mut out = Vec::new();
        cmd.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(cmd.exit_code(), 0);
    }

    #[test]
    fn test_display_escapes_newlines() {
        let cmd = Command::buffered("seq 3", b"1\n2\n3\n".to_vec(), None);
        let rendered = format!("{cmd}");
        assert!(rendered.contains("1\\n2\\n3\\n"), "{rendered}");
        assert!(!rendered.contains("exit-code"), "{rendered}");
    }

    #[test]
    fn test_display_truncates_long_commands() {
        let long = "x".repeat(150);
        let cmd = Command::buffered(&long, Vec::new(), None);
        let rendered = format!("{cmd}");
        assert!(rendered.contains(&format!("{}...", "x".repeat(80))));
        assert!(!rendered.contains(&"x".repeat(81)));
    }

    #[test]
    fn test_display_reports_errors() {
        let cmd = Command::from_error(
            "bad",
            ProcessError::Exit { code: 61 },
        );
        let rendered = format!("{cmd}");
        assert!(rendered.contains("[no stdout]"), "{rendered}");
        assert!(rendered.contains("exit-code: 61"), "{rendered}");
        assert!(rendered.contains("error: exit status 61"), "{rendered}");
    }

    #[test]
    fn test_display_does_not_consume_output() {
        let mut cmd = Command::buffered("echo hi", b"hi\n".to_vec(), None);
        let _ = format!("{cmd}");
        let _ = format!("{cmd}");
        let mut out = String::new();
        cmd.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hi\n");
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let mut cmd = Command::buffered("true", Vec::new(), None);
        cmd.cleanup();
        cmd.cleanup();
    }
}
