//! Single-attempt command capture and the retry wrapper.
//!
//! Capture reads ("peeks") up to B bytes of the child's stdout. Small
//! outputs stay in memory; anything larger streams through a best-speed
//! gzip compressor into a registered temp file, so a huge `seq` does not
//! balloon the parent and a slow downstream consumer does not block the
//! child. Large textual command output compresses well, which roughly
//! halves the disk traffic on the spill path.

use std::future::Future;
use std::io::{self, BufWriter, Write};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout};
use tokio::sync::oneshot;

use crate::cleanup;
use crate::command::Command;
use crate::error::ProcessError;
use crate::options::Options;
use crate::pipe::{self, PipeWriter};
use crate::shell;

/// Future returned by a [`Callback`].
pub type CallbackFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// Optional per-command stdout transformer.
///
/// The callback receives the child's raw stdout and the writing end of an
/// in-process pipe; capture reads the derived stream from the other end.
/// The callback owns the writer and closes it by dropping it (or via
/// `shutdown`). Its error is folded into the handle's error without masking
/// an earlier spawn or exit error. It never touches the parent's stdout.
pub type Callback = Arc<dyn Fn(ChildStdout, PipeWriter) -> CallbackFuture + Send + Sync>;

/// Chunk size for the spill copy loop.
const SPILL_CHUNK: usize = 64 * 1024;

/// Run `command` under the configured shell, re-running while the exit code
/// is non-zero and attempts remain. Spawn and capture failures count as
/// non-zero exits for retry purposes. The returned handle carries the total
/// elapsed time across attempts.
///
/// `env` entries are appended to the inherited child environment, identically
/// on every attempt.
pub async fn run(command: &str, opts: &Options, env: &[(String, String)]) -> Command {
    let start = Instant::now();
    let mut cmd = run_once(command, opts, env).await;
    let mut retries = opts.retries;
    while retries > 0 && cmd.exit_code() != 0 {
        retries -= 1;
        cmd = run_once(command, opts, env).await;
    }
    cmd.set_duration(start.elapsed());
    cmd
}

/// One attempt: spawn, capture stdout, wait.
async fn run_once(command: &str, opts: &Options, env: &[(String, String)]) -> Command {
    let mut child = match spawn_child(command, env) {
        Ok(child) => child,
        Err(err) => return Command::from_error(command, err),
    };
    let Some(stdout) = child.stdout.take() else {
        // Unreachable with a piped stdout, but not worth a panic.
        let err = ProcessError::Capture(io::Error::other("child stdout was not piped"));
        return Command::from_error(command, err);
    };

    // Interpose the callback, if any: its derived stream becomes the
    // logical source for the rest of the pipeline.
    let (mut source, callback_rx): (Source, Option<CallbackRx>) = match &opts.callback {
        Some(callback) => {
            let (writer, reader) = pipe::pipe(pipe::PIPE_CAPACITY);
            let (tx, rx) = oneshot::channel();
            let fut = callback(stdout, writer);
            tokio::spawn(async move {
                let _ = tx.send(fut.await);
            });
            (Box::new(reader), Some(rx))
        }
        None => (Box::new(stdout), None),
    };

    // Peek up to B bytes without committing to a storage strategy.
    let mut head = Vec::new();
    let at_eof = match read_head(&mut source, &mut head, opts.buffer_size).await {
        Ok(at_eof) => at_eof,
        Err(e) => {
            // Keep whatever arrived before the failure. The child is
            // dropped without waiting: it may be blocked writing to a pipe
            // nobody drains anymore, and the runtime reaps it.
            return Command::buffered(command, head, Some(ProcessError::Capture(e)));
        }
    };

    if at_eof {
        // The whole output fit in the buffer.
        let mut err = wait_child(&mut child).await;
        fold_callback(&mut err, callback_rx).await;
        return Command::buffered(command, head, err);
    }

    // More output pending: spill everything through the compressor.
    match write_spill(&head, &mut source).await {
        Ok(tmp) => {
            drop(source);
            let mut err = wait_child(&mut child).await;
            fold_callback(&mut err, callback_rx).await;
            Command::spilled(command, head, tmp, err)
        }
        Err(e) => {
            tracing::warn!(command, error = %e, "spill failed, keeping buffered prefix");
            Command::buffered(command, head, Some(ProcessError::Capture(e)))
        }
    }
}

type Source = Box<dyn AsyncRead + Send + Unpin>;
type CallbackRx = oneshot::Receiver<io::Result<()>>;

fn spawn_child(command: &str, env: &[(String, String)]) -> Result<Child, ProcessError> {
    let mut cmd = tokio::process::Command::new(shell::shell());
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.spawn().map_err(|source| ProcessError::Spawn {
        command: command.to_string(),
        source,
    })
}

/// Fill `head` with up to `limit` bytes from `source`. Returns true when
/// the source reached end-of-stream at or before the limit, so output of
/// exactly `limit` bytes still counts as fitting the buffer.
async fn read_head(source: &mut Source, head: &mut Vec<u8>, limit: usize) -> io::Result<bool> {
    head.resize(limit, 0);
    let mut filled = 0;
    while filled < limit {
        match source.read(&mut head[filled..]).await {
            Ok(0) => {
                head.truncate(filled);
                return Ok(true);
            }
            Ok(n) => filled += n,
            Err(e) => {
                head.truncate(filled);
                return Err(e);
            }
        }
    }
    // Buffer full. One probe read tells exact-fit apart from overflow; a
    // probed byte belongs to the output and rides along in `head`.
    let mut probe = [0u8; 1];
    match source.read(&mut probe).await {
        Ok(0) => Ok(true),
        Ok(n) => {
            head.extend_from_slice(&probe[..n]);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Stream `head` plus the rest of `source` through a best-speed gzip
/// encoder into a fresh spill file.
async fn write_spill(head: &[u8], source: &mut Source) -> io::Result<NamedTempFile> {
    let tmp = cleanup::spill_file()?;
    let write_side = tmp.reopen()?;
    let mut encoder = GzEncoder::new(BufWriter::new(write_side), Compression::fast());
    encoder.write_all(head)?;

    let mut chunk = vec![0u8; SPILL_CHUNK];
    loop {
        let n = source.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        encoder.write_all(&chunk[..n])?;
    }

    let file = encoder.finish()?.into_inner()?;
    drop(file);
    Ok(tmp)
}

async fn wait_child(child: &mut Child) -> Option<ProcessError> {
    match child.wait().await {
        Ok(status) => exit_error(status),
        Err(e) => Some(ProcessError::Capture(e)),
    }
}

fn exit_error(status: std::process::ExitStatus) -> Option<ProcessError> {
    if status.success() {
        return None;
    }
    match status.code() {
        Some(code) => Some(ProcessError::Exit { code }),
        None => {
            use std::os::unix::process::ExitStatusExt;
            Some(ProcessError::Signaled {
                signal: status.signal().unwrap_or(0),
            })
        }
    }
}

/// Fold the callback's outcome into `err` without masking an earlier error.
async fn fold_callback(err: &mut Option<ProcessError>, rx: Option<CallbackRx>) {
    let Some(rx) = rx else { return };
    let outcome = match rx.await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => ProcessError::Callback(e),
        Err(_) => ProcessError::Callback(io::Error::other("callback task dropped")),
    };
    if err.is_none() {
        *err = Some(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn plain_opts(buffer_size: usize) -> Options {
        Options {
            buffer_size,
            ..Options::default()
        }
    }

    fn read_all(cmd: &mut Command) -> Vec<u8> {
        let mut out = Vec::new();
        cmd.read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_small_output_stays_in_memory() {
        let mut cmd = run("printf hello", &plain_opts(1024), &[]).await;
        assert!(cmd.error().is_none(), "{cmd}");
        assert!(cmd.spill_path().is_none());
        assert_eq!(read_all(&mut cmd), b"hello");
    }

    #[tokio::test]
    async fn test_output_of_exactly_buffer_size_stays_in_memory() {
        // 8 bytes of output with B = 8: the peek sees end-of-stream.
        let mut cmd = run("printf 12345678", &plain_opts(8), &[]).await;
        assert!(cmd.error().is_none(), "{cmd}");
        assert!(cmd.spill_path().is_none());
        assert_eq!(read_all(&mut cmd), b"12345678");
    }

    #[tokio::test]
    async fn test_output_one_past_buffer_size_spills() {
        let mut cmd = run("printf 123456789", &plain_opts(8), &[]).await;
        assert!(cmd.error().is_none(), "{cmd}");
        assert!(cmd.spill_path().is_some());
        assert_eq!(read_all(&mut cmd), b"123456789");
    }

    #[tokio::test]
    async fn test_zero_byte_output() {
        let mut cmd = run("true", &plain_opts(1024), &[]).await;
        assert!(cmd.error().is_none(), "{cmd}");
        assert_eq!(cmd.exit_code(), 0);
        assert!(read_all(&mut cmd).is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let cmd = run("exit 61", &plain_opts(1024), &[]).await;
        assert_eq!(cmd.exit_code(), 61);
        assert!(matches!(
            cmd.error(),
            Some(ProcessError::Exit { code: 61 })
        ));
    }

    #[tokio::test]
    async fn test_unknown_command_is_an_error() {
        let cmd = run("XXXXXX go version", &plain_opts(1024), &[]).await;
        assert!(cmd.error().is_some());
        assert_ne!(cmd.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_extra_env_reaches_child() {
        let env = [("ZZZ".to_string(), "HELLOWORLD".to_string())];
        let mut cmd = run("echo -n $ZZZ", &plain_opts(1024), &env).await;
        assert!(cmd.error().is_none(), "{cmd}");
        assert_eq!(read_all(&mut cmd), b"HELLOWORLD");
    }

    #[tokio::test]
    async fn test_retries_rerun_failing_commands() {
        // Each attempt appends a line; k retries means k+1 attempts.
        let marker = tempfile::NamedTempFile::new().unwrap();
        let path = marker.path().display().to_string();
        let opts = Options {
            retries: 2,
            ..plain_opts(1024)
        };
        let cmd = run(&format!("echo attempt >> {path}; exit 7"), &opts, &[]).await;
        assert_eq!(cmd.exit_code(), 7);

        let attempts = std::fs::read_to_string(marker.path()).unwrap();
        assert_eq!(attempts.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_retries_stop_on_success() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let path = marker.path().display().to_string();
        let opts = Options {
            retries: 5,
            ..plain_opts(1024)
        };
        let cmd = run(&format!("echo attempt >> {path}"), &opts, &[]).await;
        assert_eq!(cmd.exit_code(), 0);

        let attempts = std::fs::read_to_string(marker.path()).unwrap();
        assert_eq!(attempts.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_sigpipe_in_upstream_command_is_tolerated() {
        let opts = Options {
            retries: 1,
            ..plain_opts(1024)
        };
        let mut cmd = run("seq 999999 | head", &opts, &[]).await;
        assert!(cmd.error().is_none(), "{cmd}");
        let expected: String = (1..=10).map(|i| format!("{i}\n")).collect();
        assert_eq!(read_all(&mut cmd), expected.as_bytes());
    }

    #[tokio::test]
    async fn test_duration_spans_all_attempts() {
        let opts = Options {
            retries: 1,
            ..plain_opts(1024)
        };
        let cmd = run("sleep 0.05; exit 1", &opts, &[]).await;
        assert!(cmd.duration() >= std::time::Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_callback_transforms_output() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        // Sums the numbers on the child's stdout, like a tiny awk.
        let callback: Callback = Arc::new(|stdout, mut writer| {
            Box::pin(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut sum: u64 = 0;
                while let Some(line) = lines.next_line().await? {
                    sum += line
                        .trim()
                        .parse::<u64>()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                writer.write_all(sum.to_string().as_bytes()).await?;
                Ok(())
            })
        });
        let opts = Options {
            callback: Some(callback),
            ..plain_opts(1024)
        };

        let mut cmd = run("seq 99", &opts, &[]).await;
        assert!(cmd.error().is_none(), "{cmd}");
        assert_eq!(read_all(&mut cmd), b"4950");
    }

    #[tokio::test]
    async fn test_callback_error_lands_on_handle() {
        use tokio::io::AsyncWriteExt;

        let callback: Callback = Arc::new(|mut stdout, mut writer| {
            Box::pin(async move {
                // Drain the child so it exits cleanly; the error is ours.
                tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await?;
                writer.write_all(b"22\n").await?;
                drop(writer);
                Err(io::Error::other("WE MADE AN ERROR"))
            })
        });
        let opts = Options {
            callback: Some(callback),
            ..plain_opts(1024)
        };

        let cmd = run("seq 99", &opts, &[]).await;
        assert!(matches!(cmd.error(), Some(ProcessError::Callback(_))));
        assert_eq!(cmd.exit_code(), crate::UNKNOWN_EXIT);
    }

    #[tokio::test]
    async fn test_callback_error_does_not_mask_exit_error() {
        let callback: Callback = Arc::new(|_stdout, writer| {
            Box::pin(async move {
                drop(writer);
                Err(io::Error::other("callback noise"))
            })
        });
        let opts = Options {
            callback: Some(callback),
            ..plain_opts(1024)
        };

        let cmd = run("exit 3", &opts, &[]).await;
        assert!(matches!(cmd.error(), Some(ProcessError::Exit { code: 3 })));
    }
}
