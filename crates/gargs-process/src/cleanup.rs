//! Spill-file bookkeeping and crash cleanup.
//!
//! Spill files are named `gargs.<pid>.<random>` under the system temp
//! directory. Each file is owned by exactly one [`Command`](crate::Command)
//! handle, which removes it on cleanup or drop. On a fatal signal (or a
//! panic) the whole prefix is swept instead, so nothing is left behind even
//! when handles are still in flight. Files from other pids are never
//! touched, so a fresh instance does not disturb a crashed one's leftovers.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tempfile::NamedTempFile;

/// Filename prefix for this process's spill files.
pub fn prefix() -> &'static str {
    static PREFIX: OnceLock<String> = OnceLock::new();
    PREFIX.get_or_init(|| format!("gargs.{}.", std::process::id()))
}

/// Create a fresh spill file under the prefix.
pub(crate) fn spill_file() -> io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(prefix())
        .tempfile_in(std::env::temp_dir())
}

/// Remove every spill file created by this process. Best-effort.
pub fn remove_all() {
    let dir = std::env::temp_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot sweep spill files");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(prefix()) {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!(file = name, error = %e, "failed to remove spill file");
            }
        }
    }
}

/// Install the fatal-signal task and the panic hook. Idempotent; the runner
/// facade calls this on first use. Must be called within a tokio runtime.
///
/// Fatal signals (interrupt, terminate, hangup, quit) sweep the prefix and
/// exit with code 2. A panic sweeps the prefix, then the previous hook runs
/// and the panic propagates as usual.
pub fn install() {
    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        remove_all();
        previous(info);
    }));

    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).ok();
        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sighup = signal(SignalKind::hangup()).ok();
        let mut sigquit = signal(SignalKind::quit()).ok();

        let name = tokio::select! {
            _ = recv(&mut sigint) => "interrupt",
            _ = recv(&mut sigterm) => "terminate",
            _ = recv(&mut sighup) => "hangup",
            _ = recv(&mut sigquit) => "quit",
        };
        // The select fires at most once, so the sweep runs at most once
        // even if more signals queue up behind it.
        remove_all();
        eprintln!("gargs: {name}");
        std::process::exit(2);
    });
}

/// Await a signal if registration succeeded, or pend forever if it failed.
async fn recv(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_prefix_contains_pid() {
        let p = prefix();
        assert!(p.starts_with("gargs."));
        assert!(p.contains(&std::process::id().to_string()));
        assert!(p.ends_with('.'));
    }

    #[test]
    fn test_spill_file_lands_under_prefix() {
        let tmp = spill_file().unwrap();
        let name = tmp.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(prefix()));
        assert!(tmp.path().starts_with(std::env::temp_dir()));
    }

    #[test]
    fn test_remove_all_sweeps_prefix() {
        let mut tmp = spill_file().unwrap();
        tmp.write_all(b"leftover").unwrap();
        // Simulate a leaked file: detach it from RAII deletion.
        let (_file, path) = tmp.keep().unwrap();
        assert!(path.exists());

        remove_all();
        assert!(!path.exists());
    }
}
