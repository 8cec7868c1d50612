//! Shell resolution for child commands.

use std::path::Path;
use std::sync::OnceLock;

/// The shell used to invoke each command as `<shell> -c <command>`.
///
/// `$SHELL` when set and non-empty, otherwise `bash` when `/bin/bash`
/// exists, otherwise `sh`. Resolved once per process.
pub fn shell() -> &'static str {
    static SHELL: OnceLock<String> = OnceLock::new();
    SHELL.get_or_init(|| match std::env::var("SHELL") {
        Ok(s) if !s.is_empty() => s,
        _ => {
            if Path::new("/bin/bash").exists() {
                "bash".to_string()
            } else {
                "sh".to_string()
            }
        }
    })
}
