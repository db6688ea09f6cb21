//! Shell processes on pseudo-terminals.
//!
//! - [`pty`] — PTY allocation, shell spawn with controlling terminal, resize.
//! - [`session`] — [`session::PtySession`]: one shell with reader and deputy
//!   threads, exposing output, write, resize and stop.

pub mod pty;
pub mod session;

/// Resolve the shell to run: explicit override, then `$SHELL`, then `sh`.
pub fn resolve_shell(configured: Option<&str>) -> String {
    configured
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_shell_wins() {
        assert_eq!(resolve_shell(Some("/bin/dash")), "/bin/dash");
    }

    #[test]
    fn blank_override_falls_through() {
        let resolved = resolve_shell(Some("  "));
        assert!(!resolved.trim().is_empty());
    }
}
