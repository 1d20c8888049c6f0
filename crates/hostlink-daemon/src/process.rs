//! Exit status helpers shared by the proxy and the gateway.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Exit code used when a command could not be located.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Exit code used when a command was found but could not be executed.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Map a child's exit status to a shell-style code: the exit code itself,
/// or `128 + signal` when the child was killed by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(1)
}

/// Synthetic exit code for a spawn that failed after authorization.
pub fn spawn_failure_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::NotFound => EXIT_NOT_FOUND,
        io::ErrorKind::PermissionDenied => EXIT_NOT_EXECUTABLE,
        _ => 1,
    }
}
