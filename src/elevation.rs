//! Privilege elevation for iptables operations
//!
//! Changing the kernel rule set needs `CAP_NET_ADMIN`. iptsync may run as an
//! unprivileged user and only elevates the commands it actually needs:
//!
//! - **iptables**: inserting and deleting single rules
//! - **iptables-save**: reading the live rule set
//! - **persistence command**: saving the rule set for the next boot
//!
//! # Elevation Strategy
//!
//! - Already root: run the program directly
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Non-interactive fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `IPTSYNC_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful for cron jobs with sudoers NOPASSWD rules.
//!   Example: `IPTSYNC_ELEVATION_METHOD=sudo iptsync apply rules.json`
//!
//! - `IPTSYNC_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation
//! - Rule arguments are validated before they reach this module
//! - Only the three command kinds above can be elevated

use std::io;
use std::path::Path;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit or run as root")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `IPTSYNC_ELEVATION_METHOD`
    #[error("Invalid IPTSYNC_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ElevationError> for crate::core::error::Error {
    fn from(err: ElevationError) -> Self {
        crate::core::error::Error::Elevation(err.to_string())
    }
}

/// Checks if a binary exists in PATH, or at the given path if it has a slash.
pub(crate) fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                full_path.is_file().then_some(full_path)
            })
        })
        .is_some()
}

fn wrap(elevator: &str, program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(elevator);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Builds an elevated command for one of the allowed programs.
fn build_elevated_command(program: &str, args: &[String]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    if std::env::var("IPTSYNC_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(program, args));
    }

    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    if let Ok(method) = std::env::var("IPTSYNC_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrap(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    if binary_exists("run0") {
        return Ok(wrap("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrap("sudo", program, args))
    } else if binary_exists("pkexec") {
        Ok(wrap("pkexec", program, args))
    } else {
        Err(ElevationError::PkexecNotFound)
    }
}

/// Creates an elevated `iptables` command.
///
/// `program` is the configured iptables binary (`/sbin/iptables` by default).
/// Arguments are passed without shell interpretation.
pub fn create_elevated_iptables_command(
    program: &str,
    args: &[String],
) -> Result<Command, ElevationError> {
    build_elevated_command(program, args)
}

/// Creates an elevated `iptables-save` command.
pub fn create_elevated_save_command(program: &str) -> Result<Command, ElevationError> {
    build_elevated_command(program, &[])
}

/// Creates an elevated persistence command such as `/sbin/service iptables save`.
///
/// The first element of `argv` is the program.
pub fn create_elevated_persist_command(argv: &[String]) -> Result<Command, ElevationError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ElevationError::Io(io::Error::new(io::ErrorKind::InvalidInput, "empty persistence command")))?;
    build_elevated_command(program, args)
}
