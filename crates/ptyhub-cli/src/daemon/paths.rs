//! Socket and PID file locations.
//!
//! Several daemons can run side by side, one per *instance* name taken from
//! `PTYHUB_INSTANCE` (default `"default"`). Each instance owns
//! `{socket_dir}/{instance}.sock` and `{socket_dir}/{instance}.pid`.
//!
//! The socket directory is the first of:
//! 1. `PTYHUB_SOCKET_DIR`
//! 2. `XDG_RUNTIME_DIR/ptyhub`
//! 3. `~/.ptyhub`
//! 4. `{temp_dir}/ptyhub`
//!
//! Empty variables are treated as unset.

use std::env;
use std::path::PathBuf;

const DEFAULT_INSTANCE: &str = "default";

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Current instance name from `PTYHUB_INSTANCE`.
pub fn get_instance() -> String {
    non_empty_var("PTYHUB_INSTANCE").unwrap_or_else(|| DEFAULT_INSTANCE.to_string())
}

pub fn get_socket_dir() -> PathBuf {
    if let Some(dir) = non_empty_var("PTYHUB_SOCKET_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(runtime_dir) = non_empty_var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("ptyhub");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".ptyhub");
    }
    env::temp_dir().join("ptyhub")
}

/// Instance names become file names, so only `[A-Za-z0-9_-]` is allowed and
/// a leading hyphen is refused. Anything else maps to `"default"`.
pub(crate) fn sanitize_instance_name(name: &str) -> String {
    let is_valid = !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if is_valid {
        name.to_string()
    } else {
        tracing::warn!(
            "Invalid instance name '{}', using '{}'",
            name,
            DEFAULT_INSTANCE
        );
        DEFAULT_INSTANCE.to_string()
    }
}

fn instance_file(instance: Option<&str>, extension: &str) -> PathBuf {
    let name = instance.map(String::from).unwrap_or_else(get_instance);
    get_socket_dir().join(format!("{}.{}", sanitize_instance_name(&name), extension))
}

/// Socket path of `instance`, or of the current instance when `None`.
pub fn get_socket_path(instance: Option<&str>) -> PathBuf {
    instance_file(instance, "sock")
}

/// PID file path of `instance`, or of the current instance when `None`.
pub fn get_pid_path(instance: Option<&str>) -> PathBuf {
    instance_file(instance, "pid")
}

/// Create the socket directory, owner-only on Unix.
pub fn ensure_socket_dir() -> std::io::Result<()> {
    let dir = get_socket_dir();
    std::fs::create_dir_all(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}
