//! Terminal service configuration.
//!
//! Values come from the environment and can be overridden by `ptyhub daemon`
//! flags:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `PTYHUB_PTY_CLOSE_THRESHOLD_MS` | grace period before a closed client's PTYs are killed | 10000 |
//! | `PTYHUB_DEV` | development mode, grace period forced to 0 | off |
//! | `PTYHUB_RECONNECT_CANCELS_DISPOSAL` | `set_client` also cancels a pending disposal | off |

use std::env;
use std::time::Duration;

use tracing::warn;

/// Default grace period between a client closing and its PTYs being killed.
pub const DEFAULT_PTY_CLOSE_THRESHOLD: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub pty_close_threshold: Duration,
    pub development: bool,
    /// When set, a client re-registering its sink also cancels its pending
    /// disposal; otherwise only `ensure_client_terminal` does.
    pub reconnect_cancels_disposal: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pty_close_threshold: DEFAULT_PTY_CLOSE_THRESHOLD,
            development: false,
            reconnect_cancels_disposal: false,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from `PTYHUB_*` environment variables.
    ///
    /// Unparseable values are logged and replaced by their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pty_close_threshold: env_var("PTYHUB_PTY_CLOSE_THRESHOLD_MS")
                .and_then(|raw| match raw.trim().parse::<u64>() {
                    Ok(ms) => Some(Duration::from_millis(ms)),
                    Err(_) => {
                        warn!(
                            "Invalid PTYHUB_PTY_CLOSE_THRESHOLD_MS '{}', using {}ms",
                            raw,
                            defaults.pty_close_threshold.as_millis()
                        );
                        None
                    }
                })
                .unwrap_or(defaults.pty_close_threshold),
            development: env_flag("PTYHUB_DEV").unwrap_or(defaults.development),
            reconnect_cancels_disposal: env_flag("PTYHUB_RECONNECT_CANCELS_DISPOSAL")
                .unwrap_or(defaults.reconnect_cancels_disposal),
        }
    }

    /// The grace period actually applied by `close_client`.
    pub fn close_threshold(&self) -> Duration {
        if self.development {
            Duration::ZERO
        } else {
            self.pty_close_threshold
        }
    }
}

/// Read a variable, ignoring empty values.
fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = env_var(name)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("Invalid boolean for {}: '{}', ignoring", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    const VARS: &[&str] = &[
        "PTYHUB_PTY_CLOSE_THRESHOLD_MS",
        "PTYHUB_DEV",
        "PTYHUB_RECONNECT_CANCELS_DISPOSAL",
    ];

    // Env var manipulation is process-global, so these tests run serially.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
            let vars = VARS
                .iter()
                .map(|name| (name.to_string(), std::env::var(name).ok()))
                .collect();
            for name in VARS {
                // SAFETY: We hold ENV_MUTEX
                unsafe { std::env::remove_var(name) };
            }
            Self { vars, _lock: lock }
        }

        fn set(&self, name: &str, value: &str) {
            // SAFETY: We hold ENV_MUTEX
            unsafe { std::env::set_var(name, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                // SAFETY: We hold ENV_MUTEX
                unsafe {
                    match value {
                        Some(v) => std::env::set_var(name, v),
                        None => std::env::remove_var(name),
                    }
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        let _guard = EnvGuard::new();
        let config = ServiceConfig::from_env();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.close_threshold(), Duration::from_millis(10_000));
    }

    #[test]
    fn test_threshold_from_env() {
        let guard = EnvGuard::new();
        guard.set("PTYHUB_PTY_CLOSE_THRESHOLD_MS", "2500");
        assert_eq!(
            ServiceConfig::from_env().close_threshold(),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_invalid_threshold_falls_back() {
        let guard = EnvGuard::new();
        guard.set("PTYHUB_PTY_CLOSE_THRESHOLD_MS", "soon");
        assert_eq!(
            ServiceConfig::from_env().pty_close_threshold,
            DEFAULT_PTY_CLOSE_THRESHOLD
        );
    }

    #[test]
    fn test_development_forces_zero_threshold() {
        let guard = EnvGuard::new();
        guard.set("PTYHUB_PTY_CLOSE_THRESHOLD_MS", "2500");
        guard.set("PTYHUB_DEV", "true");
        let config = ServiceConfig::from_env();
        assert!(config.development);
        assert_eq!(config.pty_close_threshold, Duration::from_millis(2500));
        assert_eq!(config.close_threshold(), Duration::ZERO);
    }

    #[test]
    fn test_reconnect_policy_flag() {
        let guard = EnvGuard::new();
        guard.set("PTYHUB_RECONNECT_CANCELS_DISPOSAL", "1");
        assert!(ServiceConfig::from_env().reconnect_cancels_disposal);

        guard.set("PTYHUB_RECONNECT_CANCELS_DISPOSAL", "maybe");
        assert!(!ServiceConfig::from_env().reconnect_cancels_disposal);
    }
}
