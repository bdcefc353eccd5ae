//! Shell name extraction from a launch binary path.

use std::sync::OnceLock;

use regex::Regex;

/// Name reported when the binary path has no usable trailing segment.
pub const FALLBACK_SHELL_NAME: &str = "sh";

fn trailing_word() -> &'static Regex {
    static TRAILING_WORD: OnceLock<Regex> = OnceLock::new();
    TRAILING_WORD.get_or_init(|| Regex::new(r"[\w.]+$").expect("shell name pattern is valid"))
}

/// Return the trailing run of word characters and dots in `bin`.
///
/// `/bin/bash` yields `bash`, `/usr/bin/zsh5.8` yields `zsh5.8`, and a path
/// that ends in anything else (a separator, a hyphen) yields `sh`.
pub fn shell_name(bin: &str) -> String {
    trailing_word()
        .find(bin)
        .map_or_else(|| FALLBACK_SHELL_NAME.to_string(), |m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_paths() {
        assert_eq!(shell_name("/bin/bash"), "bash");
        assert_eq!(shell_name("/usr/bin/zsh5.8"), "zsh5.8");
        assert_eq!(shell_name("fish"), "fish");
    }

    #[test]
    fn test_windows_path() {
        assert_eq!(shell_name(r"C:\Windows\System32\cmd.exe"), "cmd.exe");
    }

    #[test]
    fn test_fallback_when_no_trailing_word() {
        assert_eq!(shell_name("/bin/"), "sh");
        assert_eq!(shell_name("/opt/shell-"), "sh");
        assert_eq!(shell_name(""), "sh");
    }

    #[test]
    fn test_only_trailing_run_is_kept() {
        assert_eq!(shell_name("/opt/my-shell"), "shell");
    }
}
