//! Exec-approval fingerprinting.
//!
//! A `(tool, fingerprint, cwd)` tuple identifies "the same command" for the
//! purpose of `approved_for_session` grants. The fingerprint strips a
//! recognised shell-wrapper prefix off the front of the command text; the
//! remainder is compared verbatim — no path resolution, no further
//! canonicalisation.

const SHELL_WRAPPERS: &[&str] = &["sh -lc", "zsh -lc", "bash -lc", "cmd /c", "pwsh -c", "powershell -c"];

/// Strip a recognised shell-wrapper prefix and return the normalised command
/// text used as the approval fingerprint.
pub fn fingerprint(command: &str) -> String {
    let trimmed = command.trim();
    for wrapper in SHELL_WRAPPERS {
        if let Some(rest) = trimmed.strip_prefix(wrapper) {
            return rest.trim().trim_matches(['"', '\'']).to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_sh_lc_wrapper() {
        assert_eq!(fingerprint("sh -lc \"echo hi\""), "echo hi");
    }

    #[test]
    fn strips_bash_lc_wrapper() {
        assert_eq!(fingerprint("bash -lc 'rm -rf /tmp/x'"), "rm -rf /tmp/x");
    }

    #[test]
    fn strips_cmd_wrapper() {
        assert_eq!(fingerprint("cmd /c \"dir\""), "dir");
    }

    #[test]
    fn leaves_unwrapped_command_untouched() {
        assert_eq!(fingerprint("echo hi"), "echo hi");
    }

    #[test]
    fn same_command_same_fingerprint_regardless_of_wrapper() {
        let a = fingerprint("sh -lc \"echo hi\"");
        let b = fingerprint("bash -lc \"echo hi\"");
        assert_eq!(a, b);
    }

    #[test]
    fn different_commands_never_collide() {
        let a = fingerprint("sh -lc \"echo hi\"");
        let b = fingerprint("sh -lc \"echo bye\"");
        assert_ne!(a, b);
    }
}
