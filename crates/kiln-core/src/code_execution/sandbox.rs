//! Shell command pre-filter and subprocess confinement.
//!
//! [`SandboxValidator`] is a blunt denylist: a command is rejected when any
//! listed token appears anywhere in it, quoted or not. It is a pre-filter
//! only. Every subprocess is additionally started through
//! [`sandboxed_command`], which applies the [`SandboxConfig`] to the process
//! regardless of what the validator said: a confined environment, its own
//! process group, and on Linux a Landlock ruleset when `read_only` is set.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

use super::{ExecutionResult, Language, SandboxConfig};

/// Tokens whose presence rejects a shell command.
///
/// Matching is case-insensitive and runs of whitespace are collapsed to a
/// single space first, so `RM   -RF` matches `rm -rf`.
pub const DEFAULT_DENYLIST: &[&str] = &[
    // destructive filesystem operations
    "rm -rf",
    "rm -fr",
    "rm -r /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "/dev/sda",
    "shred ",
    "format c:",
    "del /f",
    "rmdir /s",
    "chmod 777",
    "chmod -r",
    "chown ",
    "chattr ",
    // fork bombs and process mass-kill
    ":(){",
    ":() {",
    "kill -9 -1",
    "killall ",
    "pkill ",
    // privilege escalation and system state
    "sudo ",
    "su -",
    "doas ",
    "passwd",
    "crontab",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "iptables",
    "mount ",
    // unsolicited network tools
    "wget ",
    "curl ",
    "nc ",
    "netcat",
    "ncat ",
    "telnet",
    "ssh ",
    "scp ",
    "ftp ",
    "rsync ",
];

/// Denylist check for shell commands.
#[derive(Debug, Clone)]
pub struct SandboxValidator {
    denylist: Vec<String>,
}

impl Default for SandboxValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxValidator {
    pub fn new() -> Self {
        Self::with_denylist(DEFAULT_DENYLIST.iter().copied())
    }

    /// Validator using exactly `tokens`.
    pub fn with_denylist<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            denylist: tokens
                .into_iter()
                .map(|t| normalize(t.as_ref()))
                .filter(|t| !t.trim().is_empty())
                .collect(),
        }
    }

    /// Add tokens to the denylist.
    pub fn deny<S: AsRef<str>>(mut self, token: S) -> Self {
        let token = normalize(token.as_ref());
        if !token.trim().is_empty() {
            self.denylist.push(token);
        }
        self
    }

    pub fn is_safe(&self, command: &str) -> bool {
        self.first_violation(command).is_none()
    }

    /// The first denylisted token found in `command`, if any.
    pub fn first_violation(&self, command: &str) -> Option<&str> {
        // Padding lets tokens with a trailing space match at end of input.
        let haystack = format!(" {} ", normalize(command));
        self.denylist
            .iter()
            .find(|token| haystack.contains(token.as_str()))
            .map(String::as_str)
    }

    /// Failed result for a shell command containing a denied token.
    pub(crate) fn rejection(&self, command: &str) -> Option<ExecutionResult> {
        let token = self.first_violation(command)?.trim();
        warn!(token, "Shell command rejected by sandbox validator");
        Some(ExecutionResult::failure(
            Language::Shell,
            format!("Command rejected by sandbox: contains '{token}'"),
            Duration::ZERO,
        ))
    }
}

/// `SandboxValidator::new().is_safe(command)`.
pub fn is_safe(command: &str) -> bool {
    SandboxValidator::new().is_safe(command)
}

/// Lowercase and collapse whitespace runs to single spaces, keeping a
/// single leading/trailing space when present.
fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.extend(c.to_lowercase());
            in_space = false;
        }
    }
    out
}

// ─── Process Confinement ───────────────────────────────────────────

/// Address for proxy variables when network access is off; nothing listens
/// on the discard port.
const DEAD_PROXY: &str = "http://127.0.0.1:9";
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Build a command for `program` confined by `config`.
///
/// The child gets a cleared environment plus `PATH`, locale, the proxy
/// poisoning for disabled network and the configured `env`. With
/// `limit_address_space` and a non-zero `max_memory_mb`, the program is
/// started through `sh -c 'ulimit -v ..; exec ..'` on Unix. On Unix the
/// child leads a new process group so [`ProcessGroupGuard`] can kill
/// everything it forks.
///
/// Fails when `read_only` is set and the host cannot enforce it.
pub(crate) fn sandboxed_command(
    program: &str,
    args: &[String],
    config: &SandboxConfig,
    limit_address_space: bool,
) -> Result<Command, String> {
    let mut cmd = if cfg!(unix) && limit_address_space && config.max_memory_mb > 0 {
        let kib = config.max_memory_mb.saturating_mul(1024);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("ulimit -v {kib} && exec \"$0\" \"$@\""))
            .arg(program)
            .args(args);
        cmd
    } else {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    };

    cmd.env_clear()
        .env(
            "PATH",
            std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string()),
        )
        .env("LANG", "C.UTF-8")
        .env("PYTHONIOENCODING", "utf-8");

    if !config.allow_network {
        for var in [
            "http_proxy",
            "https_proxy",
            "all_proxy",
            "HTTP_PROXY",
            "HTTPS_PROXY",
            "ALL_PROXY",
        ] {
            cmd.env(var, DEAD_PROXY);
        }
        cmd.env("no_proxy", "").env("NO_PROXY", "");
        cmd.env("KILN_NETWORK", "off");
    }

    if config.read_only {
        readonly::restrict(&mut cmd).map_err(|e| {
            format!(
                "read_only sandbox cannot be enforced on this host ({e}); \
                 set read_only = false to run with a writable filesystem"
            )
        })?;
        cmd.env("KILN_READ_ONLY", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1");
    }

    if let Some(ref dir) = config.working_dir {
        cmd.current_dir(dir);
        cmd.env("HOME", dir);
    }

    for (key, val) in &config.env {
        cmd.env(key, val);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(cmd)
}

/// Kills the child's whole process group when dropped.
///
/// `kill_on_drop` only reaches the direct child; subshells and background
/// jobs share its group and go with this guard.
pub(crate) struct ProcessGroupGuard(Option<u32>);

impl ProcessGroupGuard {
    /// Guard for a child spawned by [`sandboxed_command`]; `pid` is its group id.
    pub(crate) fn new(pid: Option<u32>) -> Self {
        Self(pid)
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.0.take() {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // ESRCH once every member has exited.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

// ─── Read-Only Filesystem ──────────────────────────────────────────

/// Whether this host can enforce [`SandboxConfig::read_only`].
///
/// Enforcement uses Landlock, so this is `false` off Linux and on kernels
/// built without it. Read-only sandboxes fail to start where it is `false`.
pub fn read_only_supported() -> bool {
    readonly::ruleset().is_ok()
}

#[cfg(target_os = "linux")]
mod readonly {
    use landlock::{
        ABI, Access, AccessFs, CompatLevel, Compatible, Ruleset, RulesetAttr, RulesetCreated,
        RulesetCreatedAttr, RulesetError, RulesetStatus, path_beneath_rules,
    };
    use tokio::process::Command;

    const ABI_LEVEL: ABI = ABI::V1;

    /// Everything readable and executable, only `/dev/null` writable.
    pub(super) fn ruleset() -> Result<RulesetCreated, RulesetError> {
        Ruleset::default()
            .set_compatibility(CompatLevel::HardRequirement)
            .handle_access(AccessFs::from_all(ABI_LEVEL))?
            .create()?
            .add_rules(path_beneath_rules(["/"], AccessFs::from_read(ABI_LEVEL)))?
            .add_rules(path_beneath_rules(["/dev/null"], AccessFs::from_all(ABI_LEVEL)))
    }

    /// Apply the ruleset to the child between fork and exec.
    pub(super) fn restrict(cmd: &mut Command) -> Result<(), String> {
        let mut ruleset = Some(ruleset().map_err(|e| e.to_string())?);
        // SAFETY: the hook only issues prctl and landlock syscalls against a
        // ruleset fd opened before the fork.
        unsafe {
            cmd.pre_exec(move || {
                let Some(ruleset) = ruleset.take() else {
                    return Ok(());
                };
                match ruleset.restrict_self() {
                    Ok(status) if status.ruleset == RulesetStatus::FullyEnforced => Ok(()),
                    _ => Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied)),
                }
            });
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod readonly {
    use tokio::process::Command;

    pub(super) fn ruleset() -> Result<(), String> {
        Err("Landlock requires Linux".to_string())
    }

    pub(super) fn restrict(_cmd: &mut Command) -> Result<(), String> {
        ruleset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_destructive_commands() {
        let v = SandboxValidator::new();
        assert!(!v.is_safe("rm -rf /tmp/x"));
        assert!(!v.is_safe("echo ok; RM  -Rf ~"));
        assert!(!v.is_safe("ls | sudo tee /etc/hosts"));
        assert!(!v.is_safe(":(){ :|:& };:"));
        assert!(!v.is_safe("echo 'curl http://evil'"));
        assert!(!v.is_safe("cat data | nc"));
    }

    #[test]
    fn accepts_benign_commands() {
        let v = SandboxValidator::new();
        assert!(v.is_safe("echo hello"));
        assert!(v.is_safe("ls -la && pwd"));
        assert!(v.is_safe("printf '%s\\n' a b c | sort"));
    }

    #[test]
    fn reports_matched_token() {
        let v = SandboxValidator::new();
        assert_eq!(v.first_violation("sudo\tapt install x"), Some("sudo "));
        assert_eq!(v.first_violation("echo hi"), None);
    }

    #[test]
    fn custom_denylist() {
        let v = SandboxValidator::with_denylist(["python -c"]).deny("Eval ");
        assert!(!v.is_safe("PYTHON   -c 'print(1)'"));
        assert!(!v.is_safe("eval $x"));
        assert!(v.is_safe("rm -rf /tmp/x"));
    }

    #[test]
    fn free_function_uses_default_list() {
        assert!(!is_safe("rm -rf /tmp/x"));
        assert!(is_safe("echo fine"));
    }

    #[test]
    fn rejection_names_the_token() {
        let v = SandboxValidator::new();
        let result = v.rejection("echo ok; sudo  reboot").unwrap();
        assert_eq!(result.language, Language::Shell);
        assert_eq!(result.exit_code, 1);
        assert_eq!(
            result.error.as_deref(),
            Some("Command rejected by sandbox: contains 'sudo'")
        );
        assert!(v.rejection("echo ok").is_none());
    }

    #[test]
    fn read_only_command_fails_closed_when_unenforceable() {
        let config = SandboxConfig::default();
        assert!(config.read_only);
        let built = sandboxed_command("sh", &[], &config, false);
        if read_only_supported() {
            assert!(built.is_ok());
        } else {
            let err = built.err().unwrap();
            assert!(err.contains("read_only"), "{err}");
        }
    }

    #[test]
    fn writable_command_always_builds() {
        let config = SandboxConfig::default().with_read_only(false);
        assert!(sandboxed_command("sh", &[], &config, true).is_ok());
    }
}
