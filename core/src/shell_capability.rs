//! Shell capability: spawn child processes behind a command allowlist, a
//! cwd allowlist, a path-argument allowlist, optional rejection of shell
//! metacharacters, and a timeout.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::process::Command;

use crate::capability::Args;
use crate::capability::Capability;
use crate::capability::OperationSpec;
use crate::capability::optional_bool;
use crate::capability::optional_seconds;
use crate::capability::optional_str;
use crate::capability::optional_str_list;
use crate::capability::require_str;
use crate::contract::Contract;
use crate::error::CapabilityError;
use crate::path_guard;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Hardening list, not a shell parser: commands containing any of these are
/// rejected outright when `deny_operators` is set. `&`, `(`, `)`, `{`, `}`
/// are deliberately not on the list.
const SHELL_OPERATORS: &[&str] = &["&&", "||", ";", "|", "`", "$(", ">", "<", "\n"];

const OPERATIONS: &[OperationSpec] = &[
    OperationSpec {
        name: "run",
        params: &["command", "cwd"],
        signature: "(command, cwd=None)",
        doc: "Run a shell command; returns exit_code, stdout, and stderr.",
    },
    OperationSpec {
        name: "run_interactive",
        params: &["command", "cwd"],
        signature: "(command, cwd=None)",
        doc: "Run a command and return its output as a single string.",
    },
    OperationSpec {
        name: "describe",
        params: &[],
        signature: "()",
        doc: "Documentation for this capability.",
    },
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Execute shell commands with optional allowlists.
pub struct ShellCapability {
    allowed_commands: Option<BTreeSet<String>>,
    allowed_cwds: Vec<PathBuf>,
    allowed_paths: Vec<PathBuf>,
    timeout: Duration,
    deny_operators: bool,
    runtime: OnceLock<tokio::runtime::Runtime>,
}

impl ShellCapability {
    pub fn new(
        allowed_commands: Option<Vec<String>>,
        allowed_cwds: Vec<PathBuf>,
        allowed_paths: Vec<PathBuf>,
        timeout: Duration,
        deny_operators: bool,
    ) -> Self {
        Self {
            allowed_commands: allowed_commands.map(|cmds| cmds.into_iter().collect()),
            allowed_cwds: path_guard::normalize_roots(allowed_cwds),
            allowed_paths: path_guard::normalize_roots(allowed_paths),
            timeout,
            deny_operators,
            runtime: OnceLock::new(),
        }
    }

    pub fn unrestricted() -> Self {
        Self::new(None, Vec::new(), Vec::new(), DEFAULT_TIMEOUT, false)
    }

    pub fn allowed_commands(&self) -> Option<&BTreeSet<String>> {
        self.allowed_commands.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn host_cwd(&self) -> PathBuf {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    }

    /// Step 1: the first shell token must be on the allowlist.
    fn check_command_name(&self, command: &str) -> Result<(), CapabilityError> {
        let Some(allowed) = &self.allowed_commands else {
            return Ok(());
        };
        let tokens = path_guard::split_command(command).ok_or_else(|| {
            CapabilityError::Permission(format!("command could not be tokenized: {command}"))
        })?;
        let name = tokens.first().ok_or_else(|| {
            CapabilityError::Permission("empty command is not allowed".to_string())
        })?;
        if allowed.contains(name) {
            Ok(())
        } else {
            let allowed_list = allowed.iter().cloned().collect::<Vec<_>>().join(", ");
            Err(CapabilityError::Permission(format!(
                "command '{name}' is not allowed. Allowed commands: {allowed_list}"
            )))
        }
    }

    /// Step 2: reject shell metacharacters when hardening is on.
    fn check_operators(&self, command: &str) -> Result<(), CapabilityError> {
        if !self.deny_operators {
            return Ok(());
        }
        for operator in SHELL_OPERATORS {
            if command.contains(operator) {
                let shown = if *operator == "\n" { "\\n" } else { operator };
                return Err(CapabilityError::Permission(format!(
                    "shell operators are not allowed in commands (found '{shown}')"
                )));
            }
        }
        Ok(())
    }

    /// Step 3: the effective working directory must be inside the cwd
    /// allowlist.
    fn check_cwd(&self, cwd: Option<&str>) -> Result<PathBuf, CapabilityError> {
        let host_cwd = self.host_cwd();
        let resolved = match cwd {
            Some(dir) => path_guard::resolve_path(Path::new(dir), &host_cwd),
            None => host_cwd,
        };
        if self.allowed_cwds.is_empty()
            || path_guard::is_path_allowed(&resolved, &self.allowed_cwds)
        {
            Ok(resolved)
        } else {
            let allowed = self
                .allowed_cwds
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Err(CapabilityError::Permission(format!(
                "working directory '{}' is not allowed. Allowed: {allowed}",
                resolved.display()
            )))
        }
    }

    /// Step 4: every path-looking argument must resolve inside the path
    /// allowlist.
    fn check_path_args(&self, command: &str, cwd: &Path) -> Result<(), CapabilityError> {
        if self.allowed_paths.is_empty() {
            return Ok(());
        }
        let tokens = path_guard::split_command(command).ok_or_else(|| {
            CapabilityError::Permission(format!("command could not be tokenized: {command}"))
        })?;
        for raw in path_guard::extract_path_args(&tokens) {
            let resolved = path_guard::resolve_path(Path::new(&raw), cwd);
            if !path_guard::is_path_allowed(&resolved, &self.allowed_paths) {
                let allowed = self
                    .allowed_paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(CapabilityError::Permission(format!(
                    "path argument '{raw}' is outside allowed paths ({allowed})"
                )));
            }
        }
        Ok(())
    }

    fn runtime(&self) -> Result<&tokio::runtime::Runtime, CapabilityError> {
        if self.runtime.get().is_none() {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| CapabilityError::Io(format!("failed to start runtime: {e}")))?;
            let _ = self.runtime.set(runtime);
        }
        self.runtime
            .get()
            .ok_or_else(|| CapabilityError::Io("runtime unavailable".to_string()))
    }

    /// Run a shell command through the full guard pipeline. Policy refusals
    /// raise; spawn failures and timeouts are reported through the
    /// `exit_code = -1` convention.
    pub fn run(&self, command: &str, cwd: Option<&str>) -> Result<CommandResult, CapabilityError> {
        self.check_command_name(command)?;
        self.check_operators(command)?;
        let resolved_cwd = self.check_cwd(cwd)?;
        self.check_path_args(command, &resolved_cwd)?;

        tracing::debug!(command, cwd = %resolved_cwd.display(), "shell run");
        let timeout = self.timeout;
        let runtime = self.runtime()?;
        Ok(runtime.block_on(spawn_and_wait(command, &resolved_cwd, timeout)))
    }

    /// Convenience facade over `run` with no distinct permission surface.
    pub fn run_interactive(
        &self,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<String, CapabilityError> {
        let result = self.run(command, cwd)?;
        if result.exit_code == 0 {
            Ok(result.stdout)
        } else {
            let detail = if result.stderr.is_empty() {
                result.stdout
            } else {
                result.stderr
            };
            Ok(format!("Error (exit {}): {detail}", result.exit_code))
        }
    }
}

async fn spawn_and_wait(command: &str, cwd: &Path, timeout: Duration) -> CommandResult {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        // No stdin: commands that probe it would otherwise hang forever.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return CommandResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: err.to_string(),
            };
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => CommandResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Ok(Err(err)) => CommandResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: err.to_string(),
        },
        // Dropping the in-flight wait kills the child via kill_on_drop.
        Err(_) => CommandResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("command timed out after {} seconds", timeout.as_secs()),
        },
    }
}

impl Capability for ShellCapability {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute shell commands (with optional allowlist)."
    }

    fn contract(&self) -> Contract {
        let executes: BTreeSet<String> = match &self.allowed_commands {
            Some(commands) => commands
                .iter()
                .map(|cmd| format!("shell:{cmd} *"))
                .collect(),
            None => ["shell:*".to_string()].into_iter().collect(),
        };
        // The command can read and write wherever its path allowlist
        // reaches.
        let file_patterns: BTreeSet<String> = if self.allowed_paths.is_empty() {
            ["file:**".to_string()].into_iter().collect()
        } else {
            self.allowed_paths
                .iter()
                .map(|p| format!("file:{}/**", p.display()))
                .collect()
        };
        Contract {
            reads: file_patterns.clone(),
            writes: file_patterns,
            executes,
            network: Default::default(),
            spawns: true,
        }
    }

    fn operations(&self) -> Vec<OperationSpec> {
        OPERATIONS.to_vec()
    }

    fn invoke(&self, method: &str, args: &Args) -> Result<Value, CapabilityError> {
        match method {
            "run" => {
                let command = require_str(args, "command")?;
                let cwd = optional_str(args, "cwd")?;
                let result = self.run(command, cwd)?;
                serde_json::to_value(result)
                    .map_err(|e| CapabilityError::Io(format!("serialize result: {e}")))
            }
            "run_interactive" => {
                let command = require_str(args, "command")?;
                let cwd = optional_str(args, "cwd")?;
                Ok(Value::String(self.run_interactive(command, cwd)?))
            }
            "describe" => Ok(Value::String(self.describe())),
            other => Err(self.unknown_method(other)),
        }
    }

    /// Restrictions: `commands`, `cwds`, `paths` (each must stay inside the
    /// parent's allowance), `timeout` (clamped to the parent's), and
    /// `deny_operators` (monotonically hardened).
    fn derive(&self, restrictions: &Args) -> Result<Arc<dyn Capability>, CapabilityError> {
        Ok(Arc::new(self.restricted(restrictions)?))
    }
}

impl ShellCapability {
    /// Typed form of [`Capability::derive`].
    pub fn restricted(&self, restrictions: &Args) -> Result<ShellCapability, CapabilityError> {
        let commands = match optional_str_list(restrictions, "commands")? {
            None => self.allowed_commands.clone(),
            Some(requested) => {
                let requested: BTreeSet<String> = requested.into_iter().collect();
                if let Some(parent) = &self.allowed_commands {
                    if let Some(extra) = requested.iter().find(|cmd| !parent.contains(*cmd)) {
                        return Err(CapabilityError::Broadened(format!(
                            "command '{extra}' is not in the parent's allowlist"
                        )));
                    }
                }
                Some(requested)
            }
        };

        let narrow_paths = |requested: Option<Vec<String>>,
                            parent: &[PathBuf],
                            what: &str|
         -> Result<Vec<PathBuf>, CapabilityError> {
            match requested {
                None => Ok(parent.to_vec()),
                Some(paths) => {
                    let resolved = path_guard::normalize_roots(&paths);
                    if !parent.is_empty() {
                        for path in &resolved {
                            if !path_guard::is_path_allowed(path, parent) {
                                return Err(CapabilityError::Broadened(format!(
                                    "{what} '{}' is outside the parent's allowance",
                                    path.display()
                                )));
                            }
                        }
                    }
                    Ok(resolved)
                }
            }
        };

        let cwds = narrow_paths(
            optional_str_list(restrictions, "cwds")?,
            &self.allowed_cwds,
            "working directory",
        )?;
        let paths = narrow_paths(
            optional_str_list(restrictions, "paths")?,
            &self.allowed_paths,
            "path",
        )?;

        let timeout = match optional_seconds(restrictions, "timeout")? {
            Some(seconds) => Duration::from_secs_f64(seconds).min(self.timeout),
            None => self.timeout,
        };
        let deny_operators = optional_bool(restrictions, "deny_operators")?.unwrap_or(false)
            || self.deny_operators;

        Ok(ShellCapability {
            allowed_commands: commands,
            allowed_cwds: cwds,
            allowed_paths: paths,
            timeout,
            deny_operators,
            runtime: OnceLock::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn allow(commands: &[&str]) -> Option<Vec<String>> {
        Some(commands.iter().map(|s| s.to_string()).collect())
    }

    fn echo_only() -> ShellCapability {
        ShellCapability::new(
            allow(&["echo"]),
            Vec::new(),
            Vec::new(),
            DEFAULT_TIMEOUT,
            true,
        )
    }

    #[test]
    fn allowlisted_command_runs() {
        let cap = echo_only();
        let result = cap.run("echo hi", None).expect("run");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hi");
    }

    #[test]
    fn unlisted_command_is_refused_before_spawn() {
        let cap = echo_only();
        let err = cap.run("rm -rf /", None).err().expect("deny");
        assert!(err.to_string().contains("not allowed"), "{err}");
    }

    #[test]
    fn operators_are_refused_when_hardened() {
        let cap = echo_only();
        let err = cap.run("echo hi && whoami", None).err().expect("deny");
        assert!(err.to_string().contains("operators"), "{err}");
        for bad in ["echo `id`", "echo $(id)", "echo x > /tmp/y", "echo a; echo b"] {
            let err = cap.run(bad, None).err().expect("deny");
            assert!(err.to_string().contains("operators"), "{bad}: {err}");
        }
    }

    #[test]
    fn operators_pass_when_not_hardened() {
        let cap = ShellCapability::new(None, Vec::new(), Vec::new(), DEFAULT_TIMEOUT, false);
        let result = cap.run("echo a && echo b", None).expect("run");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "a\nb\n");
    }

    #[test]
    fn cwd_outside_allowlist_is_refused() {
        let root = TempDir::new().expect("tempdir");
        let cap = ShellCapability::new(
            allow(&["pwd"]),
            vec![root.path().to_path_buf()],
            Vec::new(),
            DEFAULT_TIMEOUT,
            true,
        );
        let err = cap.run("pwd", Some("/")).err().expect("deny");
        assert!(err.to_string().contains("not allowed"), "{err}");
        let ok = cap
            .run("pwd", Some(&root.path().display().to_string()))
            .expect("run");
        assert_eq!(ok.exit_code, 0);
    }

    #[test]
    fn path_args_outside_allowlist_are_refused() {
        let root = TempDir::new().expect("tempdir");
        let sub = root.path().join("sub");
        std::fs::create_dir_all(&sub).expect("mkdir");
        let cap = ShellCapability::new(
            allow(&["ls"]),
            vec![root.path().to_path_buf()],
            vec![root.path().to_path_buf()],
            DEFAULT_TIMEOUT,
            true,
        );
        let cwd = root.path().display().to_string();

        let err = cap.run("ls /", Some(&cwd)).err().expect("deny");
        assert!(err.to_string().contains("outside allowed paths"), "{err}");

        let ok = cap
            .run(&format!("ls {}", sub.display()), Some(&cwd))
            .expect("run");
        assert_eq!(ok.exit_code, 0);
    }

    #[test]
    fn timeout_uses_exit_code_convention() {
        let cap = ShellCapability::new(
            None,
            Vec::new(),
            Vec::new(),
            Duration::from_millis(200),
            false,
        );
        let result = cap.run("sleep 5", None).expect("run");
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("timed out"), "{}", result.stderr);
    }

    #[test]
    fn run_interactive_formats_failures() {
        let cap = ShellCapability::unrestricted();
        assert_eq!(
            cap.run_interactive("echo hi", None).expect("run").trim(),
            "hi"
        );
        let message = cap
            .run_interactive("sh -c 'echo broken >&2; exit 3'", None)
            .expect("run");
        assert!(message.starts_with("Error (exit 3):"), "{message}");
        assert!(message.contains("broken"), "{message}");
    }

    #[test]
    fn contract_lists_commands_and_paths() {
        let root = TempDir::new().expect("tempdir");
        let canon = root.path().canonicalize().expect("canonicalize");
        let cap = ShellCapability::new(
            allow(&["git", "ls"]),
            Vec::new(),
            vec![root.path().to_path_buf()],
            DEFAULT_TIMEOUT,
            true,
        );
        let contract = cap.contract();
        assert!(contract.executes.contains("shell:git *"));
        assert!(contract.executes.contains("shell:ls *"));
        assert!(contract.reads.contains(&format!("file:{}/**", canon.display())));
        assert!(contract.spawns);
    }

    #[test]
    fn derive_monotonicity() {
        let cap = ShellCapability::new(
            allow(&["git", "ls", "echo"]),
            Vec::new(),
            Vec::new(),
            DEFAULT_TIMEOUT,
            false,
        );
        let restrictions: Args = serde_json::from_value(serde_json::json!({
            "commands": ["git"],
            "timeout": 5,
            "deny_operators": true
        }))
        .expect("args");
        let derived = cap.derive(&restrictions).expect("derive");
        assert!(derived.contract().is_subset_of(&cap.contract()));

        // Broadening the command set is rejected.
        let widened: Args = serde_json::from_value(serde_json::json!({
            "commands": ["git", "curl"]
        }))
        .expect("args");
        let err = derived.derive(&widened).err().expect("reject");
        assert!(matches!(err, CapabilityError::Broadened(_)), "{err}");
    }

    #[test]
    fn derived_timeout_clamps_to_parent() {
        let cap = ShellCapability::new(
            None,
            Vec::new(),
            Vec::new(),
            Duration::from_secs(10),
            false,
        );
        let widen: Args =
            serde_json::from_value(serde_json::json!({"timeout": 60})).expect("args");
        let derived = cap.restricted(&widen).expect("derive");
        assert_eq!(derived.timeout(), Duration::from_secs(10));

        let narrow: Args =
            serde_json::from_value(serde_json::json!({"timeout": 2})).expect("args");
        let derived = cap.restricted(&narrow).expect("derive");
        assert_eq!(derived.timeout(), Duration::from_secs(2));
    }
}
