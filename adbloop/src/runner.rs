//! High-level operations: permission grant plans, package install and
//! script execution, with per-command result classification.

use std::fmt;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{CancelToken, EventSink};
use crate::transport::{Connection, Transport};

/// Substrings (lower-case) that mark a command's output as a failure.
const FAILURE_KEYWORDS: &[&str] = &[
    "exception",
    "error",
    "unknown permission",
    "not found",
    "failure",
    "security",
    "not allowed",
];

/// Classification of one command's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No output at all.
    Success,
    /// Non-empty output without failure keywords.
    Info,
    /// Output contains a failure keyword.
    Failure,
}

/// A classified command result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Verdict.
    pub outcome: Outcome,
    /// Trimmed output.
    pub output: String,
}

impl CommandResult {
    /// Whether the command counts towards the success tally.
    pub fn is_success(&self) -> bool {
        self.outcome != Outcome::Failure
    }
}

/// Classifies trimmed command output.
pub fn classify(output: &str) -> CommandResult {
    let output = output.trim();
    let lower = output.to_lowercase();
    let outcome = if output.is_empty() {
        Outcome::Success
    } else if FAILURE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Outcome::Failure
    } else {
        Outcome::Info
    };
    CommandResult {
        outcome,
        output: output.to_owned(),
    }
}

/// Success and failure counts over a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    /// Commands that succeeded (including informational output).
    pub success: usize,
    /// Commands that failed.
    pub failure: usize,
}

impl Tally {
    /// Whether every attempted command succeeded.
    pub const fn all_succeeded(&self) -> bool {
        self.failure == 0
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} succeeded, {} failed", self.success, self.failure)
    }
}

/// One unit of a grant plan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Step {
    /// Run a shell command and classify its output.
    Shell {
        /// Short description for progress lines.
        label: String,
        /// Command line.
        command: String,
    },
    /// Make sure `value` is in the `:`-separated settings list `key`,
    /// appending it if absent, then optionally set an enable flag.
    EnsureListed {
        /// Short description for progress lines.
        label: String,
        /// Settings namespace (`secure`, `global`, `system`).
        namespace: String,
        /// Settings key holding the list.
        key: String,
        /// Entry that must be present.
        value: String,
        /// `(key, value)` written after the list was updated.
        enable: Option<(String, String)>,
    },
}

impl Step {
    /// A plain shell step.
    pub fn shell(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self::Shell {
            label: label.into(),
            command: command.into(),
        }
    }

    /// Short description for progress lines.
    pub fn label(&self) -> &str {
        match self {
            Self::Shell { label, .. } | Self::EnsureListed { label, .. } => label,
        }
    }
}

/// Ordered steps executed over one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantPlan {
    /// Steps in execution order.
    steps: Vec<Step>,
}

impl GrantPlan {
    /// A plan from explicit steps.
    pub const fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// The standard plan for `config.package`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let pkg = config.package.trim();
        if pkg.is_empty() {
            return Err(Error::InvalidConfig("no target package configured".into()));
        }
        let pkg_q = shell_quote(pkg);

        let mut steps = Vec::new();
        for perm in &config.permissions {
            let short = perm.rsplit('.').next().unwrap_or(perm);
            steps.push(Step::shell(
                format!("grant {short}"),
                format!("pm grant {pkg_q} {}", shell_quote(perm)),
            ));
        }
        for op in &config.app_ops {
            steps.push(Step::shell(
                format!("allow {op}"),
                format!("appops set {pkg_q} {} allow", shell_quote(op)),
            ));
        }
        steps.push(Step::shell(
            "battery optimization exemption",
            format!("dumpsys deviceidle whitelist {}", shell_quote(&format!("+{pkg}"))),
        ));
        if let Some(service) = &config.accessibility_service {
            steps.push(Step::EnsureListed {
                label: "enable accessibility service".into(),
                namespace: "secure".into(),
                key: "enabled_accessibility_services".into(),
                value: service.clone(),
                enable: Some(("accessibility_enabled".into(), "1".into())),
            });
        }
        if let Some(listener) = &config.notification_listener {
            steps.push(Step::EnsureListed {
                label: "enable notification listener".into(),
                namespace: "secure".into(),
                key: "enabled_notification_listeners".into(),
                value: listener.clone(),
                enable: None,
            });
        }
        Ok(Self { steps })
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

/// Runs `plan` step by step, stopping early only on cancellation or a lost
/// connection. Command-level failures are counted and the run continues.
pub fn run_plan<S: Transport>(
    conn: &mut Connection<S>,
    plan: &GrantPlan,
    cancel: &CancelToken,
    sink: &EventSink,
) -> Result<Tally> {
    let mut tally = Tally::default();
    let total = plan.steps().len();

    for (i, step) in plan.steps().iter().enumerate() {
        if cancel.is_cancelled() {
            info!(done = i, total, "plan cancelled");
            conn.close();
            sink.log(format!("Cancelled after {i} of {total} steps ({tally})."));
            return Err(Error::Cancelled);
        }

        let prefix = format!("[{}/{total}] {}", i + 1, step.label());
        match run_step(conn, step) {
            Ok(result) => {
                if result.is_success() {
                    tally.success += 1;
                } else {
                    tally.failure += 1;
                    warn!(step = step.label(), output = %result.output, "step failed");
                }
                sink.log(describe(&prefix, &result));
            }
            Err(e @ (Error::StreamRejected { .. } | Error::PayloadTooLarge { .. })) => {
                tally.failure += 1;
                warn!(step = step.label(), "step failed: {e}");
                sink.log(format!("{prefix}: FAILED ({e})"));
            }
            Err(Error::Io(e)) => {
                tally.failure += 1;
                warn!(step = step.label(), "connection lost: {e}");
                sink.log(format!("{prefix}: FAILED (connection lost: {e})"));
                break;
            }
            Err(e) => return Err(e),
        }
    }

    sink.log(format!("Done: {tally}."));
    Ok(tally)
}

/// Renders one step's result as a progress line.
fn describe(prefix: &str, result: &CommandResult) -> String {
    match result.outcome {
        Outcome::Success => format!("{prefix}: OK"),
        Outcome::Info => format!("{prefix}: OK ({})", result.output),
        Outcome::Failure => format!("{prefix}: FAILED ({})", result.output),
    }
}

/// Executes one step.
fn run_step<S: Transport>(conn: &mut Connection<S>, step: &Step) -> Result<CommandResult> {
    match step {
        Step::Shell { command, .. } => Ok(classify(&conn.shell(command)?)),
        Step::EnsureListed {
            namespace,
            key,
            value,
            enable,
            ..
        } => {
            let current = classify(&conn.shell(&format!("settings get {namespace} {key}"))?);
            if current.outcome == Outcome::Failure {
                return Ok(current);
            }
            let mut entries: Vec<&str> = current
                .output
                .split(':')
                .filter(|e| !e.is_empty() && *e != "null")
                .collect();
            // A listed entry may still be switched off by the enable flag,
            // so the flag is written either way.
            let put = if entries.contains(&value.as_str()) {
                CommandResult {
                    outcome: Outcome::Info,
                    output: "already listed".into(),
                }
            } else {
                entries.push(value);
                let updated = entries.join(":");
                classify(&conn.shell(&format!(
                    "settings put {namespace} {key} {}",
                    shell_quote(&updated)
                ))?)
            };
            if put.outcome == Outcome::Failure {
                return Ok(put);
            }
            match enable {
                Some((flag, on)) => Ok(classify(&conn.shell(&format!(
                    "settings put {namespace} {flag} {}",
                    shell_quote(on)
                ))?)),
                None => Ok(put),
            }
        }
    }
}

/// Installs the package at `path` (a path on the device).
pub fn install_package<S: Transport>(
    conn: &mut Connection<S>,
    path: &str,
    config: &Config,
    sink: &EventSink,
) -> Result<bool> {
    sink.log(format!("Installing {path}..."));
    let output = {
        let mut conn = conn.widen_read_timeout(config.install_timeout)?;
        conn.shell(&format!("pm install -r -t {}", shell_quote(path)))?
    };
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        sink.log(line);
    }
    let ok = output.contains("Success");
    sink.log(if ok { "Install succeeded." } else { "Install failed." });
    Ok(ok)
}

/// Runs the script at `path` on the device, streaming its output.
pub fn run_script<S: Transport>(
    conn: &mut Connection<S>,
    path: &str,
    config: &Config,
    sink: &EventSink,
) -> Result<bool> {
    sink.log(format!("Running {path}..."));
    let outcome = {
        let mut conn = conn.widen_read_timeout(config.script_timeout)?;
        conn.shell_streaming(
            &format!("sh {}", shell_quote(path)),
            &config.error_marker,
            |line| sink.log(line),
        )?
    };
    sink.log(if outcome.success {
        format!("Script finished ({} lines).", outcome.lines)
    } else {
        format!("Script reported errors ({} lines).", outcome.lines)
    });
    Ok(outcome.success)
}

/// Quotes `arg` for the device's `sh`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"._-/:+=@,".contains(&b))
    {
        return arg.to_owned();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}
