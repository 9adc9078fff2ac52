//! Running `jj` for the UI.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, anyhow};
use jjui_askpass::AskpassEnv;
use tokio::process::Command;
use tracing::{debug, instrument};

/// A `jj` invocation the UI knows how to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JjOp {
    Log { revset: String, limit: usize },
    GitFetch,
    GitPush,
}

impl JjOp {
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            Self::Log { revset, limit } => {
                args.push("log".to_string());
                if !revset.is_empty() {
                    args.push("-r".to_string());
                    args.push(revset.clone());
                }
                if *limit > 0 {
                    args.push("--limit".to_string());
                    args.push(limit.to_string());
                }
            }
            Self::GitFetch => args.extend(["git".to_string(), "fetch".to_string()]),
            Self::GitPush => args.extend(["git".to_string(), "push".to_string()]),
        }
        args.push("--color".to_string());
        args.push("never".to_string());
        args
    }

    /// Whether the op talks to a remote and may need credentials.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::GitFetch | Self::GitPush)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Log { .. } => "jj log",
            Self::GitFetch => "jj git fetch",
            Self::GitPush => "jj git push",
        }
    }
}

/// Captured result of a finished `jj` process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JjOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `jj` in a repository, carrying the askpass environment when set.
#[derive(Debug, Clone)]
pub struct JjRunner {
    root: PathBuf,
    askpass: Option<AskpassEnv>,
}

impl JjRunner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            askpass: None,
        }
    }

    pub fn with_askpass(mut self, env: AskpassEnv) -> Self {
        self.askpass = Some(env);
        self
    }

    pub fn has_askpass(&self) -> bool {
        self.askpass.is_some()
    }

    fn command(&self, op: &JjOp) -> Command {
        let mut cmd = Command::new("jj");
        cmd.args(op.args())
            .current_dir(&self.root)
            // No terminal for ssh to fall back on.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Only remote ops can prompt for credentials.
        if op.is_remote()
            && let Some(ref env) = self.askpass
        {
            env.apply_tokio(&mut cmd);
        }
        cmd
    }

    #[instrument(skip(self, op), fields(op = op.describe()))]
    pub async fn run(&self, op: &JjOp) -> Result<JjOutput> {
        let mut cmd = self.command(op);
        debug!("Running {:?}", cmd.as_std());
        let output = cmd
            .output()
            .await
            .with_context(|| format!("running {}", op.describe()))?;

        Ok(JjOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        })
    }

    /// `revsets.log` from jj's own configuration, empty when unset.
    pub fn default_revset(&self) -> String {
        let output = std::process::Command::new("jj")
            .args(["config", "get", "revsets.log"])
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            }
            Ok(_) => String::new(),
            Err(e) => {
                debug!("jj config get revsets.log failed: {}", e);
                String::new()
            }
        }
    }
}

/// Workspace root containing `location`, as reported by `jj root`.
pub fn root_dir(location: &Path) -> Result<PathBuf> {
    let output = std::process::Command::new("jj")
        .arg("root")
        .current_dir(location)
        .stdin(Stdio::null())
        .output()
        .context("running jj root (is jj installed?)")?;

    if !output.status.success() {
        return Err(anyhow!("{}", String::from_utf8_lossy(&output.stderr).trim()));
    }
    Ok(PathBuf::from(String::from_utf8_lossy(&output.stdout).trim()))
}

/// Revset precedence: command line, then config, then jj's default.
pub fn resolve_revset(
    flag: Option<&str>,
    configured: &str,
    jj_default: impl FnOnce() -> String,
) -> String {
    match flag.filter(|r| !r.is_empty()) {
        Some(revset) => revset.to_string(),
        None if !configured.is_empty() => configured.to_string(),
        None => jj_default(),
    }
}
