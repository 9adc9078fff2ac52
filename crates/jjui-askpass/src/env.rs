//! Address handoff from the primary process to transport subprocesses.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Relay socket path. Its presence marks a stub invocation.
pub const SOCKET_ENV: &str = "JJUI_ASKPASS_SOCKET";
/// Label the stub attaches to its request.
pub const LABEL_ENV: &str = "JJUI_ASKPASS_LABEL";
/// Connect bound for the stub, in milliseconds.
pub const TIMEOUT_ENV: &str = "JJUI_ASKPASS_TIMEOUT_MS";
/// Enables stderr logging inside the stub.
pub const DEBUG_ENV: &str = "JJUI_ASKPASS_DEBUG";

/// Default bound for a stub's connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment a transport subprocess needs to call back into the relay.
///
/// Built by [`AskpassServer::env`](crate::AskpassServer::env) and applied to
/// each `Command` before it is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskpassEnv {
    program: PathBuf,
    socket: PathBuf,
    label: String,
    connect_timeout: Duration,
}

impl AskpassEnv {
    pub fn new(
        program: impl Into<PathBuf>,
        socket: impl Into<PathBuf>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            socket: socket.into(),
            label: label.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Executable the transport should call as its askpass helper.
    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Variables to set on the child.
    ///
    /// `SSH_ASKPASS_REQUIRE=force` makes OpenSSH use the helper even when a
    /// terminal is attached; `GIT_ASKPASS` covers git's own HTTPS prompts.
    pub fn vars(&self) -> Vec<(&'static str, OsString)> {
        let program = self.program.clone().into_os_string();
        vec![
            ("SSH_ASKPASS", program.clone()),
            ("SSH_ASKPASS_REQUIRE", OsString::from("force")),
            ("GIT_ASKPASS", program),
            (SOCKET_ENV, self.socket.clone().into_os_string()),
            (LABEL_ENV, OsString::from(&self.label)),
            (
                TIMEOUT_ENV,
                OsString::from(self.connect_timeout.as_millis().to_string()),
            ),
        ]
    }

    /// Apply to a std command.
    pub fn apply(&self, cmd: &mut std::process::Command) {
        cmd.envs(self.vars());
        if needs_display() {
            cmd.env("DISPLAY", ":0");
        }
    }

    /// Apply to a tokio command.
    pub fn apply_tokio(&self, cmd: &mut tokio::process::Command) {
        cmd.envs(self.vars());
        if needs_display() {
            cmd.env("DISPLAY", ":0");
        }
    }
}

/// OpenSSH older than 8.4 ignores `SSH_ASKPASS` unless `DISPLAY` is set.
///
/// Newer versions honour `SSH_ASKPASS_REQUIRE=force` without it. The dummy
/// value can make X11-aware tools in the child try to connect, so callers
/// should apply this environment only to commands that may prompt.
fn needs_display() -> bool {
    std::env::var_os("DISPLAY").is_none_or(|v| v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vars_publish_socket_and_helper() {
        let env = AskpassEnv::new("/usr/bin/jjui", "/tmp/x/askpass.sock", "jjui")
            .with_connect_timeout(Duration::from_millis(750));
        let vars = env.vars();
        let get = |key: &str| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string_lossy().into_owned())
        };

        assert_eq!(get("SSH_ASKPASS").as_deref(), Some("/usr/bin/jjui"));
        assert_eq!(get("SSH_ASKPASS_REQUIRE").as_deref(), Some("force"));
        assert_eq!(get(SOCKET_ENV).as_deref(), Some("/tmp/x/askpass.sock"));
        assert_eq!(get(LABEL_ENV).as_deref(), Some("jjui"));
        assert_eq!(get(TIMEOUT_ENV).as_deref(), Some("750"));
    }

    #[test]
    fn test_apply_sets_command_env() {
        let env = AskpassEnv::new("/bin/jjui", "/tmp/s.sock", "jjui");
        let mut cmd = std::process::Command::new("true");
        env.apply(&mut cmd);
        let socket = cmd
            .get_envs()
            .find(|(k, _)| *k == SOCKET_ENV)
            .and_then(|(_, v)| v.map(|v| v.to_os_string()));
        assert_eq!(socket, Some(OsString::from("/tmp/s.sock")));
    }
}
