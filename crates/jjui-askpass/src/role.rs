//! Decides whether this process is the application or an askpass stub.
//!
//! ## Matching rule
//!
//! A process is a stub when both hold:
//!
//! - [`SOCKET_ENV`] is set to a non-empty value, and
//! - exactly one argument follows the program name.
//!
//! OpenSSH and git call their askpass helper with the prompt as the only
//! argument, and only transport subprocesses spawned by the primary process
//! carry [`SOCKET_ENV`]. Every other shape is [`Role::Primary`].

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::env::{DEFAULT_CONNECT_TIMEOUT, LABEL_ENV, SOCKET_ENV, TIMEOUT_ENV};

/// What this process instance is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// The long-lived interactive application.
    Primary,
    /// A short-lived prompt helper spawned by a transport subprocess.
    Stub(StubInvocation),
}

/// Everything a stub needs, taken from its argv and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubInvocation {
    pub prompt: String,
    pub socket: PathBuf,
    pub label: Option<String>,
    pub connect_timeout: Duration,
}

impl Role {
    /// Detect the role of the current process.
    pub fn from_process() -> Self {
        Self::detect(std::env::args_os(), |key| std::env::var_os(key))
    }

    /// Detect a role from an argument list (program name first) and an
    /// environment lookup. Performs no I/O.
    pub fn detect<I, S, F>(args: I, env: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
        F: Fn(&str) -> Option<OsString>,
    {
        let Some(socket) = env(SOCKET_ENV).filter(|v| !v.is_empty()) else {
            return Role::Primary;
        };

        let mut args = args.into_iter().skip(1);
        let (Some(prompt), None) = (args.next(), args.next()) else {
            return Role::Primary;
        };

        let label = env(LABEL_ENV)
            .map(|v| v.to_string_lossy().into_owned())
            .filter(|v| !v.is_empty());
        let connect_timeout = env(TIMEOUT_ENV)
            .and_then(|v| v.to_str().and_then(|s| s.trim().parse::<u64>().ok()))
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        Role::Stub(StubInvocation {
            prompt: prompt.into().to_string_lossy().into_owned(),
            socket: PathBuf::from(socket),
            label,
            connect_timeout,
        })
    }

    pub fn is_stub(&self) -> bool {
        matches!(self, Role::Stub(_))
    }
}
