//! Prompt stub client.
//!
//! Runs when the binary was started as an askpass helper. It forwards its
//! prompt to the relay, waits for the answer and prints it for the caller:
//!
//! | exit | stdout | meaning                                        |
//! |------|--------|------------------------------------------------|
//! | 0    | secret | the user answered                              |
//! | 1    | empty  | the prompt was dismissed or the relay closed it|
//! | 2    | empty  | the relay was unreachable or hung up           |

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::BufReader;
use tokio::net::UnixStream;

use crate::env::DEFAULT_CONNECT_TIMEOUT;
use crate::error::{AskpassError, AskpassResult};
use crate::protocol::{AskpassRequest, AskpassResponse, PromptOutcome, read_message, write_message};
use crate::role::StubInvocation;

/// How a stub run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubExit {
    Answered,
    Declined,
    Unavailable,
}

impl StubExit {
    pub fn code(self) -> i32 {
        match self {
            Self::Answered => 0,
            Self::Declined => 1,
            Self::Unavailable => 2,
        }
    }
}

/// Client side of the relay.
#[derive(Debug, Clone)]
pub struct AskpassClient {
    socket_path: PathBuf,
    label: Option<String>,
    connect_timeout: Duration,
}

impl AskpassClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            label: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn from_invocation(invocation: &StubInvocation) -> Self {
        Self {
            socket_path: invocation.socket.clone(),
            label: invocation.label.clone(),
            connect_timeout: invocation.connect_timeout,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn connect(&self) -> AskpassResult<UnixStream> {
        match tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
            .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(AskpassError::Connect {
                path: self.socket_path.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(AskpassError::ConnectTimeout {
                path: self.socket_path.clone(),
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Send a prompt and wait for the user's answer.
    ///
    /// There is no timeout once connected: a human is typing.
    pub async fn request(&self, prompt: &str) -> AskpassResult<PromptOutcome> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();

        let request = AskpassRequest::new(self.label.clone().unwrap_or_default(), prompt);
        debug!("Sending askpass request {:?}", request.id);
        write_message(&mut write_half, &request).await?;

        let mut reader = BufReader::new(read_half);
        match read_message::<_, AskpassResponse>(&mut reader).await? {
            Some(response) => Ok(response.into()),
            None => {
                debug!("Relay hung up without answering");
                Err(AskpassError::Closed)
            }
        }
    }
}

/// Run the stub: ask the relay, write the secret to `out`.
pub async fn run_stub<W: Write>(invocation: &StubInvocation, out: &mut W) -> StubExit {
    let client = AskpassClient::from_invocation(invocation);
    match client.request(&invocation.prompt).await {
        Ok(PromptOutcome::Answered(secret)) => {
            match out.write_all(secret.expose()).and_then(|()| out.flush()) {
                Ok(()) => StubExit::Answered,
                Err(e) => {
                    warn!("Failed to write secret to stdout: {}", e);
                    StubExit::Unavailable
                }
            }
        }
        Ok(PromptOutcome::Cancelled) => {
            debug!("Askpass prompt was cancelled");
            StubExit::Declined
        }
        Err(e) => {
            eprintln!("jjui askpass: {e}");
            StubExit::Unavailable
        }
    }
}

/// Entry point for the stub role. Returns the process exit status.
pub fn run_stub_blocking(invocation: &StubInvocation) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("jjui askpass: failed to start runtime: {e}");
            return StubExit::Unavailable.code();
        }
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    runtime.block_on(run_stub(invocation, &mut out)).code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_eq!(StubExit::Answered.code(), 0);
        assert_ne!(StubExit::Declined.code(), 0);
        assert_ne!(StubExit::Unavailable.code(), 0);
        assert_ne!(StubExit::Declined.code(), StubExit::Unavailable.code());
    }

    #[tokio::test]
    async fn test_missing_socket_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = AskpassClient::new(dir.path().join("nothing.sock"))
            .with_connect_timeout(Duration::from_millis(200));
        let err = client.request("Password: ").await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_relay_hangup_reports_closed() {
        use tokio::io::AsyncBufReadExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("askpass.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).await.unwrap();
        });

        let invocation = StubInvocation {
            prompt: "Password: ".to_string(),
            socket: path.clone(),
            label: None,
            connect_timeout: Duration::from_millis(500),
        };
        let err = AskpassClient::from_invocation(&invocation)
            .request("Password: ")
            .await
            .unwrap_err();
        assert!(matches!(err, AskpassError::Closed));
        relay.await.unwrap();

        let listener = tokio::net::UnixListener::bind(dir.path().join("again.sock")).unwrap();
        let invocation = StubInvocation {
            socket: dir.path().join("again.sock"),
            ..invocation
        };
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let mut out = Vec::new();
        assert_eq!(run_stub(&invocation, &mut out).await, StubExit::Unavailable);
        assert!(out.is_empty());
    }
}
