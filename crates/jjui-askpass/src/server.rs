//! Relay server owned by the primary process.
//!
//! Lifecycle: [`AskpassServer::create`] picks a socket path in a private
//! temporary directory, [`start`](AskpassServer::start) binds it,
//! [`serve`](AskpassServer::serve) runs the accept loop and
//! [`close`](AskpassServer::close) stops it and cancels every pending prompt.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::PromptHandler;
use crate::env::{AskpassEnv, DEFAULT_CONNECT_TIMEOUT};
use crate::error::{AskpassError, AskpassResult};
use crate::pending::PendingRequests;
use crate::protocol::{
    AskpassRequest, AskpassResponse, PromptOutcome, RequestId, read_message, write_message,
};

/// File name of the relay socket inside the server's directory.
const SOCKET_NAME: &str = "askpass.sock";

/// How long a connected stub gets to send its request line.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How long a handler may keep running after its prompt was cancelled.
const HANDLER_GRACE: Duration = Duration::from_millis(500);

/// A connection whose request line has been read.
struct Incoming {
    /// Accept order, for dispatching requests that are ready together.
    seq: u64,
    request: AskpassRequest,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

enum ServerState {
    Unstarted,
    Listening(StdUnixListener),
    Serving,
    Closed,
}

/// Server handle for the askpass relay.
pub struct AskpassServer {
    name: String,
    program: PathBuf,
    socket_path: PathBuf,
    connect_timeout: Duration,
    dir: Mutex<Option<TempDir>>,
    state: Mutex<ServerState>,
    pending: Arc<PendingRequests>,
    shutdown: CancellationToken,
}

impl AskpassServer {
    /// Create an unstarted server.
    ///
    /// `name` labels requests whose stub did not send a label. The socket
    /// path is chosen now so it can be published before the server listens.
    pub fn create(name: impl Into<String>) -> AskpassResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("jjui-askpass-")
            .tempdir()?;
        // tempfile already creates it 0700; make it explicit.
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
        let socket_path = dir.path().join(SOCKET_NAME);
        let program = std::env::current_exe()?;

        debug!("Askpass relay address chosen: {:?}", socket_path);

        Ok(Self {
            name: name.into(),
            program,
            socket_path,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dir: Mutex::new(Some(dir)),
            state: Mutex::new(ServerState::Unstarted),
            pending: Arc::new(PendingRequests::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Override the executable published as the askpass helper.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Override the connect bound published to stubs.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Environment to apply to transport subprocesses.
    pub fn env(&self) -> AskpassEnv {
        AskpassEnv::new(&self.program, &self.socket_path, &self.name)
            .with_connect_timeout(self.connect_timeout)
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_listening(&self) -> bool {
        matches!(
            *self.lock_state(),
            ServerState::Listening(_) | ServerState::Serving
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.lock_state(), ServerState::Closed)
    }

    /// Bind the socket. Connections queue until [`serve`](Self::serve) runs.
    pub fn start(&self) -> AskpassResult<()> {
        let mut state = self.lock_state();
        match *state {
            ServerState::Unstarted => {}
            ServerState::Closed => return Err(AskpassError::Closed),
            ServerState::Listening(_) | ServerState::Serving => {
                return Err(AskpassError::AlreadyStarted);
            }
        }

        let listener =
            StdUnixListener::bind(&self.socket_path).map_err(|source| AskpassError::Bind {
                path: self.socket_path.clone(),
                source,
            })?;
        listener.set_nonblocking(true)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;

        info!("Askpass relay listening on {:?}", self.socket_path);
        *state = ServerState::Listening(listener);
        Ok(())
    }

    /// Run the accept loop until [`close`](Self::close) is called.
    ///
    /// Every connection reads its request on its own task, so a silent peer
    /// holds up nobody. Requests are handed to `handler` on this loop in the
    /// order they arrive (accept order among those ready together), then
    /// waited on in their own task. A bad connection is logged and dropped.
    pub async fn serve<H: PromptHandler>(&self, handler: Arc<H>) -> AskpassResult<()> {
        let std_listener = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, ServerState::Serving) {
                ServerState::Listening(listener) => listener,
                ServerState::Unstarted => {
                    *state = ServerState::Unstarted;
                    return Err(AskpassError::NotStarted);
                }
                ServerState::Serving => return Err(AskpassError::AlreadyStarted),
                ServerState::Closed => {
                    *state = ServerState::Closed;
                    return Err(AskpassError::Closed);
                }
            }
        };
        let listener = UnixListener::from_std(std_listener)?;
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<Incoming>();
        let mut seq: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(first) = ready_rx.recv() => {
                    let mut batch = vec![first];
                    while let Ok(next) = ready_rx.try_recv() {
                        batch.push(next);
                    }
                    batch.sort_by_key(|incoming| incoming.seq);
                    for incoming in batch {
                        self.dispatch(incoming, handler.as_ref());
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        seq += 1;
                        debug!("New askpass connection #{}", seq);
                        tokio::spawn(read_request(
                            stream,
                            seq,
                            ready_tx.clone(),
                            self.shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Askpass accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        // The registry is closed by now, so these are answered as cancelled.
        ready_rx.close();
        while let Ok(incoming) = ready_rx.try_recv() {
            self.dispatch(incoming, handler.as_ref());
        }

        info!("Askpass relay stopped");
        Ok(())
    }

    /// Register a read request, start its prompt and spawn the tasks that
    /// answer it.
    fn dispatch<H: PromptHandler>(&self, incoming: Incoming, handler: &H) {
        let Incoming {
            seq,
            request,
            reader,
            writer,
        } = incoming;

        let id = request.id.unwrap_or_default();
        let label = if request.label.is_empty() {
            self.name.clone()
        } else {
            request.label
        };

        let mut ticket = match self.pending.register(id, label.as_str(), request.prompt.as_str()) {
            Ok(ticket) => ticket,
            Err(AskpassError::Closed) => {
                tokio::spawn(async move {
                    let mut writer = writer;
                    let _ = write_message(&mut writer, &AskpassResponse::Cancelled).await;
                });
                return;
            }
            Err(e) => {
                warn!("Dropping askpass connection #{}: {}", seq, e);
                return;
            }
        };
        debug!(
            "Askpass request {} (#{}) from {}: {:?}",
            id, seq, label, request.prompt
        );

        let mut answer = handler.prompt(&label, &request.prompt, ticket.cancel.clone());
        let cancel = ticket.cancel.clone();
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                secret = &mut answer => PromptOutcome::from_secret(secret),
                _ = expire_after_cancel(&cancel) => {
                    warn!("Askpass handler ignored cancellation of request {}", id);
                    PromptOutcome::Cancelled
                }
            };
            pending.resolve(id, outcome);
        });

        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let mut reader = reader;
            let mut writer = writer;
            let outcome = tokio::select! {
                outcome = ticket.wait() => outcome,
                _ = wait_for_hangup(&mut reader) => {
                    debug!("Askpass client for request {} hung up", id);
                    pending.cancel(id);
                    pending.remove(id);
                    return;
                }
            };
            pending.remove(id);

            let response = AskpassResponse::from(outcome);
            if let Err(e) = write_message(&mut writer, &response).await {
                warn!("Failed to answer askpass request {}: {}", id, e);
            }
        });
    }

    /// Cancel one pending prompt. An answer the user already gave still wins.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.pending.cancel(id)
    }

    /// Stop accepting and cancel every pending prompt.
    ///
    /// Each stub still waiting gets an explicit answer: the secret if the
    /// user had already submitted it, otherwise a cancellation. Safe to call
    /// more than once. Returns how many prompts were still unresolved.
    pub fn close(&self) -> usize {
        let previous = std::mem::replace(&mut *self.lock_state(), ServerState::Closed);
        if matches!(previous, ServerState::Closed) {
            return 0;
        }
        drop(previous);

        let cancelled = self.pending.cancel_all();
        self.shutdown.cancel();

        let dir = self.dir.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(dir) = dir
            && let Err(e) = dir.close()
        {
            warn!("Failed to remove askpass directory: {}", e);
        }

        info!("Askpass relay closed ({} pending prompt(s) cancelled)", cancelled);
        cancelled
    }
}

impl Drop for AskpassServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read one request line and queue it for the accept loop.
async fn read_request(
    stream: UnixStream,
    seq: u64,
    ready: mpsc::UnboundedSender<Incoming>,
    shutdown: CancellationToken,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let read = tokio::select! {
        _ = shutdown.cancelled() => {
            let _ = write_message(&mut writer, &AskpassResponse::Cancelled).await;
            return;
        }
        read = tokio::time::timeout(
            REQUEST_READ_TIMEOUT,
            read_message::<_, AskpassRequest>(&mut reader),
        ) => read,
    };
    let request = match read {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => {
            debug!("Askpass connection #{} closed before sending a request", seq);
            return;
        }
        Ok(Err(e)) => {
            warn!("Dropping askpass connection #{}: {}", seq, e);
            return;
        }
        Err(_) => {
            warn!(
                "Dropping askpass connection #{}: no request within {:?}",
                seq, REQUEST_READ_TIMEOUT
            );
            return;
        }
    };

    let incoming = Incoming {
        seq,
        request,
        reader,
        writer,
    };
    if let Err(mpsc::error::SendError(mut incoming)) = ready.send(incoming) {
        let _ = write_message(&mut incoming.writer, &AskpassResponse::Cancelled).await;
    }
}

/// Resolves once `cancel` has fired and the handler grace period is over.
async fn expire_after_cancel(cancel: &CancellationToken) {
    cancel.cancelled().await;
    tokio::time::sleep(HANDLER_GRACE).await;
}

/// Resolves when the peer closes its end.
async fn wait_for_hangup<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut buf = [0u8; 64];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::PromptFuture;
    use crate::protocol::Secret;

    struct FixedAnswer(&'static str);

    impl PromptHandler for FixedAnswer {
        fn prompt(&self, _label: &str, _prompt: &str, _cancel: CancellationToken) -> PromptFuture {
            let answer = self.0;
            Box::pin(async move { Some(Secret::new(answer)) })
        }
    }

    /// Never answers, even when cancelled.
    struct Stuck;

    impl PromptHandler for Stuck {
        fn prompt(&self, _label: &str, _prompt: &str, _cancel: CancellationToken) -> PromptFuture {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn test_serve_answers_request() {
        let server = Arc::new(AskpassServer::create("jjui").unwrap());
        server.start().unwrap();
        let serve = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(Arc::new(FixedAnswer("hunter2"))).await }
        });

        let outcome = crate::AskpassClient::new(server.socket_path())
            .request("Password: ")
            .await
            .unwrap();
        assert_eq!(outcome, PromptOutcome::Answered(Secret::new("hunter2")));

        server.close();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_handler_that_ignores_cancel() {
        let server = Arc::new(AskpassServer::create("jjui").unwrap());
        server.start().unwrap();
        let serve = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(Arc::new(Stuck)).await }
        });

        let client = crate::AskpassClient::new(server.socket_path());
        let request = tokio::spawn(async move { client.request("Password: ").await });
        while server.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(server.close(), 1);
        let outcome = tokio::time::timeout(Duration::from_secs(5), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, PromptOutcome::Cancelled);
        serve.await.unwrap().unwrap();
    }

    #[test]
    fn test_create_does_not_listen() {
        let server = AskpassServer::create("jjui").unwrap();
        assert!(!server.is_listening());
        assert!(!server.socket_path().exists());
        assert!(server.socket_path().ends_with(SOCKET_NAME));
    }

    #[test]
    fn test_start_twice_fails() {
        let server = AskpassServer::create("jjui").unwrap();
        server.start().unwrap();
        assert!(server.socket_path().exists());
        assert!(matches!(server.start(), Err(AskpassError::AlreadyStarted)));
    }

    #[test]
    fn test_start_reports_bind_error() {
        let server = AskpassServer::create("jjui").unwrap();
        std::fs::write(server.socket_path(), b"occupied").unwrap();
        assert!(matches!(server.start(), Err(AskpassError::Bind { .. })));
    }

    #[test]
    fn test_socket_is_private() {
        let server = AskpassServer::create("jjui").unwrap();
        server.start().unwrap();
        let mode = std::fs::metadata(server.socket_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[tokio::test]
    async fn test_serve_before_start_fails() {
        let server = AskpassServer::create("jjui").unwrap();
        let err = server.serve(Arc::new(FixedAnswer("x"))).await.unwrap_err();
        assert!(matches!(err, AskpassError::NotStarted));
    }

    #[test]
    fn test_close_removes_socket_and_is_idempotent() {
        let server = AskpassServer::create("jjui").unwrap();
        server.start().unwrap();
        let path = server.socket_path().to_path_buf();

        assert_eq!(server.close(), 0);
        assert!(!path.exists());
        assert!(server.is_closed());
        assert_eq!(server.close(), 0);
        assert!(matches!(server.start(), Err(AskpassError::Closed)));
    }

    #[test]
    fn test_env_points_at_socket() {
        let server = AskpassServer::create("jjui")
            .unwrap()
            .with_program("/usr/local/bin/jjui");
        let env = server.env();
        assert_eq!(env.socket(), server.socket_path());
        assert_eq!(env.program(), Path::new("/usr/local/bin/jjui"));
    }
}
