//! Test utilities for driving the relay end to end.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use jjui_askpass::{
    AskpassServer, PasswordMsg, PasswordPrompt, StubExit, StubInvocation, UiBridge, run_stub,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// A started relay with the UI side of its bridge.
pub struct Relay {
    pub server: Arc<AskpassServer>,
    pub ui_rx: mpsc::UnboundedReceiver<PasswordMsg>,
    pub serve_task: JoinHandle<()>,
}

pub async fn start_relay() -> Result<Relay> {
    let server = Arc::new(AskpassServer::create("jjui-test")?);
    server.start()?;

    let (ui_tx, ui_rx) = mpsc::unbounded_channel::<PasswordMsg>();
    let bridge = Arc::new(UiBridge::new(ui_tx));
    let serve_task = tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            server.serve(bridge).await.expect("serve failed");
        }
    });

    Ok(Relay {
        server,
        ui_rx,
        serve_task,
    })
}

/// Stub invocation pointing at `server`.
pub fn invocation(server: &AskpassServer, prompt: &str) -> StubInvocation {
    StubInvocation {
        prompt: prompt.to_string(),
        socket: server.socket_path().to_path_buf(),
        label: None,
        connect_timeout: Duration::from_millis(500),
    }
}

/// Run a stub in the background, capturing its stdout.
pub fn spawn_stub(invocation: StubInvocation) -> JoinHandle<(StubExit, Vec<u8>)> {
    tokio::spawn(async move {
        let mut out = Vec::new();
        let exit = run_stub(&invocation, &mut out).await;
        (exit, out)
    })
}

pub async fn join_stub(handle: JoinHandle<(StubExit, Vec<u8>)>) -> Result<(StubExit, Vec<u8>)> {
    tokio::time::timeout(WAIT, handle)
        .await
        .context("stub did not finish")?
        .context("stub task panicked")
}

/// Next message posted to the UI.
pub async fn next_ui_msg(rx: &mut mpsc::UnboundedReceiver<PasswordMsg>) -> Result<PasswordMsg> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .context("no UI message")?
        .context("UI channel closed")
}

/// Next message, which must be a show.
pub async fn next_prompt(rx: &mut mpsc::UnboundedReceiver<PasswordMsg>) -> Result<PasswordPrompt> {
    match next_ui_msg(rx).await? {
        PasswordMsg::Show(prompt) => Ok(prompt),
        PasswordMsg::Hide => bail!("expected a show message, got hide"),
    }
}

/// Wait until the server has `n` prompts in flight.
pub async fn wait_for_pending(server: &AskpassServer, n: usize) -> Result<()> {
    tokio::time::timeout(WAIT, async {
        while server.pending().len() != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .with_context(|| format!("never reached {n} pending prompt(s)"))
}
