//! SSH askpass hijack and credential relay.
//!
//! When `jj` talks to a remote over ssh and ssh needs a passphrase, ssh runs
//! the program named in `SSH_ASKPASS`. jjui points that variable at its own
//! executable, so the passphrase prompt comes back to the running UI instead
//! of a terminal jjui does not own.
//!
//! ## Architecture
//!
//! ```text
//! jjui (primary)                          ssh
//!   │  AskpassServer::env() ─► jj ─► ─────┤
//!   │                                     ▼
//!   │                               jjui "Enter passphrase..."  (stub)
//!   │                                     │ Role::detect() == Stub
//!   ▼                                     │
//! AskpassServer ◄── unix socket ──── AskpassClient
//!   │  PromptHandler::prompt()            ▲
//!   ▼                                     │ secret on stdout, exit 0
//! UiBridge ─► PasswordMsg::Show ─► UI loop (PasswordOverlay)
//!          ◄─ PasswordReply ◄──────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! match Role::from_process() {
//!     Role::Stub(invocation) => std::process::exit(run_stub_blocking(&invocation)),
//!     Role::Primary => {}
//! }
//!
//! let server = Arc::new(AskpassServer::create("jjui")?);
//! server.start()?;
//! server.env().apply_tokio(&mut jj_command);
//! tokio::spawn({
//!     let server = Arc::clone(&server);
//!     async move { server.serve(Arc::new(UiBridge::new(ui_tx))).await }
//! });
//! // ...
//! server.close();
//! ```

mod bridge;
mod client;
mod env;
mod error;
mod overlay;
mod pending;
mod protocol;
mod role;
mod server;

pub use bridge::{
    FALLBACK_PROMPT, PasswordMsg, PasswordPrompt, PasswordReply, PromptFuture, PromptHandler,
    UiBridge, UiSink, normalize_prompt,
};
pub use client::{AskpassClient, StubExit, run_stub, run_stub_blocking};
pub use env::{
    AskpassEnv, DEBUG_ENV, DEFAULT_CONNECT_TIMEOUT, LABEL_ENV, SOCKET_ENV, TIMEOUT_ENV,
};
pub use error::{AskpassError, AskpassResult};
pub use overlay::{OverlayState, PasswordOverlay};
pub use pending::{PendingInfo, PendingRequests, PendingTicket};
pub use protocol::{
    AskpassRequest, AskpassResponse, MAX_MESSAGE_BYTES, PromptOutcome, RequestId, Secret,
    read_message, write_message,
};
pub use role::{Role, StubInvocation};
pub use server::AskpassServer;
