//! Bridge between the relay server and the UI event loop.
//!
//! The relay never touches UI state. It calls [`PromptHandler::prompt`] once
//! per request, in arrival order, and the [`UiBridge`] turns that into two
//! messages the UI understands:
//!
//! - [`PasswordMsg::Show`] carries the caption and a write-once
//!   [`PasswordReply`] for the answer.
//! - [`PasswordMsg::Hide`] tells the UI to drop prompts whose requester has
//!   gone away.

use std::future::Future;
use std::pin::Pin;

use log::debug;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::protocol::Secret;

/// Caption used when the transport sends a blank prompt.
pub const FALLBACK_PROMPT: &str = "ssh-askpass: ";

/// Future returned by a prompt handler.
pub type PromptFuture = Pin<Box<dyn Future<Output = Option<Secret>> + Send + 'static>>;

/// Answers prompts on behalf of the relay server.
pub trait PromptHandler: Send + Sync + 'static {
    /// Start a prompt.
    ///
    /// Called on the accept loop, one request at a time and in arrival order,
    /// so it must not block. Anything order-sensitive (posting the prompt to
    /// the UI) happens here; the returned future waits for the answer. It
    /// resolves to `None` when the prompt was dismissed or `cancel` fired
    /// first. An answer given before `cancel` fired must still be returned.
    fn prompt(&self, label: &str, prompt: &str, cancel: CancellationToken) -> PromptFuture;
}

/// Write-once handle the UI uses to answer a prompt.
///
/// Dropping it without calling [`submit`](Self::submit) dismisses the prompt.
#[derive(Debug)]
pub struct PasswordReply(oneshot::Sender<Secret>);

impl PasswordReply {
    /// Deliver the secret. Returns `false` when the requester is gone.
    pub fn submit(self, secret: Secret) -> bool {
        self.0.send(secret).is_ok()
    }

    /// Whether the requester stopped waiting.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// A prompt to show in the password overlay.
#[derive(Debug)]
pub struct PasswordPrompt {
    pub label: String,
    pub prompt: String,
    pub reply: PasswordReply,
}

impl PasswordPrompt {
    /// Build a prompt and the receiver its answer arrives on.
    pub fn new(
        label: impl Into<String>,
        prompt: impl Into<String>,
    ) -> (Self, oneshot::Receiver<Secret>) {
        let (tx, rx) = oneshot::channel();
        let prompt = Self {
            label: label.into(),
            prompt: prompt.into(),
            reply: PasswordReply(tx),
        };
        (prompt, rx)
    }
}

/// Messages the relay injects into the UI's message stream.
#[derive(Debug)]
pub enum PasswordMsg {
    Show(PasswordPrompt),
    Hide,
}

/// Where the bridge posts its messages.
pub trait UiSink: Clone + Send + Sync + 'static {
    fn send(&self, msg: PasswordMsg);
}

impl<M> UiSink for mpsc::UnboundedSender<M>
where
    M: From<PasswordMsg> + Send + 'static,
{
    fn send(&self, msg: PasswordMsg) {
        if mpsc::UnboundedSender::send(self, M::from(msg)).is_err() {
            debug!("UI loop is gone, dropping password message");
        }
    }
}

/// Replace an all-whitespace prompt with [`FALLBACK_PROMPT`].
pub fn normalize_prompt(prompt: &str) -> String {
    if prompt.chars().all(char::is_whitespace) {
        FALLBACK_PROMPT.to_string()
    } else {
        prompt.to_string()
    }
}

/// [`PromptHandler`] that asks the user through the UI's password overlay.
#[derive(Clone)]
pub struct UiBridge<S> {
    sink: S,
}

impl<S: UiSink> UiBridge<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

impl<S: UiSink> PromptHandler for UiBridge<S> {
    fn prompt(&self, label: &str, prompt: &str, cancel: CancellationToken) -> PromptFuture {
        let (prompt, answer_rx) = PasswordPrompt::new(label, normalize_prompt(prompt));
        self.sink.send(PasswordMsg::Show(prompt));

        let sink = self.sink.clone();
        Box::pin(async move {
            let mut answer_rx = answer_rx;
            tokio::select! {
                biased;
                answer = &mut answer_rx => answer.ok(),
                _ = cancel.cancelled() => {
                    // Closing the reply makes later submits fail and marks the
                    // prompt stale for the UI. A secret sent before that wins.
                    answer_rx.close();
                    let secret = answer_rx.try_recv().ok();
                    if secret.is_none() {
                        sink.send(PasswordMsg::Hide);
                    }
                    secret
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prompt() {
        assert_eq!(normalize_prompt(""), FALLBACK_PROMPT);
        assert_eq!(normalize_prompt("   "), FALLBACK_PROMPT);
        assert_eq!(normalize_prompt(" \t\n\u{00a0}"), FALLBACK_PROMPT);
        assert_eq!(normalize_prompt("PIN: "), "PIN: ");
        assert_eq!(normalize_prompt("  x  "), "  x  ");
    }

    #[tokio::test]
    async fn test_bridge_returns_submitted_secret() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PasswordMsg>();
        let bridge = UiBridge::new(tx);
        let fut = bridge.prompt("jjui", "Password: ", CancellationToken::new());

        let Some(PasswordMsg::Show(prompt)) = rx.recv().await else {
            panic!("expected show message");
        };
        assert_eq!(prompt.label, "jjui");
        assert_eq!(prompt.prompt, "Password: ");
        assert!(prompt.reply.submit(Secret::new("correct-horse")));

        assert_eq!(fut.await, Some(Secret::new("correct-horse")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bridge_shows_fallback_for_blank_prompt() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PasswordMsg>();
        let _fut = UiBridge::new(tx).prompt("jjui", "  ", CancellationToken::new());
        let Some(PasswordMsg::Show(prompt)) = rx.recv().await else {
            panic!("expected show message");
        };
        assert_eq!(prompt.prompt, FALLBACK_PROMPT);
    }

    #[tokio::test]
    async fn test_bridge_dismissed_by_user() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PasswordMsg>();
        let fut = UiBridge::new(tx).prompt("jjui", "Password: ", CancellationToken::new());
        let Some(PasswordMsg::Show(prompt)) = rx.recv().await else {
            panic!("expected show message");
        };
        drop(prompt);
        assert_eq!(fut.await, None);
    }

    #[tokio::test]
    async fn test_bridge_cancel_posts_hide() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PasswordMsg>();
        let cancel = CancellationToken::new();
        let fut = UiBridge::new(tx).prompt("jjui", "Password: ", cancel.clone());
        let Some(PasswordMsg::Show(prompt)) = rx.recv().await else {
            panic!("expected show message");
        };

        cancel.cancel();
        assert_eq!(fut.await, None);
        assert!(matches!(rx.recv().await, Some(PasswordMsg::Hide)));
        assert!(prompt.reply.is_closed());
        assert!(!prompt.reply.submit(Secret::new("too-late")));
    }

    #[tokio::test]
    async fn test_answer_given_before_cancel_wins() {
        let (tx, mut rx) = mpsc::unbounded_channel::<PasswordMsg>();
        let cancel = CancellationToken::new();
        let fut = UiBridge::new(tx).prompt("jjui", "Password: ", cancel.clone());
        let Some(PasswordMsg::Show(prompt)) = rx.recv().await else {
            panic!("expected show message");
        };

        assert!(prompt.reply.submit(Secret::new("correct-horse")));
        cancel.cancel();
        assert_eq!(fut.await, Some(Secret::new("correct-horse")));
        assert!(rx.try_recv().is_err());
    }
}
