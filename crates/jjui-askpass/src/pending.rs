//! Registry of prompts waiting for a human answer.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use log::debug;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{AskpassError, AskpassResult};
use crate::protocol::{PromptOutcome, RequestId};

/// Pending prompt with its write-once result slot.
struct PendingEntry {
    label: String,
    prompt: String,
    created_at: Instant,
    cancel: CancellationToken,
    result_tx: Option<oneshot::Sender<PromptOutcome>>,
}

/// Snapshot of a pending prompt, without any way to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: RequestId,
    pub label: String,
    pub prompt: String,
    pub resolved: bool,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<RequestId, PendingEntry>,
    closed: bool,
}

/// Prompts in flight, shared by the accept loop and the prompt handlers.
///
/// Each entry resolves at most once, and only through [`resolve`](Self::resolve).
/// Cancelling only signals the entry's handler; whatever the handler reports
/// first is final and later resolutions of the same id are no-ops.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<Registry>,
}

/// Held by the connection that registered a prompt.
pub struct PendingTicket {
    pub id: RequestId,
    /// Fires when the prompt is cancelled or finished.
    pub cancel: CancellationToken,
    result_rx: oneshot::Receiver<PromptOutcome>,
}

impl PendingTicket {
    /// Wait for the prompt to be resolved.
    pub async fn wait(&mut self) -> PromptOutcome {
        (&mut self.result_rx)
            .await
            .unwrap_or(PromptOutcome::Cancelled)
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new prompt.
    ///
    /// Fails with [`AskpassError::Closed`] after [`cancel_all`](Self::cancel_all)
    /// and rejects an id that is still in flight.
    pub fn register(
        &self,
        id: RequestId,
        label: impl Into<String>,
        prompt: impl Into<String>,
    ) -> AskpassResult<PendingTicket> {
        let mut registry = self.lock();
        if registry.closed {
            return Err(AskpassError::Closed);
        }
        if registry.entries.contains_key(&id) {
            return Err(AskpassError::MalformedRequest(format!(
                "request id {id} is already in flight"
            )));
        }

        let (result_tx, result_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        registry.entries.insert(
            id,
            PendingEntry {
                label: label.into(),
                prompt: prompt.into(),
                created_at: Instant::now(),
                cancel: cancel.clone(),
                result_tx: Some(result_tx),
            },
        );

        Ok(PendingTicket {
            id,
            cancel,
            result_rx,
        })
    }

    /// Deliver an outcome. Returns `false` when the id is unknown or already
    /// resolved.
    pub fn resolve(&self, id: RequestId, outcome: PromptOutcome) -> bool {
        let tx = {
            let mut registry = self.lock();
            match registry.entries.get_mut(&id) {
                Some(entry) => entry.result_tx.take(),
                None => None,
            }
        };

        match tx {
            Some(tx) => {
                let answered = matches!(outcome, PromptOutcome::Answered(_));
                // The receiver may already be gone if the stub hung up.
                let _ = tx.send(outcome);
                debug!("Resolved askpass request {} (answered: {})", id, answered);
                true
            }
            None => false,
        }
    }

    /// Signal the prompt's handler to give up.
    ///
    /// The entry stays unresolved until the handler reports back, so an
    /// answer already on its way still wins. Returns `false` when the id is
    /// unknown or already resolved.
    pub fn cancel(&self, id: RequestId) -> bool {
        let registry = self.lock();
        match registry.entries.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                entry.result_tx.is_some()
            }
            None => false,
        }
    }

    /// Signal every pending prompt and refuse new ones.
    ///
    /// Returns how many prompts were still unresolved.
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<_> = {
            let mut registry = self.lock();
            registry.closed = true;
            registry
                .entries
                .values()
                .filter(|entry| entry.result_tx.is_some())
                .map(|entry| entry.cancel.clone())
                .collect()
        };

        let count = tokens.len();
        for token in tokens {
            token.cancel();
        }
        if count > 0 {
            debug!("Cancelled {} pending askpass request(s)", count);
        }
        count
    }

    /// Drop a finished prompt. Its handler, if still running, is cancelled.
    pub fn remove(&self, id: RequestId) {
        let entry = self.lock().entries.remove(&id);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            debug!(
                "Askpass request {} finished after {:?}",
                id,
                entry.created_at.elapsed()
            );
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// List pending prompts.
    pub fn list(&self) -> Vec<PendingInfo> {
        self.lock()
            .entries
            .iter()
            .map(|(id, entry)| PendingInfo {
                id: *id,
                label: entry.label.clone(),
                prompt: entry.prompt.clone(),
                resolved: entry.result_tx.is_none(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Secret;

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let pending = PendingRequests::new();
        let id = RequestId::new();
        let mut ticket = pending.register(id, "jjui", "Password: ").unwrap();

        assert!(pending.resolve(id, PromptOutcome::Answered(Secret::new("first"))));
        assert!(!pending.resolve(id, PromptOutcome::Answered(Secret::new("second"))));
        assert!(!pending.cancel(id));

        assert_eq!(
            ticket.wait().await,
            PromptOutcome::Answered(Secret::new("first"))
        );
    }

    #[tokio::test]
    async fn test_cancel_signals_without_resolving() {
        let pending = PendingRequests::new();
        let id = RequestId::new();
        let mut ticket = pending.register(id, "jjui", "Password: ").unwrap();

        assert!(pending.cancel(id));
        assert!(ticket.cancel.is_cancelled());
        assert!(!pending.list()[0].resolved);

        // The handler reports back; its first word is final.
        assert!(pending.resolve(id, PromptOutcome::Cancelled));
        assert!(!pending.resolve(id, PromptOutcome::Answered(Secret::new("late"))));
        assert!(!pending.cancel(id));
        assert_eq!(ticket.wait().await, PromptOutcome::Cancelled);
    }

    #[test]
    fn test_duplicate_id_rejected_while_in_flight() {
        let pending = PendingRequests::new();
        let id = RequestId::new();
        let _ticket = pending.register(id, "a", "p").unwrap();
        assert!(matches!(
            pending.register(id, "b", "p"),
            Err(AskpassError::MalformedRequest(_))
        ));

        pending.remove(id);
        assert!(pending.register(id, "b", "p").is_ok());
    }

    #[tokio::test]
    async fn test_cancel_all_keeps_answer_in_flight() {
        let pending = PendingRequests::new();
        let mut tickets: Vec<_> = (0..3)
            .map(|i| {
                pending
                    .register(RequestId::new(), "jjui", format!("prompt {i}"))
                    .unwrap()
            })
            .collect();
        pending.resolve(tickets[0].id, PromptOutcome::Answered(Secret::new("x")));

        assert_eq!(pending.cancel_all(), 2);
        assert!(pending.is_closed());
        assert!(matches!(
            pending.register(RequestId::new(), "jjui", "late"),
            Err(AskpassError::Closed)
        ));
        assert!(!tickets[0].cancel.is_cancelled());
        assert!(tickets[1..].iter().all(|t| t.cancel.is_cancelled()));

        // One handler already had its answer, the other gives up.
        assert!(pending.resolve(tickets[1].id, PromptOutcome::Answered(Secret::new("y"))));
        assert!(pending.resolve(tickets[2].id, PromptOutcome::Cancelled));

        assert_eq!(
            tickets[0].wait().await,
            PromptOutcome::Answered(Secret::new("x"))
        );
        assert_eq!(
            tickets[1].wait().await,
            PromptOutcome::Answered(Secret::new("y"))
        );
        assert_eq!(tickets[2].wait().await, PromptOutcome::Cancelled);
    }

    #[test]
    fn test_list_shows_prompt_not_secret() {
        let pending = PendingRequests::new();
        let id = RequestId::new();
        let _ticket = pending.register(id, "jjui", "PIN: ").unwrap();
        pending.resolve(id, PromptOutcome::Answered(Secret::new("1234")));

        let list = pending.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].prompt, "PIN: ");
        assert!(list[0].resolved);
    }
}
