//! Password overlay state machine.
//!
//! `Hidden -> Visible` on a show message, `Visible -> Hidden` on submit,
//! dismiss, or a hide message for the visible prompt. Prompts that arrive
//! while one is visible wait in arrival order and are shown one at a time.

use std::collections::VecDeque;

use log::debug;
use zeroize::Zeroizing;

use crate::bridge::{PasswordMsg, PasswordPrompt};
use crate::protocol::Secret;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    Hidden,
    Visible,
}

struct ActivePrompt {
    prompt: PasswordPrompt,
    input: Zeroizing<String>,
}

impl ActivePrompt {
    fn new(prompt: PasswordPrompt) -> Self {
        Self {
            prompt,
            input: Zeroizing::new(String::new()),
        }
    }
}

/// Password entry owned by the UI loop.
#[derive(Default)]
pub struct PasswordOverlay {
    active: Option<ActivePrompt>,
    queue: VecDeque<PasswordPrompt>,
}

impl PasswordOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> OverlayState {
        if self.active.is_some() {
            OverlayState::Visible
        } else {
            OverlayState::Hidden
        }
    }

    pub fn is_visible(&self) -> bool {
        self.active.is_some()
    }

    /// Prompts waiting behind the visible one.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn caption(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.prompt.prompt.as_str())
    }

    pub fn label(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.prompt.label.as_str())
    }

    /// One mask character per entered character.
    pub fn masked_input(&self) -> String {
        self.active
            .as_ref()
            .map(|a| "*".repeat(a.input.chars().count()))
            .unwrap_or_default()
    }

    /// Apply a relay message.
    pub fn handle(&mut self, msg: PasswordMsg) {
        match msg {
            PasswordMsg::Show(prompt) => self.show(prompt),
            PasswordMsg::Hide => self.hide_stale(),
        }
    }

    fn show(&mut self, prompt: PasswordPrompt) {
        if prompt.reply.is_closed() {
            debug!("Skipping password prompt whose requester is gone");
            return;
        }
        if self.active.is_none() {
            self.active = Some(ActivePrompt::new(prompt));
        } else {
            self.queue.push_back(prompt);
        }
    }

    fn hide_stale(&mut self) {
        self.queue.retain(|p| !p.reply.is_closed());
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.prompt.reply.is_closed())
        {
            self.active = None;
            self.advance();
        }
    }

    fn advance(&mut self) {
        debug_assert!(self.active.is_none());
        while let Some(next) = self.queue.pop_front() {
            if !next.reply.is_closed() {
                self.active = Some(ActivePrompt::new(next));
                return;
            }
        }
    }

    pub fn push_char(&mut self, c: char) {
        if let Some(active) = self.active.as_mut() {
            active.input.push(c);
        }
    }

    pub fn backspace(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.input.pop();
        }
    }

    /// Send the entered text to the requester and show the next prompt.
    ///
    /// Returns `false` when nothing was visible or the requester was gone.
    pub fn submit(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        let secret = Secret::new(active.input.as_bytes());
        let delivered = active.prompt.reply.submit(secret);
        self.advance();
        delivered
    }

    /// Decline the visible prompt and show the next one.
    pub fn dismiss(&mut self) -> bool {
        let dismissed = self.active.take().is_some();
        self.advance();
        dismissed
    }

    /// Decline everything, visible and queued.
    pub fn dismiss_all(&mut self) {
        self.active = None;
        self.queue.clear();
    }
}
