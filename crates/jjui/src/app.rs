//! UI state and message handling.
//!
//! Everything here is synchronous and free of I/O: the event loop feeds one
//! [`Msg`] at a time into [`App::update`] and carries out the returned
//! [`Action`].

use std::path::{Path, PathBuf};

use jjui_askpass::{PasswordMsg, PasswordOverlay};
use ratatui::crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::jj::{JjOp, JjOutput};

/// Everything the event loop can deliver.
#[derive(Debug)]
pub enum Msg {
    Key(KeyEvent),
    /// Terminal size changed; only needs a redraw.
    Resize,
    /// Auto refresh timer fired.
    Tick,
    Password(PasswordMsg),
    JjFinished {
        op: JjOp,
        result: Result<JjOutput, String>,
    },
}

impl From<PasswordMsg> for Msg {
    fn from(msg: PasswordMsg) -> Self {
        Self::Password(msg)
    }
}

/// Side effects requested by [`App::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Run(JjOp),
    Quit,
}

pub struct App {
    root: PathBuf,
    revset: String,
    limit: usize,
    log_lines: Vec<String>,
    status: String,
    scroll: u16,
    running: Option<JjOp>,
    overlay: PasswordOverlay,
}

impl App {
    pub fn new(root: PathBuf, revset: String, limit: usize) -> Self {
        Self {
            root,
            revset,
            limit,
            log_lines: Vec::new(),
            status: String::new(),
            scroll: 0,
            running: None,
            overlay: PasswordOverlay::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn revset(&self) -> &str {
        &self.revset
    }

    pub fn log_lines(&self) -> &[String] {
        &self.log_lines
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    pub fn scroll(&self) -> u16 {
        self.scroll
    }

    pub fn running(&self) -> Option<&JjOp> {
        self.running.as_ref()
    }

    pub fn overlay(&self) -> &PasswordOverlay {
        &self.overlay
    }

    fn log_op(&self) -> JjOp {
        JjOp::Log {
            revset: self.revset.clone(),
            limit: self.limit,
        }
    }

    /// Op to run at startup.
    pub fn initial_action(&mut self) -> Action {
        self.start(self.log_op())
    }

    fn start(&mut self, op: JjOp) -> Action {
        self.status = format!("{}...", op.describe());
        self.running = Some(op.clone());
        Action::Run(op)
    }

    fn try_start(&mut self, op: JjOp) -> Option<Action> {
        if let Some(ref busy) = self.running {
            self.status = format!("{} is still running", busy.describe());
            return None;
        }
        Some(self.start(op))
    }

    pub fn update(&mut self, msg: Msg) -> Option<Action> {
        match msg {
            Msg::Key(key) => self.handle_key(key),
            Msg::Resize => None,
            Msg::Tick => {
                if self.running.is_some() || self.overlay.is_visible() {
                    return None;
                }
                Some(self.start(self.log_op()))
            }
            Msg::Password(msg) => {
                self.overlay.handle(msg);
                None
            }
            Msg::JjFinished { op, result } => self.finish(op, result),
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Option<Action> {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Some(Action::Quit);
        }

        if self.overlay.is_visible() {
            match key.code {
                KeyCode::Enter => {
                    if !self.overlay.submit() {
                        self.status = "Prompt was withdrawn".to_string();
                    }
                }
                KeyCode::Esc => {
                    self.overlay.dismiss();
                }
                KeyCode::Backspace => self.overlay.backspace(),
                KeyCode::Char(c) => self.overlay.push_char(c),
                _ => {}
            }
            return None;
        }

        match key.code {
            KeyCode::Char('q') => Some(Action::Quit),
            KeyCode::Char('r') => self.try_start(self.log_op()),
            KeyCode::Char('f') => self.try_start(JjOp::GitFetch),
            KeyCode::Char('P') => self.try_start(JjOp::GitPush),
            KeyCode::Char('j') | KeyCode::Down => {
                self.scroll = self.scroll.saturating_add(1);
                None
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.scroll = self.scroll.saturating_sub(1);
                None
            }
            _ => None,
        }
    }

    fn finish(&mut self, op: JjOp, result: Result<JjOutput, String>) -> Option<Action> {
        self.running = None;
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.status = format!("{} failed: {e}", op.describe());
                return None;
            }
        };

        if !output.success {
            let reason = output.stderr.lines().last().unwrap_or("unknown error");
            self.status = format!("{} failed: {reason}", op.describe());
            return None;
        }

        match op {
            JjOp::Log { .. } => {
                self.log_lines = output.stdout.lines().map(str::to_string).collect();
                let max = u16::try_from(self.log_lines.len().saturating_sub(1))
                    .unwrap_or(u16::MAX);
                self.scroll = self.scroll.min(max);
                self.status.clear();
                None
            }
            JjOp::GitFetch | JjOp::GitPush => {
                let action = self.start(self.log_op());
                self.status = format!("{} done", op.describe());
                Some(action)
            }
        }
    }

    /// Dismiss every prompt; used on shutdown.
    pub fn dismiss_prompts(&mut self) {
        self.overlay.dismiss_all();
    }
}
