//! Terminal front end and event loop.

use std::io::{self, Stdout, stdout};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jjui_askpass::{AskpassResult, AskpassServer, UiBridge};
use log::{debug, error, info, warn};
use ratatui::crossterm::{
    ExecutableCommand,
    event::{self, Event, KeyEventKind},
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::app::{Action, App, Msg};
use crate::config::APP_NAME;
use crate::jj::{JjOp, JjRunner};

/// How often the input thread checks whether the UI is gone.
const INPUT_POLL: Duration = Duration::from_millis(250);

pub struct TuiOptions {
    pub hijack_askpass: bool,
    pub connect_timeout: Duration,
    /// Auto refresh period; `None` disables it.
    pub refresh: Option<Duration>,
}

/// Raw mode and alternate screen, restored on drop.
struct TerminalGuard {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        if let Err(e) = stdout().execute(EnterAlternateScreen) {
            let _ = disable_raw_mode();
            return Err(e);
        }
        let terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
        Ok(Self { terminal })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = stdout().execute(LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

/// The askpass relay while the UI runs.
struct Relay {
    server: Arc<AskpassServer>,
    task: JoinHandle<()>,
}

impl Relay {
    fn start(tx: &mpsc::UnboundedSender<Msg>, connect_timeout: Duration) -> AskpassResult<Self> {
        let server =
            Arc::new(AskpassServer::create(APP_NAME)?.with_connect_timeout(connect_timeout));
        server.start()?;

        let bridge = Arc::new(UiBridge::new(tx.clone()));
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                if let Err(e) = server.serve(bridge).await {
                    error!("Askpass relay failed: {}", e);
                }
            }
        });
        Ok(Self { server, task })
    }

    async fn close(self) {
        let cancelled = self.server.close();
        if cancelled > 0 {
            info!("Released {} waiting askpass prompt(s)", cancelled);
        }
        if let Err(e) = self.task.await {
            warn!("Askpass relay task ended abnormally: {}", e);
        }
    }
}

pub async fn run(mut app: App, mut runner: JjRunner, options: TuiOptions) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();

    let relay = if options.hijack_askpass {
        match Relay::start(&tx, options.connect_timeout) {
            Ok(relay) => {
                runner = runner.with_askpass(relay.server.env());
                Some(relay)
            }
            Err(e) => {
                warn!("Askpass relay disabled: {}", e);
                app.set_status(format!("ssh.hijack_askpass disabled: {e}"));
                None
            }
        }
    } else {
        None
    };

    let mut guard = match TerminalGuard::enter() {
        Ok(guard) => guard,
        Err(e) => {
            if let Some(relay) = relay {
                relay.close().await;
            }
            return Err(e).context("initializing terminal");
        }
    };

    spawn_input_thread(tx.clone());
    let ticker = options.refresh.map(|period| spawn_ticker(period, tx.clone()));

    let result = event_loop(&mut guard.terminal, &mut app, &runner, &tx, &mut rx).await;

    // Release blocked helpers before giving the terminal back.
    app.dismiss_prompts();
    if let Some(ticker) = ticker {
        ticker.abort();
    }
    if let Some(relay) = relay {
        relay.close().await;
    }
    drop(guard);
    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
    runner: &JjRunner,
    tx: &mpsc::UnboundedSender<Msg>,
    rx: &mut mpsc::UnboundedReceiver<Msg>,
) -> Result<()> {
    if let Action::Run(op) = app.initial_action() {
        spawn_op(runner, op, tx);
    }

    loop {
        terminal.draw(|frame| draw(frame, app))?;

        let Some(msg) = rx.recv().await else {
            debug!("Message channel closed");
            return Ok(());
        };
        match app.update(msg) {
            Some(Action::Quit) => return Ok(()),
            Some(Action::Run(op)) => spawn_op(runner, op, tx),
            None => {}
        }
    }
}

/// Run `op` on its own task so the UI keeps drawing while it waits.
fn spawn_op(runner: &JjRunner, op: JjOp, tx: &mpsc::UnboundedSender<Msg>) {
    if op.is_remote() && !runner.has_askpass() {
        debug!("{} runs without the askpass relay", op.describe());
    }
    let runner = runner.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = runner.run(&op).await.map_err(|e| format!("{e:#}"));
        let _ = tx.send(Msg::JjFinished { op, result });
    });
}

fn spawn_input_thread(tx: mpsc::UnboundedSender<Msg>) {
    std::thread::spawn(move || {
        while !tx.is_closed() {
            match event::poll(INPUT_POLL) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!("Terminal input error: {}", e);
                    return;
                }
            }
            let msg = match event::read() {
                Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => Msg::Key(key),
                Ok(Event::Resize(_, _)) => Msg::Resize,
                Ok(_) => continue,
                Err(e) => {
                    error!("Terminal input error: {}", e);
                    return;
                }
            };
            if tx.send(msg).is_err() {
                return;
            }
        }
    });
}

fn spawn_ticker(period: Duration, tx: mpsc::UnboundedSender<Msg>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            if tx.send(Msg::Tick).is_err() {
                return;
            }
        }
    })
}

fn draw(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(1),
            Constraint::Length(1),
        ])
        .split(frame.area());

    let header = Line::from(vec![
        Span::styled(
            app.root().display().to_string(),
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw("  revset: "),
        Span::styled(
            if app.revset().is_empty() {
                "(default)".to_string()
            } else {
                app.revset().to_string()
            },
            Style::default().fg(Color::Cyan),
        ),
    ]);
    frame.render_widget(Paragraph::new(header), chunks[0]);

    let lines: Vec<Line> = app
        .log_lines()
        .iter()
        .map(|l| Line::raw(l.as_str()))
        .collect();
    let log = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Log"))
        .scroll((app.scroll(), 0));
    frame.render_widget(log, chunks[1]);

    let status_color = if app.running().is_some() {
        Color::Yellow
    } else {
        Color::Gray
    };
    let status = Paragraph::new(app.status()).style(Style::default().fg(status_color));
    frame.render_widget(status, chunks[2]);

    if app.overlay().is_visible() {
        draw_password(frame, app);
    }
}

fn draw_password(frame: &mut Frame, app: &App) {
    let overlay = app.overlay();
    let area = centered_rect(60, 6, frame.area());

    let mut title = format!(" {} ", overlay.label().unwrap_or(APP_NAME));
    if overlay.queued() > 0 {
        title.push_str(&format!("(+{} waiting) ", overlay.queued()));
    }

    let body = vec![
        Line::raw(overlay.caption().unwrap_or_default()),
        Line::from(vec![
            Span::raw(overlay.masked_input()),
            Span::styled("_", Style::default().add_modifier(Modifier::SLOW_BLINK)),
        ]),
        Line::raw(""),
        Line::styled(
            "enter: submit  esc: cancel",
            Style::default().fg(Color::DarkGray),
        ),
    ];
    let popup = Paragraph::new(body)
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Magenta))
                .title(title),
        );

    frame.render_widget(Clear, area);
    frame.render_widget(popup, area);
}

/// `percent_x` wide, `height` rows tall, centred in `area`.
fn centered_rect(percent_x: u16, height: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Fill(1),
            Constraint::Length(height),
            Constraint::Fill(1),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}
