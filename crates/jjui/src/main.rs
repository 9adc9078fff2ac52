use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use jjui_askpass::{DEBUG_ENV, Role, run_stub_blocking};
use log::{LevelFilter, debug, info};

mod app;
mod config;
mod jj;
mod tui;

use crate::app::App;
use crate::config::AppConfig;
use crate::jj::JjRunner;

fn main() {
    // ssh may have started us as its askpass helper; nothing else applies then.
    if let Role::Stub(invocation) = Role::from_process() {
        init_stub_logging();
        std::process::exit(run_stub_blocking(&invocation));
    }

    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(app: App, runner: JjRunner, options: tui::TuiOptions) -> Result<()> {
    tui::run(app, runner, options).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let config_file = config::config_file_path(cli.config_file.clone())?;
    if cli.edit_config {
        return config::edit_config(&config_file);
    }

    let ctx = RuntimeContext::new(cli, config_file)?;
    ctx.init_logging()?;

    let location = match ctx.cli.location.clone() {
        Some(location) => location,
        None => env::current_dir().context(
            "couldn't determine the current directory; pass the location of a jj repo",
        )?,
    };
    let root = jj::root_dir(&location)?;
    info!("jjui starting in {}", root.display());

    let runner = JjRunner::new(&root);
    let revset = jj::resolve_revset(
        ctx.cli.revset.as_deref(),
        &ctx.config.revisions.revset,
        || runner.default_revset(),
    );
    let limit = ctx.cli.limit.unwrap_or(ctx.config.limit);
    let period = ctx.cli.period.unwrap_or(ctx.config.ui.auto_refresh_interval);
    debug!("revset={:?} limit={} period={}", revset, limit, period);

    let options = tui::TuiOptions {
        hijack_askpass: ctx.config.ssh.hijack_askpass,
        connect_timeout: Duration::from_millis(ctx.config.ssh.connect_timeout_ms),
        refresh: (period > 0).then(|| Duration::from_secs(period)),
    };

    async_main(App::new(root, revset, limit), runner, options)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "A terminal UI for the jj version control system."
)]
struct Cli {
    /// Path inside a jj repository (defaults to the current directory)
    #[arg(value_name = "LOCATION")]
    location: Option<PathBuf>,
    /// Set the default revset
    #[arg(short, long)]
    revset: Option<String>,
    /// Override the auto refresh interval in seconds (0 disables it)
    #[arg(short, long, value_name = "SECONDS")]
    period: Option<u64>,
    /// Number of revisions to show
    #[arg(short = 'n', long)]
    limit: Option<usize>,
    /// Open the configuration file in $EDITOR
    #[arg(long)]
    edit_config: bool,
    /// Override the config file path
    #[arg(long, value_name = "PATH", env = "JJUI_CONFIG")]
    config_file: Option<PathBuf>,
    /// Reduce logging to errors only
    #[arg(short, long)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long)]
    trace: bool,
}

struct RuntimeContext {
    cli: Cli,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(cli: Cli, config_file: PathBuf) -> Result<Self> {
        let config = config::load_config(&config_file)?;
        Ok(Self { cli, config })
    }

    /// The terminal belongs to the UI, so logs only ever go to a file.
    fn log_file(&self) -> Option<PathBuf> {
        if let Some(ref file) = self.config.logging.file {
            return Some(PathBuf::from(file));
        }
        env::var_os("DEBUG")
            .filter(|v| !v.is_empty())
            .map(|_| PathBuf::from("debug.log"))
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.cli.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }
        let Some(path) = self.log_file() else {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        let env_log = file
            .try_clone()
            .with_context(|| format!("opening log file {}", path.display()))?;

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "jjui={level},jjui_askpass={level}",
                level = level.as_str().to_ascii_lowercase()
            ))
        });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .try_init()
            .ok();

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder
            .filter_level(level)
            .target(env_logger::Target::Pipe(Box::new(env_log)));
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.cli.trace {
            return LevelFilter::Trace;
        }
        if self.cli.debug {
            return LevelFilter::Debug;
        }
        match self.cli.verbose {
            0 => self
                .config
                .logging
                .level
                .parse()
                .unwrap_or(LevelFilter::Info),
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

/// Helpers stay silent unless asked: ssh shows their stderr to the user.
fn init_stub_logging() {
    if env::var_os(DEBUG_ENV).is_some_and(|v| !v.is_empty()) {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .target(env_logger::Target::Stderr)
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(args: &[&str]) -> RuntimeContext {
        RuntimeContext {
            cli: Cli::try_parse_from(args).unwrap(),
            config: AppConfig::default(),
        }
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["jjui", "-r", "trunk()", "-p", "5", "-n", "20", "/repo"])
            .unwrap();
        assert_eq!(cli.revset.as_deref(), Some("trunk()"));
        assert_eq!(cli.period, Some(5));
        assert_eq!(cli.limit, Some(20));
        assert_eq!(cli.location, Some(PathBuf::from("/repo")));
        assert!(!cli.edit_config);
    }

    #[test]
    fn test_log_level_flags() {
        assert_eq!(context(&["jjui"]).effective_log_level(), LevelFilter::Info);
        assert_eq!(context(&["jjui", "-v"]).effective_log_level(), LevelFilter::Debug);
        assert_eq!(context(&["jjui", "-vv"]).effective_log_level(), LevelFilter::Trace);
        assert_eq!(context(&["jjui", "--trace"]).effective_log_level(), LevelFilter::Trace);

        let mut ctx = context(&["jjui"]);
        ctx.config.logging.level = "warn".to_string();
        assert_eq!(ctx.effective_log_level(), LevelFilter::Warn);
    }

    #[test]
    fn test_configured_log_file_wins() {
        let mut ctx = context(&["jjui"]);
        ctx.config.logging.file = Some("/tmp/jjui.log".to_string());
        assert_eq!(ctx.log_file(), Some(PathBuf::from("/tmp/jjui.log")));
    }
}
