use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use config::{Config, Environment, File, FileFormat};
use log::debug;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "jjui";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Number of revisions to show; 0 shows everything.
    pub limit: usize,
    pub ssh: SshConfig,
    pub ui: UiConfig,
    pub revisions: RevisionsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Answer ssh passphrase prompts inside the UI.
    pub hijack_askpass: bool,
    /// How long a prompt helper waits to reach the UI.
    pub connect_timeout_ms: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            hijack_askpass: false,
            connect_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Seconds between automatic refreshes; 0 disables them.
    pub auto_refresh_interval: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevisionsConfig {
    pub revset: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Resolve the config file location, honouring an explicit override.
pub fn config_file_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    let config_file = match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                expanded.join("config.toml")
            } else {
                expanded
            }
        }
        None => default_config_dir()?.join("config.toml"),
    };

    if config_file.parent().is_none() {
        return Err(anyhow!("invalid config file path: {config_file:?}"));
    }
    Ok(config_file)
}

/// Load the config file (if any) with `JJUI__SECTION__KEY` overrides.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("ssh.hijack_askpass", false)?
        .set_default("ssh.connect_timeout_ms", 2000_i64)?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix().as_str()).separator("__"))
        .build()
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .with_context(|| format!("parsing configuration in {}", path.display()))?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    debug!("loaded configuration: {:?}", config);
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Set ssh.hijack_askpass = true to answer ssh prompts inside jjui.\n");
    buffer.push('\n');
    buffer
}

/// Open the config file in `$EDITOR`, creating a default one first.
pub fn edit_config(path: &Path) -> Result<()> {
    if !path.exists() {
        write_default_config(path)?;
    }

    let editor = env::var("EDITOR")
        .ok()
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| "vi".to_string());
    let mut parts = editor.split_whitespace();
    let program = parts.next().unwrap_or("vi");

    let status = Command::new(program)
        .args(parts)
        .arg(path)
        .status()
        .with_context(|| format!("launching editor {editor:?}"))?;
    if !status.success() {
        bail!("editor {editor:?} exited with {status}");
    }
    Ok(())
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.toml")).unwrap();
        assert!(!config.ssh.hijack_askpass);
        assert_eq!(config.ssh.connect_timeout_ms, 2000);
        assert_eq!(config.ui.auto_refresh_interval, 0);
        assert_eq!(config.limit, 0);
        assert!(config.revisions.revset.is_empty());
    }

    #[test]
    fn test_file_values_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
limit = 50

[ssh]
hijack_askpass = true

[ui]
auto_refresh_interval = 5

[revisions]
revset = "trunk()..@"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert!(config.ssh.hijack_askpass);
        assert_eq!(config.ssh.connect_timeout_ms, 2000);
        assert_eq!(config.ui.auto_refresh_interval, 5);
        assert_eq!(config.limit, 50);
        assert_eq!(config.revisions.revset, "trunk()..@");
    }

    #[test]
    fn test_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default_config(&path).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for jjui"));
        assert_eq!(load_config(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_directory_override_points_at_config_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_file_path(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(path, dir.path().join("config.toml"));
    }
}
