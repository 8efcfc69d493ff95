use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Application-level settings, loaded from `~/.groupcast/config.toml`.
///
/// This is operator tuning for the process itself (tick cadence, pacing),
/// not the bot configuration — token, destinations, and collections live
/// in the SQLite store and are managed with `groupcast apply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between dispatch cycles. This is the wakeup cadence, not the
    /// send interval — due-ness per destination is decided inside the cycle.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

fn default_tick_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Pause between successive messages of one collection, to stay under
    /// the platform's rate limits.
    #[serde(default = "default_inter_message_delay_ms")]
    pub inter_message_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            inter_message_delay_ms: default_inter_message_delay_ms(),
        }
    }
}

fn default_inter_message_delay_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::new(),
            config_path: PathBuf::new(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let groupcast_dir = home.join(".groupcast");
        let config_path = groupcast_dir.join("config.toml");

        if !groupcast_dir.exists() {
            fs::create_dir_all(&groupcast_dir)
                .context("Failed to create .groupcast directory")?;
        }

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config.workspace_dir = groupcast_dir;
            config.apply_env_overrides();
            Ok(config)
        } else {
            let mut config = Config::default();
            config.config_path = config_path;
            config.workspace_dir = groupcast_dir;
            config.save()?;
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(workspace) = std::env::var("GROUPCAST_WORKSPACE") {
            if !workspace.is_empty() {
                self.workspace_dir = PathBuf::from(workspace);
            }
        }

        if let Ok(tick) = std::env::var("GROUPCAST_TICK_SECS") {
            if let Ok(secs) = tick.parse::<u64>() {
                if secs > 0 {
                    self.scheduler.tick_secs = secs;
                }
            }
        }

        if let Ok(delay) = std::env::var("GROUPCAST_DELAY_MS") {
            if let Ok(ms) = delay.parse::<u64>() {
                self.dispatch.inter_message_delay_ms = ms;
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        // Write-then-rename so a crash mid-write never leaves a torn file.
        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp"));
        fs::write(&temp_path, toml_str.as_bytes()).with_context(|| {
            format!(
                "Failed to write temporary config file: {}",
                temp_path.display()
            )
        })?;
        fs::rename(&temp_path, &self.config_path)
            .context("Failed to atomically replace config file")?;

        Ok(())
    }

    /// Path of the SQLite database holding the bot configuration.
    pub fn store_db_path(&self) -> PathBuf {
        self.workspace_dir.join("groupcast.db")
    }
}
