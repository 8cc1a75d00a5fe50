//! Configuration module for taskrun-rs
//!
//! This module handles:
//! - Application configuration (session timing, task and handler folders)
//! - Experiment files describing several subjects run side by side
//!
//! # App Data Location
//!
//! Application data is stored in the platform-appropriate location:
//! - **Linux**: `~/.local/share/dev.taskrun.taskrun-rs/`
//! - **macOS**: `~/Library/Application Support/dev.taskrun.taskrun-rs/`
//! - **Windows**: `%APPDATA%\dev.taskrun.taskrun-rs\`
//!
//! # Files
//!
//! - `config.json` - [`AppConfig`]
//! - Experiment files (`.json`) - [`ExperimentConfig`], saved wherever the user chooses
//!
//! # Example
//!
//! ```ignore
//! use taskrun_rs::config::{AppConfig, ExperimentConfig};
//!
//! let config = AppConfig::load_or_default();
//! let experiment = ExperimentConfig::load("pair.json")?;
//! let task = experiment.load_task(&config)?;
//! ```

use crate::error::{Result, TaskRunError};
use crate::experiment::ExperimentInfo;
use crate::task::TaskDefinition;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.taskrun.taskrun-rs";

/// Config filename
pub const CONFIG_FILE: &str = "config.json";

/// Default interval between ticks while running
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 10;

/// Default interval between idle housekeeping passes
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 1000;

/// Default pause between sending stop and the final drain
pub const DEFAULT_STOP_DRAIN_DELAY_MS: u64 = 100;

/// Default capacity of worker channels
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1024;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        TaskRunError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            TaskRunError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the config file
pub fn config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Session Config ====================

/// Timing and behaviour of a single session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between ticks while a run is active
    pub tick_interval_ms: u64,
    /// Interval between freshness/connectivity checks while not running
    pub refresh_interval_ms: u64,
    /// Pause after a normal stop before the final drain
    pub stop_drain_delay_ms: u64,
    /// Copy device prints to the operator log
    pub echo_prints: bool,
    /// Capacity of the worker's command and message channels
    pub channel_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            stop_drain_delay_ms: DEFAULT_STOP_DRAIN_DELAY_MS,
            echo_prints: true,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn stop_drain_delay(&self) -> Duration {
        Duration::from_millis(self.stop_drain_delay_ms)
    }

    /// Check values are usable
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(TaskRunError::Config(
                "tick_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.refresh_interval_ms < self.tick_interval_ms {
            return Err(TaskRunError::Config(
                "refresh_interval_ms must not be shorter than tick_interval_ms".to_string(),
            ));
        }
        if self.channel_buffer_size == 0 {
            return Err(TaskRunError::Config(
                "channel_buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ==================== App Config ====================

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    /// Folder holding task definitions (`<name>.py`)
    pub tasks_dir: PathBuf,
    /// Folder holding handler scripts (`<task>.rhai`)
    pub handlers_dir: PathBuf,
    /// Port used when none is given on the command line
    pub default_port: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            tasks_dir: PathBuf::from("tasks"),
            handlers_dir: PathBuf::from("handlers"),
            default_port: None,
        }
    }
}

impl AppConfig {
    /// Load config from a file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TaskRunError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            TaskRunError::Config(format!("Failed to parse config {:?}: {}", path, e))
        })?;
        config.session.validate()?;
        Ok(config)
    }

    /// Load config from the default location, or defaults if there is none
    pub fn load() -> Result<Self> {
        let path = config_path().ok_or_else(|| {
            TaskRunError::Config("Could not determine config path".to_string())
        })?;

        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    /// Load config, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save config to a file
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TaskRunError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| TaskRunError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            TaskRunError::Config(format!("Failed to write config {:?}: {}", path, e))
        })
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        let dir = ensure_app_data_dir()?;
        self.save_to(dir.join(CONFIG_FILE))
    }
}

// ==================== Experiment Config ====================

/// One subject of an experiment and the board it runs on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectSetup {
    pub subject: String,
    pub port: String,
}

/// Experiment file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    /// Task name, resolved in [`AppConfig::tasks_dir`]
    pub task: String,
    pub subjects: Vec<SubjectSetup>,
    #[serde(default)]
    pub requires_peers: bool,
}

impl ExperimentConfig {
    /// Load and validate an experiment file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TaskRunError::Config(format!("Failed to read experiment file {:?}: {}", path, e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            TaskRunError::Config(format!("Failed to parse experiment file {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save experiment file to disk as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            TaskRunError::Config(format!("Failed to serialize experiment: {}", e))
        })?;
        std::fs::write(path.as_ref(), content).map_err(|e| {
            TaskRunError::Config(format!(
                "Failed to write experiment file {:?}: {}",
                path.as_ref(),
                e
            ))
        })
    }

    /// Check subjects and ports are non-empty and unique
    pub fn validate(&self) -> Result<()> {
        if self.subjects.is_empty() {
            return Err(TaskRunError::Config(format!(
                "Experiment {} has no subjects",
                self.name
            )));
        }

        let mut subjects = HashSet::new();
        let mut ports = HashSet::new();
        for setup in &self.subjects {
            if !subjects.insert(setup.subject.as_str()) {
                return Err(TaskRunError::Config(format!(
                    "Duplicate subject {} in experiment {}",
                    setup.subject, self.name
                )));
            }
            if !ports.insert(setup.port.as_str()) {
                return Err(TaskRunError::Config(format!(
                    "Port {} used twice in experiment {}",
                    setup.port, self.name
                )));
            }
        }
        Ok(())
    }

    /// Shared description handed to every session
    pub fn info(&self) -> ExperimentInfo {
        ExperimentInfo {
            name: self.name.clone(),
            subjects: self.subjects.iter().map(|s| s.subject.clone()).collect(),
            requires_peers: self.requires_peers,
        }
    }

    pub fn ports(&self) -> Vec<String> {
        self.subjects.iter().map(|s| s.port.clone()).collect()
    }

    /// Load the experiment's task from the configured tasks folder
    pub fn load_task(&self, app: &AppConfig) -> Result<TaskDefinition> {
        TaskDefinition::load_named(&app.tasks_dir, &self.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_millis(10));
        assert_eq!(config.refresh_interval(), Duration::from_secs(1));
        assert_eq!(config.stop_drain_delay(), Duration::from_millis(100));
        assert!(config.echo_prints);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_config_validation() {
        let config = SessionConfig {
            tick_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            tick_interval_ms: 50,
            refresh_interval_ms: 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_app_config_partial_json_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "session": { "tick_interval_ms": 20 } }"#).unwrap();
        assert_eq!(config.session.tick_interval_ms, 20);
        assert_eq!(config.session.refresh_interval_ms, DEFAULT_REFRESH_INTERVAL_MS);
        assert_eq!(config.tasks_dir, PathBuf::from("tasks"));
    }

    #[test]
    fn test_app_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let config = AppConfig {
            default_port: Some("/dev/ttyACM0".to_string()),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }

    fn experiment() -> ExperimentConfig {
        ExperimentConfig {
            name: "pair".to_string(),
            task: "blinker".to_string(),
            subjects: vec![
                SubjectSetup {
                    subject: "m1".to_string(),
                    port: "COM1".to_string(),
                },
                SubjectSetup {
                    subject: "m2".to_string(),
                    port: "COM2".to_string(),
                },
            ],
            requires_peers: true,
        }
    }

    #[test]
    fn test_experiment_info() {
        let info = experiment().info();
        assert_eq!(info.subjects, vec!["m1", "m2"]);
        assert!(info.requires_peers);
        assert_eq!(experiment().ports(), vec!["COM1", "COM2"]);
    }

    #[test]
    fn test_experiment_validation() {
        assert!(experiment().validate().is_ok());

        let mut dup = experiment();
        dup.subjects[1].subject = "m1".to_string();
        assert!(dup.validate().is_err());

        let mut same_port = experiment();
        same_port.subjects[1].port = "COM1".to_string();
        assert!(same_port.validate().is_err());

        let mut empty = experiment();
        empty.subjects.clear();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_experiment_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pair.json");
        experiment().save(&path).unwrap();
        assert_eq!(ExperimentConfig::load(&path).unwrap(), experiment());
    }
}
