use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "ACADEMICD_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "academicd.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub workspace: WorkspaceSettings,
    #[serde(default)]
    pub backup: DirSettings,
    #[serde(default)]
    pub uploads: DirSettings,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkspaceSettings {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirSettings {
    pub dir: Option<PathBuf>,
}

/// Status cut-offs for report rows, in percent.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_attendance_good")]
    pub attendance_good_percent: f64,
    #[serde(default = "default_cie_pass")]
    pub cie_pass_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            attendance_good_percent: default_attendance_good(),
            cie_pass_percent: default_cie_pass(),
        }
    }
}

fn default_attendance_good() -> f64 {
    75.0
}

fn default_cie_pass() -> f64 {
    35.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Settings {
    /// Loads settings from the optional TOML file and `ACADEMICD_*` env vars.
    pub fn load() -> anyhow::Result<Self> {
        let file = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&file)
    }

    pub fn load_from(file: &Path) -> anyhow::Result<Self> {
        let built = config::Config::builder()
            .add_source(config::File::from(file).required(false))
            .add_source(
                config::Environment::with_prefix("ACADEMICD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration {}", file.display()))?;
        built
            .try_deserialize()
            .context("configuration has unexpected shape")
    }

    pub fn backup_dir(&self, workspace: &Path) -> PathBuf {
        self.backup
            .dir
            .clone()
            .unwrap_or_else(|| workspace.join("backups"))
    }

    pub fn uploads_dir(&self, workspace: &Path) -> PathBuf {
        self.uploads
            .dir
            .clone()
            .unwrap_or_else(|| workspace.join("uploads"))
    }
}
