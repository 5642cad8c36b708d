//! Layered configuration loading.
//!
//! Sources, lowest to highest priority:
//! 1. Built-in defaults
//! 2. User-level `<config dir>/groundcover/config.toml`
//! 3. Project-level `./.groundcover.toml`
//! 4. Environment variables (`GROUNDCOVER_*` prefix, `__` between section and key)
//!
//! `GROUNDCOVER_INFERENCE__MODEL` maps to `inference.model`,
//! `GROUNDCOVER_REPORT__OUT_DIR` to `report.out_dir` and so on.

use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const APP_DIR_NAME: &str = "groundcover";
const LOCAL_CONFIG_FILE: &str = ".groundcover.toml";
const ENV_PREFIX: &str = "GROUNDCOVER_";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InferenceConfig {
    /// Base URL of the generative language API, without the `/models/...` suffix.
    pub endpoint: String,
    pub model: String,
    /// Request timeout. `None` waits for the model indefinitely.
    pub timeout_secs: Option<u64>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-1.5-flash".to_string(),
            timeout_secs: None,
        }
    }
}

/// What the summary row of the exported image shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryMode {
    /// The table's computed total.
    #[default]
    Computed,
    /// The fixed text "100%", whatever the rows add up to.
    Literal,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory for downloaded reports. Defaults to the working directory.
    pub out_dir: Option<PathBuf>,
    /// Outline font (TTF/OTF) for the exported image, e.g. Noto Sans KR.
    /// Without one, the built-in Latin bitmap font is used.
    pub font: Option<PathBuf>,
    /// Override for the title above the table.
    pub title: Option<String>,
    pub summary: SummaryMode,
    /// JPEG quality, 1-100.
    pub quality: u8,
    /// Write a JSON sidecar next to every exported image.
    pub sidecar: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            out_dir: None,
            font: None,
            title: None,
            summary: SummaryMode::Computed,
            quality: 90,
            sidecar: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CredentialsConfig {
    /// Override for the credentials file location.
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self> {
        Self::from_figment(&Self::figment())
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        Ok(figment.extract()?)
    }

    /// Build the provider chain. Public so tests can layer extra providers on top.
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                figment = figment.merge(Toml::file(global_path));
            }
        }

        let local_path = PathBuf::from(LOCAL_CONFIG_FILE);
        if local_path.exists() {
            figment = figment.merge(Toml::file(local_path));
        }

        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(APP_DIR_NAME).join("config.toml"))
    }

    /// Directory reports are written to when no `--out-dir` is given.
    pub fn out_dir(&self) -> PathBuf {
        self.report
            .out_dir
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
