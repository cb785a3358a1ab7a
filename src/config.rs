/*!
 * Configuration for prescribing analyses
 *
 * Settings are layered: built-in defaults, then the per-user config file,
 * then an explicit file, then `CDRECLASS_*` environment variables.
 */

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::CorruptCachePolicy;
use crate::query::{RemoteConfig, DEFAULT_API_ENDPOINT};
use crate::{ReclassError, Result};

/// Prefix for environment overrides, e.g. `CDRECLASS_PROJECT_ID`
pub const ENV_PREFIX: &str = "CDRECLASS";

/// Placeholder printed in place of secrets
pub const REDACTED: &str = "<redacted>";

/// Analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    /// Directory relative cache paths resolve against
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Directory charts and maps are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Billing project for remote queries
    #[serde(default)]
    pub project_id: Option<String>,

    /// Dataset location, e.g. "EU" or "US"
    #[serde(default)]
    pub location: Option<String>,

    /// OAuth2 bearer token for the remote query API
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Upper bound on how long one remote query may run
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub corrupt_cache_policy: CorruptCachePolicy,

    /// Whether to show a spinner while remote queries run
    #[serde(default = "default_enable_progress_bar")]
    pub enable_progress_bar: bool,

    #[serde(default = "default_chart_width")]
    pub chart_width: f64,

    #[serde(default = "default_chart_height")]
    pub chart_height: f64,

    /// TOML scenario registry replacing the built-in scenarios
    #[serde(default)]
    pub scenarios_file: Option<PathBuf>,

    /// GeoJSON boundaries for region maps
    #[serde(default)]
    pub boundaries_file: Option<PathBuf>,

    /// GeoJSON feature property holding the region code
    #[serde(default = "default_region_property")]
    pub region_property: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            output_dir: default_output_dir(),
            project_id: None,
            location: None,
            access_token: None,
            api_endpoint: default_api_endpoint(),
            timeout_seconds: default_timeout_seconds(),
            corrupt_cache_policy: CorruptCachePolicy::default(),
            enable_progress_bar: default_enable_progress_bar(),
            chart_width: default_chart_width(),
            chart_height: default_chart_height(),
            scenarios_file: None,
            boundaries_file: None,
            region_property: default_region_property(),
        }
    }
}

// Default value functions for serde
fn default_cache_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("charts")
}

fn default_api_endpoint() -> String {
    DEFAULT_API_ENDPOINT.to_string()
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_enable_progress_bar() -> bool {
    true
}

fn default_chart_width() -> f64 {
    crate::render::DEFAULT_WIDTH
}

fn default_chart_height() -> f64 {
    crate::render::DEFAULT_HEIGHT
}

fn default_region_property() -> String {
    "code".to_string()
}

fn config_error(e: config::ConfigError) -> ReclassError {
    ReclassError::Configuration {
        message: e.to_string(),
        suggestion: Some(format!(
            "Check the config file and any {}_* environment variables",
            ENV_PREFIX
        )),
    }
}

impl AnalysisConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer defaults, the default config file, `explicit` and the environment
    pub fn load_layered(explicit: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default()).map_err(config_error)?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = Self::default_config_path() {
            builder = builder.add_source(
                config::File::from(path.as_path())
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ReclassError::Configuration {
                    message: format!("Config file '{}' does not exist", path.display()),
                    suggestion: Some("Create one with `cdcli config init`".to_string()),
                });
            }
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        builder
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(config_error)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| ReclassError::Configuration {
            message: format!("Failed to serialize config: {}", e),
            suggestion: None,
        })?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/cdreclass/config.toml` on Linux
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "cdreclass").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default locations, falling back to defaults on error
    pub fn load() -> Self {
        Self::load_layered(None).unwrap_or_default()
    }

    /// Whether enough is configured to reach the remote query engine
    pub fn has_remote_credentials(&self) -> bool {
        self.project_id.is_some() && self.access_token.is_some()
    }

    /// Connection settings for the remote query engine
    pub fn remote_config(&self) -> Result<RemoteConfig> {
        let project_id = self.project_id.clone().ok_or_else(|| ReclassError::Configuration {
            message: "No project_id configured for remote queries".to_string(),
            suggestion: Some(format!("Set project_id in the config file or {}_PROJECT_ID", ENV_PREFIX)),
        })?;
        let access_token = self.access_token.clone().ok_or_else(|| ReclassError::Configuration {
            message: "No access_token configured for remote queries".to_string(),
            suggestion: Some(format!(
                "Set {}_ACCESS_TOKEN, e.g. from `gcloud auth print-access-token`",
                ENV_PREFIX
            )),
        })?;
        Ok(RemoteConfig {
            project_id: Some(project_id),
            location: self.location.clone(),
            access_token: Some(access_token),
            api_endpoint: self.api_endpoint.clone(),
            timeout_seconds: self.timeout_seconds,
            show_progress: self.enable_progress_bar && cfg!(feature = "progress"),
            ..Default::default()
        })
    }

    /// Copy safe to print: the access token is masked
    pub fn redacted(&self) -> Self {
        let mut shown = self.clone();
        if shown.access_token.is_some() {
            shown.access_token = Some(REDACTED.to_string());
        }
        shown
    }
}

// Global configuration support
use std::sync::RwLock;

lazy_static::lazy_static! {
    static ref GLOBAL_CONFIG: RwLock<Option<AnalysisConfig>> = RwLock::new(None);
}

/// Set the global configuration
pub fn set_global_config(config: AnalysisConfig) {
    if let Ok(mut guard) = GLOBAL_CONFIG.write() {
        *guard = Some(config);
    }
}

/// Get the global configuration (or the layered default if not set)
pub fn global_config() -> AnalysisConfig {
    GLOBAL_CONFIG
        .read()
        .ok()
        .and_then(|guard| guard.clone())
        .unwrap_or_else(AnalysisConfig::load)
}

/// Clear the global configuration
pub fn clear_global_config() {
    if let Ok(mut guard) = GLOBAL_CONFIG.write() {
        *guard = None;
    }
}

/// Builder for customizing configuration
#[derive(Default)]
pub struct ConfigBuilder {
    config: AnalysisConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.config.cache_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn output_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.config.output_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn project_id(mut self, project: impl Into<String>) -> Self {
        self.config.project_id = Some(project.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.config.location = Some(location.into());
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.config.access_token = Some(token.into());
        self
    }

    pub fn corrupt_cache_policy(mut self, policy: CorruptCachePolicy) -> Self {
        self.config.corrupt_cache_policy = policy;
        self
    }

    /// Set progress bar enabled
    pub fn progress_bar(mut self, enabled: bool) -> Self {
        self.config.enable_progress_bar = enabled;
        self
    }

    pub fn chart_size(mut self, width: f64, height: f64) -> Self {
        self.config.chart_width = width;
        self.config.chart_height = height;
        self
    }

    pub fn boundaries_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.boundaries_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn build(self) -> AnalysisConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults() {
        let config = AnalysisConfig::default();
        assert!(config.enable_progress_bar);
        assert_eq!(config.corrupt_cache_policy, CorruptCachePolicy::Fail);
        assert_eq!(config.api_endpoint, DEFAULT_API_ENDPOINT);
        assert!(!config.has_remote_credentials());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .cache_dir("/tmp/cache")
            .project_id("ebmdatalab")
            .access_token("token")
            .corrupt_cache_policy(CorruptCachePolicy::Refetch)
            .progress_bar(false)
            .build();

        assert_eq!(config.cache_dir, PathBuf::from("/tmp/cache"));
        assert_eq!(config.corrupt_cache_policy, CorruptCachePolicy::Refetch);
        let remote = config.remote_config().unwrap();
        assert_eq!(remote.project_id.as_deref(), Some("ebmdatalab"));
        assert!(!remote.show_progress);
    }

    #[test]
    fn test_redacted_masks_token() {
        let config = ConfigBuilder::new().project_id("ebmdatalab").access_token("ya29.secret").build();
        let text = toml::to_string_pretty(&config.redacted()).unwrap();
        assert!(!text.contains("ya29.secret"));
        assert!(text.contains(REDACTED));
        assert_eq!(config.access_token.as_deref(), Some("ya29.secret"));
        assert_eq!(AnalysisConfig::default().redacted().access_token, None);
    }

    #[test]
    fn test_spinner_needs_progress_feature() {
        let config = ConfigBuilder::new().project_id("ebmdatalab").access_token("token").build();
        let remote = config.remote_config().unwrap();
        assert_eq!(remote.show_progress, cfg!(feature = "progress"));
    }

    #[test]
    fn test_remote_config_requires_project() {
        let err = AnalysisConfig::default().remote_config().unwrap_err();
        assert!(matches!(err, ReclassError::Configuration { .. }));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "output_dir = \"out\"\ncorrupt_cache_policy = \"refetch\"\n").unwrap();

        let config = AnalysisConfig::from_file(&path).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.corrupt_cache_policy, CorruptCachePolicy::Refetch);
        assert_eq!(config.timeout_seconds, 300);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let config = ConfigBuilder::new().location("EU").chart_size(1200.0, 600.0).build();
        config.save(&path).unwrap();
        assert_eq!(AnalysisConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_layered_explicit_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("explicit.toml");
        std::fs::write(&path, "timeout_seconds = 42\nregion_property = \"ccg_code\"\n").unwrap();

        let config = AnalysisConfig::load_layered(Some(&path)).unwrap();
        assert_eq!(config.timeout_seconds, 42);
        assert_eq!(config.region_property, "ccg_code");
    }

    #[test]
    fn test_layered_missing_explicit_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(AnalysisConfig::load_layered(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
