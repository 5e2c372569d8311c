//! Typed configuration.
//!
//! Built once by the host process and handed to the engine by value; nothing
//! here is cached globally. Values come from an optional TOML file, then
//! environment variables override individual fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_path: PathBuf,
    pub image_directory: PathBuf,
    /// How long a lease stays exclusive before another reservation may take
    /// the item over.
    pub lease_timeout: Duration,
    /// Lowercase, without a leading dot.
    pub extensions: Vec<String>,
    pub categories: Vec<Category>,
    /// Upper bound on waiting for another transaction's write lock.
    pub busy_timeout: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// A label category offered to annotators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/labels.db"),
            image_directory: PathBuf::from("images"),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            categories: Vec::new(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// On-disk shape of the TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    database: Option<PathBuf>,
    image_directory: Option<PathBuf>,
    reservation_timeout_seconds: Option<u64>,
    busy_timeout_seconds: Option<u64>,
    extensions: Option<Vec<String>>,
    #[serde(default)]
    categories: Vec<Category>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from environment variables only.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// Relative paths in the file resolve against the file's directory.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let config = Self::from_toml_str(&text, base)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the TOML file if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_toml_str(text: &str, base: &Path) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid config file: {e}")))?;

        let mut config = Self::default();
        if let Some(db) = file.database {
            config.database_path = resolve(base, db);
        }
        if let Some(dir) = file.image_directory {
            config.image_directory = resolve(base, dir);
        } else {
            config.image_directory = resolve(base, config.image_directory);
        }
        if let Some(secs) = file.reservation_timeout_seconds {
            config.lease_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.busy_timeout_seconds {
            config.busy_timeout = Duration::from_secs(secs);
        }
        if let Some(exts) = file.extensions {
            config.extensions = normalize_extensions(exts);
        }
        config.categories = file.categories;
        config.otel_endpoint = file.otel_endpoint;
        if let Some(level) = file.log_level {
            config.log_level = level;
        }
        Ok(config)
    }

    /// Override fields from variables visible through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(db) = lookup("LABELQ_DATABASE") {
            self.database_path = PathBuf::from(db);
        }
        if let Some(dir) = lookup("LABELQ_IMAGE_DIR") {
            self.image_directory = PathBuf::from(dir);
        }
        if let Some(secs) = lookup("LABELQ_LEASE_TIMEOUT_SECS") {
            self.lease_timeout = Duration::from_secs(parse_secs("LABELQ_LEASE_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = lookup("LABELQ_BUSY_TIMEOUT_SECS") {
            self.busy_timeout = Duration::from_secs(parse_secs("LABELQ_BUSY_TIMEOUT_SECS", &secs)?);
        }
        if let Some(exts) = lookup("LABELQ_EXTENSIONS") {
            self.extensions = normalize_extensions(exts.split(',').map(str::to_string));
        }
        if let Some(endpoint) = lookup("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(endpoint);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.lease_timeout.is_zero() {
            return Err(Error::Config("lease timeout must be greater than zero".into()));
        }
        if chrono::TimeDelta::from_std(self.lease_timeout).is_err() {
            return Err(Error::Config("lease timeout is out of range".into()));
        }
        if self.extensions.is_empty() {
            return Err(Error::Config("at least one image extension is required".into()));
        }
        Ok(())
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_image_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_directory = dir.into();
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_extensions<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = normalize_extensions(exts.into_iter().map(Into::into));
        self
    }

    pub fn with_categories(mut self, categories: Vec<Category>) -> Self {
        self.categories = categories;
        self
    }

    /// Lease timeout as a chrono delta for timestamp arithmetic.
    pub(crate) fn lease_timeout_delta(&self) -> Result<chrono::TimeDelta> {
        chrono::TimeDelta::from_std(self.lease_timeout)
            .map_err(|_| Error::Config("lease timeout is out of range".into()))
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn parse_secs(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be a whole number of seconds, got {value:?}")))
}

fn normalize_extensions(exts: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = exts
        .into_iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn toml_file_values_and_relative_paths() {
        let text = r#"
            database = "state/labels.db"
            image_directory = "/srv/images"
            reservation_timeout_seconds = 120
            extensions = [".JPG", "png", "png"]

            [[categories]]
            name = "quality"
            labels = ["sharp", "blurry image"]
        "#;
        let config = Config::from_toml_str(text, Path::new("/etc/labelq")).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/etc/labelq/state/labels.db"));
        assert_eq!(config.image_directory, PathBuf::from("/srv/images"));
        assert_eq!(config.lease_timeout, Duration::from_secs(120));
        assert_eq!(config.extensions, vec!["jpg", "png"]);
        assert_eq!(config.categories.len(), 1);
        assert_eq!(config.categories[0].labels[1], "blurry image");
    }

    #[test]
    fn unknown_toml_key_is_rejected() {
        let err = Config::from_toml_str("colour = 3", Path::new(".")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("LABELQ_LEASE_TIMEOUT_SECS", "45"),
            ("LABELQ_EXTENSIONS", "tif, .TIFF"),
            ("LOG_LEVEL", "debug"),
        ]);
        let mut config = Config::default();
        config
            .apply_env(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.lease_timeout, Duration::from_secs(45));
        assert_eq!(config.extensions, vec!["tif", "tiff"]);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn bad_timeout_in_env_is_a_config_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(|name| (name == "LABELQ_LEASE_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_timeout_fails_validation() {
        let config = Config::default().with_lease_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
