use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Version embedded at build time; a new build means a new generation.
const BUILD_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  pub generation: GenerationConfig,
  /// Base URL the manifest paths are resolved against
  pub origin: String,
  /// Critical resources that must all be cached for offline use
  pub manifest: Vec<String>,
  /// Served for navigations that have neither network nor cache entry.
  /// Must be listed in `manifest`.
  pub offline_page: String,
  pub notifications: NotificationDefaults,
  /// Reserved tag of the deferred data-sync task
  pub sync_tag: String,
  /// Cache database location (defaults to $XDG_DATA_HOME/offgrid/cache.db)
  pub cache_path: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      generation: GenerationConfig::default(),
      origin: "http://localhost:8080/".to_string(),
      manifest: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/css/styles.css".to_string(),
        "/js/app.js".to_string(),
        "/js/charts.js".to_string(),
        "/offline.html".to_string(),
      ],
      offline_page: "/offline.html".to_string(),
      notifications: NotificationDefaults::default(),
      sync_tag: "sync-data".to_string(),
      cache_path: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
  pub name: String,
  pub version: String,
}

impl Default for GenerationConfig {
  fn default() -> Self {
    Self {
      name: "ops-dashboard".to_string(),
      version: BUILD_VERSION.to_string(),
    }
  }
}

impl GenerationConfig {
  /// Cache store name of this generation.
  pub fn cache_name(&self) -> String {
    format!("{}@{}", self.name, self.version)
  }
}

/// Content used for any push field the payload leaves out.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  /// Untagged pushes share this tag so they collapse into one notification
  pub tag: String,
}

impl Default for NotificationDefaults {
  fn default() -> Self {
    Self {
      title: "Operations Dashboard".to_string(),
      body: "New dashboard data is available".to_string(),
      icon: "/icons/icon-192.png".to_string(),
      badge: "/icons/badge-72.png".to_string(),
      tag: "ops-dashboard-update".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
  ///
  /// Built-in defaults apply when no file is found. `OFFGRID_ORIGIN`
  /// overrides the origin.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var("OFFGRID_ORIGIN") {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    self.origin_url()?;

    if self.generation.name.is_empty() || self.generation.version.is_empty() {
      return Err(eyre!("Generation name and version must not be empty"));
    }

    if !self.manifest.contains(&self.offline_page) {
      return Err(eyre!(
        "Offline page {} is not listed in the manifest",
        self.offline_page
      ));
    }

    if self.sync_tag.is_empty() {
      return Err(eyre!("Sync tag must not be empty"));
    }

    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Absolute URL of a path relative to the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid resource path {}: {}", path, e))
  }

  pub fn manifest_urls(&self) -> Result<Vec<Url>> {
    self.manifest.iter().map(|p| self.resolve(p)).collect()
  }

  pub fn offline_url(&self) -> Result<Url> {
    self.resolve(&self.offline_page)
  }

  /// Cache database location.
  pub fn cache_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache_path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offgrid").join("cache.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(
      config.generation.cache_name(),
      format!("ops-dashboard@v{}", env!("CARGO_PKG_VERSION"))
    );
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
generation:
  version: "2024.06.1"
origin: https://fleet.example.com/app/
"#,
    )
    .unwrap();

    assert_eq!(config.generation.cache_name(), "ops-dashboard@2024.06.1");
    assert_eq!(config.sync_tag, "sync-data");
    assert_eq!(config.manifest.len(), 6);
  }

  #[test]
  fn test_manifest_resolves_against_origin() {
    let config = Config {
      origin: "https://fleet.example.com/app/".to_string(),
      manifest: vec!["index.html".to_string(), "/offline.html".to_string()],
      offline_page: "/offline.html".to_string(),
      ..Config::default()
    };

    let urls: Vec<String> = config
      .manifest_urls()
      .unwrap()
      .into_iter()
      .map(String::from)
      .collect();
    assert_eq!(
      urls,
      vec![
        "https://fleet.example.com/app/index.html",
        "https://fleet.example.com/offline.html"
      ]
    );
  }

  #[test]
  fn test_offline_page_must_be_in_manifest() {
    let config = Config {
      offline_page: "/missing.html".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_invalid_origin_rejected() {
    let config = Config {
      origin: "not a url".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let result = Config::load(Some(Path::new("/nonexistent/offgrid.yaml")));
    assert!(result.is_err());
  }
}
