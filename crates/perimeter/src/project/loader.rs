//! Project Loader
//!
//! Loads project configuration from disk. The manifest goes through figment
//! so any key can be overridden from the environment, e.g.
//! `PERIMETER_RUNTIME__RECONNECT_DELAY_MS=1000`.

use std::collections::BTreeMap;
use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use tokio::fs;
use tracing::{debug, info, warn};

use super::config::*;

pub const ENV_PREFIX: &str = "PERIMETER_";

/// Error type for project loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Project path does not exist: {0}")]
    PathNotFound(std::path::PathBuf),

    #[error("Project manifest not found: {0}")]
    ManifestNotFound(std::path::PathBuf),

    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to load manifest: {0}")]
    ManifestError(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Project loader
pub struct ProjectLoader;

impl ProjectLoader {
    /// Load a project from the given path
    pub async fn load(path: impl AsRef<Path>) -> Result<Project, LoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(LoadError::PathNotFound(path.to_path_buf()));
        }

        info!("Loading project from: {}", path.display());

        let manifest_path = path.join("project.toml");
        if !manifest_path.exists() {
            return Err(LoadError::ManifestNotFound(manifest_path));
        }

        let manifest = Self::load_manifest(&manifest_path)?;
        info!("Loaded project manifest: {} ({})", manifest.project.name, manifest.project.id);

        let devices = Self::load_devices(path).await?;
        info!("Loaded {} devices", devices.len());

        Ok(Project {
            path: path.to_path_buf(),
            manifest,
            devices,
        })
    }

    fn load_manifest(path: &Path) -> Result<ProjectManifest, LoadError> {
        let manifest: ProjectManifest = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        validate_runtime(&manifest.runtime)?;
        Ok(manifest)
    }

    /// Load all devices from the devices/ directory. Unreadable or invalid
    /// files are skipped; two files claiming the same identity are fatal.
    async fn load_devices(project_path: &Path) -> Result<BTreeMap<String, DeviceConfig>, LoadError> {
        let devices_dir = project_path.join("devices");
        let mut devices: BTreeMap<String, DeviceConfig> = BTreeMap::new();

        if !devices_dir.exists() {
            debug!("No devices directory found");
            return Ok(devices);
        }

        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&devices_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_device = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".device.toml"));
            if is_device {
                paths.push(path);
            }
        }
        // Directory order is platform-dependent
        paths.sort();

        for path in paths {
            let device = match Self::load_device(&path).await {
                Ok(device) => device,
                Err(e) => {
                    warn!("Failed to load device from {}: {}", path.display(), e);
                    continue;
                }
            };

            if devices.contains_key(&device.device.id) {
                return Err(LoadError::Invalid(format!(
                    "duplicate device id '{}' in {}",
                    device.device.id,
                    path.display()
                )));
            }

            debug!("Loaded device: {}", device.device.id);
            devices.insert(device.device.id.clone(), device);
        }

        Ok(devices)
    }

    /// Load a single device configuration
    async fn load_device(path: &Path) -> Result<DeviceConfig, LoadError> {
        let content = fs::read_to_string(path).await?;
        let device: DeviceConfig = toml::from_str(&content)?;
        validate_device(&device)?;
        Ok(device)
    }
}

fn validate_runtime(runtime: &RuntimeConfig) -> Result<(), LoadError> {
    if !runtime.backoff_multiplier.is_finite() || runtime.backoff_multiplier < 1.0 {
        return Err(LoadError::Invalid(format!(
            "runtime.backoff_multiplier must be finite and >= 1.0, got {}",
            runtime.backoff_multiplier
        )));
    }
    if runtime.max_reconnect_delay_ms < runtime.reconnect_delay_ms {
        return Err(LoadError::Invalid(
            "runtime.max_reconnect_delay_ms must be >= runtime.reconnect_delay_ms".into(),
        ));
    }
    if runtime.outbound_queue == 0 {
        return Err(LoadError::Invalid("runtime.outbound_queue must be > 0".into()));
    }
    Ok(())
}

fn validate_device(config: &DeviceConfig) -> Result<(), LoadError> {
    if config.device.id.trim().is_empty() {
        return Err(LoadError::Invalid("device.id is empty".into()));
    }
    if config.connection.endpoint.trim().is_empty() {
        return Err(LoadError::Invalid(format!(
            "device {} has an empty connection.endpoint",
            config.device.id
        )));
    }
    if config.device.max_zoom.is_nan() || config.device.max_zoom < 1.0 {
        return Err(LoadError::Invalid(format!(
            "device {} has max_zoom {} (must be >= 1.0)",
            config.device.id, config.device.max_zoom
        )));
    }
    Ok(())
}
