//! Configuration file – reads/writes `~/.relume/config.toml`.
//!
//! Every field has a default, so an empty or partial file is valid.  After
//! loading, `RELUME_*` environment variables override individual values.

use std::fs;
use std::path::{Path, PathBuf};

use relume_hal::camera::CameraSettings;
use relume_runtime::{ControllerConfig, HostConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config already exists at {0}")]
    AlreadyExists(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// TCP address the controller listens on and the host connects to.
    pub addr: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:7878".to_string(),
        }
    }
}

/// Scenario for `relume sim`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub target_x_m: f32,
    pub target_y_m: f32,
    pub target_diameter_m: f32,
    /// Rendered frame size.
    pub width: u32,
    pub height: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            target_x_m: 2.5,
            target_y_m: 0.8,
            target_diameter_m: 0.2,
            width: 160,
            height: 120,
        }
    }
}

/// Persisted configuration stored in `~/.relume/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub camera: CameraSettings,
    /// Replay `.ppm` frames from this directory instead of the simulated
    /// camera.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_dir: Option<PathBuf>,
    pub host: HostConfig,
    pub controller: ControllerConfig,
    pub sim: SimConfig,
}

/// Return the path to `~/.relume/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".relume").join("config.toml")
}

/// Load `path` (or the default location), falling back to defaults when the
/// file does not exist, then apply environment overrides.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let mut cfg = load_from(&path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(toml::from_str(&raw)?))
}

/// Apply `RELUME_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `RELUME_LINK_ADDR` | `link.addr` |
/// | `RELUME_CAMERA_FPS` | `camera.fps` |
/// | `RELUME_HOST_PERIOD_MS` | `host.period_ms` |
/// | `RELUME_CONTROLLER_PERIOD_MS` | `controller.period_ms` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("RELUME_LINK_ADDR") {
        cfg.link.addr = v;
    }
    if let Some(fps) = lookup("RELUME_CAMERA_FPS").and_then(|v| v.parse().ok()) {
        cfg.camera.fps = fps;
    }
    if let Some(ms) = lookup("RELUME_HOST_PERIOD_MS").and_then(|v| v.parse().ok()) {
        cfg.host.period_ms = ms;
    }
    if let Some(ms) = lookup("RELUME_CONTROLLER_PERIOD_MS").and_then(|v| v.parse().ok()) {
        cfg.controller.period_ms = ms;
    }
}

/// Write `cfg` to `path`, refusing to overwrite unless `force` is set.
pub fn init(cfg: &Config, path: &Path, force: bool) -> Result<(), ConfigError> {
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }
    save_to(cfg, path)
}

/// Save the config, creating the parent directory if necessary.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
        // Owner-only directory (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
