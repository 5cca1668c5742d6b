// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Server settings.
//!
//! Layering, lowest to highest priority: built-in defaults, the persisted
//! `server` config, then `GLANCE_*` environment variables and command-line
//! flags (see [`SettingsArgs`]).

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use glance_config::{ConfigError, ConfigService, ConfigStore};
use glance_proto::DEFAULT_PORT;
use glance_scene::{Color, OptionError, RenderDefaults, Texture};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Config key the settings are persisted under.
pub const CONFIG_KEY: &str = "server";

/// Settings could not be loaded or are invalid.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A value is out of range or unparseable.
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// A render default (color or texture) is malformed.
    #[error("invalid render default: {0}")]
    Render(#[from] OptionError),
    /// The persisted config could not be read.
    #[error("failed to load settings: {0}")]
    Config(#[from] ConfigError),
}

fn default_build_workers() -> usize {
    std::thread::available_parallelism().map_or(4, NonZeroUsize::get)
}

/// Effective server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Interface to bind.
    pub host: String,
    /// TCP port; `0` picks an ephemeral port.
    pub port: u16,
    /// How long `stop` waits for a first viewer before giving up.
    pub graceful_connect_secs: f64,
    /// How long `stop` waits for in-flight requests.
    pub graceful_work_secs: f64,
    /// Interval between keep-alive comments on the update feed.
    pub keep_alive_secs: f64,
    /// Optional cap on the event log.
    pub history_cap: Option<usize>,
    /// Concurrent builds.
    pub build_workers: usize,
    /// Largest GLB accepted from disk.
    pub max_blob_bytes: usize,
    /// Default face color (`#RRGGBB[AA]`).
    pub color_faces: String,
    /// Default edge color.
    pub color_edges: String,
    /// Default vertex color.
    pub color_vertices: String,
    /// Default face texture (`file:` or `data:` URI).
    pub texture: Option<String>,
    /// Directory served for every path the API does not claim.
    pub frontend_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            graceful_connect_secs: 12.0,
            graceful_work_secs: 1_000_000.0,
            keep_alive_secs: 5.0,
            history_cap: None,
            build_workers: default_build_workers(),
            max_blob_bytes: 256 * 1024 * 1024,
            color_faces: "#ffbf00".to_string(),
            color_edges: "#1a1aff".to_string(),
            color_vertices: "#1a1a1a".to_string(),
            texture: None,
            frontend_dir: None,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Settings {
    /// Defaults overlaid with the persisted `server` config, if any.
    pub fn load<S: ConfigStore>(config: &ConfigService<S>) -> Result<Self, SettingsError> {
        Ok(config.load_or_default(CONFIG_KEY)?)
    }

    /// Persist these settings under the `server` key.
    pub fn save<S: ConfigStore>(&self, config: &ConfigService<S>) -> Result<(), SettingsError> {
        config.save(CONFIG_KEY, self)?;
        Ok(())
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field, reason: &str| SettingsError::Invalid {
            field,
            reason: reason.to_string(),
        };
        if self.host.trim().is_empty() {
            return Err(invalid("host", "must not be empty"));
        }
        for (field, value) in [
            ("graceful_connect_secs", self.graceful_connect_secs),
            ("graceful_work_secs", self.graceful_work_secs),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(invalid(field, "must be a non-negative number of seconds"));
            }
        }
        if !(self.keep_alive_secs.is_finite() && self.keep_alive_secs > 0.0) {
            return Err(invalid("keep_alive_secs", "must be positive"));
        }
        if self.build_workers == 0 {
            return Err(invalid("build_workers", "must be at least 1"));
        }
        if self.max_blob_bytes == 0 {
            return Err(invalid("max_blob_bytes", "must be at least 1"));
        }
        if self.history_cap == Some(0) {
            return Err(invalid("history_cap", "must be at least 1 when set"));
        }
        self.render_defaults().map(drop)
    }

    /// Parsed colors and texture.
    pub fn render_defaults(&self) -> Result<RenderDefaults, SettingsError> {
        Ok(RenderDefaults {
            color_faces: self.color_faces.parse::<Color>()?,
            color_edges: self.color_edges.parse::<Color>()?,
            color_vertices: self.color_vertices.parse::<Color>()?,
            texture: self.texture.as_deref().map(Texture::from_uri).transpose()?,
        })
    }

    /// `graceful_connect_secs` as a duration.
    pub fn graceful_connect(&self) -> Duration {
        secs(self.graceful_connect_secs)
    }

    /// `graceful_work_secs` as a duration.
    pub fn graceful_work(&self) -> Duration {
        secs(self.graceful_work_secs)
    }

    /// `keep_alive_secs` as a duration.
    pub fn keep_alive(&self) -> Duration {
        secs(self.keep_alive_secs)
    }
}

/// Command-line and environment overrides.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct SettingsArgs {
    /// Interface to bind
    #[arg(long, env = "GLANCE_HOST")]
    pub host: Option<String>,
    /// TCP port (0 = ephemeral)
    #[arg(long, env = "GLANCE_PORT")]
    pub port: Option<u16>,
    /// Seconds `stop` waits for a first viewer
    #[arg(long, env = "GLANCE_GRACEFUL_SECS_CONNECT")]
    pub graceful_connect_secs: Option<f64>,
    /// Seconds `stop` waits for in-flight requests
    #[arg(long, env = "GLANCE_GRACEFUL_SECS_WORK")]
    pub graceful_work_secs: Option<f64>,
    /// Seconds between update-feed keep-alives
    #[arg(long, env = "GLANCE_KEEP_ALIVE_SECS")]
    pub keep_alive_secs: Option<f64>,
    /// Maximum event-log length
    #[arg(long, env = "GLANCE_HISTORY_CAP")]
    pub history_cap: Option<usize>,
    /// Concurrent builds
    #[arg(long, env = "GLANCE_BUILD_WORKERS")]
    pub build_workers: Option<usize>,
    /// Largest GLB accepted from disk, in bytes
    #[arg(long, env = "GLANCE_MAX_BLOB_BYTES")]
    pub max_blob_bytes: Option<usize>,
    /// Default face color (#RRGGBB or #RRGGBBAA)
    #[arg(long, env = "GLANCE_COLOR_FACES")]
    pub color_faces: Option<String>,
    /// Default edge color
    #[arg(long, env = "GLANCE_COLOR_EDGES")]
    pub color_edges: Option<String>,
    /// Default vertex color
    #[arg(long, env = "GLANCE_COLOR_VERTICES")]
    pub color_vertices: Option<String>,
    /// Default face texture (file:<path> or data:<mime>;base64,<data>)
    #[arg(long, env = "GLANCE_TEXTURE")]
    pub texture: Option<String>,
    /// Static frontend directory
    #[arg(long, env = "GLANCE_FRONTEND_DIR")]
    pub frontend_dir: Option<PathBuf>,
}

impl SettingsArgs {
    /// Overwrite every field of `settings` that was given here.
    pub fn apply(self, settings: &mut Settings) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }
        set(&mut settings.host, self.host);
        set(&mut settings.port, self.port);
        set(&mut settings.graceful_connect_secs, self.graceful_connect_secs);
        set(&mut settings.graceful_work_secs, self.graceful_work_secs);
        set(&mut settings.keep_alive_secs, self.keep_alive_secs);
        set(&mut settings.build_workers, self.build_workers);
        set(&mut settings.max_blob_bytes, self.max_blob_bytes);
        set(&mut settings.color_faces, self.color_faces);
        set(&mut settings.color_edges, self.color_edges);
        set(&mut settings.color_vertices, self.color_vertices);
        if self.history_cap.is_some() {
            settings.history_cap = self.history_cap;
        }
        if self.texture.is_some() {
            settings.texture = self.texture;
        }
        if self.frontend_dir.is_some() {
            settings.frontend_dir = self.frontend_dir;
        }
    }
}
