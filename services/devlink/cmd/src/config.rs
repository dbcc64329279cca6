//! Configuration handling for the devlink command line.
//!
//! Settings come from three layers, later ones winning: the YAML config
//! file, `DEVLINK_*` environment variables, and command-line flags (applied
//! by `main`).

use anyhow::{Context, Result};
use devlink_session::{LinkConfig, ShortAckPolicy, DEFAULT_BAUD_RATE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Resolved devlink configuration
#[derive(Debug, Clone)]
pub struct DevlinkConfig {
    /// Serial port to open
    pub device: Option<PathBuf>,
    /// Serial port speed
    pub baud_rate: u32,
    /// Serial bridge address (`host:port`)
    pub connect: Option<String>,
    /// Session tuning
    pub link: LinkConfig,
}

impl Default for DevlinkConfig {
    fn default() -> Self {
        Self {
            device: None,
            baud_rate: DEFAULT_BAUD_RATE,
            connect: None,
            link: LinkConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RootConfig {
    device: Option<PathBuf>,
    baud_rate: Option<u32>,
    connect: Option<String>,
    link: Option<LinkSection>,
}

/// `link:` section; durations in milliseconds
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkSection {
    response_timeout_ms: Option<u64>,
    list_timeout_ms: Option<u64>,
    chunk_ack_timeout_ms: Option<u64>,
    chunk_attempts: Option<u32>,
    delete_attempts: Option<u32>,
    default_max_payload: Option<u32>,
    max_inbox_frames: Option<usize>,
    max_stalled_acks: Option<u32>,
    short_ack_policy: Option<ShortAckPolicy>,
}

impl DevlinkConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file yields defaults; a file that does not parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                config.apply_root_config(root);
                info!("Loaded configuration from {:?}", path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {:?}", path));
            }
        }

        config.apply_environment_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        if root.device.is_some() {
            self.device = root.device;
        }
        if let Some(baud_rate) = root.baud_rate {
            self.baud_rate = baud_rate;
        }
        if root.connect.is_some() {
            self.connect = root.connect;
        }

        let Some(section) = root.link else {
            return;
        };
        let link = &mut self.link;
        if let Some(ms) = section.response_timeout_ms {
            link.response_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = section.list_timeout_ms {
            link.list_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = section.chunk_ack_timeout_ms {
            link.chunk_ack_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = section.chunk_attempts {
            link.chunk_attempts = n;
        }
        if let Some(n) = section.delete_attempts {
            link.delete_attempts = n;
        }
        if let Some(n) = section.default_max_payload {
            link.default_max_payload = n;
        }
        if let Some(n) = section.max_inbox_frames {
            link.max_inbox_frames = n;
        }
        if let Some(n) = section.max_stalled_acks {
            link.max_stalled_acks = n;
        }
        if let Some(policy) = section.short_ack_policy {
            link.short_ack_policy = policy;
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(device) = lookup("DEVLINK_DEVICE") {
            info!("Device overridden by environment: {}", device);
            self.device = Some(PathBuf::from(device));
        }

        if let Some(connect) = lookup("DEVLINK_CONNECT") {
            info!("Bridge address overridden by environment: {}", connect);
            self.connect = Some(connect);
        }

        if let Some(raw) = lookup("DEVLINK_MAX_PAYLOAD") {
            match raw.parse::<u32>() {
                Ok(n) => {
                    self.link.default_max_payload = n;
                    info!("Max payload overridden by environment: {}", n);
                }
                Err(_) => warn!("Ignoring invalid DEVLINK_MAX_PAYLOAD={:?}", raw),
            }
        }
    }
}
