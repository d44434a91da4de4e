use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;
use tracing::{debug, info, info_span};

use crate::bus::common::{Error, Result};

/// Settings tunes the transport core's per-iteration budgets and backpressure
/// ceiling. Mirrors the teacher crate's `config/config.rs`: a `serde`-derived
/// struct with `#[serde(default = "...")]` fallbacks, loaded from a YAML file
/// discovered by walking up from the current directory.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Maximum bytes read from the socket per `do_reading` iteration, to keep
    /// `handle_watch` responsive against a peer sending a huge stream (§9).
    #[serde(default = "default_bytes_per_iteration")]
    pub max_bytes_read_per_iteration: usize,
    /// Maximum bytes written per `do_writing` iteration.
    #[serde(default = "default_bytes_per_iteration")]
    pub max_bytes_written_per_iteration: usize,
    /// Backpressure ceiling on the byte size of messages queued for dispatch
    /// but not yet consumed by the embedder (§4.6, §8 scenario 3).
    #[serde(default = "default_max_live_messages_size")]
    pub max_live_messages_size: u64,
    /// How long a transport may sit in the auth state machine before the
    /// embedder should give up and disconnect it. Zero disables the timeout.
    #[serde(default)]
    pub auth_timeout_seconds: u32,
    /// Backlog passed to `listen()` for accepting transport constructors.
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,
}

const fn default_bytes_per_iteration() -> usize {
    2048
}

const fn default_max_live_messages_size() -> u64 {
    64 * 1024 * 1024
}

const fn default_listen_backlog() -> u32 {
    128
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_bytes_read_per_iteration: default_bytes_per_iteration(),
            max_bytes_written_per_iteration: default_bytes_per_iteration(),
            max_live_messages_size: default_max_live_messages_size(),
            auth_timeout_seconds: 0,
            listen_backlog: default_listen_backlog(),
        }
    }
}

impl Settings {
    fn validate(&mut self) -> Result<()> {
        if self.max_bytes_read_per_iteration == 0 || self.max_bytes_written_per_iteration == 0 {
            return Err(Error::new("per-iteration byte budgets must be > 0"));
        }
        Ok(())
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Returns the process-wide Settings, loaded once via `load_config` or
/// `set_config`. Panics if neither has been called yet, same as the teacher
/// crate's `config()` accessor.
pub fn conf() -> &'static Settings {
    SETTINGS.get().expect("config not loaded, call load_config() first")
}

/// Installs `settings` as the process-wide config, bypassing the file
/// lookup. Used by tests and by embedders that build `Settings` themselves.
pub fn set_config(settings: Settings) -> &'static Settings {
    SETTINGS.get_or_init(|| settings)
}

/// Loads `config_name` (default `linkbus.yaml`) by searching the current
/// directory and its ancestors, then `~/.config/linkbus/`, then
/// `/etc/linkbus/`, following the teacher's `find_config_file` search order.
/// If no file is found, falls back to `Settings::default()`.
pub fn load_config(config_name: &str) -> Result<&'static Settings> {
    let _span = info_span!("loading config file").entered();
    let settings = match find_config_file(config_name) {
        Some(path) => {
            info!(config_path = %path.to_string_lossy(), "found config file");
            let file = File::open(&path)?;
            let mut settings: Settings = serde_yaml::from_reader(file)
                .map_err(|e| Error::new(format!("invalid config file {}: {}", path.display(), e)))?;
            settings.validate()?;
            settings
        }
        None => {
            debug!("no config file found, using defaults");
            Settings::default()
        }
    };
    Ok(set_config(settings))
}

fn find_config_file(config_name: &str) -> Option<PathBuf> {
    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        loop {
            let fp = Path::join(dir, config_name);
            if fp.exists() {
                return Some(fp);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    let home = env::var("HOME").unwrap_or_else(|_| "~/".to_string());

    let conf_path = Path::join(Path::new(&home), Path::join(Path::new(".config/linkbus"), config_name));
    if conf_path.exists() {
        return Some(conf_path);
    }

    let conf_path = Path::join(Path::new("/etc/linkbus"), config_name);
    if conf_path.exists() {
        return Some(conf_path);
    }

    None
}
