//! Configuration
//!
//! Directory layout of the service, loadable from JSON/TOML-style config
//! via serde with per-field defaults.

use serde::Deserialize;
use std::path::PathBuf;

/// Directories the manager works with
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Incoming capture files
    #[serde(default = "default_pcap_dir")]
    pub pcap_dir: PathBuf,

    /// Index artifacts (owned by the manager; superseded files are deleted)
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,

    /// Persisted tag/pcap state files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Converter executables, watched externally
    #[serde(default = "default_converter_dir")]
    pub converter_dir: PathBuf,
}

fn default_pcap_dir() -> PathBuf {
    PathBuf::from("data/pcap")
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("data/index")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("data/state")
}

fn default_converter_dir() -> PathBuf {
    PathBuf::from("data/converters")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pcap_dir: default_pcap_dir(),
            index_dir: default_index_dir(),
            state_dir: default_state_dir(),
            converter_dir: default_converter_dir(),
        }
    }
}

impl Config {
    /// All directories rooted under one base path.
    pub fn under(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            pcap_dir: base.join("pcap"),
            index_dir: base.join("index"),
            state_dir: base.join("state"),
            converter_dir: base.join("converters"),
        }
    }
}
