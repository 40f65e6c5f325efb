use anyhow::{Context, Result};
use itc503_lib::{transport::ConnectOptions, Itc503Config};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};

fn default_address() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(flatten)]
    pub options: ConnectOptions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            options: ConnectOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub driver: Itc503Config,
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &'static str = "itc503.yml";
}

/// Loads `path`, or the default file if it exists, or falls back to defaults.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default_file = PathBuf::from(Config::DEFAULT_CONFIG_FILE);
            if !default_file.exists() {
                log::debug!("No config file, using defaults");
                return Ok(Config::default());
            }
            default_file
        }
    };
    log::debug!("Loading config file from {path:?}");
    let config_file =
        File::open(&path).with_context(|| format!("Cannot open config file {path:?}"))?;
    serde_yaml::from_reader(&config_file)
        .with_context(|| format!("Cannot parse config file {path:?}"))
}
