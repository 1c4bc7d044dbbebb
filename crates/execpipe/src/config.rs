// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pid::PidFileReader;
use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

static DEFAULT_SUPERVISOR: &str = "execpipe-supervise";
static DEFAULT_RUNTIME: &str = "runc";

/// Settings for launching and tracking processes
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Runner {
    /// The supervisor binary that is spawned once per process
    pub supervisor_path: PathBuf,
    /// The container runtime binary that the supervisor invokes
    pub runtime_path: PathBuf,
    /// State directory for the container runtime, passed as `--root`
    pub runtime_root: Option<PathBuf>,
    /// Base directory for tty console sockets
    pub socket_dir: Option<PathBuf>,
    /// Remove each process directory once its exit code has been collected
    pub cleanup_process_dirs_on_wait: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self {
            supervisor_path: PathBuf::from(DEFAULT_SUPERVISOR),
            runtime_path: PathBuf::from(DEFAULT_RUNTIME),
            runtime_root: None,
            socket_dir: None,
            cleanup_process_dirs_on_wait: false,
        }
    }
}

/// Settings for resolving the pid of a running process
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PidFile {
    /// How long to wait for the runtime to write the pidfile
    pub timeout_ms: u64,
    /// Delay between attempts to read the pidfile
    pub interval_ms: u64,
}

impl Default for PidFile {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            interval_ms: 100,
        }
    }
}

impl PidFile {
    /// Create a pidfile reader with these settings
    pub fn reader(&self) -> PidFileReader {
        PidFileReader {
            timeout: Duration::from_millis(self.timeout_ms),
            interval: Duration::from_millis(self.interval_ms),
        }
    }
}

/// Configuration values for execpipe.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    // These sub-types should only have one level of values
    // within them, otherwise they cannot be addressed with
    // environment variables.
    pub runner: Runner,
    pub pidfile: PidFile,
}

impl Config {
    /// Parse a configuration from toml source
    pub fn load_string<S: AsRef<str>>(conf: S) -> Result<Self> {
        use config::{Config as RawConfig, File, FileFormat};

        let config = RawConfig::builder()
            .add_source(File::from_str(conf.as_ref(), FileFormat::Toml))
            .build()?;
        Ok(Config::deserialize(config)?)
    }
}

/// Load the execpipe configuration from disk.
///
/// This includes the default, system and user configurations, if they
/// exist, followed by any `EXECPIPE_<SECTION>_<NAME>` environment variables.
pub fn load_config() -> Result<Config> {
    load_config_from_vars(std::env::vars())
}

fn load_config_from_vars<I>(vars: I) -> Result<Config>
where
    I: IntoIterator<Item = (String, String)>,
{
    use config::{Config as RawConfig, File};

    let mut config_builder = RawConfig::builder()
        // the system config can be in any supported format: toml, yaml, json, ini, etc
        .add_source(File::with_name("/etc/execpipe").required(false));

    if let Some(user_config) = dirs::config_dir() {
        let user_config = user_config.join("execpipe").join("execpipe");
        config_builder = config_builder
            .add_source(File::with_name(&format!("{}", user_config.display())).required(false));
    }

    for (var, value) in vars {
        let Some(tail) = var.strip_prefix("EXECPIPE_") else {
            continue;
        };
        let Some((section, name)) = tail.split_once('_') else {
            // a value with no section is not a configuration
            // value, and can be skipped (eg: EXECPIPE_LOG)
            continue;
        };

        let key = format!("{}.{}", section.to_lowercase(), name.to_lowercase());
        config_builder = config_builder.set_override(key, value)?;
    }

    let config = config_builder.build()?;
    Ok(Config::deserialize(config)?)
}
