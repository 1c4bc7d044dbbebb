// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

#[cfg(test)]
#[path = "./args_test.rs"]
mod args_test;

const EXECPIPE_LOG: &str = "EXECPIPE_LOG";

/// Command line flags for configuring logging
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Logging {
    /// Make output more verbose, can be specified more than once
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to this file instead of stderr
    #[clap(long, global = true, env = "EXECPIPE_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// Build the log filter for a verbosity level.
///
/// The default level can be replaced with the `EXECPIPE_LOG` value and
/// extended with `RUST_LOG`, both of which are given here when set.
pub fn filter_directives(
    verbosity: u8,
    existing: Option<String>,
    overrides: Option<String>,
) -> String {
    let mut config = match verbosity {
        0 => existing.unwrap_or_else(|| "execpipe=info,warn".to_string()),
        1 => "execpipe=debug,info".to_string(),
        2 => "execpipe=trace,info".to_string(),
        3 => "execpipe=trace,debug".to_string(),
        _ => "trace".to_string(),
    };
    if let Some(overrides) = overrides {
        config.push(',');
        config.push_str(&overrides);
    }
    config
}

pub fn configure_logging(logging: &Logging) -> Result<()> {
    let config = filter_directives(
        logging.verbose,
        std::env::var(EXECPIPE_LOG).ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let env_filter = tracing_subscriber::filter::EnvFilter::from(config);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(logging.verbose > 2);

    match &logging.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let sub = tracing_subscriber::registry().with(
                fmt_layer
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(env_filter),
            );
            tracing::subscriber::set_global_default(sub)
                .context("Failed to install the logger")?;
        }
        None => {
            let sub = tracing_subscriber::registry()
                .with(fmt_layer.with_writer(std::io::stderr).with_filter(env_filter));
            tracing::subscriber::set_global_default(sub)
                .context("Failed to install the logger")?;
        }
    }
    Ok(())
}

/// Trait all execpipe cli command parsers must implement to provide
/// the name of the command that has been parsed. The name is attached
/// to everything the command logs.
pub trait CommandName {
    fn command_name(&self) -> &str;
}

/// Generate a synchronous `main` function for a command parser.
///
/// The parser must have a `logging` field and a
/// `run(&mut self, &execpipe::Config) -> anyhow::Result<i32>` method.
#[macro_export]
macro_rules! main {
    ($cmd:ident) => {
        fn main() {
            // because this function exits right away it does not
            // properly handle destruction of data, so we put the actual
            // logic into a separate function/scope
            std::process::exit(main2())
        }
        fn main2() -> i32 {
            let mut opt = $cmd::parse();
            let config = $crate::configure!(opt);
            let span = tracing::info_span!("command", name = opt.command_name());
            let result = span.in_scope(|| opt.run(&config));
            $crate::handle_result!(result)
        }
    };
}

#[macro_export]
macro_rules! configure {
    ($opt:ident) => {{
        if let Err(err) = $crate::configure_logging(&$opt.logging) {
            eprintln!("{err:?}");
            return 1;
        }
        match execpipe::load_config() {
            Err(err) => {
                tracing::error!(err = ?err, "failed to load config");
                return 1;
            }
            Ok(config) => config,
        }
    }};
}

#[macro_export]
macro_rules! handle_result {
    ($result:ident) => {{
        match $result {
            Err(err) => {
                tracing::error!("{err:?}");
                1
            }
            Ok(code) => code,
        }
    }};
}
