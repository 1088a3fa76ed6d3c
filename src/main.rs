// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::path::PathBuf;
use std::process::ExitCode;

use bpaf::Bpaf;

fn default_config() -> Result<PathBuf, std::convert::Infallible> {
    Ok(PathBuf::from("/etc/lightnvr.toml"))
}

/// LightNVR: a lightweight network video recorder.
#[derive(Clone, Debug, Bpaf)]
#[bpaf(options, version)]
enum Args {
    /// Initializes the catalog and storage layout, then exits.
    #[bpaf(command)]
    Init {
        /// Path to the configuration file.
        #[bpaf(argument("PATH"), fallback_with(default_config))]
        config: PathBuf,
    },

    /// Runs the recorder until SIGINT.
    #[bpaf(command)]
    Run {
        /// Path to the configuration file.
        #[bpaf(argument("PATH"), fallback_with(default_config))]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = args().run();
    let r = match args {
        Args::Init { config } => lightnvr::cmds::init::run(&config),
        Args::Run { config } => lightnvr::cmds::run::run(&config),
    };
    match r {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {}", e.chain());
            ExitCode::FAILURE
        }
    }
}
