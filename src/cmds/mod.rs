// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommands of the `lightnvr` binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base::{err, Error};
use db::{RetentionPolicy, StreamChange};

use crate::engine::EngineConfig;

pub mod init;
pub mod run;

fn default_cleanup_interval_secs() -> u64 {
    3600
}

/// The TOML configuration file shared by `init` and `run`.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Path of the catalog database.
    pub db_path: PathBuf,

    /// Root under which `recordings/` and `manifests/` live.
    pub storage_root: PathBuf,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Default retention for streams without their own policy row.
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Streams to upsert at startup; the catalog remains the source of
    /// truth for anything created through the control surface afterward.
    #[serde(default)]
    pub streams: Vec<StreamChange>,
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            err!(
                NotFound,
                msg("unable to read config file {}", path.display()),
                source(e)
            )
        })?;
        toml::from_str(&text).map_err(|e| {
            err!(
                InvalidArgument,
                msg("unable to parse config file {}", path.display()),
                source(e)
            )
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            db_path: self.db_path.clone(),
            storage_root: self.storage_root.clone(),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            default_retention: self.retention,
        }
    }
}
