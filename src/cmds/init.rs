// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to create (or migrate) the catalog and storage layout.

use std::path::Path;

use base::clock::RealClocks;
use base::Error;
use db::dir::SegmentDir;
use db::Database;
use tracing::info;

use super::ConfigFile;

pub fn run(config_path: &Path) -> Result<(), Error> {
    let config = ConfigFile::read(config_path)?;
    let db = Database::open(RealClocks {}, &config.db_path)?;
    SegmentDir::open(&config.storage_root)?;
    let mut l = db.lock();
    for change in config.streams {
        let name = change.name.clone();
        let id = l.upsert_stream(change)?;
        info!("stream {name:?} is id {id}");
    }
    info!(
        "catalog {} ready (uuid {})",
        config.db_path.display(),
        l.uuid()
    );
    Ok(())
}
