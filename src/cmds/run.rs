// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to run the recorder until SIGINT.

use std::path::Path;
use std::sync::Arc;

use base::clock::RealClocks;
use base::{err, Error};
use tracing::{info, warn};

use super::ConfigFile;
use crate::engine::Engine;
use crate::stream::RetinaOpener;

pub fn run(config_path: &Path) -> Result<(), Error> {
    let config = ConfigFile::read(config_path)?;

    // The capture workers are plain threads; the runtime exists to drive
    // Retina's I/O and the signal handler.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("tokio")
        .build()
        .map_err(|e| err!(Internal, msg("unable to build tokio runtime"), source(e)))?;
    let opener = Arc::new(RetinaOpener::new(rt.handle().clone()));

    let engine = Engine::start(RealClocks {}, opener, &config.engine_config())?;
    for change in &config.streams {
        if let Err(e) = engine.streams_create(change.clone()) {
            warn!(err = %e.chain(), "unable to apply config for stream {:?}", &change.name);
        }
    }

    info!("recording engine running; send SIGINT to stop");
    rt.block_on(async {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| err!(Internal, msg("unable to wait for signal"), source(e)))
    })?;

    info!("received SIGINT; shutting down");
    engine.shutdown();
    Ok(())
}
