// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

/// Upgrades a version 1 schema to a version 2 schema: adds the
/// detection-triggered recording parameters to `streams`.
use base::Error;

pub(crate) fn run(tx: &rusqlite::Transaction) -> Result<(), Error> {
    for (column, ddl) in [
        (
            "detection_based_recording",
            "alter table streams add column detection_based_recording integer not null default 0",
        ),
        (
            "detection_model",
            "alter table streams add column detection_model text",
        ),
        (
            "detection_threshold",
            "alter table streams add column detection_threshold real not null default 0.5",
        ),
        (
            "detection_interval",
            "alter table streams add column detection_interval integer not null default 10",
        ),
        (
            "pre_detection_buffer",
            "alter table streams add column pre_detection_buffer integer not null default 0",
        ),
        (
            "post_detection_buffer",
            "alter table streams add column post_detection_buffer integer not null default 0",
        ),
    ] {
        if !super::column_exists(tx, "streams", column)? {
            tx.execute(ddl, rusqlite::params![])?;
        }
    }
    Ok(())
}
