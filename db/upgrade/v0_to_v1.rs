// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

/// Upgrades a version 0 schema to a version 1 schema: adds the per-stream
/// recording/retention tuning table.
use base::Error;

pub(crate) fn run(tx: &rusqlite::Transaction) -> Result<(), Error> {
    if !super::table_exists(tx, "motion_recording_config")? {
        tx.execute_batch(
            r#"
            create table motion_recording_config (
              stream_name text unique not null,
              enabled integer not null default 0,
              pre_buffer_seconds integer not null default 0,
              post_buffer_seconds integer not null default 0,
              max_file_duration integer not null default 0,
              codec text,
              quality text,
              retention_days integer not null default 0,
              max_storage_mb integer not null default 0,
              created_at integer not null,
              updated_at integer not null
            );
            "#,
        )?;
    }
    Ok(())
}
