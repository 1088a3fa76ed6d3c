// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

/// Upgrades a version 2 schema to a version 3 schema:
///
/// *   `streams.is_onvif` and `streams.record_audio`.
/// *   `segments.is_corrupt` for crash-finalization bookkeeping.
/// *   event coalescing columns (`count`, `updated_at`) and the
///     `created_at` index used by event listing and pruning.
use base::Error;

pub(crate) fn run(tx: &rusqlite::Transaction) -> Result<(), Error> {
    for (table, column, ddl) in [
        (
            "streams",
            "is_onvif",
            "alter table streams add column is_onvif integer not null default 0",
        ),
        (
            "streams",
            "record_audio",
            "alter table streams add column record_audio integer not null default 0",
        ),
        (
            "segments",
            "is_corrupt",
            "alter table segments add column is_corrupt integer not null default 0",
        ),
        (
            "events",
            "count",
            "alter table events add column count integer not null default 1",
        ),
        (
            "events",
            "updated_at",
            "alter table events add column updated_at integer not null default 0",
        ),
    ] {
        if !super::column_exists(tx, table, column)? {
            tx.execute(ddl, rusqlite::params![])?;
        }
    }
    tx.execute_batch(
        r#"
        create index if not exists segments_stream_start on segments (stream_name, start_time);
        create index if not exists events_created_at on events (created_at);
        "#,
    )?;
    Ok(())
}
