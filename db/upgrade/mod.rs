// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Upgrades the catalog schema.
//!
//! Rules, which must hold forever:
//!
//! *   migrations are append-only. Never edit an existing `vN_to_vN+1`;
//!     catalogs in the field have already run it.
//! *   each migration is idempotent on partial completion: it checks for
//!     table/column presence before adding, so that a crash between DDL
//!     statements and the version bump can be retried safely. (SQLite DDL
//!     is transactional, but cheap checks keep this robust against manual
//!     fiddling too.)

use base::{bail, Error};
use rusqlite::params;
use tracing::info;

mod v0_to_v1;
mod v1_to_v2;
mod v2_to_v3;

type Upgrader = fn(&rusqlite::Transaction) -> Result<(), Error>;

const UPGRADERS: [Upgrader; crate::db::CURRENT_SCHEMA_VERSION as usize] =
    [v0_to_v1::run, v1_to_v2::run, v2_to_v3::run];

/// Returns true iff `table` exists.
pub(crate) fn table_exists(conn: &rusqlite::Connection, table: &str) -> Result<bool, Error> {
    let n: i64 = conn.query_row(
        "select count(*) from sqlite_master where type = 'table' and name = ?",
        params![table],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Returns true iff `table` has a column named `column`.
///
/// Migration-time use only; steady-state code goes through the
/// [`crate::db::LockedDatabase`] column cache instead of re-probing.
pub(crate) fn column_exists(
    conn: &rusqlite::Connection,
    table: &str,
    column: &str,
) -> Result<bool, Error> {
    let n: i64 = conn.query_row(
        "select count(*) from pragma_table_info(?) where name = ?",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Brings `conn` forward from its persisted version to
/// [`crate::db::CURRENT_SCHEMA_VERSION`], one version at a time, each in
/// its own transaction.
pub(crate) fn run(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    let target = crate::db::CURRENT_SCHEMA_VERSION;
    let old_ver: i32 =
        conn.query_row("select version from schema_version", params![], |row| {
            row.get(0)
        })?;
    if old_ver > target {
        bail!(
            FailedPrecondition,
            msg("catalog is at schema version {old_ver}, later than expected {target}")
        );
    } else if old_ver < 0 {
        bail!(DataLoss, msg("catalog is at negative schema version {old_ver}!"));
    } else if old_ver == target {
        return Ok(());
    }
    info!("upgrading catalog from schema version {old_ver} to {target}");
    for ver in old_ver..target {
        info!("...from version {} to version {}", ver, ver + 1);
        let tx = conn.transaction()?;
        UPGRADERS[ver as usize](&tx)?;
        tx.execute("update schema_version set version = ?", params![ver + 1])?;
        tx.commit()?;
    }
    Ok(())
}
