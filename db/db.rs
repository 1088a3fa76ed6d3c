// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Catalog access logic for the LightNVR SQLite schema.
//!
//! The [`Database`] struct wraps a single connection behind a mutex, making
//! the assumption that only one process accesses the catalog at a time.
//! Stream configurations are cached in RAM and kept coherent with every
//! mutation; segment and event rows are read through prepared statements in
//! the [`crate::raw`] module.
//!
//! Operations here may block on SQLite I/O, so callers must not hold this
//! lock across file I/O of their own (see the concurrency rules in the
//! `writer` and `retention` modules).

use std::collections::BTreeMap;
use std::path::Path;

use base::clock::Clocks;
use base::{bail, err, Error, FastHashMap};
use base::{Mutex, MutexGuard};
use rusqlite::params;
use tracing::info;
use uuid::Uuid;

use crate::raw;
use crate::upgrade;

/// Expected schema version; see the `upgrade` module before changing.
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Repeated identical events within this window coalesce into one row.
const EVENT_COALESCE_WINDOW_SECS: i64 = 60;

/// Maximum size of the event-coalescing cache before stale entries are
/// pruned.
const EVENT_CACHE_MAX: usize = 256;

/// Source transport for a stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    TcpPull,
    UdpPull,
    Onvif,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::TcpPull => "tcp-pull",
            Protocol::UdpPull => "udp-pull",
            Protocol::Onvif => "onvif",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "tcp-pull" => Ok(Protocol::TcpPull),
            "udp-pull" => Ok(Protocol::UdpPull),
            "onvif" => Ok(Protocol::Onvif),
            _ => Err(err!(InvalidArgument, msg("unknown protocol {s:?}"))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached stream configuration row.
#[derive(Clone, Debug, PartialEq)]
pub struct Stream {
    pub id: i32,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub streaming_enabled: bool,
    pub width: u16,
    pub height: u16,
    pub fps: u32,
    pub codec: String,
    pub priority: i32,
    pub record: bool,
    pub segment_duration: u32,
    pub detection_based_recording: bool,
    pub detection_model: Option<String>,
    pub detection_threshold: f64,
    pub detection_interval: u32,
    pub pre_detection_buffer: u32,
    pub post_detection_buffer: u32,
    pub protocol: Protocol,
    pub is_onvif: bool,
    pub record_audio: bool,
}

/// All the fields of a stream except its row id, as supplied on upsert.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamChange {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,
    #[serde(default)]
    pub width: u16,
    #[serde(default)]
    pub height: u16,
    #[serde(default)]
    pub fps: u32,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub record: bool,
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,
    #[serde(default)]
    pub detection_based_recording: bool,
    #[serde(default)]
    pub detection_model: Option<String>,
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f64,
    #[serde(default = "default_detection_interval")]
    pub detection_interval: u32,
    #[serde(default)]
    pub pre_detection_buffer: u32,
    #[serde(default)]
    pub post_detection_buffer: u32,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub is_onvif: bool,
    #[serde(default)]
    pub record_audio: bool,
}

fn default_true() -> bool {
    true
}
fn default_codec() -> String {
    "h264".to_owned()
}
fn default_segment_duration() -> u32 {
    60
}
fn default_detection_threshold() -> f64 {
    0.5
}
fn default_detection_interval() -> u32 {
    10
}
fn default_protocol() -> Protocol {
    Protocol::TcpPull
}

impl Stream {
    fn from_change(id: i32, c: StreamChange) -> Self {
        Stream {
            id,
            name: c.name,
            url: c.url,
            enabled: c.enabled,
            streaming_enabled: c.streaming_enabled,
            width: c.width,
            height: c.height,
            fps: c.fps,
            codec: c.codec,
            priority: c.priority,
            record: c.record,
            segment_duration: c.segment_duration,
            detection_based_recording: c.detection_based_recording,
            detection_model: c.detection_model,
            detection_threshold: c.detection_threshold,
            detection_interval: c.detection_interval,
            pre_detection_buffer: c.pre_detection_buffer,
            post_detection_buffer: c.post_detection_buffer,
            protocol: c.protocol,
            is_onvif: c.is_onvif,
            record_audio: c.record_audio,
        }
    }

    /// File extension for this stream's segments; BMFF either way, but the
    /// catalog and paths follow the codec tag.
    pub fn extension(&self) -> &'static str {
        extension_for_codec(&self.codec)
    }
}

pub fn extension_for_codec(codec: &str) -> &'static str {
    if codec.eq_ignore_ascii_case("h264") {
        "mp4"
    } else {
        "mkv"
    }
}

/// Metadata for one produced container file.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentRow {
    pub id: i64,
    pub stream_name: String,
    pub file_path: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub size_bytes: i64,
    pub width: u16,
    pub height: u16,
    pub fps: u32,
    pub codec: String,
    pub is_complete: bool,
    pub is_corrupt: bool,
    pub created_at: i64,
}

/// Parameters for [`LockedDatabase::open_segment`].
#[derive(Clone, Debug)]
pub struct SegmentToInsert {
    pub stream_name: String,
    pub file_path: String,
    pub start_time: i64,
    pub width: u16,
    pub height: u16,
    pub fps: u32,
    pub codec: String,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ListOrder {
    #[default]
    Asc,
    Desc,
}

/// Filters for [`LockedDatabase::list_segments`]. `start`/`end` select
/// segments overlapping the half-open range `[start, end)`.
#[derive(Clone, Debug)]
pub struct SegmentQuery<'a> {
    pub stream_name: Option<&'a str>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub order: ListOrder,
    pub limit: i64,
    pub offset: i64,
}

impl Default for SegmentQuery<'_> {
    fn default() -> Self {
        SegmentQuery {
            stream_name: None,
            start: None,
            end: None,
            order: ListOrder::Asc,
            limit: 1000,
            offset: 0,
        }
    }
}

/// Per-stream recording tuning and retention policy
/// (`motion_recording_config` row).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RecordingConfig {
    pub stream_name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub pre_buffer_seconds: u32,
    #[serde(default)]
    pub post_buffer_seconds: u32,
    #[serde(default)]
    pub max_file_duration: u32,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub retention_days: u32,
    #[serde(default)]
    pub max_storage_mb: u64,
    #[serde(skip)]
    pub created_at: i64,
    #[serde(skip)]
    pub updated_at: i64,
}

impl RecordingConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            retention_days: self.retention_days,
            max_storage_bytes: (self.max_storage_mb as i64) << 20,
        }
    }
}

/// Retention bounds; zero disables the respective pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub retention_days: u32,
    #[serde(default)]
    pub max_storage_bytes: i64,
}

/// One operational audit row.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub id: i64,
    pub type_: String,
    pub stream_name: Option<String>,
    pub message: String,
    pub file_path: Option<String>,
    pub count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Validates a stream name: short, printable, and path-safe, since it
/// doubles as a directory name under the recordings root.
pub fn validate_stream_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > 63 {
        bail!(
            InvalidArgument,
            msg("stream name must be 1-63 bytes; got {}", name.len())
        );
    }
    if name.starts_with('.') {
        bail!(InvalidArgument, msg("stream name must not start with a dot"));
    }
    if let Some(c) = name
        .chars()
        .find(|&c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        bail!(
            InvalidArgument,
            msg("stream name contains disallowed character {c:?}")
        );
    }
    Ok(())
}

fn validate_stream_change(c: &StreamChange) -> Result<(), Error> {
    validate_stream_name(&c.name)?;
    if c.url.is_empty() {
        bail!(InvalidArgument, msg("stream {}: empty source url", &c.name));
    }
    if c.segment_duration == 0 {
        bail!(
            InvalidArgument,
            msg("stream {}: segment_duration must be positive", &c.name)
        );
    }
    Ok(())
}

type EventKey = (String, Option<String>, String);

struct RecentEvent {
    row_id: i64,
    created_at: i64,
}

/// The catalog state, accessed through [`Database::lock`].
pub struct LockedDatabase {
    conn: rusqlite::Connection,
    uuid: Uuid,
    streams_by_name: BTreeMap<String, Stream>,
    schema_cols: FastHashMap<String, Vec<String>>,
    recent_events: FastHashMap<EventKey, RecentEvent>,
}

impl LockedDatabase {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn streams_by_name(&self) -> &BTreeMap<String, Stream> {
        &self.streams_by_name
    }

    pub fn get_stream(&self, name: &str) -> Option<&Stream> {
        self.streams_by_name.get(name)
    }

    /// Returns all non-hard-deleted streams, soft-deleted (disabled) ones
    /// included.
    pub fn list_streams(&self) -> Vec<Stream> {
        self.streams_by_name.values().cloned().collect()
    }

    /// Inserts or fully replaces the stream named by `change`, returning
    /// its row id. An upsert over a soft-deleted row applies `change`'s
    /// `enabled` flag, re-enabling it in the common case.
    pub fn upsert_stream(&mut self, change: StreamChange) -> Result<i32, Error> {
        validate_stream_change(&change)?;
        let id = raw::upsert_stream(&self.conn, &change)?;
        self.streams_by_name
            .insert(change.name.clone(), Stream::from_change(id, change));
        Ok(id)
    }

    /// Sets `enabled = 0`, retaining history.
    pub fn soft_delete_stream(&mut self, name: &str) -> Result<(), Error> {
        if raw::set_stream_enabled(&self.conn, name, false)? == 0 {
            bail!(NotFound, msg("no stream {name:?}"));
        }
        if let Some(s) = self.streams_by_name.get_mut(name) {
            s.enabled = false;
        }
        Ok(())
    }

    /// Removes the row entirely. Segment rows keep their dangling owner
    /// name; the retention orphan pass reaps them as their files go away.
    pub fn hard_delete_stream(&mut self, name: &str) -> Result<(), Error> {
        if raw::delete_stream(&self.conn, name)? == 0 {
            bail!(NotFound, msg("no stream {name:?}"));
        }
        self.streams_by_name.remove(name);
        Ok(())
    }

    /// Registers a newly opened segment (`is_complete = 0`, null end time)
    /// and returns its id. Failure here aborts the segment start attempt;
    /// see the writer module.
    pub fn open_segment(&mut self, s: &SegmentToInsert) -> Result<i64, Error> {
        Ok(raw::insert_segment(&self.conn, s)?)
    }

    /// Marks the segment at `file_path` complete with its final end time
    /// and size. The stored end time is clamped to be >= the start time.
    pub fn close_segment(
        &mut self,
        file_path: &str,
        end_time: i64,
        size_bytes: i64,
    ) -> Result<(), Error> {
        if raw::close_segment(&self.conn, file_path, end_time, size_bytes)? == 0 {
            bail!(NotFound, msg("no segment row for {file_path:?}"));
        }
        Ok(())
    }

    /// Marks the segment at `file_path` complete-but-corrupt (zero size) so
    /// that crash-finalization bookkeeping stays consistent and retention
    /// can reap the row.
    pub fn mark_segment_corrupt(&mut self, file_path: &str) -> Result<(), Error> {
        if raw::mark_segment_corrupt(&self.conn, file_path)? == 0 {
            bail!(NotFound, msg("no segment row for {file_path:?}"));
        }
        Ok(())
    }

    /// Returns the id the next [`LockedDatabase::open_segment`] will
    /// assign. Callers use it to name the file before inserting the row;
    /// the two calls must happen under one lock guard.
    pub fn next_segment_id(&self) -> Result<i64, Error> {
        raw::next_segment_id(&self.conn)
    }

    pub fn get_segment(&self, id: i64) -> Result<Option<SegmentRow>, Error> {
        raw::get_segment(&self.conn, id)
    }

    pub fn get_segment_by_path(&self, file_path: &str) -> Result<Option<SegmentRow>, Error> {
        raw::get_segment_by_path(&self.conn, file_path)
    }

    pub(crate) fn list_incomplete_segments(&self) -> Result<Vec<SegmentRow>, Error> {
        raw::list_incomplete_segments(&self.conn)
    }

    pub fn list_segments(&self, q: &SegmentQuery) -> Result<Vec<SegmentRow>, Error> {
        raw::list_segments(&self.conn, q)
    }

    pub fn count_segments(&self, q: &SegmentQuery) -> Result<i64, Error> {
        raw::count_segments(&self.conn, q)
    }

    pub fn latest_segment(&self, stream_name: &str) -> Result<Option<SegmentRow>, Error> {
        Ok(raw::list_segments(
            &self.conn,
            &SegmentQuery {
                stream_name: Some(stream_name),
                order: ListOrder::Desc,
                limit: 1,
                ..SegmentQuery::default()
            },
        )?
        .pop())
    }

    /// Removes the catalog row only. The caller (retention or an admin
    /// handler) is responsible for unlinking the file *first*.
    pub fn delete_segment(&mut self, id: i64) -> Result<(), Error> {
        if raw::delete_segment_row(&self.conn, id)? == 0 {
            bail!(NotFound, msg("no segment {id}"));
        }
        Ok(())
    }

    pub fn total_size_bytes(&self, stream_name: Option<&str>) -> Result<u64, Error> {
        Ok(raw::total_size_bytes(&self.conn, stream_name)?.max(0) as u64)
    }

    pub(crate) fn list_expired_segments(
        &self,
        stream_name: &str,
        cutoff: i64,
    ) -> Result<Vec<SegmentRow>, Error> {
        raw::list_expired_segments(&self.conn, stream_name, cutoff)
    }

    pub(crate) fn list_oldest_segments(
        &self,
        stream_name: &str,
        f: &mut dyn FnMut(&SegmentRow) -> bool,
    ) -> Result<(), Error> {
        raw::list_oldest_segments(&self.conn, stream_name, f)
    }

    pub(crate) fn list_segments_for_stream(
        &self,
        stream_name: &str,
    ) -> Result<Vec<SegmentRow>, Error> {
        raw::list_segments_for_stream(&self.conn, stream_name)
    }

    pub(crate) fn list_segment_owners(&self) -> Result<Vec<String>, Error> {
        raw::list_segment_owners(&self.conn)
    }

    pub fn upsert_recording_config(
        &mut self,
        mut c: RecordingConfig,
        now: i64,
    ) -> Result<(), Error> {
        validate_stream_name(&c.stream_name)?;
        c.updated_at = now;
        if c.created_at == 0 {
            c.created_at = now;
        }
        raw::upsert_recording_config(&self.conn, &c)
    }

    pub fn get_recording_config(&self, stream_name: &str) -> Result<Option<RecordingConfig>, Error> {
        raw::get_recording_config(&self.conn, stream_name)
    }

    /// Records an operational event. Identical events (same type, stream,
    /// and message) within [`EVENT_COALESCE_WINDOW_SECS`] coalesce into the
    /// existing row by bumping its count.
    pub fn add_event(
        &mut self,
        type_: &str,
        stream_name: Option<&str>,
        message: &str,
        file_path: Option<&str>,
        now: i64,
    ) -> Result<(), Error> {
        let key: EventKey = (
            type_.to_owned(),
            stream_name.map(str::to_owned),
            message.to_owned(),
        );
        if let Some(recent) = self.recent_events.get(&key) {
            if now - recent.created_at < EVENT_COALESCE_WINDOW_SECS {
                raw::bump_event(&self.conn, recent.row_id, now)?;
                return Ok(());
            }
        }
        let row_id = raw::insert_event(&self.conn, type_, stream_name, message, file_path, now)?;
        if self.recent_events.len() >= EVENT_CACHE_MAX {
            self.recent_events
                .retain(|_, v| now - v.created_at < EVENT_COALESCE_WINDOW_SECS);
        }
        self.recent_events.insert(
            key,
            RecentEvent {
                row_id,
                created_at: now,
            },
        );
        Ok(())
    }

    pub fn list_events(&self, limit: i64) -> Result<Vec<Event>, Error> {
        raw::list_events(&self.conn, limit)
    }

    /// Consults the schema-column cache (populated at open and after each
    /// migration); never re-probes `pragma table_info`.
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.schema_cols
            .get(table)
            .is_some_and(|cols| cols.iter().any(|c| c == column))
    }
}

/// The top-level catalog handle: a [`LockedDatabase`] behind a mutex, plus
/// the clocks used for timestamps and retries.
pub struct Database<C: Clocks + Clone = base::clock::RealClocks> {
    db: Mutex<LockedDatabase>,
    clocks: C,
}

impl<C: Clocks + Clone> Database<C> {
    /// Opens (creating or migrating as needed) the catalog at `path`.
    pub fn open(clocks: C, path: &Path) -> Result<Self, Error> {
        let mut conn = rusqlite::Connection::open(path)?;
        set_integrity_pragmas(&conn)?;
        if !upgrade::table_exists(&conn, "schema_version")? {
            info!("initializing fresh catalog at {}", path.display());
            init_schema(&mut conn)?;
        } else {
            upgrade::run(&mut conn)?;
        }
        Self::from_conn(clocks, conn)
    }

    /// Wraps an already-initialized connection; used by `open` and tests.
    pub(crate) fn from_conn(clocks: C, conn: rusqlite::Connection) -> Result<Self, Error> {
        let ver: i32 =
            conn.query_row("select version from schema_version", params![], |row| {
                row.get(0)
            })?;
        if ver != CURRENT_SCHEMA_VERSION {
            bail!(
                FailedPrecondition,
                msg("catalog at schema version {ver}, expected {CURRENT_SCHEMA_VERSION}")
            );
        }
        let uuid = raw::read_meta(&conn)?;
        let schema_cols = read_schema_columns(&conn)?;
        verify_required_columns(&schema_cols)?;
        let streams_by_name = raw::list_streams(&conn)?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        Ok(Database {
            db: Mutex::new(LockedDatabase {
                conn,
                uuid,
                streams_by_name,
                schema_cols,
                recent_events: FastHashMap::default(),
            }),
            clocks,
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, LockedDatabase> {
        self.db.lock()
    }

    pub fn clocks(&self) -> C {
        self.clocks.clone()
    }
}

fn set_integrity_pragmas(conn: &rusqlite::Connection) -> Result<(), Error> {
    conn.execute_batch(
        r#"
        pragma foreign_keys = on;
        pragma fullfsync = on;
        pragma synchronous = 2;
        "#,
    )?;
    let mode: String =
        conn.query_row("pragma journal_mode = wal", params![], |row| row.get(0))?;
    if mode != "wal" && mode != "memory" {
        bail!(
            FailedPrecondition,
            msg("unable to enable wal journal mode; got {mode:?}")
        );
    }
    Ok(())
}

fn init_schema(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    let tx = conn.transaction()?;
    tx.execute_batch(include_str!("schema.sql"))?;
    tx.execute(
        "insert into schema_version (version) values (?)",
        params![CURRENT_SCHEMA_VERSION],
    )?;
    tx.execute(
        "insert into meta (uuid) values (?)",
        params![Uuid::now_v7().as_bytes().as_slice()],
    )?;
    tx.commit()?;
    Ok(())
}

/// Reads every user table's column list for the schema-column cache.
fn read_schema_columns(
    conn: &rusqlite::Connection,
) -> Result<FastHashMap<String, Vec<String>>, Error> {
    let mut tables = Vec::new();
    {
        let mut stmt = conn.prepare(
            "select name from sqlite_master where type = 'table' and name not like 'sqlite_%'",
        )?;
        let mut rows = stmt.query(params![])?;
        while let Some(row) = rows.next()? {
            tables.push(row.get::<_, String>(0)?);
        }
    }
    let mut cols = FastHashMap::default();
    for table in tables {
        let mut table_cols = Vec::new();
        let mut stmt = conn.prepare("select name from pragma_table_info(?)")?;
        let mut rows = stmt.query(params![&table])?;
        while let Some(row) = rows.next()? {
            table_cols.push(row.get::<_, String>(0)?);
        }
        cols.insert(table, table_cols);
    }
    Ok(cols)
}

/// Cheap sanity check that migration left the columns the compiled SQL
/// relies on; failure here means catalog corruption or a bad downgrade.
fn verify_required_columns(cols: &FastHashMap<String, Vec<String>>) -> Result<(), Error> {
    const REQUIRED: [(&str, &[&str]); 4] = [
        ("streams", &["name", "url", "segment_duration", "record_audio"]),
        (
            "segments",
            &["file_path", "start_time", "end_time", "size_bytes", "is_complete", "is_corrupt"],
        ),
        ("motion_recording_config", &["retention_days", "max_storage_mb"]),
        ("events", &["count", "updated_at"]),
    ];
    for (table, required) in REQUIRED {
        let Some(have) = cols.get(table) else {
            bail!(DataLoss, msg("catalog is missing table {table:?}"));
        };
        for col in required {
            if !have.iter().any(|c| c == col) {
                bail!(DataLoss, msg("catalog table {table:?} is missing column {col:?}"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, TestDb};
    use base::ErrorKind;

    fn change(name: &str) -> StreamChange {
        StreamChange {
            name: name.to_owned(),
            url: format!("rtsp://{name}/main"),
            enabled: true,
            streaming_enabled: true,
            width: 1920,
            height: 1080,
            fps: 10,
            codec: "h264".to_owned(),
            priority: 0,
            record: true,
            segment_duration: 60,
            detection_based_recording: false,
            detection_model: None,
            detection_threshold: 0.5,
            detection_interval: 10,
            pre_detection_buffer: 0,
            post_detection_buffer: 0,
            protocol: Protocol::TcpPull,
            is_onvif: false,
            record_audio: false,
        }
    }

    /// P1: `list_streams` always reflects exactly the non-hard-deleted
    /// streams, each equal to its last upsert.
    #[test]
    fn stream_lifecycle() {
        testutil::init();
        let tdb = TestDb::new();
        let mut l = tdb.db.lock();

        let id1 = l.upsert_stream(change("cam-front")).unwrap();
        l.upsert_stream(change("cam-door")).unwrap();
        assert_eq!(
            l.list_streams().iter().map(|s| &s.name[..]).collect::<Vec<_>>(),
            vec!["cam-door", "cam-front"]
        );

        // Replacing all fields keeps the id.
        let mut c = change("cam-front");
        c.url = "rtsp://front/sub".to_owned();
        c.fps = 15;
        assert_eq!(l.upsert_stream(c.clone()).unwrap(), id1);
        let s = l.get_stream("cam-front").unwrap();
        assert_eq!(s.url, "rtsp://front/sub");
        assert_eq!(s.fps, 15);

        // Soft delete retains the row; the next upsert re-enables.
        l.soft_delete_stream("cam-front").unwrap();
        assert!(!l.get_stream("cam-front").unwrap().enabled);
        assert_eq!(l.list_streams().len(), 2);
        assert_eq!(l.upsert_stream(change("cam-front")).unwrap(), id1);
        assert!(l.get_stream("cam-front").unwrap().enabled);

        // Hard delete removes it entirely.
        l.hard_delete_stream("cam-door").unwrap();
        assert_eq!(l.list_streams().len(), 1);
        l.hard_delete_stream("cam-door").unwrap_err();

        // The cache matches a fresh read of the catalog.
        assert_eq!(
            raw::list_streams(&l.conn).unwrap(),
            l.list_streams()
        );
    }

    #[test]
    fn stream_validation() {
        testutil::init();
        let tdb = TestDb::new();
        let mut l = tdb.db.lock();

        let mut c = change("cam/evil");
        assert_eq!(
            l.upsert_stream(c.clone()).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        c.name = "x".repeat(64);
        assert_eq!(
            l.upsert_stream(c.clone()).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        c.name = "cam-ok".to_owned();
        c.segment_duration = 0; // "never rotate" is rejected, not inferred.
        assert_eq!(
            l.upsert_stream(c).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert!(l.list_streams().is_empty());
    }

    #[test]
    fn segment_lifecycle_and_ranges() {
        testutil::init();
        let tdb = TestDb::new();
        let mut l = tdb.db.lock();
        l.upsert_stream(change("cam-front")).unwrap();

        let id1 = l
            .open_segment(&testutil::segment_to_insert("cam-front", "/r/a.mp4", 100))
            .unwrap();
        let id2 = l
            .open_segment(&testutil::segment_to_insert("cam-front", "/r/b.mp4", 160))
            .unwrap();
        assert!(id2 > id1, "segment ids are monotonic");

        // Duplicate path violates the unique constraint.
        let e = l
            .open_segment(&testutil::segment_to_insert("cam-front", "/r/a.mp4", 300))
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);

        // I4: an end time before the start is clamped, not stored.
        l.close_segment("/r/a.mp4", 50, 1000).unwrap();
        let s = l.get_segment(id1).unwrap().unwrap();
        assert_eq!(s.end_time, Some(100));
        assert!(s.is_complete);

        l.close_segment("/r/b.mp4", 220, 2000).unwrap();
        l.close_segment("/r/missing.mp4", 220, 2000).unwrap_err();

        // Range query [150, 1000) matches only the second segment; the
        // first ended at 100 (after clamping).
        let q = SegmentQuery {
            stream_name: Some("cam-front"),
            start: Some(150),
            end: Some(1000),
            ..SegmentQuery::default()
        };
        let rows = l.list_segments(&q).unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![id2]);
        assert_eq!(l.count_segments(&q).unwrap(), 1);

        assert_eq!(l.total_size_bytes(Some("cam-front")).unwrap(), 3000);
        assert_eq!(l.total_size_bytes(None).unwrap(), 3000);

        // Row deletion doesn't touch the filesystem, so it's just gone.
        l.delete_segment(id1).unwrap();
        assert!(l.get_segment(id1).unwrap().is_none());
        assert_eq!(l.total_size_bytes(Some("cam-front")).unwrap(), 2000);
    }

    #[test]
    fn event_coalescing() {
        testutil::init();
        let tdb = TestDb::new();
        let mut l = tdb.db.lock();

        l.add_event("stream_error", Some("cam-front"), "connect failed", None, 1000)
            .unwrap();
        l.add_event("stream_error", Some("cam-front"), "connect failed", None, 1030)
            .unwrap();
        l.add_event("stream_error", Some("cam-front"), "connect failed", None, 1059)
            .unwrap();

        // Different message is a distinct event.
        l.add_event("stream_error", Some("cam-front"), "eof", None, 1030)
            .unwrap();

        // Outside the window, a fresh row is written.
        l.add_event("stream_error", Some("cam-front"), "connect failed", None, 1100)
            .unwrap();

        let events = l.list_events(10).unwrap();
        assert_eq!(events.len(), 3);
        let coalesced = events
            .iter()
            .find(|e| e.created_at == 1000)
            .expect("original row is retained");
        assert_eq!(coalesced.count, 3);
        assert_eq!(coalesced.updated_at, 1059);
    }

    #[test]
    fn column_cache() {
        testutil::init();
        let tdb = TestDb::new();
        let l = tdb.db.lock();
        assert!(l.has_column("segments", "is_corrupt"));
        assert!(!l.has_column("segments", "nonexistent"));
        assert!(!l.has_column("nonexistent", "id"));
    }
}
