// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Raw catalog access: SQLite statements which do not touch any cached
//! state. See [`crate::db::LockedDatabase`] for the cache-coherent layer.

use crate::db::{
    Event, ListOrder, RecordingConfig, SegmentQuery, SegmentRow, SegmentToInsert, Stream,
    StreamChange,
};
use base::Error;
use rusqlite::{named_params, params, OptionalExtension as _};
use uuid::Uuid;

const SEGMENT_COLUMNS: &str = r#"
    id,
    stream_name,
    file_path,
    start_time,
    end_time,
    size_bytes,
    width,
    height,
    fps,
    codec,
    is_complete,
    is_corrupt,
    created_at
"#;

// Overlap filter: a segment matches [start, end) if it starts before `end`
// and does not end at or before `start`. Open segments (null end_time) are
// still growing and match any `start`.
const LIST_SEGMENTS_WHERE: &str = r#"
    (:stream_name is null or stream_name = :stream_name) and
    (:end is null or start_time < :end) and
    (:start is null or end_time is null or end_time > :start)
"#;

fn segment_from_row(row: &rusqlite::Row) -> rusqlite::Result<SegmentRow> {
    Ok(SegmentRow {
        id: row.get(0)?,
        stream_name: row.get(1)?,
        file_path: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        size_bytes: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        fps: row.get(8)?,
        codec: row.get(9)?,
        is_complete: row.get(10)?,
        is_corrupt: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn stream_from_row(row: &rusqlite::Row) -> rusqlite::Result<Stream> {
    let protocol: String = row.get(18)?;
    Ok(Stream {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        enabled: row.get(3)?,
        streaming_enabled: row.get(4)?,
        width: row.get(5)?,
        height: row.get(6)?,
        fps: row.get(7)?,
        codec: row.get(8)?,
        priority: row.get(9)?,
        record: row.get(10)?,
        segment_duration: row.get(11)?,
        detection_based_recording: row.get(12)?,
        detection_model: row.get(13)?,
        detection_threshold: row.get(14)?,
        detection_interval: row.get(15)?,
        pre_detection_buffer: row.get(16)?,
        post_detection_buffer: row.get(17)?,
        protocol: protocol.parse().map_err(|e: Error| -> rusqlite::Error {
            rusqlite::types::FromSqlError::Other(Box::new(e)).into()
        })?,
        is_onvif: row.get(19)?,
        record_audio: row.get(20)?,
    })
}

pub(crate) fn read_meta(conn: &rusqlite::Connection) -> Result<Uuid, Error> {
    let uuid: Vec<u8> = conn.query_row("select uuid from meta", params![], |row| row.get(0))?;
    Ok(Uuid::from_slice(&uuid[..])
        .map_err(|_| base::err!(DataLoss, msg("meta row has malformed uuid")))?)
}

pub(crate) fn list_streams(conn: &rusqlite::Connection) -> Result<Vec<Stream>, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        select
          id, name, url, enabled, streaming_enabled, width, height, fps, codec,
          priority, record, segment_duration, detection_based_recording,
          detection_model, detection_threshold, detection_interval,
          pre_detection_buffer, post_detection_buffer, protocol, is_onvif,
          record_audio
        from streams
        order by name
        "#,
    )?;
    let mut rows = stmt.query(params![])?;
    let mut streams = Vec::new();
    while let Some(row) = rows.next()? {
        streams.push(stream_from_row(row)?);
    }
    Ok(streams)
}

/// Inserts or fully replaces the stream row named by `change`; returns its
/// row id.
pub(crate) fn upsert_stream(
    conn: &rusqlite::Connection,
    change: &StreamChange,
) -> Result<i32, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        insert into streams (name, url, enabled, streaming_enabled, width, height, fps,
                             codec, priority, record, segment_duration,
                             detection_based_recording, detection_model,
                             detection_threshold, detection_interval,
                             pre_detection_buffer, post_detection_buffer, protocol,
                             is_onvif, record_audio)
                     values (:name, :url, :enabled, :streaming_enabled, :width, :height,
                             :fps, :codec, :priority, :record, :segment_duration,
                             :detection_based_recording, :detection_model,
                             :detection_threshold, :detection_interval,
                             :pre_detection_buffer, :post_detection_buffer, :protocol,
                             :is_onvif, :record_audio)
        on conflict (name) do update set
          url = excluded.url,
          enabled = excluded.enabled,
          streaming_enabled = excluded.streaming_enabled,
          width = excluded.width,
          height = excluded.height,
          fps = excluded.fps,
          codec = excluded.codec,
          priority = excluded.priority,
          record = excluded.record,
          segment_duration = excluded.segment_duration,
          detection_based_recording = excluded.detection_based_recording,
          detection_model = excluded.detection_model,
          detection_threshold = excluded.detection_threshold,
          detection_interval = excluded.detection_interval,
          pre_detection_buffer = excluded.pre_detection_buffer,
          post_detection_buffer = excluded.post_detection_buffer,
          protocol = excluded.protocol,
          is_onvif = excluded.is_onvif,
          record_audio = excluded.record_audio
        "#,
    )?;
    stmt.execute(named_params! {
        ":name": &change.name,
        ":url": &change.url,
        ":enabled": change.enabled,
        ":streaming_enabled": change.streaming_enabled,
        ":width": change.width,
        ":height": change.height,
        ":fps": change.fps,
        ":codec": &change.codec,
        ":priority": change.priority,
        ":record": change.record,
        ":segment_duration": change.segment_duration,
        ":detection_based_recording": change.detection_based_recording,
        ":detection_model": change.detection_model.as_deref(),
        ":detection_threshold": change.detection_threshold,
        ":detection_interval": change.detection_interval,
        ":pre_detection_buffer": change.pre_detection_buffer,
        ":post_detection_buffer": change.post_detection_buffer,
        ":protocol": change.protocol.as_str(),
        ":is_onvif": change.is_onvif,
        ":record_audio": change.record_audio,
    })?;
    let id = conn.query_row(
        "select id from streams where name = ?",
        params![&change.name],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub(crate) fn set_stream_enabled(
    conn: &rusqlite::Connection,
    name: &str,
    enabled: bool,
) -> Result<usize, Error> {
    let mut stmt = conn.prepare_cached("update streams set enabled = ? where name = ?")?;
    Ok(stmt.execute(params![enabled, name])?)
}

pub(crate) fn delete_stream(conn: &rusqlite::Connection, name: &str) -> Result<usize, Error> {
    conn.prepare_cached("delete from motion_recording_config where stream_name = ?")?
        .execute(params![name])?;
    let n = conn
        .prepare_cached("delete from streams where name = ?")?
        .execute(params![name])?;
    Ok(n)
}

pub(crate) fn insert_segment(
    conn: &rusqlite::Connection,
    s: &SegmentToInsert,
) -> Result<i64, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        insert into segments (stream_name, file_path, start_time, width, height, fps,
                              codec, is_complete, created_at)
                      values (:stream_name, :file_path, :start_time, :width, :height,
                              :fps, :codec, 0, :created_at)
        "#,
    )?;
    stmt.execute(named_params! {
        ":stream_name": &s.stream_name,
        ":file_path": &s.file_path,
        ":start_time": s.start_time,
        ":width": s.width,
        ":height": s.height,
        ":fps": s.fps,
        ":codec": &s.codec,
        ":created_at": s.created_at,
    })?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn close_segment(
    conn: &rusqlite::Connection,
    file_path: &str,
    end_time: i64,
    size_bytes: i64,
) -> Result<usize, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        update segments
        set end_time = max(:end_time, start_time),
            size_bytes = :size_bytes,
            is_complete = 1
        where file_path = :file_path
        "#,
    )?;
    Ok(stmt.execute(named_params! {
        ":end_time": end_time,
        ":size_bytes": size_bytes,
        ":file_path": file_path,
    })?)
}

/// Marks the row for an unsalvageable `.part` file: complete so that it is
/// never re-finalized, corrupt + zero size so that retention reaps it.
pub(crate) fn mark_segment_corrupt(
    conn: &rusqlite::Connection,
    file_path: &str,
) -> Result<usize, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        update segments
        set end_time = coalesce(end_time, start_time),
            size_bytes = 0,
            is_complete = 1,
            is_corrupt = 1
        where file_path = :file_path
        "#,
    )?;
    Ok(stmt.execute(named_params! {":file_path": file_path})?)
}

/// Returns the id the next inserted segment row will receive. Only
/// meaningful while the catalog lock is held across the following insert.
pub(crate) fn next_segment_id(conn: &rusqlite::Connection) -> Result<i64, Error> {
    let seq: Option<i64> = conn
        .prepare_cached("select seq from sqlite_sequence where name = 'segments'")?
        .query_row(params![], |row| row.get(0))
        .optional()?;
    Ok(seq.unwrap_or(0) + 1)
}

pub(crate) fn get_segment_by_path(
    conn: &rusqlite::Connection,
    file_path: &str,
) -> Result<Option<SegmentRow>, Error> {
    let mut stmt = conn.prepare_cached(&format!(
        "select {SEGMENT_COLUMNS} from segments where file_path = :file_path"
    ))?;
    Ok(stmt
        .query_row(named_params! {":file_path": file_path}, segment_from_row)
        .optional()?)
}

pub(crate) fn list_incomplete_segments(
    conn: &rusqlite::Connection,
) -> Result<Vec<SegmentRow>, Error> {
    let mut stmt = conn.prepare_cached(&format!(
        "select {SEGMENT_COLUMNS} from segments where is_complete = 0 order by id"
    ))?;
    let mut rows = stmt.query(params![])?;
    let mut segments = Vec::new();
    while let Some(row) = rows.next()? {
        segments.push(segment_from_row(row)?);
    }
    Ok(segments)
}

pub(crate) fn get_segment(
    conn: &rusqlite::Connection,
    id: i64,
) -> Result<Option<SegmentRow>, Error> {
    let mut stmt = conn.prepare_cached(&format!(
        "select {SEGMENT_COLUMNS} from segments where id = :id"
    ))?;
    Ok(stmt
        .query_row(named_params! {":id": id}, segment_from_row)
        .optional()?)
}

pub(crate) fn list_segments(
    conn: &rusqlite::Connection,
    q: &SegmentQuery,
) -> Result<Vec<SegmentRow>, Error> {
    let sql = format!(
        "select {SEGMENT_COLUMNS} from segments where {LIST_SEGMENTS_WHERE} \
         order by start_time {}, id {} limit :limit offset :offset",
        q.order.as_sql(),
        q.order.as_sql(),
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(named_params! {
        ":stream_name": q.stream_name,
        ":start": q.start,
        ":end": q.end,
        ":limit": q.limit,
        ":offset": q.offset,
    })?;
    let mut segments = Vec::new();
    while let Some(row) = rows.next()? {
        segments.push(segment_from_row(row)?);
    }
    Ok(segments)
}

pub(crate) fn count_segments(conn: &rusqlite::Connection, q: &SegmentQuery) -> Result<i64, Error> {
    let sql = format!("select count(*) from segments where {LIST_SEGMENTS_WHERE}");
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.query_row(
        named_params! {
            ":stream_name": q.stream_name,
            ":start": q.start,
            ":end": q.end,
        },
        |row| row.get(0),
    )?)
}

pub(crate) fn delete_segment_row(conn: &rusqlite::Connection, id: i64) -> Result<usize, Error> {
    let mut stmt = conn.prepare_cached("delete from segments where id = ?")?;
    Ok(stmt.execute(params![id])?)
}

pub(crate) fn total_size_bytes(
    conn: &rusqlite::Connection,
    stream_name: Option<&str>,
) -> Result<i64, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        select coalesce(sum(size_bytes), 0) from segments
        where (:stream_name is null or stream_name = :stream_name)
        "#,
    )?;
    Ok(stmt.query_row(named_params! {":stream_name": stream_name}, |row| {
        row.get(0)
    })?)
}

/// Lists complete segments of `stream_name` whose end time is strictly
/// before `cutoff`, oldest first, for the retention age pass.
pub(crate) fn list_expired_segments(
    conn: &rusqlite::Connection,
    stream_name: &str,
    cutoff: i64,
) -> Result<Vec<SegmentRow>, Error> {
    let sql = format!(
        "select {SEGMENT_COLUMNS} from segments \
         where stream_name = :stream_name and is_complete = 1 and end_time < :cutoff \
         order by start_time, id"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(named_params! {
        ":stream_name": stream_name,
        ":cutoff": cutoff,
    })?;
    let mut segments = Vec::new();
    while let Some(row) = rows.next()? {
        segments.push(segment_from_row(row)?);
    }
    Ok(segments)
}

/// Lists complete segments of `stream_name` oldest first, passing each to
/// `f` until it returns false. Used by the retention quota pass; given that
/// `f` runs with the catalog lock held, it should be quick.
pub(crate) fn list_oldest_segments(
    conn: &rusqlite::Connection,
    stream_name: &str,
    f: &mut dyn FnMut(&SegmentRow) -> bool,
) -> Result<(), Error> {
    let sql = format!(
        "select {SEGMENT_COLUMNS} from segments \
         where stream_name = :stream_name and is_complete = 1 \
         order by start_time, id"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(named_params! {":stream_name": stream_name})?;
    while let Some(row) = rows.next()? {
        if !f(&segment_from_row(row)?) {
            break;
        }
    }
    Ok(())
}

/// Lists every segment row (complete or not) owned by `stream_name`, for
/// the retention orphan pass.
pub(crate) fn list_segments_for_stream(
    conn: &rusqlite::Connection,
    stream_name: &str,
) -> Result<Vec<SegmentRow>, Error> {
    let sql = format!(
        "select {SEGMENT_COLUMNS} from segments where stream_name = :stream_name \
         order by start_time, id"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(named_params! {":stream_name": stream_name})?;
    let mut segments = Vec::new();
    while let Some(row) = rows.next()? {
        segments.push(segment_from_row(row)?);
    }
    Ok(segments)
}

/// Distinct segment owner names, including dangling ones whose stream row
/// was hard-deleted.
pub(crate) fn list_segment_owners(conn: &rusqlite::Connection) -> Result<Vec<String>, Error> {
    let mut stmt = conn.prepare_cached("select distinct stream_name from segments")?;
    let mut rows = stmt.query(params![])?;
    let mut names = Vec::new();
    while let Some(row) = rows.next()? {
        names.push(row.get(0)?);
    }
    Ok(names)
}

pub(crate) fn upsert_recording_config(
    conn: &rusqlite::Connection,
    c: &RecordingConfig,
) -> Result<(), Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        insert into motion_recording_config (stream_name, enabled, pre_buffer_seconds,
                                             post_buffer_seconds, max_file_duration, codec,
                                             quality, retention_days, max_storage_mb,
                                             created_at, updated_at)
                                     values (:stream_name, :enabled, :pre_buffer_seconds,
                                             :post_buffer_seconds, :max_file_duration, :codec,
                                             :quality, :retention_days, :max_storage_mb,
                                             :now, :now)
        on conflict (stream_name) do update set
          enabled = excluded.enabled,
          pre_buffer_seconds = excluded.pre_buffer_seconds,
          post_buffer_seconds = excluded.post_buffer_seconds,
          max_file_duration = excluded.max_file_duration,
          codec = excluded.codec,
          quality = excluded.quality,
          retention_days = excluded.retention_days,
          max_storage_mb = excluded.max_storage_mb,
          updated_at = excluded.updated_at
        "#,
    )?;
    stmt.execute(named_params! {
        ":stream_name": &c.stream_name,
        ":enabled": c.enabled,
        ":pre_buffer_seconds": c.pre_buffer_seconds,
        ":post_buffer_seconds": c.post_buffer_seconds,
        ":max_file_duration": c.max_file_duration,
        ":codec": c.codec.as_deref(),
        ":quality": c.quality.as_deref(),
        ":retention_days": c.retention_days,
        ":max_storage_mb": c.max_storage_mb,
        ":now": c.updated_at,
    })?;
    Ok(())
}

pub(crate) fn get_recording_config(
    conn: &rusqlite::Connection,
    stream_name: &str,
) -> Result<Option<RecordingConfig>, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        select
          stream_name, enabled, pre_buffer_seconds, post_buffer_seconds,
          max_file_duration, codec, quality, retention_days, max_storage_mb,
          created_at, updated_at
        from motion_recording_config
        where stream_name = :stream_name
        "#,
    )?;
    Ok(stmt
        .query_row(named_params! {":stream_name": stream_name}, |row| {
            Ok(RecordingConfig {
                stream_name: row.get(0)?,
                enabled: row.get(1)?,
                pre_buffer_seconds: row.get(2)?,
                post_buffer_seconds: row.get(3)?,
                max_file_duration: row.get(4)?,
                codec: row.get(5)?,
                quality: row.get(6)?,
                retention_days: row.get(7)?,
                max_storage_mb: row.get(8)?,
                created_at: row.get(9)?,
                updated_at: row.get(10)?,
            })
        })
        .optional()?)
}

pub(crate) fn insert_event(
    conn: &rusqlite::Connection,
    type_: &str,
    stream_name: Option<&str>,
    message: &str,
    file_path: Option<&str>,
    now: i64,
) -> Result<i64, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        insert into events (type, stream_name, message, file_path, count, created_at,
                            updated_at)
                    values (:type, :stream_name, :message, :file_path, 1, :now, :now)
        "#,
    )?;
    stmt.execute(named_params! {
        ":type": type_,
        ":stream_name": stream_name,
        ":message": message,
        ":file_path": file_path,
        ":now": now,
    })?;
    Ok(conn.last_insert_rowid())
}

/// Coalesces a repeated event into its existing row.
pub(crate) fn bump_event(conn: &rusqlite::Connection, id: i64, now: i64) -> Result<usize, Error> {
    let mut stmt = conn
        .prepare_cached("update events set count = count + 1, updated_at = ? where id = ?")?;
    Ok(stmt.execute(params![now, id])?)
}

pub(crate) fn list_events(conn: &rusqlite::Connection, limit: i64) -> Result<Vec<Event>, Error> {
    let mut stmt = conn.prepare_cached(
        r#"
        select id, type, stream_name, message, file_path, count, created_at, updated_at
        from events
        order by created_at desc, id desc
        limit :limit
        "#,
    )?;
    let mut rows = stmt.query(named_params! {":limit": limit})?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        events.push(Event {
            id: row.get(0)?,
            type_: row.get(1)?,
            stream_name: row.get(2)?,
            message: row.get(3)?,
            file_path: row.get(4)?,
            count: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        });
    }
    Ok(events)
}

impl ListOrder {
    fn as_sql(self) -> &'static str {
        match self {
            ListOrder::Asc => "asc",
            ListOrder::Desc => "desc",
        }
    }
}
