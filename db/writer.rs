// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Writing segments and the per-stream writer registry.
//!
//! A [`SegmentWriter`] owns one in-flight segment: the `.part` file, the
//! muxer state, the `.idx` sidecar, and the catalog row it opened. The
//! [`WriterRegistry`] is the single answer to "is this stream actively
//! recording?", holding at most one live handle per stream.
//!
//! Locking discipline, which every caller must follow:
//!
//! *   the registry lock is never held across a writer close; `arm` and
//!     `disarm` *detach* and return the previous handle for the caller to
//!     close afterward.
//! *   the catalog lock is never held across file I/O; open/close lock it
//!     only for the row insert/update.

use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use base::clock::Clocks;
use base::{bail, err, Error, FastHashMap};
use base::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::db::{extension_for_codec, Database, SegmentToInsert};
use crate::dir::{self, SegmentDir};
use crate::mux::{AudioParams, IndexEntry, IndexWriter, Mp4Writer, VideoParams};
use crate::preroll::PrerollBuffer;
use crate::recording::{Frame, FrameKind};

/// As-probed parameters of the segment being opened; recorded on the
/// segment row, which may differ from the stream's configured values.
#[derive(Clone, Debug)]
pub struct SegmentParams {
    pub stream_name: String,
    pub codec: String,
    pub width: u16,
    pub height: u16,
    pub fps: u32,
}

struct OpenState {
    mux: Mp4Writer<std::fs::File>,
    idx: IndexWriter<BufWriter<std::fs::File>>,
    has_audio: bool,
    seen_key: bool,
    skipped: u64,
}

/// The live state of one in-flight segment. Created on segment open,
/// destroyed (via [`SegmentWriter::close`] or [`SegmentWriter::abort`]) on
/// segment close; I2 holds because each writer owns exactly one open file
/// and one `is_complete = 0` row.
pub struct SegmentWriter {
    stream_name: String,
    segment_id: i64,
    final_path: PathBuf,
    start_time: i64,
    state: Option<OpenState>,
}

impl SegmentWriter {
    /// Opens a new segment: inserts the catalog row (under one lock guard,
    /// so the preallocated id and the row agree), then creates the `.part`
    /// and `.idx` files. A catalog failure aborts the attempt; a file
    /// failure also rolls the row back.
    pub fn open<C: Clocks + Clone>(
        db: &Database<C>,
        dir: &SegmentDir,
        params: &SegmentParams,
        start_time: i64,
        video: VideoParams,
        audio: Option<AudioParams>,
    ) -> Result<Self, Error> {
        let created_at = db.clocks().realtime_epoch();
        let (segment_id, final_path) = {
            let mut l = db.lock();
            let id = l.next_segment_id()?;
            let final_path = dir.segment_path(
                &params.stream_name,
                start_time,
                id,
                extension_for_codec(&params.codec),
            )?;
            let got = l.open_segment(&SegmentToInsert {
                stream_name: params.stream_name.clone(),
                file_path: final_path.to_string_lossy().into_owned(),
                start_time,
                width: params.width,
                height: params.height,
                fps: params.fps,
                codec: params.codec.clone(),
                created_at,
            })?;
            debug_assert_eq!(got, id);
            (id, final_path)
        };

        let roll_back_row = |e: Error| -> Error {
            if let Err(e2) = db.lock().delete_segment(segment_id) {
                warn!(err = %e2.chain(), "unable to roll back segment row {segment_id}");
            }
            e
        };
        let (part, idx_file) = dir
            .create_segment_files(&final_path)
            .map_err(roll_back_row)?;
        let has_audio = audio.is_some();
        let mux = match Mp4Writer::new(part, video.clone(), audio.clone()) {
            Ok(m) => m,
            Err(e) => {
                dir.discard_partial(&final_path);
                return Err(roll_back_row(e));
            }
        };
        let idx = match IndexWriter::new(BufWriter::new(idx_file), &video, audio.as_ref()) {
            Ok(i) => i,
            Err(e) => {
                dir.discard_partial(&final_path);
                return Err(roll_back_row(e));
            }
        };
        debug!(
            "{}: opened segment {} at {}",
            &params.stream_name,
            segment_id,
            final_path.display()
        );
        Ok(SegmentWriter {
            stream_name: params.stream_name.clone(),
            segment_id,
            final_path,
            start_time,
            state: Some(OpenState {
                mux,
                idx,
                has_audio,
                seen_key: false,
                skipped: 0,
            }),
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn segment_id(&self) -> i64 {
        self.segment_id
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Media duration of the video written so far, for rotation decisions.
    /// Zero once closed.
    pub fn media_duration_90k(&self) -> i64 {
        self.state.as_ref().map_or(0, |s| s.mux.media_duration_90k())
    }

    /// Writes one frame. Leading non-key video (and any audio before the
    /// first keyframe) is skipped so the file always starts decodable;
    /// audio is skipped entirely when the segment has no audio track.
    pub fn write(&mut self, frame: &Frame) -> Result<(), Error> {
        let Some(s) = self.state.as_mut() else {
            bail!(FailedPrecondition, msg("writer for {} is closed", &self.stream_name));
        };
        match frame.kind {
            FrameKind::Video => {
                if !s.seen_key {
                    if !frame.is_key {
                        s.skipped += 1;
                        return Ok(());
                    }
                    s.seen_key = true;
                }
            }
            FrameKind::Audio => {
                if !s.seen_key || !s.has_audio {
                    return Ok(());
                }
            }
            FrameKind::Subtitle => return Ok(()),
        }
        let offset = s.mux.next_sample_offset();
        s.mux
            .write_sample(frame.kind, frame.pts_90k, frame.is_key, &frame.data)?;
        s.idx.push(&IndexEntry {
            kind: frame.kind,
            is_key: frame.is_key,
            len: frame.data.len() as u32,
            offset,
            pts_90k: frame.pts_90k,
        })?;
        if frame.is_key {
            // Keep the on-disk index current to the keyframe group so a
            // crash loses at most one group.
            s.idx.flush()?;
        }
        Ok(())
    }

    /// Cleanly closes the segment: `moov`, fsync, rename out of `.part`,
    /// catalog update, sidecar removal. An empty segment (no keyframe ever
    /// arrived) is quietly aborted instead. On any error the partial state
    /// is deleted so that I2 still holds afterward.
    pub fn close<C: Clocks + Clone>(
        &mut self,
        db: &Database<C>,
        dir: &SegmentDir,
        end_time: i64,
    ) -> Result<(), Error> {
        let Some(s) = self.state.take() else {
            bail!(FailedPrecondition, msg("writer for {} is closed", &self.stream_name));
        };
        if !s.seen_key {
            debug!("{}: discarding empty segment {}", &self.stream_name, self.segment_id);
            self.discard(db, dir, s);
            return Ok(());
        }
        match self.close_inner(db, dir, s, end_time) {
            Ok(()) => Ok(()),
            Err(e) => {
                // `close_inner` has already dropped the file handles.
                dir.discard_partial(&self.final_path);
                if let Err(e2) = db.lock().delete_segment(self.segment_id) {
                    warn!(err = %e2.chain(), "unable to roll back segment row {}", self.segment_id);
                }
                Err(e)
            }
        }
    }

    fn close_inner<C: Clocks + Clone>(
        &self,
        db: &Database<C>,
        dir: &SegmentDir,
        s: OpenState,
        end_time: i64,
    ) -> Result<(), Error> {
        let OpenState {
            mux, mut idx, skipped, ..
        } = s;
        if skipped > 0 {
            debug!("{}: skipped {} leading frames", &self.stream_name, skipped);
        }
        idx.flush()?;
        let (file, total_bytes) = mux.finish()?;
        file.sync_all()?;
        drop(file);
        drop(idx);
        dir.finalize(&self.final_path)?;
        db.lock().close_segment(
            &self.final_path.to_string_lossy(),
            end_time,
            total_bytes as i64,
        )?;
        let _ = dir.unlink(&dir::idx_path(&self.final_path));
        debug!(
            "{}: closed segment {} ({} bytes)",
            &self.stream_name, self.segment_id, total_bytes
        );
        Ok(())
    }

    /// The delete-partial path: drops the files and the catalog row, e.g.
    /// after a mid-segment write failure. One broken segment must not stop
    /// recording; the caller re-arms on the next keyframe.
    pub fn abort<C: Clocks + Clone>(&mut self, db: &Database<C>, dir: &SegmentDir) {
        if let Some(s) = self.state.take() {
            self.discard(db, dir, s);
        }
    }

    fn discard<C: Clocks + Clone>(&self, db: &Database<C>, dir: &SegmentDir, s: OpenState) {
        drop(s); // close both file handles before unlinking
        dir.discard_partial(&self.final_path);
        if let Err(e) = db.lock().delete_segment(self.segment_id) {
            warn!(err = %e.chain(), "unable to delete aborted segment row {}", self.segment_id);
        }
    }
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("stream_name", &self.stream_name)
            .field("segment_id", &self.segment_id)
            .field("final_path", &self.final_path)
            .field("open", &self.state.is_some())
            .finish()
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if self.state.is_some() {
            // No catalog handle here, so just leave the `.part`/`.idx` and
            // row for the next crash-finalize scan, which handles exactly
            // this shape of leftover.
            warn!(
                "{}: segment writer {} dropped while open",
                &self.stream_name, self.segment_id
            );
        }
    }
}

/// Process-wide map from stream name to the currently-active writer.
///
/// At most one handle per stream (I6). Mutations take the write lock
/// briefly and never touch files while holding it; lookups take the read
/// lock.
pub struct WriterRegistry {
    streams: RwLock<FastHashMap<String, Arc<Mutex<SegmentWriter>>>>,
}

impl Default for WriterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterRegistry {
    pub fn new() -> Self {
        WriterRegistry {
            streams: RwLock::new(FastHashMap::default()),
        }
    }

    /// Installs `writer` as the stream's active writer, first feeding it
    /// the ring buffer's keyframe-aligned backlog (pre-roll). Returns the
    /// detached previous handle, if any; the caller must close it *after*
    /// this returns, outside any registry lock.
    ///
    /// On a pre-roll write failure the writer is handed back to the caller
    /// (for [`SegmentWriter::abort`]) along with the error, and the
    /// registry is left unchanged.
    #[allow(clippy::result_large_err)]
    pub fn arm(
        &self,
        mut writer: SegmentWriter,
        preroll: Option<&mut PrerollBuffer>,
    ) -> Result<Option<Arc<Mutex<SegmentWriter>>>, (SegmentWriter, Error)> {
        if let Some(ring) = preroll {
            let frames = ring.drain_keyframe_aligned();
            if let Some(first) = frames.first() {
                debug_assert!(first.is_key);
                debug!(
                    "{}: flushing {} pre-roll frames into segment {}",
                    writer.stream_name(),
                    frames.len(),
                    writer.segment_id()
                );
            }
            for f in &frames {
                if let Err(e) = writer.write(f) {
                    return Err((writer, e));
                }
            }
        }
        let name = writer.stream_name().to_owned();
        let prev = self
            .streams
            .write()
            .insert(name, Arc::new(Mutex::new(writer)));
        Ok(prev)
    }

    /// Returns the stream's active writer, if any. The clone keeps the
    /// handle alive for the caller's operation even across a concurrent
    /// disarm; the holder of a detached handle closes it, never the
    /// registry.
    pub fn handle(&self, stream_name: &str) -> Option<Arc<Mutex<SegmentWriter>>> {
        self.streams.read().get(stream_name).cloned()
    }

    pub fn is_armed(&self, stream_name: &str) -> bool {
        self.streams.read().contains_key(stream_name)
    }

    /// Removes and returns the stream's writer for the caller to close.
    pub fn disarm(&self, stream_name: &str) -> Option<Arc<Mutex<SegmentWriter>>> {
        self.streams.write().remove(stream_name)
    }

    pub fn armed_streams(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preroll::PrerollBuffer;
    use crate::testutil::{self, TestDb};
    use bytes::Bytes;

    struct Harness {
        tdb: TestDb,
        dir: Arc<SegmentDir>,
        _tmpdir: tempfile::TempDir,
    }

    fn new_harness() -> Harness {
        let tmpdir = tempfile::tempdir().unwrap();
        let dir = SegmentDir::open(tmpdir.path()).unwrap();
        Harness {
            tdb: TestDb::new(),
            dir,
            _tmpdir: tmpdir,
        }
    }

    fn params() -> SegmentParams {
        SegmentParams {
            stream_name: "cam-yard".to_owned(),
            codec: "h264".to_owned(),
            width: 1920,
            height: 1080,
            fps: 10,
        }
    }

    fn frame(pts_90k: i64, is_key: bool) -> Frame {
        Frame {
            pts_90k,
            is_key,
            kind: FrameKind::Video,
            data: Bytes::from_static(&[0u8; 64]),
        }
    }

    fn open_writer(h: &Harness, start_time: i64) -> SegmentWriter {
        SegmentWriter::open(
            &h.tdb.db,
            &h.dir,
            &params(),
            start_time,
            testutil::test_video_params(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn write_close_round_trip() {
        testutil::init();
        let h = new_harness();
        let mut w = open_writer(&h, 1_700_000_000);
        let id = w.segment_id();

        // Writer refuses to start mid-group: the leading delta is skipped.
        w.write(&frame(0, false)).unwrap();
        w.write(&frame(9000, true)).unwrap();
        w.write(&frame(18000, false)).unwrap();
        assert_eq!(w.media_duration_90k(), 18000);

        w.close(&h.tdb.db, &h.dir, 1_700_000_002).unwrap();
        let row = h.tdb.db.lock().get_segment(id).unwrap().unwrap();
        assert!(row.is_complete);
        assert_eq!(row.end_time, Some(1_700_000_002));
        let path = std::path::PathBuf::from(&row.file_path);
        assert!(path.exists());
        assert_eq!(row.size_bytes, path.metadata().unwrap().len() as i64);
        assert!(!dir::part_path(&path).exists());
        assert!(!dir::idx_path(&path).exists());

        // I2 after close: no open file, no incomplete row.
        assert!(!w.is_open());
        w.write(&frame(27000, false)).unwrap_err();
    }

    #[test]
    fn abort_deletes_partial_and_row() {
        testutil::init();
        let h = new_harness();
        let mut w = open_writer(&h, 1_700_000_000);
        let id = w.segment_id();
        w.write(&frame(0, true)).unwrap();
        let row = h.tdb.db.lock().get_segment(id).unwrap().unwrap();
        let path = std::path::PathBuf::from(&row.file_path);
        assert!(dir::part_path(&path).exists());

        w.abort(&h.tdb.db, &h.dir);
        assert!(!dir::part_path(&path).exists());
        assert!(!dir::idx_path(&path).exists());
        assert!(h.tdb.db.lock().get_segment(id).unwrap().is_none());
    }

    #[test]
    fn empty_segment_close_is_an_abort() {
        testutil::init();
        let h = new_harness();
        let mut w = open_writer(&h, 1_700_000_000);
        let id = w.segment_id();
        w.write(&frame(0, false)).unwrap(); // never a keyframe
        w.close(&h.tdb.db, &h.dir, 1_700_000_001).unwrap();
        assert!(h.tdb.db.lock().get_segment(id).unwrap().is_none());
    }

    /// P5 / S6: re-arming returns the previous writer to the caller, the
    /// registry references exactly the new one, and the old one closes
    /// fine afterward.
    #[test]
    fn rearm_detaches_previous_writer() {
        testutil::init();
        let h = new_harness();
        let registry = WriterRegistry::new();

        let mut w1 = open_writer(&h, 1_700_000_000);
        w1.write(&frame(0, true)).unwrap();
        let id1 = w1.segment_id();
        assert!(registry.arm(w1, None).unwrap().is_none());
        assert!(registry.is_armed("cam-yard"));

        let w2 = open_writer(&h, 1_700_000_060);
        let id2 = w2.segment_id();
        let prev = registry.arm(w2, None).unwrap().expect("w1 is detached");
        assert_eq!(prev.lock().segment_id(), id1);

        // The registry now references exactly w2.
        assert_eq!(
            registry.handle("cam-yard").unwrap().lock().segment_id(),
            id2
        );

        // Closing the detached writer happens outside the registry lock
        // and does not disturb the active one.
        prev.lock().close(&h.tdb.db, &h.dir, 1_700_000_060).unwrap();
        assert!(h.tdb.db.lock().get_segment(id1).unwrap().unwrap().is_complete);
        assert!(registry.is_armed("cam-yard"));

        let active = registry.disarm("cam-yard").unwrap();
        active.lock().write(&frame(0, true)).unwrap();
        active.lock().close(&h.tdb.db, &h.dir, 1_700_000_120).unwrap();
        assert!(!registry.is_armed("cam-yard"));
    }

    #[test]
    fn arm_flushes_keyframe_aligned_preroll() {
        testutil::init();
        let h = new_harness();
        let registry = WriterRegistry::new();

        let mut ring = PrerollBuffer::new(8);
        ring.push(frame(0, false)); // before any keyframe; must not be emitted
        ring.push(frame(9000, true));
        ring.push(frame(18000, false));

        let w = open_writer(&h, 1_700_000_000);
        registry.arm(w, Some(&mut ring)).unwrap();
        assert!(ring.is_empty());

        let handle = registry.handle("cam-yard").unwrap();
        {
            let w = handle.lock();
            // Two frames of pre-roll (from the keyframe on), 9000 units.
            assert_eq!(w.media_duration_90k(), 9000);
        }
        let arc = registry.disarm("cam-yard").unwrap();
        arc.lock().close(&h.tdb.db, &h.dir, 1_700_000_001).unwrap();
    }

    #[test]
    fn audio_is_gated_by_track_presence() {
        testutil::init();
        let h = new_harness();
        let mut w = open_writer(&h, 1_700_000_000);
        w.write(&frame(0, true)).unwrap();
        // No audio track: silently skipped rather than failing recording.
        w.write(&Frame {
            pts_90k: 0,
            is_key: false,
            kind: FrameKind::Audio,
            data: Bytes::from_static(b"aac"),
        })
        .unwrap();
        // A lone video sample borrows the fallback duration; the skipped
        // audio contributed nothing.
        assert_eq!(w.media_duration_90k(), 3600);
        w.close(&h.tdb.db, &h.dir, 1_700_000_001).unwrap();
    }
}
