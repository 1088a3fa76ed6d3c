// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The retention cleaner: bounded disk usage without orphaning rows or
//! files.
//!
//! One background thread runs a pass per interval (or on demand). Each
//! pass applies, per stream, the age pass, the quota pass, and the orphan
//! pass, then clears leftover playback manifests. Deletion order is
//! always *file unlink before row delete*, so an
//! interrupted pass leaves an orphaned row (cleaned next pass) rather than
//! an orphaned file invisible to the engine; this is what keeps I1 true
//! across interruptions.
//!
//! The catalog lock is taken to read batches and to delete rows, never
//! across an unlink.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base::clock::Clocks;
use base::{Error, FastHashSet};
use tracing::{debug, info, warn};

use crate::db::{Database, RetentionPolicy, SegmentRow};
use crate::dir::{self, SegmentDir};

/// A command sent to the cleaner. These correspond to methods on
/// [`CleanerChannel`].
enum CleanerCommand {
    CleanNow,
    SetInterval(Duration),
}

/// A channel which can be used to prod the cleaner. Can be cloned; the
/// cleaner thread exits when every clone is dropped.
#[derive(Clone)]
pub struct CleanerChannel(mpsc::Sender<CleanerCommand>);

impl CleanerChannel {
    /// Requests an immediate retention pass.
    pub fn clean_now(&self) {
        if self.0.send(CleanerCommand::CleanNow).is_err() {
            warn!("retention cleaner is gone; ignoring clean_now");
        }
    }

    pub fn set_interval(&self, interval: Duration) {
        if self.0.send(CleanerCommand::SetInterval(interval)).is_err() {
            warn!("retention cleaner is gone; ignoring set_interval");
        }
    }
}

/// What one retention pass did, for logs and tests.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct PassSummary {
    pub age_deleted: usize,
    pub quota_deleted: usize,
    pub orphan_rows_deleted: usize,
    pub stray_files_deleted: usize,
    pub manifests_deleted: usize,
    pub errors: usize,
}

impl PassSummary {
    fn is_noop(&self) -> bool {
        *self == PassSummary::default()
    }
}

/// Starts the retention cleaner thread.
///
/// `default_policy` applies to streams without a row in
/// `motion_recording_config` (and to dangling segment owners). Returns a
/// channel for on-demand triggering and the join handle; drop all channel
/// clones and join at shutdown.
pub fn start_cleaner<C: Clocks + Clone>(
    db: Arc<Database<C>>,
    dir: Arc<SegmentDir>,
    default_policy: RetentionPolicy,
    interval: Duration,
) -> (CleanerChannel, thread::JoinHandle<()>) {
    let (snd, rcv) = mpsc::channel();
    let mut cleaner = Cleaner {
        db,
        dir,
        default_policy,
        interval,
    };
    let join = thread::Builder::new()
        .name("retention".to_owned())
        .spawn(move || cleaner.run(rcv))
        .expect("spawning retention thread");
    (CleanerChannel(snd), join)
}

struct Cleaner<C: Clocks + Clone> {
    db: Arc<Database<C>>,
    dir: Arc<SegmentDir>,
    default_policy: RetentionPolicy,
    interval: Duration,
}

impl<C: Clocks + Clone> Cleaner<C> {
    fn run(&mut self, cmds: mpsc::Receiver<CleanerCommand>) {
        info!("retention cleaner starting; interval {:?}", self.interval);
        loop {
            let clocks = self.db.clocks();
            match clocks.recv_timeout(&cmds, self.interval) {
                Ok(CleanerCommand::CleanNow) | Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.pass_and_log()
                }
                Ok(CleanerCommand::SetInterval(interval)) => {
                    info!("retention interval now {interval:?}");
                    self.interval = interval;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    info!("retention cleaner exiting");
                    return;
                }
            }
        }
    }

    fn pass_and_log(&mut self) {
        match self.pass() {
            Ok(s) if s.is_noop() => debug!("retention pass: nothing to do"),
            Ok(s) => info!(
                "retention pass: {} aged out, {} over quota, {} orphaned rows, {} stray files, {} manifests, {} errors",
                s.age_deleted, s.quota_deleted, s.orphan_rows_deleted, s.stray_files_deleted,
                s.manifests_deleted, s.errors
            ),
            Err(e) => warn!(err = %e.chain(), "retention pass failed"),
        }
    }

    /// One full retention pass over every stream that is configured or
    /// still owns segment rows (dangling owners use the default policy).
    fn pass(&mut self) -> Result<PassSummary, Error> {
        let now = self.db.clocks().realtime_epoch();
        let mut streams: Vec<String> = {
            let l = self.db.lock();
            let mut names: Vec<String> = l.streams_by_name().keys().cloned().collect();
            names.extend(l.list_segment_owners()?);
            names
        };
        streams.sort();
        streams.dedup();

        let mut summary = PassSummary::default();
        for stream in &streams {
            let policy = match self.db.lock().get_recording_config(stream)? {
                Some(c) => c.policy(),
                None => self.default_policy,
            };
            self.age_pass(stream, policy, now, &mut summary);
            self.quota_pass(stream, policy, &mut summary);
            self.orphan_pass(stream, now, &mut summary);
        }
        self.manifest_pass(&mut summary);
        Ok(summary)
    }

    /// Clears leftover playback manifests. They are single-use artifacts
    /// (built, served, forgotten) and are not in the catalog, so every one
    /// still on disk at pass time is stale.
    fn manifest_pass(&self, summary: &mut PassSummary) {
        let manifests = match self.dir.manifests_dir() {
            Ok(d) => d,
            Err(e) => {
                warn!(err = %e.chain(), "unable to open manifests dir");
                summary.errors += 1;
                return;
            }
        };
        let mut stale = Vec::new();
        let walk = dir::walk_files(&manifests, &mut |path| {
            stale.push(path.to_owned());
            Ok(())
        });
        if let Err(e) = walk {
            warn!(err = %e.chain(), "unable to walk manifests dir");
            summary.errors += 1;
        }
        for path in stale {
            match self.dir.unlink(&path) {
                Ok(()) => {
                    debug!("unlinked stale manifest {}", path.display());
                    summary.manifests_deleted += 1;
                }
                Err(e) => {
                    warn!(err = %e.chain(), "unable to unlink manifest {}", path.display());
                    summary.errors += 1;
                }
            }
        }
    }

    /// Deletes complete segments older than the policy allows.
    fn age_pass(&self, stream: &str, policy: RetentionPolicy, now: i64, summary: &mut PassSummary) {
        if policy.retention_days == 0 {
            return;
        }
        let cutoff = now - i64::from(policy.retention_days) * 86_400;
        let expired = match self.db.lock().list_expired_segments(stream, cutoff) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(err = %e.chain(), "{stream}: unable to list expired segments");
                summary.errors += 1;
                return;
            }
        };
        for row in expired {
            self.remove_segment(&row, "aged out", &mut summary.age_deleted, &mut summary.errors);
        }
    }

    /// Deletes oldest-first until the stream's total fits its quota.
    fn quota_pass(&self, stream: &str, policy: RetentionPolicy, summary: &mut PassSummary) {
        if policy.max_storage_bytes == 0 {
            return;
        }
        let mut victims = Vec::new();
        {
            let l = self.db.lock();
            let total = match l.total_size_bytes(Some(stream)) {
                Ok(t) => t as i64,
                Err(e) => {
                    warn!(err = %e.chain(), "{stream}: unable to total segment sizes");
                    summary.errors += 1;
                    return;
                }
            };
            let mut excess = total - policy.max_storage_bytes;
            if excess <= 0 {
                return;
            }
            debug!(
                "{stream}: {} over quota",
                base::strutil::encode_size(excess)
            );
            if let Err(e) = l.list_oldest_segments(stream, &mut |row| {
                if excess <= 0 {
                    return false;
                }
                excess -= row.size_bytes;
                victims.push(row.clone());
                true
            }) {
                warn!(err = %e.chain(), "{stream}: unable to walk oldest segments");
                summary.errors += 1;
                return;
            }
        }
        for row in victims {
            self.remove_segment(&row, "over quota", &mut summary.quota_deleted, &mut summary.errors);
        }
    }

    /// Reconciles rows without files and files without rows.
    fn orphan_pass(&self, stream: &str, now: i64, summary: &mut PassSummary) {
        let rows = match self.db.lock().list_segments_for_stream(stream) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(err = %e.chain(), "{stream}: unable to list segments");
                summary.errors += 1;
                return;
            }
        };
        let mut keep: FastHashSet<PathBuf> = FastHashSet::default();
        for row in rows {
            let path = PathBuf::from(&row.file_path);
            if !row.is_complete {
                // An active writer owns these; leave every spelling alone.
                keep.insert(dir::part_path(&path));
                keep.insert(dir::idx_path(&path));
                keep.insert(path);
            } else if row.is_corrupt {
                // Remove the moved-aside file (if still present) and then
                // the bookkeeping row.
                let corrupt = dir::corrupt_path(&path);
                match self.dir.unlink(&corrupt) {
                    Ok(()) => self.delete_row(&row, "corrupt reaped", &mut summary.orphan_rows_deleted),
                    Err(e) => {
                        warn!(err = %e.chain(), "unable to unlink {}", corrupt.display());
                        summary.errors += 1;
                    }
                }
            } else if path.exists() {
                keep.insert(path);
            } else {
                debug!("{stream}: segment {} lost its file", row.id);
                self.add_event(
                    "segment_orphaned",
                    stream,
                    &row.file_path,
                    &format!("segment file {} missing", &row.file_path),
                    now,
                );
                self.delete_row(&row, "orphaned", &mut summary.orphan_rows_deleted);
            }
        }

        // Anything else under the stream root is a stray: leftover `.part`
        // files of deleted rows, `.corrupt` files whose row is already
        // gone, manual copies.
        let stream_dir = self.dir.stream_dir(stream);
        let mut strays = Vec::new();
        let walk = dir::walk_files(&stream_dir, &mut |path| {
            if !keep.contains(path) {
                strays.push(path.to_owned());
            }
            Ok(())
        });
        if let Err(e) = walk {
            warn!(err = %e.chain(), "{stream}: unable to walk stream dir");
            summary.errors += 1;
        }
        for path in strays {
            match self.dir.unlink(&path) {
                Ok(()) => {
                    info!("unlinked stray file {}", path.display());
                    summary.stray_files_deleted += 1;
                }
                Err(e) => {
                    warn!(err = %e.chain(), "unable to unlink stray {}", path.display());
                    summary.errors += 1;
                }
            }
        }
    }

    /// The one true deletion order: unlink first, then the row. An unlink
    /// failure skips the row so the next pass retries; a missing file is a
    /// success (the goal state).
    fn remove_segment(&self, row: &SegmentRow, why: &str, deleted: &mut usize, errors: &mut usize) {
        let path = Path::new(&row.file_path);
        let target = if row.is_corrupt {
            dir::corrupt_path(path)
        } else {
            path.to_owned()
        };
        if let Err(e) = self.dir.unlink(&target) {
            warn!(err = %e.chain(), "unable to unlink {}; will retry next pass", target.display());
            *errors += 1;
            return;
        }
        self.delete_row(row, why, deleted);
    }

    fn delete_row(&self, row: &SegmentRow, why: &str, deleted: &mut usize) {
        match self.db.lock().delete_segment(row.id) {
            Ok(()) => {
                debug!("{}: deleted segment {} ({why})", &row.stream_name, row.id);
                *deleted += 1;
            }
            Err(e) => {
                warn!(err = %e.chain(), "unable to delete segment row {}", row.id)
            }
        }
    }

    fn add_event(&self, type_: &str, stream: &str, file_path: &str, message: &str, now: i64) {
        if let Err(e) =
            self.db
                .lock()
                .add_event(type_, Some(stream), message, Some(file_path), now)
        {
            warn!(err = %e.chain(), "unable to record {type_} event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RecordingConfig, SegmentToInsert};
    use crate::testutil::{self, TestDb};
    use base::clock::SimulatedClocks;
    use jiff::Timestamp;

    const BOOT: i64 = 2_000_000_000;

    struct Harness {
        tdb: TestDb<SimulatedClocks>,
        dir: Arc<SegmentDir>,
        _tmpdir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let tmpdir = tempfile::tempdir().unwrap();
            Harness {
                tdb: TestDb::with_clocks(SimulatedClocks::new(
                    Timestamp::from_second(BOOT).unwrap(),
                )),
                dir: SegmentDir::open(tmpdir.path()).unwrap(),
                _tmpdir: tmpdir,
            }
        }

        fn cleaner(&self, default_policy: RetentionPolicy) -> Cleaner<SimulatedClocks> {
            Cleaner {
                db: self.tdb.db.clone(),
                dir: self.dir.clone(),
                default_policy,
                interval: Duration::from_secs(3600),
            }
        }

        /// Inserts a closed segment row with a real (dummy-content) file
        /// of `size` bytes.
        fn add_segment(&self, stream: &str, start: i64, end: i64, size: usize) -> SegmentRow {
            let (id, path) = {
                let mut l = self.tdb.db.lock();
                let id = l.next_segment_id().unwrap();
                let path = self.dir.segment_path(stream, start, id, "mp4").unwrap();
                l.open_segment(&SegmentToInsert {
                    file_path: path.to_string_lossy().into_owned(),
                    ..testutil::segment_to_insert(stream, "unused", start)
                })
                .unwrap();
                (id, path)
            };
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, vec![0u8; size]).unwrap();
            self.tdb
                .db
                .lock()
                .close_segment(&path.to_string_lossy(), end, size as i64)
                .unwrap();
            self.tdb.db.lock().get_segment(id).unwrap().unwrap()
        }
    }

    /// P4 (age half) and the unlink-before-row ordering.
    #[test]
    fn age_pass_deletes_expired() {
        testutil::init();
        let h = Harness::new();
        let day = 86_400;
        let old = h.add_segment("cam-front", BOOT - 10 * day, BOOT - 10 * day + 60, 1000);
        let fresh = h.add_segment("cam-front", BOOT - day / 2, BOOT - day / 2 + 60, 1000);

        let mut cleaner = h.cleaner(RetentionPolicy {
            retention_days: 7,
            max_storage_bytes: 0,
        });
        let s = cleaner.pass().unwrap();
        assert_eq!(s.age_deleted, 1);

        let l = h.tdb.db.lock();
        assert!(l.get_segment(old.id).unwrap().is_none());
        assert!(!Path::new(&old.file_path).exists());
        assert!(l.get_segment(fresh.id).unwrap().is_some());
        assert!(Path::new(&fresh.file_path).exists());
    }

    /// S4 / P4 (quota half): oldest-first deletion until total <= quota;
    /// nothing newer than needed is touched.
    #[test]
    fn quota_pass_deletes_oldest_first() {
        testutil::init();
        let h = Harness::new();
        // 7 segments of 20 bytes each = 140, quota 100.
        let rows: Vec<SegmentRow> = (0..7)
            .map(|i| h.add_segment("cam-lobby", BOOT - 700 + i * 60, BOOT - 700 + i * 60 + 60, 20))
            .collect();

        let mut cleaner = h.cleaner(RetentionPolicy {
            retention_days: 0,
            max_storage_bytes: 100,
        });
        let s = cleaner.pass().unwrap();
        assert_eq!(s.quota_deleted, 2);

        let l = h.tdb.db.lock();
        assert_eq!(l.total_size_bytes(Some("cam-lobby")).unwrap(), 100);
        for (i, row) in rows.iter().enumerate() {
            let gone = l.get_segment(row.id).unwrap().is_none();
            assert_eq!(gone, i < 2, "segment {i}");
            assert_eq!(!Path::new(&row.file_path).exists(), i < 2, "file {i}");
        }
    }

    /// Per-stream policy rows override the default.
    #[test]
    fn per_stream_policy_overrides_default() {
        testutil::init();
        let h = Harness::new();
        h.add_segment("cam-a", BOOT - 600, BOOT - 540, 50);
        h.add_segment("cam-b", BOOT - 600, BOOT - 540, 50);
        h.tdb
            .db
            .lock()
            .upsert_recording_config(
                RecordingConfig {
                    stream_name: "cam-b".to_owned(),
                    enabled: true,
                    pre_buffer_seconds: 0,
                    post_buffer_seconds: 0,
                    max_file_duration: 0,
                    codec: None,
                    quality: None,
                    retention_days: 0,
                    max_storage_mb: 1, // far above 50 bytes: keeps everything
                    created_at: 0,
                    updated_at: 0,
                },
                BOOT,
            )
            .unwrap();

        // Default quota of 10 bytes would delete both, but cam-b's row
        // says 1 MiB.
        let mut cleaner = h.cleaner(RetentionPolicy {
            retention_days: 0,
            max_storage_bytes: 10,
        });
        cleaner.pass().unwrap();
        let l = h.tdb.db.lock();
        assert_eq!(l.total_size_bytes(Some("cam-a")).unwrap(), 0);
        assert_eq!(l.total_size_bytes(Some("cam-b")).unwrap(), 50);
    }

    /// S5: manually deleted files are reconciled; exactly the affected
    /// rows are removed and `segment_orphaned` events recorded.
    #[test]
    fn orphan_pass_reconciles_missing_files() {
        testutil::init();
        let h = Harness::new();
        let rows: Vec<SegmentRow> = (0..4)
            .map(|i| h.add_segment("cam-front", BOOT - 400 + i * 60, BOOT - 400 + i * 60 + 60, 30))
            .collect();
        std::fs::remove_file(&rows[1].file_path).unwrap();
        std::fs::remove_file(&rows[2].file_path).unwrap();

        let mut cleaner = h.cleaner(RetentionPolicy::default());
        let s = cleaner.pass().unwrap();
        assert_eq!(s.orphan_rows_deleted, 2);

        let l = h.tdb.db.lock();
        assert!(l.get_segment(rows[0].id).unwrap().is_some());
        assert!(l.get_segment(rows[1].id).unwrap().is_none());
        assert!(l.get_segment(rows[2].id).unwrap().is_none());
        assert!(l.get_segment(rows[3].id).unwrap().is_some());

        let events = l.list_events(10).unwrap();
        let orphaned: Vec<_> = events.iter().filter(|e| e.type_ == "segment_orphaned").collect();
        assert_eq!(orphaned.len(), 2);
    }

    /// Stray files (no catalog row) under a stream root are unlinked; an
    /// active segment's `.part`/`.idx` are not.
    #[test]
    fn stray_files_are_unlinked_but_active_part_kept() {
        testutil::init();
        let h = Harness::new();
        let kept = h.add_segment("cam-front", BOOT - 300, BOOT - 240, 30);

        // An open (incomplete) segment with its .part/.idx on disk.
        let part_row = {
            let mut l = h.tdb.db.lock();
            let id = l.next_segment_id().unwrap();
            let path = h.dir.segment_path("cam-front", BOOT - 100, id, "mp4").unwrap();
            l.open_segment(&SegmentToInsert {
                file_path: path.to_string_lossy().into_owned(),
                ..testutil::segment_to_insert("cam-front", "unused", BOOT - 100)
            })
            .unwrap();
            path
        };
        h.dir.create_segment_files(&part_row).unwrap();

        // A stray with no row at all.
        let stray = h.dir.stream_dir("cam-front").join("stray.mp4.part");
        std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
        std::fs::write(&stray, b"junk").unwrap();

        let mut cleaner = h.cleaner(RetentionPolicy::default());
        let s = cleaner.pass().unwrap();
        assert_eq!(s.stray_files_deleted, 1);
        assert!(!stray.exists());
        assert!(dir::part_path(&part_row).exists());
        assert!(dir::idx_path(&part_row).exists());
        assert!(Path::new(&kept.file_path).exists());
    }

    /// Manifests are not cataloged; whatever playback left behind is
    /// cleared by the next pass.
    #[test]
    fn manifest_pass_clears_leftovers() {
        testutil::init();
        let h = Harness::new();
        let manifests = h.dir.manifests_dir().unwrap();
        std::fs::write(manifests.join("cam-front-100-200.m3u8"), "#EXTM3U\n").unwrap();
        std::fs::write(manifests.join("cam-door-300-400.m3u8"), "#EXTM3U\n").unwrap();

        let mut cleaner = h.cleaner(RetentionPolicy::default());
        let s = cleaner.pass().unwrap();
        assert_eq!(s.manifests_deleted, 2);
        assert!(!manifests.join("cam-front-100-200.m3u8").exists());

        let second = cleaner.pass().unwrap();
        assert!(second.is_noop(), "second pass did {second:?}");
    }

    /// R2: a second pass with no producer activity is a no-op.
    #[test]
    fn second_pass_is_noop() {
        testutil::init();
        let h = Harness::new();
        for i in 0..5 {
            h.add_segment("cam-front", BOOT - 900 + i * 60, BOOT - 900 + i * 60 + 60, 40);
        }
        let mut cleaner = h.cleaner(RetentionPolicy {
            retention_days: 0,
            max_storage_bytes: 100,
        });
        let first = cleaner.pass().unwrap();
        assert!(!first.is_noop());
        let second = cleaner.pass().unwrap();
        assert!(second.is_noop(), "second pass did {second:?}");
    }

    /// The cleaner thread wakes on demand and exits when its channel is
    /// dropped.
    #[test]
    fn thread_lifecycle() {
        testutil::init();
        let h = Harness::new();
        h.add_segment("cam-front", BOOT - 900, BOOT - 840, 40);
        let (channel, join) = start_cleaner(
            h.tdb.db.clone(),
            h.dir.clone(),
            RetentionPolicy {
                retention_days: 0,
                max_storage_bytes: 10,
            },
            Duration::from_secs(3600),
        );
        channel.clean_now();
        drop(channel);
        join.join().unwrap();
        assert_eq!(h.tdb.db.lock().total_size_bytes(Some("cam-front")).unwrap(), 0);
    }
}
