// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The owning structure of the recording engine and the control surface
//! the HTTP layer consumes.
//!
//! The engine owns the catalog handle, the segment store, the writer
//! registry, the per-stream capture workers, and the retention cleaner;
//! workers hold clones of these rather than file-scope globals, so there
//! is no initialization-order hazard and shutdown is a plain teardown.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base::clock::Clocks;
use base::shutdown;
use base::{bail, err, Error, FastHashMap, FastHashSet, Mutex};
use db::dir::SegmentDir;
use db::retention::{self, CleanerChannel};
use db::writer::WriterRegistry;
use db::{Database, RecordingConfig, RetentionPolicy, SegmentRow, StreamChange};
use tracing::{info, warn};

use crate::stream;
use crate::streamer::{DetectionInbox, Environment, Streamer};
use crate::timeline;

/// Engine construction parameters, typically read from the config file.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub storage_root: PathBuf,
    pub cleanup_interval: Duration,
    pub default_retention: RetentionPolicy,
}

struct Worker {
    shutdown_tx: shutdown::Sender,
    join: thread::JoinHandle<()>,
    record_enabled: Arc<AtomicBool>,
    inbox: Arc<DetectionInbox>,
}

/// The running engine. One per process.
pub struct Engine<C: Clocks + Clone = base::clock::RealClocks> {
    db: Arc<Database<C>>,
    dir: Arc<SegmentDir>,
    registry: Arc<WriterRegistry>,
    opener: Arc<dyn stream::Opener>,
    workers: Mutex<FastHashMap<String, Worker>>,
    cleaner: CleanerChannel,
    cleaner_join: Mutex<Option<thread::JoinHandle<()>>>,

    /// Segment ids with a playback start in flight; an advisory
    /// short-circuit against duplicate opens under heavy UI refresh, not a
    /// correctness guard.
    active_reads: Arc<Mutex<FastHashSet<i64>>>,
}

impl<C: Clocks + Clone> Engine<C> {
    /// Opens the catalog (migrating as needed), crash-finalizes leftovers
    /// from any previous run, starts the retention cleaner, and spawns a
    /// capture worker per enabled stream.
    pub fn start(
        clocks: C,
        opener: Arc<dyn stream::Opener>,
        config: &EngineConfig,
    ) -> Result<Self, Error> {
        let db = Arc::new(Database::open(clocks, &config.db_path)?);
        let dir = SegmentDir::open(&config.storage_root)?;
        dir.scan_and_finalize(&db)?;
        let (cleaner, cleaner_join) = retention::start_cleaner(
            db.clone(),
            dir.clone(),
            config.default_retention,
            config.cleanup_interval,
        );
        let engine = Engine {
            db,
            dir,
            registry: Arc::new(WriterRegistry::new()),
            opener,
            workers: Mutex::new(FastHashMap::default()),
            cleaner,
            cleaner_join: Mutex::new(Some(cleaner_join)),
            active_reads: Arc::new(Mutex::new(FastHashSet::default())),
        };
        for cfg in engine.db.lock().list_streams() {
            if cfg.enabled {
                engine.spawn_worker(cfg);
            }
        }
        Ok(engine)
    }

    pub fn db(&self) -> &Arc<Database<C>> {
        &self.db
    }

    fn spawn_worker(&self, cfg: db::Stream) {
        let mut workers = self.workers.lock();
        if workers.contains_key(&cfg.name) {
            // Replaced below; stop the old incarnation first.
            drop(workers);
            self.stop_worker(&cfg.name);
            workers = self.workers.lock();
        }
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let record_enabled = Arc::new(AtomicBool::new(cfg.record));
        let inbox = Arc::new(DetectionInbox::default());
        let db = self.db.clone();
        let dir = self.dir.clone();
        let registry = self.registry.clone();
        let opener = self.opener.clone();
        let name = cfg.name.clone();
        let flag = record_enabled.clone();
        let worker_inbox = inbox.clone();
        let join = thread::Builder::new()
            .name(format!("s-{name}"))
            .spawn(move || {
                let env = Environment {
                    opener: &*opener,
                    db: &db,
                    dir: &dir,
                    registry: &registry,
                };
                match Streamer::new(&env, &cfg, shutdown_rx, flag, worker_inbox) {
                    Ok(mut streamer) => streamer.run(),
                    Err(e) => warn!(err = %e.chain(), "unable to start worker for {}", &cfg.name),
                }
            })
            .expect("spawning capture worker");
        workers.insert(
            name,
            Worker {
                shutdown_tx,
                join,
                record_enabled,
                inbox,
            },
        );
    }

    fn stop_worker(&self, name: &str) {
        let Some(worker) = self.workers.lock().remove(name) else {
            return;
        };
        drop(worker.shutdown_tx);
        if worker.join.join().is_err() {
            warn!("capture worker for {name:?} panicked");
        }
        // The worker closes its writer on the way out; this is belt and
        // suspenders for a panicking worker (the detached handle must not
        // linger in the registry).
        if let Some(prev) = self.registry.disarm(name) {
            let now = self.db.clocks().realtime_epoch();
            if let Err(e) = prev.lock().close(&self.db, &self.dir, now) {
                warn!(err = %e.chain(), "unable to close orphaned writer for {name:?}");
            }
        }
    }

    // --- streams.* -------------------------------------------------------

    pub fn streams_list(&self) -> Vec<db::Stream> {
        self.db.lock().list_streams()
    }

    pub fn streams_get(&self, name: &str) -> Result<db::Stream, Error> {
        self.db
            .lock()
            .get_stream(name)
            .cloned()
            .ok_or_else(|| err!(NotFound, msg("no stream {name:?}")))
    }

    /// Creates or fully replaces a stream and (re)starts its worker.
    pub fn streams_create(&self, change: StreamChange) -> Result<i32, Error> {
        let id = self.db.lock().upsert_stream(change.clone())?;
        self.stop_worker(&change.name);
        if change.enabled {
            let cfg = self.streams_get(&change.name)?;
            self.spawn_worker(cfg);
        }
        Ok(id)
    }

    /// Alias of [`Engine::streams_create`]: an upsert with the full field
    /// set is the update operation.
    pub fn streams_update(&self, change: StreamChange) -> Result<i32, Error> {
        self.streams_create(change)
    }

    /// Stops the stream's worker and soft-deletes (or, with `hard`,
    /// removes) its row. Hard deletion leaves segment rows to the
    /// retention orphan pass.
    pub fn streams_delete(&self, name: &str, hard: bool) -> Result<(), Error> {
        // Validate existence first so a bad name doesn't stop anything.
        self.streams_get(name)?;
        self.stop_worker(name);
        if hard {
            self.db.lock().hard_delete_stream(name)
        } else {
            self.db.lock().soft_delete_stream(name)
        }
    }

    // --- recording.* -----------------------------------------------------

    /// Toggles recording without restarting capture; the worker observes
    /// the flag on its next frame.
    pub fn recording_enable(&self, name: &str, enabled: bool) -> Result<(), Error> {
        let mut change: StreamChange = {
            let l = self.db.lock();
            let s = l
                .get_stream(name)
                .ok_or_else(|| err!(NotFound, msg("no stream {name:?}")))?;
            stream_to_change(s)
        };
        change.record = enabled;
        self.db.lock().upsert_stream(change)?;
        if let Some(worker) = self.workers.lock().get(name) {
            worker.record_enabled.store(enabled, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn update_recording_config(&self, config: RecordingConfig) -> Result<(), Error> {
        let now = self.db.clocks().realtime_epoch();
        self.db.lock().upsert_recording_config(config, now)
    }

    /// §6.4 detection trigger input: enqueues into the stream's inbox
    /// (bounded, drop-oldest).
    pub fn notify_detection(
        &self,
        stream_name: &str,
        confidence: f64,
        at_time: i64,
    ) -> Result<(), Error> {
        let workers = self.workers.lock();
        let Some(worker) = workers.get(stream_name) else {
            bail!(NotFound, msg("no running worker for stream {stream_name:?}"));
        };
        worker.inbox.notify(confidence, at_time);
        Ok(())
    }

    /// Control-surface convenience: a full-confidence trigger at now.
    pub fn trigger_detection(&self, stream_name: &str) -> Result<(), Error> {
        let now = self.db.clocks().realtime_epoch();
        self.notify_detection(stream_name, 1.0, now)
    }

    pub fn trigger_cleanup_now(&self) {
        self.cleaner.clean_now();
    }

    pub fn set_cleanup_interval(&self, interval: Duration) {
        self.cleaner.set_interval(interval);
    }

    // --- segments.* ------------------------------------------------------

    pub fn segments_list_by_range(
        &self,
        stream_name: &str,
        t0: i64,
        t1: i64,
        limit: i64,
        offset: i64,
        order: db::ListOrder,
    ) -> Result<Vec<SegmentRow>, Error> {
        self.db.lock().list_segments(&db::SegmentQuery {
            stream_name: Some(stream_name),
            start: Some(t0),
            end: Some(t1),
            order,
            limit,
            offset,
        })
    }

    pub fn segments_get_by_id(&self, id: i64) -> Result<SegmentRow, Error> {
        self.db
            .lock()
            .get_segment(id)?
            .ok_or_else(|| err!(NotFound, msg("no segment {id}")))
    }

    /// Admin deletion: unlinks the file first, then removes the row, the
    /// same ordering the retention cleaner uses.
    pub fn segments_delete_by_id(&self, id: i64) -> Result<(), Error> {
        let row = self.segments_get_by_id(id)?;
        if !row.is_complete {
            bail!(
                FailedPrecondition,
                msg("segment {id} is still being recorded")
            );
        }
        let path = Path::new(&row.file_path);
        let target = if row.is_corrupt {
            db::dir::corrupt_path(path)
        } else {
            path.to_owned()
        };
        self.dir.unlink(&target)?;
        self.db.lock().delete_segment(id)
    }

    /// Resolves a segment for playback: `(path, mime, size)`. Duplicate
    /// concurrent starts for the same id skip the filesystem re-check.
    pub fn segments_open_for_read(&self, id: i64) -> Result<(PathBuf, &'static str, u64), Error> {
        let row = self.segments_get_by_id(id)?;
        if !row.is_complete || row.is_corrupt {
            bail!(
                FailedPrecondition,
                msg("segment {id} is not readable (complete={}, corrupt={})",
                    row.is_complete, row.is_corrupt)
            );
        }
        let path = PathBuf::from(&row.file_path);
        let mime = if row.file_path.ends_with(".mkv") {
            "video/x-matroska"
        } else {
            "video/mp4"
        };
        let first = self.active_reads.lock().insert(id);
        if !first {
            return Ok((path, mime, row.size_bytes as u64));
        }
        let r = (|| -> Result<(PathBuf, &'static str, u64), Error> {
            let meta = std::fs::metadata(&path)?;
            if meta.len() != row.size_bytes as u64 {
                // I1 tolerates one-block drift only mid-write; a closed
                // segment should match exactly. Serve what's on disk and
                // complain.
                warn!(
                    "segment {id}: catalog says {} bytes, file has {}",
                    row.size_bytes,
                    meta.len()
                );
            }
            Ok((path, mime, meta.len()))
        })();
        self.active_reads.lock().remove(&id);
        r
    }

    // --- timeline.* ------------------------------------------------------

    /// Writes an HLS-style playlist covering `[t0, t1)` and returns its
    /// path.
    pub fn build_timeline_manifest(
        &self,
        stream_name: &str,
        t0: i64,
        t1: i64,
    ) -> Result<PathBuf, Error> {
        let rows = self.segments_list_by_range(
            stream_name,
            t0,
            t1,
            i64::MAX,
            0,
            db::ListOrder::Asc,
        )?;
        timeline::build_manifest(&rows, stream_name, t0, t1, &self.dir.manifests_dir()?)
    }

    pub fn list_events(&self, limit: i64) -> Result<Vec<db::Event>, Error> {
        self.db.lock().list_events(limit)
    }

    /// Orderly teardown: stop every worker (each finishes its current
    /// frame, detaches, and closes its writer), stop the cleaner, then
    /// sweep any writer that never made it to a clean close. I2 holds
    /// afterward: no open writer files, no `is_complete = 0` rows.
    pub fn shutdown(self) {
        info!("engine shutting down");
        let names: Vec<String> = self.workers.lock().keys().cloned().collect();
        // Signal everyone in parallel before joining anyone.
        for worker in self.workers.lock().values_mut() {
            // Dropping the sender is the signal; replace it with a dummy.
            let (tx, _rx) = shutdown::channel();
            let old = std::mem::replace(&mut worker.shutdown_tx, tx);
            drop(old);
        }
        for name in names {
            self.stop_worker(&name);
        }
        drop(self.cleaner);
        if let Some(join) = self.cleaner_join.lock().take() {
            if join.join().is_err() {
                warn!("retention cleaner panicked");
            }
        }
        if let Err(e) = self.dir.scan_and_finalize(&self.db) {
            warn!(err = %e.chain(), "final segment scan failed");
        }
        info!("engine shut down");
    }
}

fn stream_to_change(s: &db::Stream) -> StreamChange {
    StreamChange {
        name: s.name.clone(),
        url: s.url.clone(),
        enabled: s.enabled,
        streaming_enabled: s.streaming_enabled,
        width: s.width,
        height: s.height,
        fps: s.fps,
        codec: s.codec.clone(),
        priority: s.priority,
        record: s.record,
        segment_duration: s.segment_duration,
        detection_based_recording: s.detection_based_recording,
        detection_model: s.detection_model.clone(),
        detection_threshold: s.detection_threshold,
        detection_interval: s.detection_interval,
        pre_detection_buffer: s.pre_detection_buffer,
        post_detection_buffer: s.post_detection_buffer,
        protocol: s.protocol,
        is_onvif: s.is_onvif,
        record_audio: s.record_audio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use base::ErrorKind;
    use db::testutil;
    use jiff::Timestamp;

    const BOOT: i64 = 1_700_000_000;

    /// An opener whose streams never come up; worker paths are covered by
    /// the streamer tests.
    struct DownOpener;

    impl stream::Opener for DownOpener {
        fn open(
            &self,
            _label: String,
            _url: url::Url,
            _options: stream::Options,
        ) -> Result<Box<dyn stream::Stream>, Error> {
            Err(base::err!(Unavailable, msg("camera unreachable")))
        }
    }

    struct Harness {
        engine: Engine<SimulatedClocks>,
        _tmpdir: tempfile::TempDir,
    }

    fn new_harness() -> Harness {
        let tmpdir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            db_path: tmpdir.path().join("catalog.sqlite3"),
            storage_root: tmpdir.path().to_owned(),
            cleanup_interval: Duration::from_secs(3600),
            default_retention: RetentionPolicy::default(),
        };
        let engine = Engine::start(
            SimulatedClocks::new(Timestamp::from_second(BOOT).unwrap()),
            Arc::new(DownOpener),
            &config,
        )
        .unwrap();
        Harness {
            engine,
            _tmpdir: tmpdir,
        }
    }

    fn disabled_change(name: &str) -> StreamChange {
        StreamChange {
            name: name.to_owned(),
            url: format!("rtsp://{name}/main"),
            enabled: false,
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
            protocol: db::Protocol::TcpPull,
            is_onvif: false,
            record_audio: false,
        }
    }

    #[test]
    fn stream_crud_surface() {
        testutil::init();
        let h = new_harness();
        h.engine.streams_create(disabled_change("cam-a")).unwrap();
        assert_eq!(h.engine.streams_list().len(), 1);
        assert_eq!(h.engine.streams_get("cam-a").unwrap().name, "cam-a");
        assert_eq!(
            h.engine.streams_get("cam-b").unwrap_err().kind(),
            ErrorKind::NotFound
        );

        h.engine.streams_delete("cam-a", false).unwrap();
        assert!(!h.engine.streams_get("cam-a").unwrap().enabled);
        h.engine.streams_delete("cam-a", true).unwrap();
        assert_eq!(
            h.engine.streams_delete("cam-a", true).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        h.engine.shutdown();
    }

    #[test]
    fn detection_requires_running_worker() {
        testutil::init();
        let h = new_harness();
        h.engine.streams_create(disabled_change("cam-a")).unwrap();
        // Disabled stream: no worker, so the trigger has nowhere to go.
        assert_eq!(
            h.engine.trigger_detection("cam-a").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        h.engine.shutdown();
    }

    #[test]
    fn open_for_read_checks_state() {
        testutil::init();
        let h = new_harness();
        let id = {
            let mut l = h.engine.db().lock();
            l.open_segment(&testutil::segment_to_insert(
                "cam-a",
                "/nonexistent/seg.mp4",
                BOOT,
            ))
            .unwrap()
        };
        // Incomplete segments are not readable.
        assert_eq!(
            h.engine.segments_open_for_read(id).unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );
        h.engine.db().lock().close_segment("/nonexistent/seg.mp4", BOOT + 60, 10).unwrap();
        // Complete but the file is gone: surfaces as unavailable I/O, and
        // the advisory set is left clean for the next attempt.
        h.engine.segments_open_for_read(id).unwrap_err();
        h.engine.segments_open_for_read(id).unwrap_err();
        h.engine.shutdown();
    }

    #[test]
    fn admin_delete_unlinks_then_removes_row() {
        testutil::init();
        let h = new_harness();
        let tmp = h._tmpdir.path().join("seg.mp4");
        std::fs::write(&tmp, b"data").unwrap();
        let id = {
            let mut l = h.engine.db().lock();
            let id = l
                .open_segment(&testutil::segment_to_insert(
                    "cam-a",
                    &tmp.to_string_lossy(),
                    BOOT,
                ))
                .unwrap();
            l.close_segment(&tmp.to_string_lossy(), BOOT + 60, 4).unwrap();
            id
        };
        h.engine.segments_delete_by_id(id).unwrap();
        assert!(!tmp.exists());
        assert_eq!(
            h.engine.segments_get_by_id(id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        h.engine.shutdown();
    }
}
