// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The capture worker: one long-lived thread per enabled stream.
//!
//! The worker pulls frames from the source, feeds the pre-roll ring, and
//! (while armed) hands frames to the active segment writer, rotating on
//! keyframes. It is meant to be long-lived and will sleep and retry with
//! exponential backoff after each failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base::clock::{Clocks, TimerGuard};
use base::shutdown;
use base::{ErrorKind, Mutex};
use db::dir::SegmentDir;
use db::preroll::{self, PrerollBuffer};
use db::recording::TIME_UNITS_PER_SEC;
use db::writer::{SegmentParams, SegmentWriter, WriterRegistry};
use db::Database;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::stream;

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// A burst of this many recoverable per-frame errors within
/// [`DECODE_ERROR_WINDOW`] escalates to a reconnect with backoff.
const DECODE_ERROR_BURST: usize = 5;
const DECODE_ERROR_WINDOW: Duration = Duration::from_secs(10);

/// Bound on queued detection triggers per stream; oldest are dropped on
/// overflow.
const INBOX_CAPACITY: usize = 64;

/// One detection trigger as delivered to `notify_detection`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DetectionEvent {
    pub confidence: f64,
    pub at_time: i64,
}

/// Per-stream inbox for detection triggers; the producer is the control
/// surface, the consumer is the stream's capture worker.
pub struct DetectionInbox(Mutex<VecDeque<DetectionEvent>>);

impl Default for DetectionInbox {
    fn default() -> Self {
        DetectionInbox(Mutex::new(VecDeque::with_capacity(INBOX_CAPACITY)))
    }
}

impl DetectionInbox {
    pub fn notify(&self, confidence: f64, at_time: i64) {
        let mut l = self.0.lock();
        if l.len() == INBOX_CAPACITY {
            l.pop_front();
        }
        l.push_back(DetectionEvent {
            confidence,
            at_time,
        });
    }

    fn drain(&self) -> Vec<DetectionEvent> {
        self.0.lock().drain(..).collect()
    }
}

/// Common state that can be used by multiple [`Streamer`] instances.
pub struct Environment<'a, C: Clocks + Clone> {
    pub opener: &'a dyn stream::Opener,
    pub db: &'a Arc<Database<C>>,
    pub dir: &'a Arc<SegmentDir>,
    pub registry: &'a Arc<WriterRegistry>,
}

/// Connects to a stream and drives it end to end: Connecting → Streaming
/// (with keyframe-aligned rotation) → Backoff on failure, until shutdown.
pub struct Streamer<'a, C: Clocks + Clone> {
    shutdown_rx: shutdown::Receiver,

    // State below is only used by the thread in `run`.
    db: Arc<Database<C>>,
    dir: Arc<SegmentDir>,
    registry: Arc<WriterRegistry>,
    opener: &'a dyn stream::Opener,
    short_name: String,
    url: Url,
    protocol: db::Protocol,
    nominal_fps: u32,
    segment_duration_90k: i64,
    detection_based: bool,
    post_detection_buffer: u32,
    record_enabled: Arc<AtomicBool>,
    record_audio: bool,
    inbox: Arc<DetectionInbox>,

    preroll: Option<PrerollBuffer>,
    pending_detections: Vec<DetectionEvent>,
    detect_until: i64,
    backoff: Duration,
    decode_errors: VecDeque<Duration>,
}

impl<'a, C: Clocks + Clone> Streamer<'a, C> {
    pub fn new(
        env: &Environment<'a, C>,
        cfg: &db::Stream,
        shutdown_rx: shutdown::Receiver,
        record_enabled: Arc<AtomicBool>,
        inbox: Arc<DetectionInbox>,
    ) -> Result<Self, base::Error> {
        let url = Url::parse(&cfg.url).map_err(|e| {
            base::err!(InvalidArgument, msg("bad url for stream {}", &cfg.name), source(e))
        })?;
        let preroll = preroll::capacity(cfg.pre_detection_buffer, cfg.fps).map(PrerollBuffer::new);
        Ok(Streamer {
            shutdown_rx,
            db: env.db.clone(),
            dir: env.dir.clone(),
            registry: env.registry.clone(),
            opener: env.opener,
            short_name: cfg.name.clone(),
            url,
            protocol: cfg.protocol,
            nominal_fps: cfg.fps,
            segment_duration_90k: i64::from(cfg.segment_duration) * TIME_UNITS_PER_SEC,
            detection_based: cfg.detection_based_recording,
            post_detection_buffer: cfg.post_detection_buffer,
            record_enabled,
            record_audio: cfg.record_audio,
            inbox,
            preroll,
            pending_detections: Vec::new(),
            detect_until: i64::MIN,
            backoff: BACKOFF_MIN,
            decode_errors: VecDeque::new(),
        })
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn run(&mut self) {
        let clocks = self.db.clocks();
        while self.shutdown_rx.check().is_ok() {
            if let Err(e) = self.run_once() {
                if self.shutdown_rx.check().is_err() {
                    break;
                }
                let sleep_time = self.backoff;
                self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
                warn!(
                    "{}: sleeping for {:?} after error: {}",
                    &self.short_name,
                    sleep_time,
                    e.chain()
                );
                let now = clocks.realtime_epoch();
                if let Err(e2) = self.db.lock().add_event(
                    "stream_error",
                    Some(&self.short_name),
                    &e.to_string(),
                    None,
                    now,
                ) {
                    warn!(err = %e2.chain(), "unable to record stream_error event");
                }
                clocks.sleep(sleep_time);
            }
        }
        info!("{}: shutting down", &self.short_name);
    }

    fn run_once(&mut self) -> Result<(), base::Error> {
        info!("{}: opening input {}", &self.short_name, &self.url);
        let clocks = self.db.clocks();
        let mut source = {
            let _t = TimerGuard::new(&clocks, || format!("opening {}", &self.url));
            self.opener.open(
                self.short_name.clone(),
                self.url.clone(),
                stream::Options::for_protocol(self.protocol),
            )?
        };
        let now = clocks.realtime_epoch();
        if let Err(e) = self.db.lock().add_event(
            "stream_connected",
            Some(&self.short_name),
            "connected to source",
            None,
            now,
        ) {
            warn!(err = %e.chain(), "unable to record stream_connected event");
        }
        let r = self.stream_loop(&mut *source);

        // Whatever ends Streaming (shutdown, source close, error burst)
        // also ends the in-flight segment; a writer must never outlive its
        // worker's connection.
        self.close_active(clocks.realtime_epoch());
        r
    }

    /// The Streaming state: reads frames until shutdown (Ok) or a
    /// connection-level failure (Err, caller backs off).
    fn stream_loop(&mut self, source: &mut dyn stream::Stream) -> Result<(), base::Error> {
        let clocks = self.db.clocks();
        let video_params = source.video_params().clone();
        let audio_params = self
            .record_audio
            .then(|| source.audio_params().cloned())
            .flatten();
        let segment_params = SegmentParams {
            stream_name: self.short_name.clone(),
            codec: source.codec().to_owned(),
            width: video_params.width,
            height: video_params.height,
            fps: self.nominal_fps,
        };
        loop {
            if self.shutdown_rx.check().is_err() {
                return Ok(());
            }
            let frame = {
                let _t = TimerGuard::new(&clocks, || "getting next frame");
                match source.next() {
                    Ok(f) => f,
                    Err(e)
                        if matches!(
                            e.kind(),
                            ErrorKind::Unavailable
                                | ErrorKind::DeadlineExceeded
                                | ErrorKind::Cancelled
                        ) =>
                    {
                        return Err(e)
                    }
                    Err(e) => {
                        self.note_decode_error(e)?;
                        continue;
                    }
                }
            };
            self.backoff = BACKOFF_MIN;
            let now = clocks.realtime_epoch();
            self.update_detection_window(now);

            let want = self.want_armed(now);
            let mut armed = self.registry.is_armed(&self.short_name);

            if armed && !want && frame.is_key {
                trace!("{}: detection window closed; ending segment", &self.short_name);
                self.close_active(now);
                armed = false;
            }

            if armed {
                armed = self.maybe_rotate(
                    &segment_params,
                    &video_params,
                    audio_params.as_ref(),
                    now,
                    frame.is_key,
                )?;
            }

            if !armed && want && frame.is_key {
                self.open_and_arm(&segment_params, &video_params, audio_params.as_ref(), now);
                armed = self.registry.is_armed(&self.short_name);
            }

            if armed {
                let handle = self
                    .registry
                    .handle(&self.short_name)
                    .expect("armed stream has a handle");
                let r = {
                    let _t = TimerGuard::new(&clocks, || {
                        format!("writing {} bytes", frame.data.len())
                    });
                    handle.lock().write(&frame)
                };
                if let Err(e) = r {
                    // One broken segment must not stop recording: delete
                    // the partial and re-arm on the next keyframe.
                    warn!(
                        "{}: write failed; aborting segment: {}",
                        &self.short_name,
                        e.chain()
                    );
                    if let Err(e2) = self.db.lock().add_event(
                        "segment_abort",
                        Some(&self.short_name),
                        &e.to_string(),
                        None,
                        now,
                    ) {
                        warn!(err = %e2.chain(), "unable to record segment_abort event");
                    }
                    if let Some(prev) = self.registry.disarm(&self.short_name) {
                        prev.lock().abort(&self.db, &self.dir);
                    }
                }
            } else if let Some(ring) = &mut self.preroll {
                if !ring.push(frame) {
                    trace!("{}: dropped non-monotone frame", &self.short_name);
                }
            }
        }
    }

    fn want_armed(&self, now: i64) -> bool {
        if !self.record_enabled.load(Ordering::SeqCst) {
            return false;
        }
        if self.detection_based {
            return now <= self.detect_until;
        }
        true
    }

    /// Folds newly arrived triggers into the active window. Triggers
    /// timestamped in the future stay pending until due.
    fn update_detection_window(&mut self, now: i64) {
        self.pending_detections.extend(self.inbox.drain());
        self.pending_detections.retain(|ev| {
            if ev.at_time > now {
                return true;
            }
            self.detect_until = self
                .detect_until
                .max(ev.at_time + i64::from(self.post_detection_buffer));
            false
        });
    }

    /// Rotation: requested at `segment_duration`, cut at the next keyframe,
    /// forced (without starting a successor mid-group) at twice that.
    /// Returns whether the stream is still armed.
    fn maybe_rotate(
        &mut self,
        segment_params: &SegmentParams,
        video_params: &db::mux::VideoParams,
        audio_params: Option<&db::mux::AudioParams>,
        now: i64,
        is_key: bool,
    ) -> Result<bool, base::Error> {
        let duration = self
            .registry
            .handle(&self.short_name)
            .map_or(0, |h| h.lock().media_duration_90k());
        if is_key && duration >= self.segment_duration_90k {
            trace!("{}: rotating on keyframe", &self.short_name);
            // A failed open leaves the previous writer armed; the next
            // keyframe retries the rotation.
            self.open_and_arm(segment_params, video_params, audio_params, now);
            return Ok(self.registry.is_armed(&self.short_name));
        }
        if !is_key && duration >= 2 * self.segment_duration_90k {
            // Hard ceiling: no keyframe arrived in a whole extra segment
            // length. Cut anyway; the successor starts at the next
            // keyframe.
            warn!(
                "{}: forcing cut without a keyframe after {} units",
                &self.short_name, duration
            );
            self.close_active(now);
            return Ok(false);
        }
        Ok(true)
    }

    /// Opens a fresh segment (pre-roll-flushed) and arms it, closing any
    /// previous writer after the registry swap. Open failures abort the
    /// attempt, leaving the registry as it was; recording retries on the
    /// next keyframe.
    fn open_and_arm(
        &mut self,
        segment_params: &SegmentParams,
        video_params: &db::mux::VideoParams,
        audio_params: Option<&db::mux::AudioParams>,
        now: i64,
    ) {
        // Pre-roll shifts the segment's start back to its oldest keyframe.
        let span_90k = self
            .preroll
            .as_ref()
            .map_or(0, |r| r.span_from_keyframe_90k());
        let start_time = now - (span_90k + TIME_UNITS_PER_SEC - 1) / TIME_UNITS_PER_SEC;
        let writer = match SegmentWriter::open(
            &self.db,
            &self.dir,
            segment_params,
            start_time,
            video_params.clone(),
            audio_params.cloned(),
        ) {
            Ok(w) => w,
            Err(e) => {
                warn!(
                    "{}: unable to open segment: {}",
                    &self.short_name,
                    e.chain()
                );
                return;
            }
        };
        debug!(
            "{}: armed segment {} starting at {}",
            &self.short_name,
            writer.segment_id(),
            start_time
        );
        match self.registry.arm(writer, self.preroll.as_mut()) {
            Ok(prev) => {
                if let Some(prev) = prev {
                    // Detached by the swap; close it outside any registry
                    // lock.
                    if let Err(e) = prev.lock().close(&self.db, &self.dir, now) {
                        warn!(
                            "{}: unable to close rotated segment: {}",
                            &self.short_name,
                            e.chain()
                        );
                    }
                }
            }
            Err((mut writer, e)) => {
                warn!(
                    "{}: pre-roll flush failed; aborting segment: {}",
                    &self.short_name,
                    e.chain()
                );
                writer.abort(&self.db, &self.dir);
            }
        }
    }

    /// Detaches and closes the active writer, if any.
    fn close_active(&mut self, now: i64) {
        if let Some(prev) = self.registry.disarm(&self.short_name) {
            if let Err(e) = prev.lock().close(&self.db, &self.dir, now) {
                warn!(
                    "{}: unable to close segment: {}",
                    &self.short_name,
                    e.chain()
                );
            }
        }
    }

    /// Counts a recoverable per-frame error; a burst escalates to the
    /// caller (Backoff).
    fn note_decode_error(&mut self, e: base::Error) -> Result<(), base::Error> {
        let now = self.db.clocks().monotonic();
        warn!("{}: decode error: {}", &self.short_name, e.chain());
        while self
            .decode_errors
            .front()
            .is_some_and(|&t| now.saturating_sub(t) > DECODE_ERROR_WINDOW)
        {
            self.decode_errors.pop_front();
        }
        self.decode_errors.push_back(now);
        if self.decode_errors.len() >= DECODE_ERROR_BURST {
            self.decode_errors.clear();
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use bytes::Bytes;
    use db::mux::VideoParams;
    use db::recording::{Frame, FrameKind};
    use db::testutil::{self, TestDb};
    use db::{ListOrder, SegmentQuery, StreamChange};
    use jiff::Timestamp;
    use std::collections::VecDeque;

    const BOOT: i64 = 1_700_000_000;
    const FRAME_DUR: Duration = Duration::from_millis(100); // 10 fps

    struct MockStream {
        clocks: SimulatedClocks,
        video_params: VideoParams,
        frames: VecDeque<Frame>,
    }

    impl MockStream {
        /// `n` frames at 10 fps with a keyframe every `key_interval`
        /// frames. The simulated clock advances to each frame's end as it
        /// is delivered, like a live camera.
        fn new(clocks: &SimulatedClocks, n: usize, key_interval: usize) -> Self {
            let frames = (0..n)
                .map(|i| Frame {
                    pts_90k: (i as i64) * 9000,
                    is_key: i % key_interval == 0,
                    kind: FrameKind::Video,
                    data: Bytes::from(vec![i as u8; 64]),
                })
                .collect();
            MockStream {
                clocks: clocks.clone(),
                video_params: testutil::test_video_params(),
                frames,
            }
        }
    }

    impl stream::Stream for MockStream {
        fn codec(&self) -> &str {
            "h264"
        }

        fn video_params(&self) -> &VideoParams {
            &self.video_params
        }

        fn next(&mut self) -> Result<Frame, base::Error> {
            match self.frames.pop_front() {
                Some(f) => {
                    self.clocks.sleep(FRAME_DUR);
                    Ok(f)
                }
                None => Err(base::err!(Unavailable, msg("end of stream"))),
            }
        }
    }

    struct MockOpener {
        streams: Mutex<Vec<MockStream>>,
        shutdown_tx: Mutex<Option<shutdown::Sender>>,
    }

    impl stream::Opener for MockOpener {
        fn open(
            &self,
            _label: String,
            _url: Url,
            _options: stream::Options,
        ) -> Result<Box<dyn stream::Stream>, base::Error> {
            match self.streams.lock().pop() {
                Some(s) => {
                    trace!("MockOpener returning next stream");
                    Ok(Box::new(s))
                }
                None => {
                    trace!("MockOpener shutting down");
                    self.shutdown_tx.lock().take();
                    Err(base::err!(Unavailable, msg("done")))
                }
            }
        }
    }

    struct Harness {
        tdb: TestDb<SimulatedClocks>,
        dir: Arc<SegmentDir>,
        registry: Arc<WriterRegistry>,
        _tmpdir: tempfile::TempDir,
    }

    fn new_harness(clocks: &SimulatedClocks) -> Harness {
        let tmpdir = tempfile::tempdir().unwrap();
        Harness {
            tdb: TestDb::with_clocks(clocks.clone()),
            dir: SegmentDir::open(tmpdir.path()).unwrap(),
            registry: Arc::new(WriterRegistry::new()),
            _tmpdir: tmpdir,
        }
    }

    fn change(name: &str, segment_duration: u32) -> StreamChange {
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
            segment_duration,
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

    fn run_streamer(h: &Harness, opener: &MockOpener, cfg: &db::Stream, rx: shutdown::Receiver) {
        let env = Environment {
            opener,
            db: &h.tdb.db,
            dir: &h.dir,
            registry: &h.registry,
        };
        let inbox = Arc::new(DetectionInbox::default());
        let mut streamer = Streamer::new(
            &env,
            cfg,
            rx,
            Arc::new(AtomicBool::new(cfg.record)),
            inbox,
        )
        .unwrap();
        streamer.run();
    }

    fn segments(h: &Harness, stream: &str) -> Vec<db::SegmentRow> {
        h.tdb
            .db
            .lock()
            .list_segments(&SegmentQuery {
                stream_name: Some(stream),
                order: ListOrder::Asc,
                ..SegmentQuery::default()
            })
            .unwrap()
    }

    /// S1: continuous recording with keyframe-aligned rotation. 1800
    /// frames over 180 s at `segment_duration = 60` produce three
    /// segments cut on the boundary keyframes.
    #[test]
    fn continuous_rotation() {
        testutil::init();
        let clocks = SimulatedClocks::new(Timestamp::from_second(BOOT).unwrap());
        let h = new_harness(&clocks);
        let cfg_id = h.tdb.db.lock().upsert_stream(change("cam-front", 60)).unwrap();
        let cfg = h.tdb.db.lock().get_stream("cam-front").unwrap().clone();
        assert!(cfg_id > 0);

        let (tx, rx) = shutdown::channel();
        let opener = MockOpener {
            streams: Mutex::new(vec![MockStream::new(&clocks, 1800, 20)]),
            shutdown_tx: Mutex::new(Some(tx)),
        };
        run_streamer(&h, &opener, &cfg, rx);

        let rows = segments(&h, "cam-front");
        assert_eq!(rows.len(), 3, "{rows:#?}");
        for (i, row) in rows.iter().enumerate() {
            assert!(row.is_complete);
            assert_eq!(row.start_time, BOOT + 60 * i as i64);
            assert_eq!(row.end_time, Some(BOOT + 60 * (i as i64 + 1)));
            assert!(std::path::Path::new(&row.file_path).exists());
            assert!(row.size_bytes > 0);
        }
        assert!(!h.registry.is_armed("cam-front"), "I2/I6 hold on shutdown");
    }

    /// The 2× hard ceiling: with no further keyframes, the segment is cut
    /// anyway and no successor starts mid-group.
    #[test]
    fn hard_ceiling_forces_cut() {
        testutil::init();
        let clocks = SimulatedClocks::new(Timestamp::from_second(BOOT).unwrap());
        let h = new_harness(&clocks);
        h.tdb.db.lock().upsert_stream(change("cam-front", 10)).unwrap();
        let cfg = h.tdb.db.lock().get_stream("cam-front").unwrap().clone();

        let (tx, rx) = shutdown::channel();
        // 400 frames = 40 s, keyframe only at frame 0.
        let opener = MockOpener {
            streams: Mutex::new(vec![MockStream::new(&clocks, 400, 1000)]),
            shutdown_tx: Mutex::new(Some(tx)),
        };
        run_streamer(&h, &opener, &cfg, rx);

        let rows = segments(&h, "cam-front");
        assert_eq!(rows.len(), 1, "{rows:#?}");
        assert_eq!(rows[0].start_time, BOOT);
        assert_eq!(rows[0].end_time, Some(BOOT + 20));
    }

    /// S2: detection-triggered recording delivers pre-roll (the segment
    /// starts at the ring's oldest keyframe, before the trigger) and
    /// closes at the first keyframe past the post-detection window.
    #[test]
    fn detection_preroll_delivery() {
        testutil::init();
        let clocks = SimulatedClocks::new(Timestamp::from_second(BOOT).unwrap());
        let h = new_harness(&clocks);
        let mut c = change("cam-door", 60);
        c.detection_based_recording = true;
        c.pre_detection_buffer = 5;
        c.post_detection_buffer = 3;
        h.tdb.db.lock().upsert_stream(c).unwrap();
        let cfg = h.tdb.db.lock().get_stream("cam-door").unwrap().clone();

        let (tx, rx) = shutdown::channel();
        let opener = MockOpener {
            streams: Mutex::new(vec![MockStream::new(&clocks, 500, 20)]),
            shutdown_tx: Mutex::new(Some(tx)),
        };
        let env = Environment {
            opener: &opener,
            db: &h.tdb.db,
            dir: &h.dir,
            registry: &h.registry,
        };
        let inbox = Arc::new(DetectionInbox::default());
        // Triggers every 2 s from t=30 to t=40: the window stays open
        // (post buffer 3 s) until t=43.
        for t in (30..=40).step_by(2) {
            inbox.notify(0.9, BOOT + t);
        }
        let mut streamer = Streamer::new(
            &env,
            &cfg,
            rx,
            Arc::new(AtomicBool::new(true)),
            inbox,
        )
        .unwrap();
        streamer.run();

        let rows = segments(&h, "cam-door");
        assert_eq!(rows.len(), 1, "{rows:#?}");
        let row = &rows[0];
        assert!(row.is_complete);
        // Ring held 5 s; its oldest keyframe sits at t=26.
        assert_eq!(row.start_time, BOOT + 26);
        // First keyframe at or after t=43 is t=44.
        assert_eq!(row.end_time, Some(BOOT + 44));
    }

    /// A disabled record flag means the worker captures (keeping the ring
    /// warm) but never arms.
    #[test]
    fn record_disabled_never_arms() {
        testutil::init();
        let clocks = SimulatedClocks::new(Timestamp::from_second(BOOT).unwrap());
        let h = new_harness(&clocks);
        h.tdb.db.lock().upsert_stream(change("cam-front", 10)).unwrap();
        let mut cfg = h.tdb.db.lock().get_stream("cam-front").unwrap().clone();
        cfg.record = false;

        let (tx, rx) = shutdown::channel();
        let opener = MockOpener {
            streams: Mutex::new(vec![MockStream::new(&clocks, 100, 20)]),
            shutdown_tx: Mutex::new(Some(tx)),
        };
        run_streamer(&h, &opener, &cfg, rx);
        assert!(segments(&h, "cam-front").is_empty());
    }

    #[test]
    fn inbox_drops_oldest_on_overflow() {
        let inbox = DetectionInbox::default();
        for i in 0..(INBOX_CAPACITY + 3) {
            inbox.notify(0.5, i as i64);
        }
        let events = inbox.drain();
        assert_eq!(events.len(), INBOX_CAPACITY);
        assert_eq!(events[0].at_time, 3);
    }
}
