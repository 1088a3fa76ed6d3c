// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Test infrastructure.
//!
//! This is only for `#[cfg(test)]`, but it's also used by the dependent
//! crate's tests, and `#[cfg(test)]` is not passed on to dependencies.

use std::sync::Arc;

use base::clock::{Clocks, RealClocks};

use crate::db::{Database, SegmentToInsert};
use crate::mux::{AudioParams, VideoParams};

/// Performs global initialization for tests: installs a tracing
/// subscriber honoring `RUST_LOG`. Idempotent.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh on-disk catalog in a scratch directory.
pub struct TestDb<C: Clocks + Clone = RealClocks> {
    pub db: Arc<Database<C>>,
    pub tmpdir: tempfile::TempDir,
}

impl TestDb<RealClocks> {
    pub fn new() -> Self {
        Self::with_clocks(RealClocks {})
    }
}

impl<C: Clocks + Clone> TestDb<C> {
    pub fn with_clocks(clocks: C) -> Self {
        let tmpdir = tempfile::Builder::new()
            .prefix("lightnvr-test")
            .tempdir()
            .expect("create tempdir");
        let db = Database::open(clocks, &tmpdir.path().join("catalog.sqlite3"))
            .expect("open test catalog");
        TestDb {
            db: Arc::new(db),
            tmpdir,
        }
    }
}

impl Default for TestDb<RealClocks> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`SegmentToInsert`] with plausible defaults, for struct-update syntax.
pub fn segment_to_insert(stream_name: &str, file_path: &str, start_time: i64) -> SegmentToInsert {
    SegmentToInsert {
        stream_name: stream_name.to_owned(),
        file_path: file_path.to_owned(),
        start_time,
        width: 1920,
        height: 1080,
        fps: 10,
        codec: "h264".to_owned(),
        created_at: start_time,
    }
}

fn fake_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut b = Vec::with_capacity(8 + body.len());
    b.extend_from_slice(&(8 + body.len() as u32).to_be_bytes());
    b.extend_from_slice(fourcc);
    b.extend_from_slice(body);
    b
}

/// A syntactically plausible `avc1` sample entry (empty parameter sets);
/// the muxer embeds it verbatim, so tests only need stable bytes.
pub fn test_video_params() -> VideoParams {
    let avc_c = fake_box(b"avcC", &[0x01, 0x4d, 0x40, 0x1e, 0xff, 0xe0, 0x00]);
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 6]); // reserved
    body.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    body.extend_from_slice(&[0u8; 16]); // pre_defined + reserved
    body.extend_from_slice(&1920u16.to_be_bytes());
    body.extend_from_slice(&1080u16.to_be_bytes());
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // horizresolution
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // vertresolution
    body.extend_from_slice(&[0u8; 4]); // reserved
    body.extend_from_slice(&1u16.to_be_bytes()); // frame_count
    body.extend_from_slice(&[0u8; 32]); // compressorname
    body.extend_from_slice(&0x18u16.to_be_bytes()); // depth
    body.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined
    body.extend_from_slice(&avc_c);
    VideoParams {
        width: 1920,
        height: 1080,
        sample_entry: fake_box(b"avc1", &body),
    }
}

/// A minimal `mp4a` sample entry for audio-track tests.
pub fn test_audio_params() -> AudioParams {
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 6]); // reserved
    body.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    body.extend_from_slice(&[0u8; 8]); // reserved
    body.extend_from_slice(&2u16.to_be_bytes()); // channelcount
    body.extend_from_slice(&16u16.to_be_bytes()); // samplesize
    body.extend_from_slice(&[0u8; 4]); // pre_defined + reserved
    body.extend_from_slice(&(48_000u32 << 16).to_be_bytes()); // samplerate 16.16
    AudioParams {
        sample_entry: fake_box(b"mp4a", &body),
    }
}
