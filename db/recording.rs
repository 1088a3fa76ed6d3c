// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared frame and timestamp types used along the capture → ring buffer →
//! writer path.

use bytes::Bytes;

/// Media timestamp units per second. Frame presentation timestamps use a
/// 90 kHz clock throughout the engine; only whole epoch seconds cross
/// component boundaries.
pub const TIME_UNITS_PER_SEC: i64 = 90_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameKind {
    Video,
    Audio,
    Subtitle,
}

/// One encoded frame as received from the source.
#[derive(Clone)]
pub struct Frame {
    /// Presentation timestamp in 90 kHz units, relative to the source's
    /// arbitrary epoch. Monotone non-decreasing within a stream.
    pub pts_90k: i64,

    /// If this is a key (IDR) frame. Always false for non-video frames.
    pub is_key: bool,

    pub kind: FrameKind,

    /// Codec-specific payload, e.g. length-prefixed H.264 NALs.
    pub data: Bytes,
}

/// Custom `Debug` impl that skips the verbose `data` field.
impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("pts_90k", &self.pts_90k)
            .field("is_key", &self.is_key)
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .finish()
    }
}
