// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Timeline browsing: HLS-style VOD manifests over a segment range.
//!
//! Storage and query parameters are UTC epoch seconds; the manifest also
//! renders local wall-clock strings purely for display.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use base::{bail, err, Error};
use db::SegmentRow;
use jiff::tz::TimeZone;
use jiff::Timestamp;

/// Segments more than this many seconds apart get a discontinuity tag.
const DISCONTINUITY_GAP_SECS: i64 = 1;

/// Builds a VOD playlist covering `[t0, t1)` from the given (ascending)
/// rows, writes it under `out_dir`, and returns its path. Incomplete and
/// corrupt rows are skipped; an empty result is `NotFound`.
pub fn build_manifest(
    rows: &[SegmentRow],
    stream_name: &str,
    t0: i64,
    t1: i64,
    out_dir: &Path,
) -> Result<PathBuf, Error> {
    let playable: Vec<&SegmentRow> = rows
        .iter()
        .filter(|r| r.is_complete && !r.is_corrupt)
        .collect();
    if playable.is_empty() {
        bail!(
            NotFound,
            msg("no playable segments for {stream_name:?} in [{t0}, {t1})")
        );
    }

    let durations: Vec<i64> = playable
        .iter()
        .map(|r| (r.end_time.unwrap_or(r.start_time) - r.start_time).max(1))
        .collect();
    let target = durations.iter().copied().max().unwrap_or(1);

    let tz = TimeZone::system();
    let mut m3u8 = String::with_capacity(1024);
    writeln!(m3u8, "#EXTM3U").expect("write to String");
    writeln!(m3u8, "#EXT-X-VERSION:4").expect("write to String");
    writeln!(m3u8, "#EXT-X-TARGETDURATION:{target}").expect("write to String");
    writeln!(m3u8, "#EXT-X-PLAYLIST-TYPE:VOD").expect("write to String");
    writeln!(m3u8, "#EXT-X-MEDIA-SEQUENCE:{}", playable[0].id).expect("write to String");

    let mut prev_end: Option<i64> = None;
    for (row, duration) in playable.iter().zip(&durations) {
        if let Some(prev_end) = prev_end {
            if row.start_time - prev_end > DISCONTINUITY_GAP_SECS {
                writeln!(m3u8, "#EXT-X-DISCONTINUITY").expect("write to String");
            }
        }
        prev_end = row.end_time;
        let ts = Timestamp::from_second(row.start_time)
            .map_err(|e| err!(OutOfRange, msg("bad start time {}", row.start_time), source(e)))?;
        writeln!(
            m3u8,
            "#EXT-X-PROGRAM-DATE-TIME:{ts}"
        )
        .expect("write to String");
        // Local wall-clock rendering for display only.
        writeln!(
            m3u8,
            "# {}",
            ts.to_zoned(tz.clone()).strftime("%Y-%m-%d %H:%M:%S %Z")
        )
        .expect("write to String");
        writeln!(m3u8, "#EXTINF:{duration}.0,").expect("write to String");
        writeln!(m3u8, "{}", &row.file_path).expect("write to String");
    }
    writeln!(m3u8, "#EXT-X-ENDLIST").expect("write to String");

    let path = out_dir.join(format!("{stream_name}-{t0}-{t1}.m3u8"));
    std::fs::write(&path, m3u8)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, start: i64, end: i64) -> SegmentRow {
        SegmentRow {
            id,
            stream_name: "cam-front".to_owned(),
            file_path: format!("/r/cam-front/{start}-{id}.mp4"),
            start_time: start,
            end_time: Some(end),
            size_bytes: 1000,
            width: 1920,
            height: 1080,
            fps: 10,
            codec: "h264".to_owned(),
            is_complete: true,
            is_corrupt: false,
            created_at: start,
        }
    }

    #[test]
    fn manifest_covers_range_with_discontinuities() {
        let tmp = tempfile::tempdir().unwrap();
        let rows = vec![
            row(1, 1_700_000_000, 1_700_000_060),
            row(2, 1_700_000_060, 1_700_000_120),
            // 40-second gap.
            row(3, 1_700_000_160, 1_700_000_220),
        ];
        let path =
            build_manifest(&rows, "cam-front", 1_700_000_000, 1_700_000_300, tmp.path()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("#EXTM3U"));
        assert!(text.contains("#EXT-X-TARGETDURATION:60"));
        assert_eq!(text.matches("#EXTINF:60.0,").count(), 3);
        assert_eq!(text.matches("#EXT-X-DISCONTINUITY").count(), 1);
        assert!(text.contains("/r/cam-front/1700000000-1.mp4"));
        assert!(text.trim_end().ends_with("#EXT-X-ENDLIST"));
    }

    #[test]
    fn corrupt_and_incomplete_rows_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut corrupt = row(1, 1_700_000_000, 1_700_000_000);
        corrupt.is_corrupt = true;
        let mut open = row(2, 1_700_000_060, 0);
        open.is_complete = false;
        open.end_time = None;

        let e = build_manifest(
            &[corrupt, open],
            "cam-front",
            1_700_000_000,
            1_700_000_300,
            tmp.path(),
        )
        .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::NotFound);
    }
}
