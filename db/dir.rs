// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Segment store: layout and atomicity of on-disk segment files.
//!
//! One file per segment, laid out as
//! `<root>/recordings/<stream>/YYYY/MM/DD/<start_epoch>-<segment_id>.<ext>`.
//! An open segment lives under an added `.part` suffix (with a `.idx`
//! sidecar; see the `mux` module) and is atomically renamed into place on
//! close. [`SegmentDir::scan_and_finalize`] reconciles whatever a previous
//! crashed run left behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base::clock::Clocks;
use base::{err, Error};
use jiff::tz::TimeZone;
use jiff::Timestamp;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::{info, warn};

use crate::db::Database;
use crate::mux;
use crate::recording::TIME_UNITS_PER_SEC;

const PART_SUFFIX: &str = ".part";
const IDX_SUFFIX: &str = ".idx";
const CORRUPT_SUFFIX: &str = ".corrupt";

/// Appends `suffix` to the final path's file name.
fn with_suffix(final_path: &Path, suffix: &str) -> PathBuf {
    let mut s = final_path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn part_path(final_path: &Path) -> PathBuf {
    with_suffix(final_path, PART_SUFFIX)
}

pub fn idx_path(final_path: &Path) -> PathBuf {
    with_suffix(final_path, IDX_SUFFIX)
}

pub fn corrupt_path(final_path: &Path) -> PathBuf {
    with_suffix(final_path, CORRUPT_SUFFIX)
}

/// Creates `path` and any missing ancestors with mode 0755.
fn create_dirs(path: &Path) -> Result<(), Error> {
    if path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dirs(parent)?;
        }
    }
    match nix::unistd::mkdir(path, Mode::from_bits_truncate(0o755)) {
        Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(err!(
            Unavailable,
            msg("unable to mkdir {}", path.display()),
            source(e)
        )),
    }
}

/// Fsyncs a directory so that entry creation/rename/unlink within it is
/// durable.
fn fsync_dir(path: &Path) -> Result<(), Error> {
    let fd = nix::fcntl::open(path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
        .map_err(|e| {
            err!(
                Unavailable,
                msg("unable to open dir {} for fsync", path.display()),
                source(e)
            )
        })?;
    let r = nix::unistd::fsync(fd);
    let _ = nix::unistd::close(fd);
    r.map_err(|e| {
        err!(
            Unavailable,
            msg("unable to fsync dir {}", path.display()),
            source(e)
        )
    })
}

fn utc_date_dirs(start_time: i64) -> Result<String, Error> {
    let ts = Timestamp::from_second(start_time)
        .map_err(|e| err!(InvalidArgument, msg("bad start time {start_time}"), source(e)))?;
    let date = ts.to_zoned(TimeZone::UTC).date();
    Ok(format!(
        "{:04}/{:02}/{:02}",
        date.year(),
        date.month(),
        date.day()
    ))
}

/// What [`SegmentDir::scan_and_finalize`] did, for the boot log.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ScanSummary {
    pub recovered: usize,
    pub corrupted: usize,
    pub abandoned: usize,
}

/// The filesystem-backed object namespace where segments live.
pub struct SegmentDir {
    root: PathBuf,
}

impl SegmentDir {
    /// Opens the store rooted at `root`, creating the recordings
    /// directory if needed.
    pub fn open(root: &Path) -> Result<Arc<Self>, Error> {
        let dir = SegmentDir {
            root: root.to_owned(),
        };
        create_dirs(&dir.recordings_root())?;
        Ok(Arc::new(dir))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn recordings_root(&self) -> PathBuf {
        self.root.join("recordings")
    }

    pub fn stream_dir(&self, stream_name: &str) -> PathBuf {
        self.recordings_root().join(stream_name)
    }

    /// Directory for generated playback manifests. Manifests are
    /// single-use and regenerated on demand; each retention pass clears
    /// whatever is left here.
    pub fn manifests_dir(&self) -> Result<PathBuf, Error> {
        let dir = self.root.join("manifests");
        create_dirs(&dir)?;
        Ok(dir)
    }

    /// Computes the final (post-rename) path for a segment.
    pub fn segment_path(
        &self,
        stream_name: &str,
        start_time: i64,
        segment_id: i64,
        extension: &str,
    ) -> Result<PathBuf, Error> {
        Ok(self
            .stream_dir(stream_name)
            .join(utc_date_dirs(start_time)?)
            .join(format!("{start_time}-{segment_id}.{extension}")))
    }

    /// Creates the in-flight `.part` file and its `.idx` sidecar (plus any
    /// missing date directories) for the segment that will live at
    /// `final_path`.
    pub fn create_segment_files(&self, final_path: &Path) -> Result<(fs::File, fs::File), Error> {
        let parent = final_path
            .parent()
            .ok_or_else(|| err!(InvalidArgument, msg("segment path has no parent")))?;
        create_dirs(parent)?;
        let part = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(part_path(final_path))?;
        let idx = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(idx_path(final_path))
        {
            Ok(f) => f,
            Err(e) => {
                // Don't leave the half-created pair behind.
                let _ = fs::remove_file(part_path(final_path));
                return Err(e.into());
            }
        };
        Ok((part, idx))
    }

    /// Atomically renames the `.part` file to its final name and makes the
    /// rename durable.
    pub fn finalize(&self, final_path: &Path) -> Result<(), Error> {
        fs::rename(part_path(final_path), final_path)?;
        if let Some(parent) = final_path.parent() {
            fsync_dir(parent)?;
        }
        Ok(())
    }

    /// Deletes the `.part` and `.idx` files of an aborted segment.
    /// Missing files are fine; other unlink errors are logged and
    /// swallowed, leaving strays for the retention orphan pass.
    pub fn discard_partial(&self, final_path: &Path) {
        for p in [part_path(final_path), idx_path(final_path)] {
            if let Err(e) = fs::remove_file(&p) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("unable to unlink {}: {e}", p.display());
                }
            }
        }
    }

    /// Unlinks a file; `NotFound` is success (the point of unlinking is
    /// for the file to not exist).
    pub fn unlink(&self, path: &Path) -> Result<(), Error> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Boot-time reconciliation of on-disk state with the catalog:
    ///
    /// 1. every `.part` file is crash-finalized into a playable segment
    ///    (salvaging whole keyframe groups via its `.idx`), moved aside as
    ///    `.corrupt`, or unlinked when no catalog row claims it.
    /// 2. every remaining `is_complete = 0` row is resolved: closed from
    ///    the already-renamed file if one exists (crash between rename and
    ///    catalog update), otherwise marked corrupt.
    ///
    /// Also run after shutdown's grace period, when it sweeps up writers
    /// that never finished closing.
    pub fn scan_and_finalize<C: Clocks + Clone>(
        &self,
        db: &Database<C>,
    ) -> Result<ScanSummary, Error> {
        let mut summary = ScanSummary::default();
        let mut parts = Vec::new();
        walk_files(&self.recordings_root(), &mut |path| {
            if path.extension().is_some_and(|e| e == "part") {
                parts.push(path.to_owned());
            }
            Ok(())
        })?;
        for part in parts {
            self.finalize_part(db, &part, &mut summary);
        }

        let incomplete = db.lock().list_incomplete_segments()?;
        for row in incomplete {
            let final_path = PathBuf::from(&row.file_path);
            if final_path.exists() {
                // Renamed but never recorded as closed: recover the
                // duration from the sidecar if it survived.
                let mut duration_90k = 0;
                if let Ok(mut idx) = fs::File::open(idx_path(&final_path)) {
                    if let Ok((_, _, entries)) = mux::read_index(&mut idx) {
                        if let (Some(first), Some(last)) = (entries.first(), entries.last()) {
                            duration_90k = last.pts_90k - first.pts_90k;
                        }
                    }
                }
                let size = fs::metadata(&final_path)?.len();
                let end = row.start_time + div_round_up_90k(duration_90k);
                db.lock()
                    .close_segment(&row.file_path, end, size as i64)?;
                let _ = fs::remove_file(idx_path(&final_path));
                summary.recovered += 1;
            } else {
                db.lock().mark_segment_corrupt(&row.file_path)?;
                self.add_event(
                    db,
                    "segment_corrupt",
                    &row.stream_name,
                    &row.file_path,
                    "segment file lost before close",
                );
                summary.corrupted += 1;
            }
        }
        info!(
            "segment scan: {} recovered, {} corrupt, {} abandoned",
            summary.recovered, summary.corrupted, summary.abandoned
        );
        Ok(summary)
    }

    fn finalize_part<C: Clocks + Clone>(
        &self,
        db: &Database<C>,
        part: &Path,
        summary: &mut ScanSummary,
    ) {
        let final_path = part.with_extension(""); // strip ".part"
        let final_str = final_path.to_string_lossy().into_owned();
        let row = match db.lock().get_segment_by_path(&final_str) {
            Ok(Some(row)) => row,
            Ok(None) => {
                // No catalog row ever existed (or it was deleted): the file
                // is abandoned.
                warn!("unlinking abandoned partial segment {}", part.display());
                self.discard_partial(&final_path);
                summary.abandoned += 1;
                return;
            }
            Err(e) => {
                warn!(err = %e.chain(), "unable to look up {}", part.display());
                return;
            }
        };
        if row.is_complete {
            // A closed row with a stray .part: the rename happened, this is
            // leftover junk.
            warn!("unlinking stray .part for complete segment {}", final_path.display());
            self.discard_partial(&final_path);
            summary.abandoned += 1;
            return;
        }
        match self.try_repair(&final_path) {
            Ok(s) => {
                let end = row.start_time + div_round_up_90k(s.media_duration_90k);
                match db.lock().close_segment(&final_str, end, s.total_bytes as i64) {
                    Ok(()) => {
                        info!(
                            "crash-finalized {} ({} frames, {} bytes)",
                            final_path.display(),
                            s.video_samples,
                            s.total_bytes
                        );
                        let _ = fs::remove_file(idx_path(&final_path));
                        self.add_event(
                            db,
                            "segment_recovered",
                            &row.stream_name,
                            &final_str,
                            "crash-finalized partial segment",
                        );
                        summary.recovered += 1;
                    }
                    Err(e) => warn!(err = %e.chain(), "unable to close recovered segment"),
                }
            }
            Err(e) => {
                warn!(
                    err = %e.chain(),
                    "unable to repair {}; moving aside",
                    part.display()
                );
                if let Err(e) = fs::rename(part, corrupt_path(&final_path)) {
                    warn!("unable to move {} aside: {e}", part.display());
                }
                let _ = fs::remove_file(idx_path(&final_path));
                if let Err(e) = db.lock().mark_segment_corrupt(&final_str) {
                    warn!(err = %e.chain(), "unable to mark segment corrupt");
                }
                self.add_event(
                    db,
                    "segment_corrupt",
                    &row.stream_name,
                    &final_str,
                    "unable to repair partial segment",
                );
                summary.corrupted += 1;
            }
        }
    }

    /// Repairs one `.part` in place and renames it into its final name.
    fn try_repair(&self, final_path: &Path) -> Result<mux::RepairSummary, Error> {
        let mut part = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(part_path(final_path))?;
        let mut idx = fs::File::open(idx_path(final_path))
            .map_err(|e| err!(DataLoss, msg("no sidecar index"), source(e)))?;
        let summary = mux::repair(&mut part, &mut idx)?;
        part.sync_all()?;
        drop(part);
        self.finalize(final_path)?;
        Ok(summary)
    }

    fn add_event<C: Clocks + Clone>(
        &self,
        db: &Database<C>,
        type_: &str,
        stream_name: &str,
        file_path: &str,
        message: &str,
    ) {
        let now = db.clocks().realtime_epoch();
        if let Err(e) =
            db.lock()
                .add_event(type_, Some(stream_name), message, Some(file_path), now)
        {
            warn!(err = %e.chain(), "unable to record {type_} event");
        }
    }
}

/// Converts a 90 kHz media duration to whole seconds, rounding up so a
/// segment's end time covers its last frame.
pub(crate) fn div_round_up_90k(duration_90k: i64) -> i64 {
    (duration_90k + TIME_UNITS_PER_SEC - 1) / TIME_UNITS_PER_SEC
}

/// Depth-first walk over regular files under `root`. A missing `root` is
/// an empty walk, matching lazy directory creation.
pub(crate) fn walk_files(
    root: &Path,
    f: &mut dyn FnMut(&Path) -> Result<(), Error>,
) -> Result<(), Error> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let ft = entry.file_type()?;
        if ft.is_dir() {
            walk_files(&entry.path(), f)?;
        } else if ft.is_file() {
            f(&entry.path())?;
        }
    }
    Ok(())
}

impl std::fmt::Debug for SegmentDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentDir")
            .field("root", &self.root)
            .finish()
    }
}
