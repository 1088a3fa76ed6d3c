// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Segment container muxing.
//!
//! Writes standard ISO BMFF: an `ftyp` box, a growing `mdat` holding the
//! raw samples, and a `moov` synthesized at close from in-memory sample
//! tables. Because `moov` exists only at close, every open segment also
//! carries a sidecar `.idx` file of fixed-width sample records (flushed at
//! keyframe-group boundaries); [`repair`] consumes it to synthesize the
//! missing `moov` after a crash.
//!
//! See ISO/IEC 14496-12 for the box definitions.

use std::io::{Read, Seek, SeekFrom, Write};

use base::{bail, err, Error};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};

use crate::recording::{FrameKind, TIME_UNITS_PER_SEC};

/// Magic + format version prefix of the sidecar index.
const IDX_MAGIC: &[u8; 8] = b"LNVRIDX1";

/// Size of one sidecar index record: kind, key flag, length, offset, pts.
const IDX_RECORD_LEN: usize = 1 + 1 + 4 + 8 + 8;

/// Fallback duration of the final sample when no successor pts is known
/// and the track has only one sample: 1/25 s in 90 kHz units.
const DEFAULT_SAMPLE_DURATION_90K: i64 = 3600;

/// Parameters of the video track. `sample_entry` is a complete sample
/// entry box (e.g. `avc1` including `avcC`), written into `stsd` verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoParams {
    pub width: u16,
    pub height: u16,
    pub sample_entry: Vec<u8>,
}

/// Parameters of the optional audio track; `sample_entry` as in
/// [`VideoParams`]. Sample timestamps must already be in 90 kHz units.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioParams {
    pub sample_entry: Vec<u8>,
}

macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let pos_start = $buf.len();
        $buf.put_u32(0); // length placeholder
        $buf.extend_from_slice($fourcc);
        $b
        let len = u32::try_from($buf.len() - pos_start)
            .map_err(|_| err!(OutOfRange, msg("box too large")))?;
        $buf[pos_start..pos_start + 4].copy_from_slice(&len.to_be_bytes());
    }};
}

/// Per-track sample bookkeeping, one chunk per sample.
#[derive(Default)]
struct TrakTracker {
    sizes: Vec<u32>,
    pts: Vec<i64>,
    sync_samples: Vec<u32>, // 1-based indices, video only
    chunk_offsets: Vec<u64>,
}

impl TrakTracker {
    fn add_sample(&mut self, offset: u64, size: u32, pts_90k: i64, is_key: bool) {
        self.sizes.push(size);
        self.pts.push(pts_90k);
        self.chunk_offsets.push(offset);
        if is_key {
            self.sync_samples.push(self.sizes.len() as u32);
        }
    }

    fn last_pts(&self) -> Option<i64> {
        self.pts.last().copied()
    }

    /// Per-sample durations: the pts delta to the next sample; the final
    /// sample borrows the previous delta.
    fn durations(&self) -> Vec<i64> {
        let n = self.pts.len();
        let mut durations = Vec::with_capacity(n);
        for i in 0..n.saturating_sub(1) {
            durations.push(self.pts[i + 1] - self.pts[i]);
        }
        if n > 0 {
            let last = durations
                .last()
                .copied()
                .unwrap_or(DEFAULT_SAMPLE_DURATION_90K);
            durations.push(last);
        }
        durations
    }

    fn duration_90k(&self) -> i64 {
        self.durations().iter().sum()
    }

    fn write_stbl(&self, buf: &mut BytesMut, sample_entry: &[u8], with_stss: bool) -> Result<(), Error> {
        write_box!(buf, b"stbl", {
            write_box!(buf, b"stsd", {
                buf.put_u32(0); // version + flags
                buf.put_u32(1); // entry_count
                buf.extend_from_slice(sample_entry);
            });
            write_box!(buf, b"stts", {
                buf.put_u32(0);
                let durations = self.durations();
                // Run-length encode.
                let mut runs: Vec<(u32, u32)> = Vec::new();
                for &d in &durations {
                    let d = u32::try_from(d).map_err(|_| {
                        err!(OutOfRange, msg("sample duration {d} out of range"))
                    })?;
                    match runs.last_mut() {
                        Some((count, delta)) if *delta == d => *count += 1,
                        _ => runs.push((1, d)),
                    }
                }
                buf.put_u32(runs.len() as u32);
                for (count, delta) in runs {
                    buf.put_u32(count);
                    buf.put_u32(delta);
                }
            });
            if with_stss {
                write_box!(buf, b"stss", {
                    buf.put_u32(0);
                    buf.put_u32(self.sync_samples.len() as u32);
                    for &s in &self.sync_samples {
                        buf.put_u32(s);
                    }
                });
            }
            write_box!(buf, b"stsc", {
                buf.put_u32(0);
                buf.put_u32(1); // entry_count
                buf.put_u32(1); // first_chunk
                buf.put_u32(1); // samples_per_chunk
                buf.put_u32(1); // sample_description_index
            });
            write_box!(buf, b"stsz", {
                buf.put_u32(0);
                buf.put_u32(0); // sample_size: not constant
                buf.put_u32(self.sizes.len() as u32);
                for &s in &self.sizes {
                    buf.put_u32(s);
                }
            });
            write_box!(buf, b"co64", {
                buf.put_u32(0);
                buf.put_u32(self.chunk_offsets.len() as u32);
                for &o in &self.chunk_offsets {
                    buf.put_u64(o);
                }
            });
        });
        Ok(())
    }
}

fn write_matrix(buf: &mut BytesMut) {
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        buf.put_u32(v);
    }
}

struct TrakDesc<'a> {
    track_id: u32,
    handler: &'a [u8; 4], // "vide" / "soun"
    width: u16,           // zero for audio
    height: u16,
    sample_entry: &'a [u8],
}

fn write_trak(buf: &mut BytesMut, d: &TrakDesc, t: &TrakTracker) -> Result<(), Error> {
    let duration = t.duration_90k() as u64;
    write_box!(buf, b"trak", {
        write_box!(buf, b"tkhd", {
            buf.put_u32((1 << 24) | 7); // version 1, flags: enabled | in movie | in preview
            buf.put_u64(0); // creation_time
            buf.put_u64(0); // modification_time
            buf.put_u32(d.track_id);
            buf.put_u32(0); // reserved
            buf.put_u64(duration);
            buf.put_u64(0); // reserved
            buf.put_u16(0); // layer
            buf.put_u16(0); // alternate_group
            buf.put_u16(if d.handler == b"soun" { 0x0100 } else { 0 }); // volume
            buf.put_u16(0); // reserved
            write_matrix(buf);
            buf.put_u32(u32::from(d.width) << 16); // 16.16 fixed point
            buf.put_u32(u32::from(d.height) << 16);
        });
        write_box!(buf, b"mdia", {
            write_box!(buf, b"mdhd", {
                buf.put_u32(1 << 24); // version 1
                buf.put_u64(0); // creation_time
                buf.put_u64(0); // modification_time
                buf.put_u32(TIME_UNITS_PER_SEC as u32);
                buf.put_u64(duration);
                buf.put_u16(0x55c4); // language: und
                buf.put_u16(0); // pre_defined
            });
            write_box!(buf, b"hdlr", {
                buf.put_u32(0); // version + flags
                buf.put_u32(0); // pre_defined
                buf.extend_from_slice(d.handler);
                buf.extend_from_slice(&[0u8; 12]); // reserved
                buf.put_u8(0); // name: empty c string
            });
            write_box!(buf, b"minf", {
                if d.handler == b"soun" {
                    write_box!(buf, b"smhd", {
                        buf.put_u32(0); // version + flags
                        buf.put_u16(0); // balance
                        buf.put_u16(0); // reserved
                    });
                } else {
                    write_box!(buf, b"vmhd", {
                        buf.put_u32(1); // version 0, flags 1
                        buf.put_u16(0); // graphicsmode
                        buf.extend_from_slice(&[0u8; 6]); // opcolor
                    });
                }
                write_box!(buf, b"dinf", {
                    write_box!(buf, b"dref", {
                        buf.put_u32(0);
                        buf.put_u32(1); // entry_count
                        write_box!(buf, b"url ", {
                            buf.put_u32(1); // version 0, flags: self-contained
                        });
                    });
                });
                t.write_stbl(buf, d.sample_entry, d.handler == b"vide")?;
            });
        });
    });
    Ok(())
}

fn build_moov(
    video_params: &VideoParams,
    audio_params: Option<&AudioParams>,
    video: &TrakTracker,
    audio: &TrakTracker,
) -> Result<BytesMut, Error> {
    let mut buf = BytesMut::with_capacity(4096);
    let movie_duration = video.duration_90k().max(audio.duration_90k()) as u64;
    write_box!(&mut buf, b"moov", {
        write_box!(&mut buf, b"mvhd", {
            buf.put_u32(1 << 24); // version 1
            buf.put_u64(0); // creation_time
            buf.put_u64(0); // modification_time
            buf.put_u32(TIME_UNITS_PER_SEC as u32);
            buf.put_u64(movie_duration);
            buf.put_u32(0x0001_0000); // rate: 1.0
            buf.put_u16(0x0100); // volume: 1.0
            buf.put_u16(0); // reserved
            buf.put_u64(0); // reserved
            write_matrix(&mut buf);
            buf.extend_from_slice(&[0u8; 24]); // pre_defined
            let next_track = if audio_params.is_some() { 3 } else { 2 };
            buf.put_u32(next_track);
        });
        write_trak(
            &mut buf,
            &TrakDesc {
                track_id: 1,
                handler: b"vide",
                width: video_params.width,
                height: video_params.height,
                sample_entry: &video_params.sample_entry,
            },
            video,
        )?;
        if let Some(a) = audio_params {
            if !audio.sizes.is_empty() {
                write_trak(
                    &mut buf,
                    &TrakDesc {
                        track_id: 2,
                        handler: b"soun",
                        width: 0,
                        height: 0,
                        sample_entry: &a.sample_entry,
                    },
                    audio,
                )?;
            }
        }
    });
    Ok(buf)
}

fn write_ftyp(buf: &mut BytesMut) -> Result<(), Error> {
    write_box!(buf, b"ftyp", {
        buf.extend_from_slice(b"isom");
        buf.put_u32(0x200); // minor_version
        buf.extend_from_slice(b"isomiso2avc1mp41");
    });
    Ok(())
}

/// Incremental segment writer: `ftyp` + growing `mdat`, then a trailing
/// `moov` on [`Mp4Writer::finish`].
pub struct Mp4Writer<W: Write + Seek> {
    w: W,
    video_params: VideoParams,
    audio_params: Option<AudioParams>,
    video: TrakTracker,
    audio: TrakTracker,
    mdat_start: u64,
    pos: u64,
}

impl<W: Write + Seek> Mp4Writer<W> {
    pub fn new(
        mut w: W,
        video_params: VideoParams,
        audio_params: Option<AudioParams>,
    ) -> Result<Self, Error> {
        let mut buf = BytesMut::with_capacity(64);
        write_ftyp(&mut buf)?;
        let mdat_start = buf.len() as u64;
        // The mdat uses the 64-bit largesize form (size field 1) so that
        // finish only has to patch, never shift.
        buf.put_u32(1);
        buf.extend_from_slice(b"mdat");
        buf.put_u64(0); // largesize, patched in finish/repair
        w.write_all(&buf)?;
        let pos = buf.len() as u64;
        Ok(Mp4Writer {
            w,
            video_params,
            audio_params,
            video: TrakTracker::default(),
            audio: TrakTracker::default(),
            mdat_start,
            pos,
        })
    }

    /// The file offset at which the next sample will land; recorded into
    /// the sidecar index by the caller.
    pub fn next_sample_offset(&self) -> u64 {
        self.pos
    }

    pub fn video_sample_count(&self) -> usize {
        self.video.sizes.len()
    }

    /// Media duration of the video track so far, for rotation decisions.
    pub fn media_duration_90k(&self) -> i64 {
        self.video.duration_90k()
    }

    pub fn write_sample(
        &mut self,
        kind: FrameKind,
        pts_90k: i64,
        is_key: bool,
        data: &[u8],
    ) -> Result<(), Error> {
        let tracker = match kind {
            FrameKind::Video => &mut self.video,
            FrameKind::Audio => {
                if self.audio_params.is_none() {
                    bail!(FailedPrecondition, msg("segment has no audio track"));
                }
                &mut self.audio
            }
            FrameKind::Subtitle => {
                bail!(Unimplemented, msg("subtitle tracks are not recorded"));
            }
        };
        if let Some(last) = tracker.last_pts() {
            if pts_90k < last {
                bail!(
                    InvalidArgument,
                    msg("pts not monotonically non-decreasing; got {last} then {pts_90k}")
                );
            }
        }
        let len = u32::try_from(data.len())
            .map_err(|_| err!(OutOfRange, msg("sample of {} bytes too large", data.len())))?;
        self.w.write_all(data)?;
        tracker.add_sample(self.pos, len, pts_90k, is_key && kind == FrameKind::Video);
        self.pos += u64::from(len);
        Ok(())
    }

    /// Patches the `mdat` size, appends the synthesized `moov`, and returns
    /// the underlying file plus the total byte count. The caller remains
    /// responsible for fsync and rename.
    pub fn finish(mut self) -> Result<(W, u64), Error> {
        if self.video.sizes.is_empty() {
            bail!(FailedPrecondition, msg("refusing to finish a segment with no video samples"));
        }
        self.w.seek(SeekFrom::Start(self.mdat_start + 8))?;
        self.w.write_all(&(self.pos - self.mdat_start).to_be_bytes())?;
        self.w.seek(SeekFrom::Start(self.pos))?;
        let moov = build_moov(
            &self.video_params,
            self.audio_params.as_ref(),
            &self.video,
            &self.audio,
        )?;
        self.w.write_all(&moov)?;
        let total = self.pos + moov.len() as u64;
        Ok((self.w, total))
    }
}

/// One record of the sidecar index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    pub kind: FrameKind,
    pub is_key: bool,
    pub len: u32,
    pub offset: u64,
    pub pts_90k: i64,
}

/// Appends sample records (and a self-contained header) to the sidecar
/// index file. The caller flushes at keyframe-group boundaries so that the
/// on-disk index always ends at a decodable cut point.
pub struct IndexWriter<W: Write> {
    w: W,
}

impl<W: Write> IndexWriter<W> {
    pub fn new(
        mut w: W,
        video: &VideoParams,
        audio: Option<&AudioParams>,
    ) -> Result<Self, Error> {
        w.write_all(IDX_MAGIC)?;
        w.write_u16::<LittleEndian>(video.width)?;
        w.write_u16::<LittleEndian>(video.height)?;
        w.write_u32::<LittleEndian>(video.sample_entry.len() as u32)?;
        w.write_all(&video.sample_entry)?;
        match audio {
            None => w.write_u8(0)?,
            Some(a) => {
                w.write_u8(1)?;
                w.write_u32::<LittleEndian>(a.sample_entry.len() as u32)?;
                w.write_all(&a.sample_entry)?;
            }
        }
        Ok(IndexWriter { w })
    }

    pub fn push(&mut self, e: &IndexEntry) -> Result<(), Error> {
        self.w.write_u8(match e.kind {
            FrameKind::Video => 0,
            FrameKind::Audio => 1,
            FrameKind::Subtitle => 2,
        })?;
        self.w.write_u8(e.is_key as u8)?;
        self.w.write_u32::<LittleEndian>(e.len)?;
        self.w.write_u64::<LittleEndian>(e.offset)?;
        self.w.write_i64::<LittleEndian>(e.pts_90k)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.w.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

/// Reads a sidecar index back. A truncated trailing record (crash mid
/// flush) is tolerated and simply ends the entry list; a malformed header
/// is an error.
pub fn read_index<R: Read + ?Sized>(
    r: &mut R,
) -> Result<(VideoParams, Option<AudioParams>, Vec<IndexEntry>), Error> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)
        .map_err(|e| err!(DataLoss, msg("short index header"), source(e)))?;
    if &magic != IDX_MAGIC {
        bail!(DataLoss, msg("bad index magic {magic:02x?}"));
    }
    let width = r.read_u16::<LittleEndian>()?;
    let height = r.read_u16::<LittleEndian>()?;
    let entry_len = r.read_u32::<LittleEndian>()? as usize;
    if entry_len > 4096 {
        bail!(DataLoss, msg("implausible sample entry length {entry_len}"));
    }
    let mut sample_entry = vec![0u8; entry_len];
    r.read_exact(&mut sample_entry)?;
    let video = VideoParams {
        width,
        height,
        sample_entry,
    };
    let audio = match r.read_u8()? {
        0 => None,
        _ => {
            let len = r.read_u32::<LittleEndian>()? as usize;
            if len > 4096 {
                bail!(DataLoss, msg("implausible sample entry length {len}"));
            }
            let mut sample_entry = vec![0u8; len];
            r.read_exact(&mut sample_entry)?;
            Some(AudioParams { sample_entry })
        }
    };
    let mut entries = Vec::new();
    let mut record = [0u8; IDX_RECORD_LEN];
    loop {
        if !read_exact_or_eof(r, &mut record)? {
            break; // clean EOF or truncated tail
        }
        let mut c = &record[..];
        let kind = match c.read_u8()? {
            0 => FrameKind::Video,
            1 => FrameKind::Audio,
            2 => FrameKind::Subtitle,
            k => bail!(DataLoss, msg("bad frame kind {k} in index")),
        };
        let is_key = c.read_u8()? != 0;
        let len = c.read_u32::<LittleEndian>()?;
        let offset = c.read_u64::<LittleEndian>()?;
        let pts_90k = c.read_i64::<LittleEndian>()?;
        entries.push(IndexEntry {
            kind,
            is_key,
            len,
            offset,
            pts_90k,
        });
    }
    Ok((video, audio, entries))
}

/// Reads exactly `buf.len()` bytes, or returns false on EOF (clean or
/// mid-record).
fn read_exact_or_eof<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<bool, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// Result of a successful [`repair`].
#[derive(Debug)]
pub struct RepairSummary {
    pub video_samples: usize,
    pub media_duration_90k: i64,
    pub total_bytes: u64,
}

/// Crash-finalizes a `.part` file in place: reads the sidecar index,
/// truncates to the last fully-written sample, and synthesizes the missing
/// `moov`. The caller fsyncs and renames afterward.
pub fn repair(file: &mut std::fs::File, idx: &mut dyn Read) -> Result<RepairSummary, Error> {
    let file_len = file.metadata()?.len();
    let (video_params, audio_params, entries) = read_index(idx)?;

    // Verify the fixed prefix this module writes: ftyp, then an mdat with
    // a 64-bit largesize.
    file.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; 8];
    file.read_exact(&mut header)
        .map_err(|e| err!(DataLoss, msg("file too short for ftyp"), source(e)))?;
    if &header[4..8] != b"ftyp" {
        bail!(DataLoss, msg("missing ftyp"));
    }
    let mdat_start = u64::from(u32::from_be_bytes(header[0..4].try_into().expect("4 bytes")));
    file.seek(SeekFrom::Start(mdat_start))?;
    file.read_exact(&mut header)
        .map_err(|e| err!(DataLoss, msg("file too short for mdat"), source(e)))?;
    if u32::from_be_bytes(header[0..4].try_into().expect("4 bytes")) != 1
        || &header[4..8] != b"mdat"
    {
        bail!(DataLoss, msg("missing mdat"));
    }

    // Keep the longest prefix of entries fully contained in the file.
    let mut video = TrakTracker::default();
    let mut audio = TrakTracker::default();
    let mut end = mdat_start + 16;
    for e in &entries {
        if e.offset + u64::from(e.len) > file_len {
            break;
        }
        end = end.max(e.offset + u64::from(e.len));
        match e.kind {
            FrameKind::Video => video.add_sample(e.offset, e.len, e.pts_90k, e.is_key),
            FrameKind::Audio => audio.add_sample(e.offset, e.len, e.pts_90k, false),
            FrameKind::Subtitle => {}
        }
    }
    if video.sizes.is_empty() {
        bail!(DataLoss, msg("no complete video samples to salvage"));
    }
    if !video.sync_samples.first().is_some_and(|&s| s == 1) {
        bail!(DataLoss, msg("salvaged samples do not start at a keyframe"));
    }

    // Truncate any partial tail, patch the mdat size, append moov.
    file.set_len(end)?;
    file.seek(SeekFrom::Start(mdat_start + 8))?;
    file.write_all(&(end - mdat_start).to_be_bytes())?;
    file.seek(SeekFrom::Start(end))?;
    let moov = build_moov(
        &video_params,
        audio_params.as_ref(),
        &video,
        &audio,
    )?;
    file.write_all(&moov)?;
    Ok(RepairSummary {
        video_samples: video.sizes.len(),
        media_duration_90k: video.duration_90k(),
        total_bytes: end + moov.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_video_params() -> VideoParams {
        crate::testutil::test_video_params()
    }

    fn test_audio_params() -> AudioParams {
        crate::testutil::test_audio_params()
    }

    /// Minimal box walk over `buf`, returning `(fourcc, body_range)` pairs.
    fn boxes(buf: &[u8]) -> Vec<([u8; 4], std::ops::Range<usize>)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 8 <= buf.len() {
            let size32 = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap());
            let fourcc: [u8; 4] = buf[pos + 4..pos + 8].try_into().unwrap();
            let (hdr, size) = if size32 == 1 {
                let large = u64::from_be_bytes(buf[pos + 8..pos + 16].try_into().unwrap());
                (16, large as usize)
            } else {
                (8, size32 as usize)
            };
            out.push((fourcc, pos + hdr..pos + size));
            pos += size;
        }
        assert_eq!(pos, buf.len(), "boxes cover the file exactly");
        out
    }

    fn find<'a>(buf: &'a [u8], path: &str) -> &'a [u8] {
        let mut cur = buf;
        for component in path.split('/') {
            let fourcc: [u8; 4] = component.as_bytes().try_into().unwrap();
            let (_, range) = boxes(cur)
                .into_iter()
                .find(|(f, _)| *f == fourcc)
                .unwrap_or_else(|| panic!("no {component} box"));
            cur = &cur[range];
        }
        cur
    }

    fn write_segment(
        audio: bool,
        frames: &[(FrameKind, i64, bool, &'static [u8])],
    ) -> (Vec<u8>, u64) {
        let mut w = Mp4Writer::new(
            Cursor::new(Vec::new()),
            test_video_params(),
            audio.then(test_audio_params),
        )
        .unwrap();
        for &(kind, pts, key, data) in frames {
            w.write_sample(kind, pts, key, data).unwrap();
        }
        let (cursor, total) = w.finish().unwrap();
        (cursor.into_inner(), total)
    }

    /// R1 at the container level: every written sample is findable at its
    /// indexed offset with its original bytes and timestamps intact.
    #[test]
    fn round_trip_tables() {
        let frames: &[(FrameKind, i64, bool, &'static [u8])] = &[
            (FrameKind::Video, 0, true, b"key0"),
            (FrameKind::Video, 3000, false, b"p1"),
            (FrameKind::Video, 6000, false, b"p2"),
            (FrameKind::Video, 9000, true, b"key1!"),
            (FrameKind::Video, 12000, false, b"p3"),
        ];
        let (buf, total) = write_segment(false, frames);
        assert_eq!(buf.len() as u64, total);

        let top: Vec<[u8; 4]> = boxes(&buf).into_iter().map(|(f, _)| f).collect();
        assert_eq!(top, vec![*b"ftyp", *b"mdat", *b"moov"]);

        let stbl = "moov/trak/mdia/minf/stbl";
        let stsz = find(&buf, &format!("{stbl}/stsz"));
        assert_eq!(u32::from_be_bytes(stsz[8..12].try_into().unwrap()), 5);
        let sizes: Vec<u32> = (0..5)
            .map(|i| u32::from_be_bytes(stsz[12 + 4 * i..16 + 4 * i].try_into().unwrap()))
            .collect();
        assert_eq!(sizes, vec![4, 2, 2, 5, 2]);

        let stss = find(&buf, &format!("{stbl}/stss"));
        assert_eq!(u32::from_be_bytes(stss[4..8].try_into().unwrap()), 2);
        assert_eq!(u32::from_be_bytes(stss[8..12].try_into().unwrap()), 1);
        assert_eq!(u32::from_be_bytes(stss[12..16].try_into().unwrap()), 4);

        // All durations are 3000, so stts is a single run of 5.
        let stts = find(&buf, &format!("{stbl}/stts"));
        assert_eq!(u32::from_be_bytes(stts[4..8].try_into().unwrap()), 1);
        assert_eq!(u32::from_be_bytes(stts[8..12].try_into().unwrap()), 5);
        assert_eq!(u32::from_be_bytes(stts[12..16].try_into().unwrap()), 3000);

        // co64 offsets point at the original payload bytes.
        let co64 = find(&buf, &format!("{stbl}/co64"));
        for (i, &(_, _, _, data)) in frames.iter().enumerate() {
            let off =
                u64::from_be_bytes(co64[8 + 8 * i..16 + 8 * i].try_into().unwrap()) as usize;
            assert_eq!(&buf[off..off + data.len()], data, "sample {i}");
        }

        // mdat largesize covers header + payload.
        let payload: usize = frames.iter().map(|f| f.3.len()).sum();
        let mdat = u64::from_be_bytes(buf[40..48].try_into().unwrap());
        assert_eq!(mdat as usize, 16 + payload);
    }

    #[test]
    fn audio_track_is_emitted_when_fed() {
        let frames: &[(FrameKind, i64, bool, &'static [u8])] = &[
            (FrameKind::Video, 0, true, b"key0"),
            (FrameKind::Audio, 0, false, b"aac0"),
            (FrameKind::Video, 3000, false, b"p1"),
            (FrameKind::Audio, 1920, false, b"aac1"),
        ];
        let (buf, _) = write_segment(true, frames);
        let moov = find(&buf, "moov");
        let traks = boxes(moov)
            .into_iter()
            .filter(|(f, _)| f == b"trak")
            .count();
        assert_eq!(traks, 2);
    }

    #[test]
    fn audio_without_track_is_rejected() {
        let mut w = Mp4Writer::new(Cursor::new(Vec::new()), test_video_params(), None).unwrap();
        w.write_sample(FrameKind::Video, 0, true, b"k").unwrap();
        let e = w
            .write_sample(FrameKind::Audio, 0, false, b"a")
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn non_monotone_pts_is_rejected() {
        let mut w = Mp4Writer::new(Cursor::new(Vec::new()), test_video_params(), None).unwrap();
        w.write_sample(FrameKind::Video, 3000, true, b"k").unwrap();
        let e = w
            .write_sample(FrameKind::Video, 0, false, b"p")
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn index_round_trip_tolerates_truncation() {
        let mut idx = IndexWriter::new(Vec::new(), &test_video_params(), None).unwrap();
        let entries = [
            IndexEntry {
                kind: FrameKind::Video,
                is_key: true,
                len: 4,
                offset: 48,
                pts_90k: 0,
            },
            IndexEntry {
                kind: FrameKind::Video,
                is_key: false,
                len: 2,
                offset: 52,
                pts_90k: 3000,
            },
        ];
        for e in &entries {
            idx.push(e).unwrap();
        }
        let full = idx.into_inner();

        let (video, audio, read) = read_index(&mut Cursor::new(&full)).unwrap();
        assert_eq!(video, test_video_params());
        assert!(audio.is_none());
        assert_eq!(read, entries);

        // A crash mid-record leaves a truncated tail; the reader stops at
        // the last full record.
        let truncated = &full[..full.len() - 3];
        let (_, _, read) = read_index(&mut Cursor::new(truncated)).unwrap();
        assert_eq!(read, entries[..1]);

        read_index(&mut Cursor::new(&b"JUNKJUNKJUNK"[..])).unwrap_err();
    }
}
