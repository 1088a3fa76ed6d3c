// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Camera ingest: the source abstraction the capture workers consume, and
//! its Retina-backed implementation.
//!
//! Capture workers are plain blocking threads while Retina is async, so
//! the real opener bridges the two: every open and every frame fetch is a
//! task spawned onto a shared runtime handle that the calling thread then
//! parks on.

use std::pin::Pin;

use base::{bail, err, Error};
use db::mux::VideoParams;
use db::recording::{Frame, FrameKind};
use db::Protocol;
use futures::StreamExt as _;
use retina::client::Demuxed;
use retina::codec::CodecItem;
use tracing::{debug, warn};
use url::Url;

/// Ceiling on a single open or frame fetch; a camera quieter than this is
/// treated as gone.
static RETINA_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Encodings the recording engine accepts from a camera.
const SUPPORTED_ENCODINGS: [&str; 3] = ["h264", "h265", "jpeg"];

pub struct Options {
    pub session: retina::client::SessionOptions,
    pub setup: retina::client::SetupOptions,
}

impl Options {
    /// Session/setup options for a stream's configured transport.
    pub fn for_protocol(protocol: Protocol) -> Self {
        let transport = match protocol {
            Protocol::UdpPull => retina::client::Transport::Udp(
                retina::client::UdpTransportOptions::default(),
            ),
            // ONVIF-discovered cameras are plain RTSP at this layer.
            Protocol::TcpPull | Protocol::Onvif => retina::client::Transport::Tcp(
                retina::client::TcpTransportOptions::default(),
            ),
        };
        Options {
            session: retina::client::SessionOptions::default(),
            setup: retina::client::SetupOptions::default().transport(transport),
        }
    }
}

/// Camera source factory, injectable so worker tests can feed canned
/// frames instead of a live session.
pub trait Opener: Send + Sync {
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Stream>, Error>;
}

/// One connected source, yielding frames with 90 kHz timestamps.
pub trait Stream: Send {
    /// The probed codec tag, e.g. `h264`.
    fn codec(&self) -> &str;

    /// Sample entry and pixel dimensions for the muxer.
    fn video_params(&self) -> &VideoParams;

    /// Audio sample entry, for sources that deliver audio. The RTSP
    /// opener records video only, so its implementation is the default.
    fn audio_params(&self) -> Option<&db::mux::AudioParams> {
        None
    }

    fn next(&mut self) -> Result<Frame, Error>;
}

/// Real opener, implemented with the Retina library. The handle must
/// belong to a live multi-threaded runtime; the worker threads themselves
/// stay synchronous.
pub struct RetinaOpener {
    handle: tokio::runtime::Handle,
}

impl RetinaOpener {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        RetinaOpener { handle }
    }
}

impl Opener for RetinaOpener {
    fn open(
        &self,
        label: String,
        url: Url,
        mut options: Options,
    ) -> Result<Box<dyn Stream>, Error> {
        options.session = options
            .session
            .user_agent(format!("LightNVR {}", env!("CARGO_PKG_VERSION")));
        let handle = self.handle.clone();
        let (inner, first_frame) = handle
            .block_on(handle.spawn(tokio::time::timeout(
                RETINA_TIMEOUT,
                RetinaStreamInner::play(label, url, options),
            )))
            .expect("play task panicked")
            .map_err(|e| {
                err!(
                    DeadlineExceeded,
                    msg("no keyframe within {RETINA_TIMEOUT:?} of opening"),
                    source(e),
                )
            })??;
        Ok(Box::new(RetinaStream {
            inner: Some(inner),
            handle,
            first_frame: Some(first_frame),
        }))
    }
}

/// A connected Retina session plus the runtime handle used to drive it.
struct RetinaStream {
    /// Session state. Absent only while a fetch task owns it: spawned
    /// tasks need `'static` ownership, so the state round-trips through
    /// every spawn.
    inner: Option<Box<RetinaStreamInner>>,

    handle: tokio::runtime::Handle,

    /// The keyframe that completed `play`, handed out by the first call
    /// to `next`.
    first_frame: Option<retina::codec::VideoFrame>,
}

struct RetinaStreamInner {
    label: String,
    session: Demuxed,
    codec: String,
    video_params: VideoParams,
}

fn params_to_video_params(
    params: &retina::codec::VideoParameters,
) -> Result<VideoParams, Error> {
    let (width, height) = params.pixel_dimensions();
    let sample_entry = params
        .mp4_sample_entry()
        .build()
        .map_err(|e| err!(Unknown, msg("sample entry construction failed"), source(e)))?;
    Ok(VideoParams {
        width: u16::try_from(width).map_err(|e| err!(OutOfRange, source(e)))?,
        height: u16::try_from(height).map_err(|e| err!(OutOfRange, source(e)))?,
        sample_entry,
    })
}

/// Pulls the next demuxed video frame, discarding other codec items and
/// logging RTP loss.
async fn next_video_frame(
    label: &str,
    session: &mut Demuxed,
) -> Result<retina::codec::VideoFrame, Error> {
    loop {
        let frame = match Pin::new(&mut *session).next().await {
            None => bail!(Unavailable, msg("source closed the session")),
            Some(Err(e)) => bail!(Unavailable, msg("demux failed"), source(e)),
            Some(Ok(CodecItem::VideoFrame(v))) => v,
            Some(Ok(_)) => continue,
        };
        if frame.loss() > 0 {
            warn!(
                "{label}: lost {} RTP packets @ {}",
                frame.loss(),
                frame.start_ctx()
            );
        }
        return Ok(frame);
    }
}

impl RetinaStreamInner {
    /// Describes, sets up, and plays the session, then pulls frames until
    /// the first keyframe so that codec parameters are settled before the
    /// worker sees anything. No timeout here; the caller wraps one around
    /// the whole call.
    async fn play(
        label: String,
        url: Url,
        options: Options,
    ) -> Result<(Box<Self>, retina::codec::VideoFrame), Error> {
        let mut session = retina::client::Session::describe(url, options.session)
            .await
            .map_err(|e| err!(Unavailable, source(e)))?;
        debug!("{}: described; camera tool {:?}", &label, session.tool());
        let video_i = session
            .streams()
            .iter()
            .enumerate()
            .find_map(|(i, s)| {
                (s.media() == "video" && SUPPORTED_ENCODINGS.contains(&s.encoding_name()))
                    .then_some(i)
            })
            .ok_or_else(|| {
                err!(
                    FailedPrecondition,
                    msg("no usable video track in session description")
                )
            })?;
        let codec = session.streams()[video_i].encoding_name().to_owned();
        session
            .setup(video_i, options.setup)
            .await
            .map_err(|e| err!(Unavailable, source(e)))?;
        let session = session
            .play(retina::client::PlayOptions::default())
            .await
            .map_err(|e| err!(Unavailable, source(e)))?;
        let mut session = session.demuxed().map_err(|e| err!(Unknown, source(e)))?;

        let first_frame = loop {
            let v = next_video_frame(&label, &mut session).await?;
            if v.is_random_access_point() {
                break v;
            }
        };
        let video_params = match session.streams()[video_i].parameters() {
            Some(retina::codec::ParametersRef::Video(v)) => params_to_video_params(v)?,
            Some(_) => unreachable!(),
            None => bail!(Unknown, msg("video track declared no parameters")),
        };
        let self_ = Box::new(Self {
            label,
            session,
            codec,
            video_params,
        });
        Ok((self_, first_frame))
    }

    /// Runs on the reactor: pulls one frame, then hands `self` back to
    /// the blocking side.
    async fn into_next_frame(
        mut self: Box<Self>,
    ) -> Result<(Box<Self>, retina::codec::VideoFrame), Error> {
        let frame = next_video_frame(&self.label, &mut self.session).await?;
        Ok((self, frame))
    }
}

impl Stream for RetinaStream {
    fn codec(&self) -> &str {
        &self.inner.as_ref().expect("inner returns after each fetch").codec
    }

    fn video_params(&self) -> &VideoParams {
        &self
            .inner
            .as_ref()
            .expect("inner returns after each fetch")
            .video_params
    }

    fn next(&mut self) -> Result<Frame, Error> {
        let frame = match self.first_frame.take() {
            Some(f) => f,
            None => {
                let inner = self.inner.take().expect("inner returns after each fetch");
                let (inner, frame) = self
                    .handle
                    .block_on(self.handle.spawn(tokio::time::timeout(
                        RETINA_TIMEOUT,
                        inner.into_next_frame(),
                    )))
                    .expect("frame task panicked")
                    .map_err(|e| {
                        err!(
                            DeadlineExceeded,
                            msg("no frame within {RETINA_TIMEOUT:?}"),
                            source(e)
                        )
                    })??;
                self.inner = Some(inner);
                frame
            }
        };
        Ok(Frame {
            pts_90k: frame.timestamp().elapsed(),
            is_key: frame.is_random_access_point(),
            kind: FrameKind::Video,
            data: frame.into_data().into(),
        })
    }
}
