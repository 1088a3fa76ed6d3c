// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock plumbing. Everything in the engine that reads time or waits goes
//! through [`Clocks`], so the time-sensitive paths (rotation, retention,
//! backoff) can run against virtual time in tests.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use tracing::warn;

use crate::shutdown::ShutdownError;

/// How long a guarded operation may run before [`TimerGuard`] complains.
const SLOW_OPERATION: Duration = Duration::from_secs(1);

/// Pause between attempts in [`retry`].
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// The engine's view of the system clocks.
pub trait Clocks: Send + Sync + 'static {
    /// Wall-clock now.
    fn realtime(&self) -> Timestamp;

    /// Monotonic now, as the duration since some fixed but unspecified
    /// origin. The Linux implementation counts suspended time too
    /// (`CLOCK_BOOTTIME`); elsewhere it is `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> Duration;

    /// Blocks the calling thread for `how_long`.
    fn sleep(&self, how_long: Duration);

    /// Receives from `rcv`, giving up after `timeout`. Waiting is routed
    /// through the clock so that virtual-time tests never stall on a real
    /// channel wait.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError>;

    /// Whole seconds since the UNIX epoch, the form timestamps take when
    /// crossing component boundaries.
    fn realtime_epoch(&self) -> i64 {
        self.realtime().as_second()
    }
}

/// Runs `f` until it succeeds, sleeping [`RETRY_DELAY`] between attempts;
/// only shutdown ends the loop early.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &crate::shutdown::Receiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, ShutdownError>
where
    C: Clocks,
    E: Into<crate::Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        warn!(err = %e.chain(), "retrying in {RETRY_DELAY:?} after error");
        clocks.sleep(RETRY_DELAY);
    }
}

fn gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let r = unsafe { libc::clock_gettime(clock, &mut ts) };
    assert_eq!(r, 0, "clock_gettime({clock}) failed");
    ts
}

#[derive(Copy, Clone)]
pub struct RealClocks {}

impl Clocks for RealClocks {
    fn realtime(&self) -> Timestamp {
        let ts = gettime(libc::CLOCK_REALTIME);
        // On 32-bit arm, `tv_sec` is an `i32` and needs widening first.
        #[allow(clippy::useless_conversion)]
        Timestamp::new(ts.tv_sec.into(), ts.tv_nsec as i32).expect("kernel time within range")
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Duration {
        let ts = gettime(libc::CLOCK_BOOTTIME);
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Duration {
        let ts = gettime(libc::CLOCK_MONOTONIC);
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    }

    fn sleep(&self, how_long: Duration) {
        thread::sleep(how_long)
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Times an enclosing operation and complains if it outlives
/// [`SLOW_OPERATION`]. The label closure runs only in the slow case, so
/// building it is free on the happy path.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Duration,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic() - self.start;
        if elapsed < SLOW_OPERATION {
            return;
        }
        if let Some(label_f) = self.label_f.take() {
            warn!("slow operation: {} took {:?}", label_f().as_ref(), elapsed);
        }
    }
}

/// Deterministic clock for tests. Time stands still except when something
/// sleeps, so a test's notion of "now" is exactly the sleeps it has
/// performed.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedInner>);

struct SimulatedInner {
    start: Timestamp,
    elapsed: crate::Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(start: Timestamp) -> Self {
        SimulatedClocks(Arc::new(SimulatedInner {
            start,
            elapsed: crate::Mutex::new(Duration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> Timestamp {
        let elapsed = SignedDuration::try_from(*self.0.elapsed.lock())
            .expect("simulated elapsed time fits a signed duration");
        self.0.start + elapsed
    }

    fn monotonic(&self) -> Duration {
        *self.0.elapsed.lock()
    }

    /// No thread is parked; the virtual clock jumps forward instead.
    fn sleep(&self, how_long: Duration) {
        *self.0.elapsed.lock() += how_long;
    }

    /// Polls without blocking. An empty channel charges the whole timeout
    /// to the virtual clock, as if the caller had waited it out; a
    /// delivered message costs nothing.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        match rcv.try_recv() {
            Ok(t) => Ok(t),
            Err(mpsc::TryRecvError::Empty) => {
                self.sleep(timeout);
                Err(mpsc::RecvTimeoutError::Timeout)
            }
            Err(mpsc::TryRecvError::Disconnected) => Err(mpsc::RecvTimeoutError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advances_on_sleep() {
        let c = SimulatedClocks::new(Timestamp::UNIX_EPOCH);
        assert_eq!(c.realtime_epoch(), 0);
        c.sleep(Duration::from_secs(86_400));
        assert_eq!(c.realtime_epoch(), 86_400);
        assert_eq!(c.monotonic(), Duration::from_secs(86_400));
    }

    #[test]
    fn simulated_recv_charges_only_empty_waits() {
        let c = SimulatedClocks::new(Timestamp::UNIX_EPOCH);
        let (tx, rx) = mpsc::channel::<u8>();
        assert!(matches!(
            c.recv_timeout(&rx, Duration::from_secs(5)),
            Err(mpsc::RecvTimeoutError::Timeout)
        ));
        assert_eq!(c.monotonic(), Duration::from_secs(5));

        tx.send(7).unwrap();
        assert_eq!(c.recv_timeout(&rx, Duration::from_secs(5)).unwrap(), 7);
        assert_eq!(c.monotonic(), Duration::from_secs(5));

        drop(tx);
        assert!(matches!(
            c.recv_timeout(&rx, Duration::from_secs(5)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        ));
        assert_eq!(c.monotonic(), Duration::from_secs(5));
    }
}
