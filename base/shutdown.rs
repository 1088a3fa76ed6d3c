// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! The receiver can be cloned, checked, or blocked on from worker threads.
//! Dropping the single [`Sender`] requests shutdown.

use std::sync::Arc;

use crate::{Condvar, Mutex};

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

impl From<ShutdownError> for crate::Error {
    fn from(e: ShutdownError) -> Self {
        crate::err!(Cancelled, source(Box::new(e) as Box<dyn std::error::Error + Send + Sync>))
    }
}

struct Inner {
    /// `false` iff shutdown has already happened.
    open: Mutex<bool>,
    condvar: Condvar,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Note sequencing: modify the lock state, then notify waiters.
        // The opposite order would create a race in which a waiter might
        // never wake.
        *self.0.open.lock() = false;
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    /// Returns an error iff shutdown has been requested.
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.open.lock() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }

    /// Blocks up to `timeout` for shutdown; `Ok` means the timeout elapsed
    /// with no shutdown.
    pub fn wait_for(&self, timeout: std::time::Duration) -> Result<(), ShutdownError> {
        let mut l = self.0.open.lock();
        let result = self.0.condvar.wait_while_for(&mut l, |open| *open, timeout);
        if result.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender will request shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        open: Mutex::new(true),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}
