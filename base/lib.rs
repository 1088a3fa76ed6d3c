// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

pub mod clock;
mod error;
pub mod shutdown;
pub mod strutil;

pub use crate::error::{Error, ErrorKind, ResultExt};

pub use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Hash map with a fast, DoS-resistant hasher; this is not exposed to
/// attacker-controlled keys.
pub type FastHashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Hash set variant of [`FastHashMap`].
pub type FastHashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
