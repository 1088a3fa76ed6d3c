// This file is part of LightNVR, a lightweight network video recorder.
// Copyright (C) 2024 The LightNVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The project-wide error type, constructed via the [`err!`] and [`bail!`]
//! macros.

use std::error::Error as StdError;
use std::fmt;

/// Error kind, a coarse classification usable across component boundaries.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        };
        f.write_str(s)
    }
}

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

/// The project-wide error type: a kind, an optional message, an optional
/// source. Boxed so that `Result<T, Error>` stays a single word on the Ok
/// path.
pub struct Error(Box<ErrorInner>);

impl Error {
    #[doc(hidden)]
    pub fn new(
        kind: ErrorKind,
        msg: Option<String>,
        source: Option<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Error(Box::new(ErrorInner { kind, msg, source }))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns a `Display`able that includes the full source chain, for
    /// logging.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }

    /// Replaces the kind, e.g. to reclassify a wrapped error at a component
    /// boundary.
    pub fn map_kind(mut self, kind: ErrorKind) -> Self {
        self.0.kind = kind;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.0.msg, &self.0.source) {
            (Some(msg), _) => write!(f, "{}: {}", self.0.kind, msg),
            (None, Some(source)) => write!(f, "{}: {}", self.0.kind, source),
            (None, None) => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.chain(), f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

/// `Display` wrapper which writes an error and all its causes.
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut source = StdError::source(self.0);
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::Unavailable,
        };
        Error::new(kind, None, Some(Box::new(e)))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        let kind = match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => ErrorKind::AlreadyExists,
            Some(rusqlite::ErrorCode::DatabaseCorrupt) => ErrorKind::DataLoss,
            _ => ErrorKind::Internal,
        };
        Error::new(kind, None, Some(Box::new(e)))
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T, E> {
    /// Wraps an error, annotating it with the given kind.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k, None, Some(Box::new(e))))
    }
}

/// Constructs an [`Error`] from a kind, an optional `msg(...)` format, and
/// an optional `source(...)` cause.
///
/// ```
/// use lightnvr_base::{err, ErrorKind};
/// let e = err!(NotFound, msg("no stream {}", "cam-front"));
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "Not found: no stream cam-front");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, None)
    };
    ($kind:ident, msg($($msg:tt)*) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($msg)*)), None)
    };
    ($kind:ident, source($source:expr) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, Some(($source).into()))
    };
    ($kind:ident, msg($($msg:tt)*), source($source:expr) $(,)?) => {
        $crate::Error::new(
            $crate::ErrorKind::$kind,
            Some(format!($($msg)*)),
            Some(($source).into()),
        )
    };
}

/// Returns an [`Error`] constructed as by [`err!`].
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_msgs() {
        let e = err!(Unavailable, msg("connection reset"));
        assert_eq!(e.kind(), ErrorKind::Unavailable);
        assert_eq!(e.to_string(), "Unavailable: connection reset");
    }

    #[test]
    fn chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "got EIO");
        let e = err!(Internal, msg("write failed"), source(io));
        assert_eq!(e.chain().to_string(), "Internal: write failed: got EIO");
    }

    #[test]
    fn io_conversion_picks_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e = Error::from(io);
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }
}
