// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link for
/// descriptions of each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    #[error("Cancelled")] Cancelled,
    #[error("Unknown")] Unknown,
    #[error("Invalid argument")] InvalidArgument,
    #[error("Deadline exceeded")] DeadlineExceeded,
    #[error("Not found")] NotFound,
    #[error("Already exists")] AlreadyExists,
    #[error("Permission denied")] PermissionDenied,
    #[error("Unauthenticated")] Unauthenticated,
    #[error("Resource exhausted")] ResourceExhausted,
    #[error("Failed precondition")] FailedPrecondition,
    #[error("Aborted")] Aborted,
    #[error("Out of range")] OutOfRange,
    #[error("Unimplemented")] Unimplemented,
    #[error("Internal")] Internal,
    #[error("Unavailable")] Unavailable,
    #[error("Data loss")] DataLoss,
}

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// An error with a classifying [`ErrorKind`], an optional message, and an
/// optional source error.
///
/// Boxed so that `Result<T, Error>` stays a pointer wide on the happy path.
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg: Some(msg.into()),
            source: None,
        }))
    }

    pub fn wrap<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error(Box::new(ErrorInner {
            kind,
            msg: None,
            source: Some(source.into()),
        }))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Annotates this error with an additional message, pushing the existing
    /// error down the source chain.
    pub fn context(self, msg: impl Into<String>) -> Self {
        Error(Box::new(ErrorInner {
            kind: self.kind(),
            msg: Some(msg.into()),
            source: Some(Box::new(self)),
        }))
    }

    /// Returns a `Display` adapter which prints the full source chain.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.0.msg.as_deref(), self.0.source.as_deref()) {
            (Some(msg), _) => write!(f, "{}: {}", self.0.kind, msg),
            (None, Some(src)) => write!(f, "{}: {}", self.0.kind, src),
            (None, None) => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.chain())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.0.source.as_deref() {
            Some(s) => Some(s as &(dyn std::error::Error + 'static)),
            None => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg: None,
            source: None,
        }))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::TimedOut => ErrorKind::DeadlineExceeded,
            _ => ErrorKind::Internal,
        };
        Error::wrap(kind, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::wrap(ErrorKind::DataLoss, e)
    }
}

/// `Display` adapter printing an error and each of its sources.
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cur = std::error::Error::source(self.0);
        while let Some(e) = cur {
            write!(f, ": caused by: {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind.
    /// Example:
    /// ```
    /// use vigil_base::{ErrorKind, ResultExt as _};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Like `bail!`, but the first argument specifies a type as an `ErrorKind`.
///
/// Example:
/// ```
/// use vigil_base::bail_t;
/// let e = || -> Result<(), vigil_base::Error> {
///     bail_t!(Unauthenticated, "unknown user: {}", "admin");
/// }().unwrap_err();
/// assert_eq!(e.kind(), vigil_base::ErrorKind::Unauthenticated);
/// assert_eq!(e.to_string(), "Unauthenticated: unknown user: admin");
/// ```
#[macro_export]
macro_rules! bail_t {
    ($t:ident, $($arg:tt)+) => {
        return Err($crate::Error::new($crate::ErrorKind::$t, format!($($arg)+)));
    };
}

/// Like `format_err!`, but the first argument specifies a type as an `ErrorKind`.
///
/// Example:
/// ```
/// use vigil_base::format_err_t;
/// let e = format_err_t!(Unauthenticated, "unknown user: {}", "admin");
/// assert_eq!(e.kind(), vigil_base::ErrorKind::Unauthenticated);
/// assert_eq!(e.to_string(), "Unauthenticated: unknown user: admin");
/// ```
#[macro_export]
macro_rules! format_err_t {
    ($t:ident, $($arg:tt)+) => {
        $crate::Error::new($crate::ErrorKind::$t, format!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_msg() {
        let e = Error::new(ErrorKind::NotFound, "no such camera");
        assert_eq!(e.to_string(), "Not found: no such camera");
    }

    #[test]
    fn chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let e = Error::wrap(ErrorKind::Internal, io).context("writing playlist");
        let chained = e.chain().to_string();
        assert!(chained.contains("writing playlist"), "{chained}");
        assert!(chained.contains("disk on fire"), "{chained}");
    }

    #[test]
    fn io_error_kind_mapping() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }
}
