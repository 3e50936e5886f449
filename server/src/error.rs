// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use hyper::StatusCode;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[macro_export]
macro_rules! bad_request {
    ($($token:tt)*) => {
        return Err($crate::error::Error::bad_request(anyhow::anyhow!($($token)*)).into())
    };
}

/// Endpoint error that knows which HTTP status it maps to.
///
/// Handlers return `anyhow::Error`; the API layer downcasts to this type to pick the status and
/// treats everything else as an internal error.
#[derive(Debug)]
pub struct Error {
    pub inner: anyhow::Error,
    pub err_kind: ErrorKind,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let context = match self.err_kind {
            ErrorKind::BadRequest => "bad request",
            ErrorKind::NotFound => "not found",
            ErrorKind::Internal => "internal error",
        };

        write!(f, "{context}: {}", self.inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Internal,
}

impl std::error::Error for Error {}

pub trait ResultExt<T> {
    fn err_internal(self) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn err_internal(self) -> Result<T> {
        self.map_err(|e| Error::internal(e.into()))
    }
}

impl Error {
    pub fn internal(inner: anyhow::Error) -> Self {
        Self {
            inner,
            err_kind: ErrorKind::Internal,
        }
    }

    pub fn bad_request(inner: anyhow::Error) -> Self {
        Self {
            inner,
            err_kind: ErrorKind::BadRequest,
        }
    }

    pub fn not_found(inner: anyhow::Error) -> Self {
        Self {
            inner,
            err_kind: ErrorKind::NotFound,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.err_kind {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Status code for an error that bubbled up from a handler.
pub fn status_of(err: &anyhow::Error) -> StatusCode {
    match err.downcast_ref::<Error>() {
        Some(err) => err.status(),
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
