// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for all hbus operations.
//!
//! Recoverable data-plane conditions (a dropped sample, a reconnect) are
//! counted and logged but never surfaced through this type; structural
//! failures (bad arguments, finalized context, bind failures) are returned
//! immediately. The flat handle API maps each variant to a negative status
//! code via [`Error::status_code`].

use std::io;

/// Errors returned by hbus operations.
#[derive(Debug)]
pub enum Error {
    /// An argument was malformed (empty topic name, invalid regex, bad config).
    InvalidArgument(String),
    /// The operation requires an initialized context.
    NotInitialized,
    /// An entity with the same identity already exists.
    AlreadyExists(String),
    /// Handle or entity not found (stale handle, unknown method).
    NotFound,
    /// A blocking operation expired before completion.
    Timeout,
    /// The context was finalized while the operation was in flight.
    Cancelled,
    /// A transport could not be set up or is not usable.
    TransportUnavailable(io::Error),
    /// A matched peer could not be reached.
    PeerUnreachable(String),
    /// Wire record encoding or decoding failed.
    Serialization(String),
    /// Invariant violation or unexpected internal condition.
    Internal(String),
}

impl Error {
    /// Map to the flat-API integer status code (negative; `0` means ok).
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -1,
            Error::NotInitialized => -2,
            Error::AlreadyExists(_) => -3,
            Error::NotFound => -4,
            Error::Timeout => -5,
            Error::Cancelled => -6,
            Error::TransportUnavailable(_) => -7,
            Error::PeerUnreachable(_) => -8,
            Error::Serialization(_) => -9,
            Error::Internal(_) => -10,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::NotInitialized => write!(f, "context not initialized"),
            Error::AlreadyExists(what) => write!(f, "already exists: {}", what),
            Error::NotFound => write!(f, "not found"),
            Error::Timeout => write!(f, "timeout"),
            Error::Cancelled => write!(f, "cancelled"),
            Error::TransportUnavailable(e) => write!(f, "transport unavailable: {}", e),
            Error::PeerUnreachable(peer) => write!(f, "peer unreachable: {}", peer),
            Error::Serialization(msg) => write!(f, "serialization failed: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::TransportUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::TransportUnavailable(e),
        }
    }
}

/// Convenient alias for results using the hbus [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_negative_and_distinct() {
        let errors = [
            Error::InvalidArgument("x".into()),
            Error::NotInitialized,
            Error::AlreadyExists("x".into()),
            Error::NotFound,
            Error::Timeout,
            Error::Cancelled,
            Error::TransportUnavailable(io::Error::new(io::ErrorKind::Other, "x")),
            Error::PeerUnreachable("x".into()),
            Error::Serialization("x".into()),
            Error::Internal("x".into()),
        ];

        let mut codes: Vec<i32> = errors.iter().map(Error::status_code).collect();
        assert!(codes.iter().all(|&c| c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn io_timeout_maps_to_timeout() {
        let e: Error = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(e, Error::Timeout));

        let e: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "no").into();
        assert!(matches!(e, Error::TransportUnavailable(_)));
    }
}
