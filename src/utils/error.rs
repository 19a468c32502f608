//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for tessera. Most failures are plain messages; the
/// dedicated variants carry the failure classes that callers dispatch on:
/// client-input errors are returned synchronously, `NotServingRegion` is
/// retried with backoff by the master's catalog operations, and
/// `DroppedSnapshot` is fatal to the hosting process (restart + log replay
/// is the only recovery).
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TesseraError {
    /// Row falls outside the region's key range.
    WrongRegion(String),

    /// Operation attempted on a closed region.
    RegionClosed(String),

    /// Catalog region is not currently served; retry with backoff.
    NotServingRegion(String),

    /// Memstore snapshot could not be persisted after the WAL checkpoint
    /// was allocated. Fatal; never retried in place.
    DroppedSnapshot(String),

    /// A lease with this name is still held.
    LeaseStillHeld(String),

    /// Unknown or malformed column family name.
    InvalidColumn(String),

    /// Filesystem-level failure.
    Io(String),

    /// Everything else.
    Msg(String),
}

impl TesseraError {
    pub fn msg(msg: impl ToString) -> Self {
        TesseraError::Msg(msg.to_string())
    }
}

impl fmt::Display for TesseraError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // do not display literal quotes around the inner string
        match self {
            TesseraError::WrongRegion(s) => write!(f, "wrong region: {}", s),
            TesseraError::RegionClosed(s) => write!(f, "region closed: {}", s),
            TesseraError::NotServingRegion(s) => {
                write!(f, "not serving region: {}", s)
            }
            TesseraError::DroppedSnapshot(s) => {
                write!(f, "dropped snapshot: {}", s)
            }
            TesseraError::LeaseStillHeld(s) => {
                write!(f, "lease still held: {}", s)
            }
            TesseraError::InvalidColumn(s) => {
                write!(f, "invalid column: {}", s)
            }
            TesseraError::Io(s) => write!(f, "io error: {}", s),
            TesseraError::Msg(s) => write!(f, "{}", s),
        }
    }
}

impl error::Error for TesseraError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `TesseraError`.
macro_rules! impl_from_error {
    ($error:ty, $variant:path) => {
        impl From<$error> for TesseraError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                $variant(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `TesseraError`.
macro_rules! impl_from_error_generic {
    ($error:ty, $variant:path) => {
        impl<T> From<$error> for TesseraError {
            fn from(e: $error) -> Self {
                $variant(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error, TesseraError::Io);
impl_from_error!(string::FromUtf8Error, TesseraError::Msg);
impl_from_error!(num::ParseIntError, TesseraError::Msg);
impl_from_error!(net::AddrParseError, TesseraError::Msg);
impl_from_error!(rmp_serde::encode::Error, TesseraError::Msg);
impl_from_error!(rmp_serde::decode::Error, TesseraError::Msg);
impl_from_error!(toml::de::Error, TesseraError::Msg);
impl_from_error!(tokio::task::JoinError, TesseraError::Msg);
impl_from_error!(tokio::sync::watch::error::RecvError, TesseraError::Msg);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>, TesseraError::Msg);
impl_from_error_generic!(tokio::sync::watch::error::SendError<T>, TesseraError::Msg);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = TesseraError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = TesseraError::from(io_error);
        assert!(matches!(e, TesseraError::Io(ref s) if s.contains("oh no!")));
    }
}
