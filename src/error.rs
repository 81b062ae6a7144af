use std::fmt;
use std::io;

use thiserror::Error;

use crate::hub::StreamId;

/// The failure classes a stream operation can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Library-internal or initialization failure.
    Unknown,
    /// The multiplexing primitive itself failed, or an accept failed on a
    /// ready listener.
    SyncError,
    /// The target string was bad: parse error, missing mandatory parameter,
    /// or unknown protocol.
    InvalidTarget,
    /// The operation is not valid on this stream.
    InvalidOperation,
    /// The connection was lost: end of file, zero-byte read on a connected
    /// stream, or remote reset on write.
    ConnectionLost,
    /// OS read/write/flush error, or a UDP send size mismatch.
    IoError,
    /// The connection could not be established: resolution, socket, bind,
    /// listen, connect, or device-open failure.
    ConnectionFailed,
    /// Serial-port discovery failed.
    EnumerationError,
    /// A readiness dispatch delivered incoming data but the handler did not
    /// consume a byte.
    PreviousIncomingDataNotRead,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::Unknown => "unknown error",
            ErrorKind::SyncError => "synchronization error",
            ErrorKind::InvalidTarget => "invalid target",
            ErrorKind::InvalidOperation => "invalid operation",
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::IoError => "I/O error",
            ErrorKind::ConnectionFailed => "connection failed",
            ErrorKind::EnumerationError => "enumeration error",
            ErrorKind::PreviousIncomingDataNotRead => "previous incoming data not read",
        };
        f.write_str(text)
    }
}

/// Typed failure raised by streams and the hub.
///
/// Carries the failure kind, the OS error number (0 when none), a composed
/// human-readable reason, and the id of the offending stream when the error
/// originated from a stream already registered with a hub.
#[derive(Debug, Error)]
#[error("{kind} ({errno}): {reason}")]
pub struct StreamError {
    /// The failure class.
    pub kind: ErrorKind,
    /// OS error number, 0 if the failure did not come from the OS.
    pub errno: i32,
    /// Human-readable reason, with the OS message appended when one exists.
    pub reason: String,
    /// The stream that caused the error, if it was registered with a hub.
    pub stream: Option<StreamId>,
    /// The underlying OS error, if any.
    #[source]
    pub source: Option<io::Error>,
}

impl StreamError {
    /// An error with no OS-level cause.
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            errno: 0,
            reason: reason.into(),
            stream: None,
            source: None,
        }
    }

    /// An error caused by an OS-level failure. The OS message is appended to
    /// the reason and the OS error number is captured.
    pub fn with_source(kind: ErrorKind, reason: impl Into<String>, source: io::Error) -> Self {
        let mut reason = reason.into();
        reason.push(' ');
        reason.push_str(&source.to_string());
        Self {
            kind,
            errno: source.raw_os_error().unwrap_or(0),
            reason,
            stream: None,
            source: Some(source),
        }
    }

    /// Attach the offending stream id.
    pub(crate) fn for_stream(mut self, stream: Option<StreamId>) -> Self {
        self.stream = stream;
        self
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_errno() {
        let err = StreamError::new(ErrorKind::InvalidTarget, "no protocol specified in target");
        assert_eq!(
            err.to_string(),
            "invalid target (0): no protocol specified in target"
        );
    }

    #[test]
    fn os_message_is_appended_to_reason() {
        let os = io::Error::from_raw_os_error(2);
        let errno = os.raw_os_error().unwrap();
        let err = StreamError::with_source(ErrorKind::ConnectionFailed, "cannot open file.", os);
        assert_eq!(err.errno, errno);
        assert!(err.reason.starts_with("cannot open file. "));
        assert!(err.reason.len() > "cannot open file. ".len());
    }
}
