//! The stream contract.
//!
//! [`Stream`] is the user-facing surface: blocking `read`/`write`/`flush`
//! with explicit failure propagation and a target echo. [`PacketStream`]
//! adds datagram boundaries on top. [`SelectableStream`] is the hub-facing
//! surface: poller registration, the readiness-driven read-ahead refill, and
//! the buffered-data latch that drives `incoming_data` dispatch.
//!
//! Concrete streams embed a [`StreamCore`] holding the protocol tag, the
//! parsed target, and the failure state; [`StreamCore::fail`] is the single
//! chokepoint through which every failure passes.

use std::io;
use std::os::fd::RawFd;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::address::Ipv4Address;
use crate::error::{ErrorKind, Result, StreamError};
use crate::hub::StreamId;
use crate::params::ParameterSet;

/// Size of the per-stream read-ahead buffer.
pub(crate) const RECV_BUFFER_SIZE: usize = 4096;

/// How the hub should treat a stream when dispatching readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Carries bytes; readiness means data (or closure) to dispatch.
    Data,
    /// Accepts connections; readiness means children to accept.
    Listener,
}

/// Outcome of a readiness-driven refill of the read-ahead state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// Bytes were moved into the read-ahead buffer; more may follow.
    Filled,
    /// A one-shot readiness latch was armed; do not refill again for this
    /// notification.
    Latched,
    /// The OS has nothing more right now.
    WouldBlock,
    /// The OS reported end-of-file or remote closure.
    Eof,
}

/// Common state embedded in every concrete stream.
#[derive(Debug)]
pub struct StreamCore {
    protocol: &'static str,
    pub(crate) target: ParameterSet,
    failed: bool,
    fail_reason: String,
    id: Option<StreamId>,
}

impl StreamCore {
    pub fn new(protocol: &'static str, target: ParameterSet) -> Self {
        Self {
            protocol,
            target,
            failed: false,
            fail_reason: String::new(),
            id: None,
        }
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn target(&self) -> &ParameterSet {
        &self.target
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn fail_reason(&self) -> &str {
        &self.fail_reason
    }

    pub(crate) fn set_id(&mut self, id: StreamId) {
        self.id = Some(id);
    }

    /// Put the stream into the failed state and build the error to raise.
    ///
    /// Composes the reason with the OS message, records it as the failure
    /// reason, and returns the typed error for propagation with `?`. Once a
    /// stream has failed, no further I/O is permitted and the hub destroys
    /// it on its next iteration.
    pub fn fail(
        &mut self,
        kind: ErrorKind,
        source: Option<io::Error>,
        reason: &str,
    ) -> StreamError {
        self.failed = true;
        let err = match source {
            Some(source) => StreamError::with_source(kind, reason, source),
            None => StreamError::new(kind, reason),
        };
        self.fail_reason = err.reason.clone();
        err.for_stream(self.id)
    }
}

/// A data stream with blocking read/write and explicit failure state.
///
/// Implementors provide [`Stream::core`]/[`Stream::core_mut`] plus the three
/// I/O operations; the target echo and failure accessors are derived.
pub trait Stream: Send {
    /// The embedded common state. Implementation plumbing for the derived
    /// accessors; applications use the named methods instead.
    fn core(&self) -> &StreamCore;

    /// Mutable access to the embedded common state.
    fn core_mut(&mut self) -> &mut StreamCore;

    /// Write all of `data`, blocking until the OS has accepted every byte.
    ///
    /// The data may be buffered locally; its arrival at the peer is only
    /// guaranteed after [`Stream::flush`].
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Push local buffers to the OS.
    fn flush(&mut self) -> Result<()>;

    /// Read exactly `data.len()` bytes, blocking until they are supplied.
    ///
    /// Read-ahead bytes buffered by the hub are consumed before the OS is
    /// touched. End-of-file before the requested count is
    /// [`ErrorKind::ConnectionLost`].
    fn read(&mut self, data: &mut [u8]) -> Result<()>;

    /// Whether the stream has failed. A failed stream accepts no further
    /// I/O and is destroyed by the hub on its next iteration.
    fn failed(&self) -> bool {
        self.core().failed()
    }

    /// The reason for the failure, empty while the stream is healthy.
    fn fail_reason(&self) -> &str {
        self.core().fail_reason()
    }

    /// The protocol tag this stream was created under.
    fn protocol_name(&self) -> &str {
        self.core().protocol()
    }

    /// The full target, protocol tag included, with every bound parameter.
    fn target_name(&self) -> String {
        let core = self.core();
        format!("{}:{}", core.protocol(), core.target().get_string())
    }

    /// A single parameter of the target, or `None` when unset.
    fn target_parameter(&self, name: &str) -> Option<&str> {
        self.core().target().value(name)
    }
}

/// A stream whose transport preserves datagram boundaries.
///
/// Written bytes collect in a send buffer until [`PacketStream::send`] emits
/// them as one datagram. Reading requires a prior [`PacketStream::receive`],
/// which replaces the reception buffer with exactly one datagram's payload.
pub trait PacketStream: Stream {
    /// Transmit the send buffer as a single datagram to `dest`, then clear
    /// it. A partial transmission is [`ErrorKind::IoError`].
    fn send(&mut self, dest: &Ipv4Address) -> Result<()>;

    /// Block until one datagram arrives, replace the reception buffer with
    /// its payload, and return the source address.
    fn receive(&mut self) -> Result<Ipv4Address>;
}

/// The hub-facing half of a stream: readiness registration and dispatch.
pub trait SelectableStream: Stream + std::fmt::Debug {
    /// Data stream or listener. Only the hub's accept fast-path branches on
    /// this.
    fn kind(&self) -> StreamKind {
        StreamKind::Data
    }

    /// Write-only streams are never polled for readiness.
    fn write_only(&self) -> bool {
        false
    }

    /// Register with the hub's poller under `token`.
    ///
    /// Returns `Ok(false)` for descriptors the poller cannot watch (regular
    /// files); the hub then treats the stream as perpetually read-ready, the
    /// way `poll(2)` reports regular files.
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<bool>;

    /// Undo [`SelectableStream::register`].
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    /// Refill the read-ahead state after a readiness notification.
    ///
    /// Called by the hub only; must not block. Streams that buffer bytes
    /// report [`FillStatus::Eof`] on a zero-byte OS read; one-shot streams
    /// (UDP, poll streams, stdin) arm a latch and report
    /// [`FillStatus::Latched`].
    fn fill_recv_buffer(&mut self) -> Result<FillStatus>;

    /// True while [`Stream::read`] can progress without blocking on the OS.
    ///
    /// For latch streams this consumes the latch, so the hub delivers
    /// exactly one `incoming_data` per readiness notification.
    fn is_data_in_recv_buffer(&mut self) -> bool;

    /// Bytes currently held in the read-ahead buffer. Latch streams report
    /// zero.
    fn recv_buffered_len(&self) -> usize {
        0
    }

    /// Accept one pending child connection, rendering it as a connectable
    /// target (listeners only). `Ok(None)` means nothing is pending.
    fn accept_target(&mut self, resolve_peer_name: bool) -> Result<Option<String>> {
        let _ = resolve_peer_name;
        Ok(None)
    }

    /// Downcast to the packet-stream surface, for datagram streams.
    fn as_packet_stream(&mut self) -> Option<&mut dyn PacketStream> {
        None
    }
}

/// Fixed-size read-ahead buffer serving `read()` before the OS is touched.
///
/// Refilled by the hub on readiness; a refill is only legal once the
/// previous content has been fully consumed.
#[derive(Debug)]
pub(crate) struct RecvBuffer {
    buf: Box<[u8; RECV_BUFFER_SIZE]>,
    pos: usize,
    len: usize,
}

impl RecvBuffer {
    pub(crate) fn new() -> Self {
        Self {
            buf: Box::new([0u8; RECV_BUFFER_SIZE]),
            pos: 0,
            len: 0,
        }
    }

    pub(crate) fn has_data(&self) -> bool {
        self.pos != self.len
    }

    pub(crate) fn available(&self) -> usize {
        self.len - self.pos
    }

    /// Copy buffered bytes into `out`, returning how many were moved.
    pub(crate) fn consume(&mut self, out: &mut [u8]) -> usize {
        let n = self.available().min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    /// Refill from `reader` with a single read call.
    pub(crate) fn refill<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        debug_assert!(!self.has_data());
        let n = reader.read(&mut self.buf[..])?;
        self.pos = 0;
        self.len = n;
        Ok(n)
    }
}

/// Native-endian typed access on top of any stream, standing in for the raw
/// `read<T>()`/`write<T>()` surface. No byte-order conversion is performed.
pub trait StreamExt: Stream {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(&mut buf)?;
        Ok(u16::from_ne_bytes(buf))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(&mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write(&[v])
    }

    fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write(&v.to_ne_bytes())
    }

    fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write(&v.to_ne_bytes())
    }

    fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write(&v.to_ne_bytes())
    }
}

impl<S: Stream + ?Sized> StreamExt for S {}

/// Block until `fd` is ready for `interest`.
///
/// The single-descriptor rendition of the hub's wait: a transient poller
/// watching one raw descriptor. Used by the blocking read/write paths of
/// streams whose descriptors are non-blocking.
pub(crate) fn wait_fd_ready(fd: RawFd, interest: Interest) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(4);
    poll.registry()
        .register(&mut SourceFd(&fd), Token(0), interest)?;
    let result = loop {
        match poll.poll(&mut events, None) {
            Ok(()) if events.is_empty() => continue,
            Ok(()) => break Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        }
    };
    let _ = poll.registry().deregister(&mut SourceFd(&fd));
    result
}

pub(crate) fn wait_fd_readable(fd: RawFd) -> io::Result<()> {
    wait_fd_ready(fd, Interest::READABLE)
}

pub(crate) fn wait_fd_writable(fd: RawFd) -> io::Result<()> {
    wait_fd_ready(fd, Interest::WRITABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_buffer_consumes_in_order() {
        let mut buf = RecvBuffer::new();
        let mut source: &[u8] = b"abcdef";
        assert_eq!(buf.refill(&mut source).unwrap(), 6);
        assert!(buf.has_data());

        let mut out = [0u8; 4];
        assert_eq!(buf.consume(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(buf.available(), 2);

        let mut rest = [0u8; 8];
        assert_eq!(buf.consume(&mut rest), 2);
        assert_eq!(&rest[..2], b"ef");
        assert!(!buf.has_data());
    }

    #[test]
    fn fail_composes_reason_and_marks_stream() {
        let mut params = ParameterSet::new();
        params.add("tcp:host;port").unwrap();
        let mut core = StreamCore::new("tcp", params);
        assert!(!core.failed());

        let err = core.fail(
            ErrorKind::IoError,
            Some(io::Error::from_raw_os_error(32)),
            "socket write I/O error.",
        );
        assert!(core.failed());
        assert_eq!(err.kind, ErrorKind::IoError);
        assert_eq!(err.errno, 32);
        assert_eq!(core.fail_reason(), err.reason);
        assert!(core.fail_reason().starts_with("socket write I/O error. "));
    }

    struct LoopbackStream {
        core: StreamCore,
        data: Vec<u8>,
        cursor: usize,
    }

    impl LoopbackStream {
        fn new() -> Self {
            let mut params = ParameterSet::new();
            params.add("loop:").unwrap();
            Self {
                core: StreamCore::new("loop", params),
                data: Vec::new(),
                cursor: 0,
            }
        }
    }

    impl Stream for LoopbackStream {
        fn core(&self) -> &StreamCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut StreamCore {
            &mut self.core
        }

        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.data.extend_from_slice(data);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn read(&mut self, data: &mut [u8]) -> Result<()> {
            let end = self.cursor + data.len();
            data.copy_from_slice(&self.data[self.cursor..end]);
            self.cursor = end;
            Ok(())
        }
    }

    #[test]
    fn typed_access_is_raw_native_order() {
        let mut stream = LoopbackStream::new();
        stream.write_u32(0xDEAD_BEEF).unwrap();
        stream.write_u8(7).unwrap();
        assert_eq!(stream.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(stream.read_u8().unwrap(), 7);
    }
}
