//! TCP streams: client connections, listeners, and poll-only sockets.

use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

use bytes::BytesMut;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::address::Ipv4Address;
use crate::error::{ErrorKind, Result, StreamError};
use crate::params::ParameterSet;
use crate::stream::{
    wait_fd_readable, wait_fd_writable, FillStatus, RecvBuffer, SelectableStream, Stream,
    StreamCore, StreamKind,
};

/// Initial capacity of the send accumulator.
const SEND_BUFFER_SIZE_INITIAL: usize = 256;
/// Accumulator size that forces a flush; larger single writes bypass it.
const SEND_BUFFER_SIZE_LIMIT: usize = 64 * 1024;

/// Listen backlog.
const LISTEN_BACKLOG: i32 = 16;

/// Connect to the configured peer, or adopt the descriptor given by a
/// nonnegative `sock` parameter (the listener acceptance path).
///
/// Outgoing connections canonicalize the target to the resolved peer address
/// and drop `connectionPort`; adopted ones keep it and drop `sock`.
fn connect_or_adopt(params: &mut ParameterSet) -> Result<TcpStream> {
    let sock: i32 = params.get_parsed("sock")?;
    let std_stream = if sock >= 0 {
        params.erase("sock");
        // Safety: the sock parameter is the internal hand-off channel from
        // the accept path; the descriptor is owned by this stream from here.
        unsafe { std::net::TcpStream::from_raw_fd(sock) }
    } else {
        let remote = Ipv4Address::resolve(params.get("host")?, params.get_parsed("port")?);
        let stream = std::net::TcpStream::connect(remote.socket_addr()).map_err(|e| {
            StreamError::with_source(
                ErrorKind::ConnectionFailed,
                "cannot connect to remote host.",
                e,
            )
        })?;
        params.add(&remote.format(true))?;
        params.erase("connectionPort");
        stream
    };
    std_stream.set_nonblocking(true).map_err(|e| {
        StreamError::with_source(ErrorKind::ConnectionFailed, "cannot configure socket.", e)
    })?;
    Ok(TcpStream::from_std(std_stream))
}

/// A connected TCP stream.
///
/// Writes collect in an accumulator that doubles as needed; crossing
/// [`SEND_BUFFER_SIZE_LIMIT`] forces a flush, and a single write at least
/// that large is sent directly after flushing what came before. Bytes reach
/// the peer no later than the next [`Stream::flush`].
#[derive(Debug)]
pub struct TcpClientStream {
    core: StreamCore,
    socket: TcpStream,
    recv: RecvBuffer,
    send_buffer: BytesMut,
}

impl TcpClientStream {
    /// Connect from a `tcp:` target.
    pub fn connect(target: &str) -> Result<Self> {
        let mut params = ParameterSet::new();
        params.add("tcp:host;port;connectionPort=-1;sock=-1")?;
        params.add(target)?;
        let socket = connect_or_adopt(&mut params)?;
        debug!(target: "streamhub::tcp", peer = ?socket.peer_addr().ok(), "tcp stream up");
        Ok(Self {
            core: StreamCore::new("tcp", params),
            socket,
            recv: RecvBuffer::new(),
            send_buffer: BytesMut::with_capacity(SEND_BUFFER_SIZE_INITIAL),
        })
    }

    /// Push all of `data` to the OS, waiting out short and refused writes.
    fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            match self.socket.write(&data[written..]) {
                Ok(0) => {
                    return Err(self
                        .core
                        .fail(ErrorKind::ConnectionLost, None, "connection lost."))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Err(e) = wait_fd_writable(self.socket.as_raw_fd()) {
                        return Err(self.core.fail(
                            ErrorKind::IoError,
                            Some(e),
                            "socket write I/O error.",
                        ));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::BrokenPipe
                        || e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    return Err(self
                        .core
                        .fail(ErrorKind::ConnectionLost, Some(e), "connection lost."))
                }
                Err(e) => {
                    return Err(self.core.fail(
                        ErrorKind::IoError,
                        Some(e),
                        "socket write I/O error.",
                    ))
                }
            }
        }
        Ok(())
    }

    fn flush_send_buffer(&mut self) -> Result<()> {
        if self.send_buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::take(&mut self.send_buffer);
        let result = self.send_all(&buffer);
        self.send_buffer = buffer;
        self.send_buffer.clear();
        result
    }
}

impl Stream for TcpClientStream {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StreamCore {
        &mut self.core
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() >= SEND_BUFFER_SIZE_LIMIT {
            self.flush_send_buffer()?;
            self.send_all(data)
        } else {
            self.send_buffer.extend_from_slice(data);
            if self.send_buffer.len() >= SEND_BUFFER_SIZE_LIMIT {
                self.flush_send_buffer()?;
            }
            Ok(())
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_send_buffer()
    }

    fn read(&mut self, data: &mut [u8]) -> Result<()> {
        let mut filled = self.recv.consume(data);
        while filled < data.len() {
            match self.socket.read(&mut data[filled..]) {
                Ok(0) => {
                    return Err(self
                        .core
                        .fail(ErrorKind::ConnectionLost, None, "connection lost."))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Err(e) = wait_fd_readable(self.socket.as_raw_fd()) {
                        return Err(self.core.fail(
                            ErrorKind::IoError,
                            Some(e),
                            "socket read I/O error.",
                        ));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self.core.fail(
                        ErrorKind::IoError,
                        Some(e),
                        "socket read I/O error.",
                    ))
                }
            }
        }
        Ok(())
    }
}

impl SelectableStream for TcpClientStream {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        registry.register(&mut self.socket, token, Interest::READABLE)?;
        Ok(true)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }

    fn fill_recv_buffer(&mut self) -> Result<FillStatus> {
        loop {
            match self.recv.refill(&mut self.socket) {
                Ok(0) => return Ok(FillStatus::Eof),
                Ok(n) => {
                    trace!(target: "streamhub::tcp", n, "read ahead");
                    return Ok(FillStatus::Filled);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FillStatus::WouldBlock)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self.core.fail(
                        ErrorKind::IoError,
                        Some(e),
                        "socket read I/O error.",
                    ))
                }
            }
        }
    }

    fn is_data_in_recv_buffer(&mut self) -> bool {
        self.recv.has_data()
    }

    fn recv_buffered_len(&self) -> usize {
        self.recv.available()
    }
}

impl Drop for TcpClientStream {
    fn drop(&mut self) {
        if !self.core.failed() {
            let _ = self.flush_send_buffer();
        }
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// A listening TCP socket (`tcpin:`).
///
/// Never carries data itself; the hub accepts children off it and connects
/// them as `tcp:` streams carrying `connectionPort` and `sock` parameters.
#[derive(Debug)]
pub struct TcpListenerStream {
    core: StreamCore,
    listener: TcpListener,
}

impl TcpListenerStream {
    /// Bind from a `tcpin:` target.
    pub fn bind(target: &str) -> Result<Self> {
        let mut params = ParameterSet::new();
        params.add("tcpin:port=5000;address=0.0.0.0")?;
        params.add(target)?;

        let bind_address = Ipv4Address::resolve(params.get("address")?, params.get_parsed("port")?);

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(|e| {
            StreamError::with_source(ErrorKind::ConnectionFailed, "cannot create socket.", e)
        })?;
        socket.set_reuse_address(true).map_err(|e| {
            StreamError::with_source(
                ErrorKind::ConnectionFailed,
                "cannot set address reuse flag on socket, probably the port is already in use.",
                e,
            )
        })?;
        socket.bind(&bind_address.socket_addr().into()).map_err(|e| {
            StreamError::with_source(
                ErrorKind::ConnectionFailed,
                "cannot bind socket to port, probably the port is already in use.",
                e,
            )
        })?;
        socket.listen(LISTEN_BACKLOG).map_err(|e| {
            StreamError::with_source(ErrorKind::ConnectionFailed, "cannot listen on socket.", e)
        })?;

        let std_listener: std::net::TcpListener = socket.into();
        std_listener.set_nonblocking(true).map_err(|e| {
            StreamError::with_source(ErrorKind::ConnectionFailed, "cannot configure socket.", e)
        })?;

        // Report back the OS-assigned port when a dynamic one was requested.
        if bind_address.port == 0 {
            let assigned = std_listener
                .local_addr()
                .map_err(|e| {
                    StreamError::with_source(
                        ErrorKind::ConnectionFailed,
                        "cannot retrieve socket port assignment.",
                        e,
                    )
                })?
                .port();
            params.erase("port");
            params.add_param("port", Some(&assigned.to_string()), true);
            debug!(target: "streamhub::tcp", port = assigned, "listener bound to dynamic port");
        }

        Ok(Self {
            core: StreamCore::new("tcpin", params),
            listener: TcpListener::from_std(std_listener),
        })
    }
}

impl Stream for TcpListenerStream {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StreamCore {
        &mut self.core
    }

    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, _data: &mut [u8]) -> Result<()> {
        Ok(())
    }
}

impl SelectableStream for TcpListenerStream {
    fn kind(&self) -> StreamKind {
        StreamKind::Listener
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        registry.register(&mut self.listener, token, Interest::READABLE)?;
        Ok(true)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.listener)
    }

    fn fill_recv_buffer(&mut self) -> Result<FillStatus> {
        Ok(FillStatus::Latched)
    }

    fn is_data_in_recv_buffer(&mut self) -> bool {
        false
    }

    fn accept_target(&mut self, resolve_peer_name: bool) -> Result<Option<String>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let peer = match addr {
                    SocketAddr::V4(v4) => Ipv4Address::from(v4),
                    SocketAddr::V6(v6) => Ipv4Address::resolve(&v6.ip().to_string(), v6.port()),
                };
                let listen_port = self.core.target().value("port").unwrap_or("0").to_string();
                let fd = stream.into_raw_fd();
                trace!(target: "streamhub::tcp", %peer, fd, "accepted connection");
                Ok(Some(format!(
                    "{};connectionPort={listen_port};sock={fd}",
                    peer.format(resolve_peer_name)
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(StreamError::with_source(
                ErrorKind::SyncError,
                "cannot accept new stream.",
                e,
            )),
        }
    }
}

/// A socket included in the hub's wait whose bytes are read by the
/// application, not the library (`tcppoll:`).
///
/// `incoming_data` fires exactly once per readiness notification; the hub
/// never reads from the descriptor. On drop the socket is closed only if
/// this stream created it.
#[derive(Debug)]
pub struct TcpPollStream {
    core: StreamCore,
    socket: ManuallyDrop<TcpStream>,
    owns_socket: bool,
    latch: bool,
}

impl TcpPollStream {
    /// Connect (or adopt via `sock=`) from a `tcppoll:` target.
    pub fn connect(target: &str) -> Result<Self> {
        let mut params = ParameterSet::new();
        params.add("tcppoll:host;port;connectionPort=-1;sock=-1")?;
        params.add(target)?;
        let owns_socket = params.get_parsed::<i32>("sock")? < 0;
        let socket = connect_or_adopt(&mut params)?;
        Ok(Self {
            core: StreamCore::new("tcppoll", params),
            socket: ManuallyDrop::new(socket),
            owns_socket,
            latch: false,
        })
    }

    /// The watched descriptor, so the application can perform its own I/O.
    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        self.socket.as_raw_fd()
    }
}

impl Stream for TcpPollStream {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StreamCore {
        &mut self.core
    }

    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, _data: &mut [u8]) -> Result<()> {
        Ok(())
    }
}

impl SelectableStream for TcpPollStream {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        registry.register(&mut *self.socket, token, Interest::READABLE)?;
        Ok(true)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut *self.socket)
    }

    fn fill_recv_buffer(&mut self) -> Result<FillStatus> {
        self.latch = true;
        Ok(FillStatus::Latched)
    }

    fn is_data_in_recv_buffer(&mut self) -> bool {
        std::mem::take(&mut self.latch)
    }
}

impl Drop for TcpPollStream {
    fn drop(&mut self) {
        if self.owns_socket {
            // Safety: dropped exactly once; adopted descriptors stay with
            // their true owner.
            unsafe { ManuallyDrop::drop(&mut self.socket) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connection_is_connection_failed() {
        // Bind a listener and drop it so the port is known-closed.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let err = TcpClientStream::connect(&format!("tcp:host=127.0.0.1;port={port}")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionFailed);
    }

    #[test]
    fn listener_reports_assigned_port() {
        let listener = TcpListenerStream::bind("tcpin:port=0").unwrap();
        let port: u16 = listener.target_parameter("port").unwrap().parse().unwrap();
        assert_ne!(port, 0);
        assert!(listener.target_name().starts_with(&format!("tcpin:port={port}")));
    }

    #[test]
    fn poll_stream_latches_once_per_notification() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut stream =
            TcpPollStream::connect(&format!("tcppoll:host=127.0.0.1;port={port}")).unwrap();

        assert!(!stream.is_data_in_recv_buffer());
        stream.fill_recv_buffer().unwrap();
        assert!(stream.is_data_in_recv_buffer());
        assert!(!stream.is_data_in_recv_buffer());
    }

    #[test]
    fn client_canonicalizes_target_and_strips_sock() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = TcpClientStream::connect(&format!("tcp:host=127.0.0.1;port={port}")).unwrap();
        let name = stream.target_name();
        assert!(name.starts_with("tcp:host="));
        assert!(name.ends_with(&format!("port={port}")));
        assert!(!name.contains("sock"));
        assert!(!name.contains("connectionPort"));
    }
}
