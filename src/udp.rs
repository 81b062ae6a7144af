//! The UDP packet stream.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd};

use bytes::BytesMut;
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::address::Ipv4Address;
use crate::error::{ErrorKind, Result, StreamError};
use crate::params::ParameterSet;
use crate::stream::{
    wait_fd_readable, wait_fd_writable, FillStatus, PacketStream, SelectableStream, Stream,
    StreamCore,
};

/// Largest datagram payload accepted on receive.
const MAX_DATAGRAM_SIZE: usize = 4096;

/// A datagram stream (`udp:`).
///
/// Deliberately bends the stream abstraction: written bytes collect in a
/// send buffer until [`PacketStream::send`] emits them as one datagram, and
/// [`Stream::read`] only serves bytes of the datagram fetched by the last
/// [`PacketStream::receive`]. The hub delivers exactly one `incoming_data`
/// per queued datagram; the handler is expected to call `receive` inside
/// it.
#[derive(Debug)]
pub struct UdpStream {
    core: StreamCore,
    socket: UdpSocket,
    send_buffer: BytesMut,
    recv_buffer: VecDeque<u8>,
    latch: bool,
    /// A notification was handed to the handler and `receive()` has not run
    /// since. A second notification in this state means the handler ignored
    /// the datagram.
    awaiting_receive: bool,
}

impl UdpStream {
    /// Bind from a `udp:` target.
    pub fn bind(target: &str) -> Result<Self> {
        let mut params = ParameterSet::new();
        params.add("udp:port=5000;address=0.0.0.0;sock=-1")?;
        params.add(target)?;

        let sock: i32 = params.get_parsed("sock")?;
        let std_socket = if sock >= 0 {
            params.erase("sock");
            // Safety: adoption channel for an externally created socket; the
            // descriptor is owned by this stream from here.
            unsafe { std::net::UdpSocket::from_raw_fd(sock) }
        } else {
            let bind_address =
                Ipv4Address::resolve(params.get("address")?, params.get_parsed("port")?);
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(
                |e| StreamError::with_source(ErrorKind::ConnectionFailed, "cannot create socket.", e),
            )?;
            socket.bind(&bind_address.socket_addr().into()).map_err(|e| {
                StreamError::with_source(
                    ErrorKind::ConnectionFailed,
                    "cannot bind socket to port, probably the port is already in use.",
                    e,
                )
            })?;
            let std_socket: std::net::UdpSocket = socket.into();

            // Report back the OS-assigned port when a dynamic one was requested.
            if bind_address.port == 0 {
                let assigned = std_socket
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
            }
            std_socket
        };

        std_socket.set_broadcast(true).map_err(|e| {
            StreamError::with_source(
                ErrorKind::ConnectionFailed,
                "cannot enable broadcast on socket.",
                e,
            )
        })?;
        std_socket.set_nonblocking(true).map_err(|e| {
            StreamError::with_source(ErrorKind::ConnectionFailed, "cannot configure socket.", e)
        })?;
        debug!(target: "streamhub::udp", local = ?std_socket.local_addr().ok(), "udp stream up");

        Ok(Self {
            core: StreamCore::new("udp", params),
            socket: UdpSocket::from_std(std_socket),
            send_buffer: BytesMut::new(),
            recv_buffer: VecDeque::new(),
            latch: false,
            awaiting_receive: false,
        })
    }
}

impl Stream for UdpStream {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StreamCore {
        &mut self.core
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.send_buffer.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, data: &mut [u8]) -> Result<()> {
        if data.len() > self.recv_buffer.len() {
            return Err(self.core.fail(
                ErrorKind::IoError,
                None,
                "attempt to read past available data.",
            ));
        }
        for byte in data.iter_mut() {
            *byte = self.recv_buffer.pop_front().unwrap_or_default();
        }
        Ok(())
    }
}

impl PacketStream for UdpStream {
    fn send(&mut self, dest: &Ipv4Address) -> Result<()> {
        let addr = dest.socket_addr();
        loop {
            match self.socket.send_to(&self.send_buffer, addr) {
                Ok(sent) if sent == self.send_buffer.len() => {
                    trace!(target: "streamhub::udp", bytes = sent, %dest, "datagram sent");
                    self.send_buffer.clear();
                    return Ok(());
                }
                Ok(_) => {
                    return Err(self.core.fail(
                        ErrorKind::IoError,
                        None,
                        "UDP socket write I/O error.",
                    ))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Err(e) = wait_fd_writable(self.socket.as_raw_fd()) {
                        return Err(self.core.fail(
                            ErrorKind::IoError,
                            Some(e),
                            "UDP socket write I/O error.",
                        ));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self.core.fail(
                        ErrorKind::IoError,
                        Some(e),
                        "UDP socket write I/O error.",
                    ))
                }
            }
        }
    }

    fn receive(&mut self) -> Result<Ipv4Address> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((received, source)) => {
                    self.awaiting_receive = false;
                    self.recv_buffer.clear();
                    self.recv_buffer.extend(&buf[..received]);
                    let source = match source {
                        SocketAddr::V4(v4) => Ipv4Address::from(v4),
                        SocketAddr::V6(v6) => {
                            Ipv4Address::resolve(&v6.ip().to_string(), v6.port())
                        }
                    };
                    trace!(target: "streamhub::udp", bytes = received, %source, "datagram received");
                    return Ok(source);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Err(e) = wait_fd_readable(self.socket.as_raw_fd()) {
                        return Err(self.core.fail(
                            ErrorKind::ConnectionLost,
                            Some(e),
                            "UDP socket read I/O error.",
                        ));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self.core.fail(
                        ErrorKind::ConnectionLost,
                        Some(e),
                        "UDP socket read I/O error.",
                    ))
                }
            }
        }
    }
}

impl SelectableStream for UdpStream {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        registry.register(&mut self.socket, token, Interest::READABLE)?;
        Ok(true)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }

    fn fill_recv_buffer(&mut self) -> Result<FillStatus> {
        // Peek instead of latching blindly: the poller is edge-triggered, so
        // every queued datagram must produce its own notification round or
        // packets beyond the first would strand until the next arrival.
        let mut probe = [0u8; 1];
        loop {
            match self.socket.peek_from(&mut probe) {
                Ok(_) => {
                    if self.awaiting_receive {
                        return Err(self.core.fail(
                            ErrorKind::PreviousIncomingDataNotRead,
                            None,
                            "the incoming datagram was not received by the handler.",
                        ));
                    }
                    self.latch = true;
                    self.awaiting_receive = true;
                    return Ok(FillStatus::Filled);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FillStatus::WouldBlock)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self.core.fail(
                        ErrorKind::ConnectionLost,
                        Some(e),
                        "UDP socket read I/O error.",
                    ))
                }
            }
        }
    }

    fn is_data_in_recv_buffer(&mut self) -> bool {
        std::mem::take(&mut self.latch)
    }

    fn as_packet_stream(&mut self) -> Option<&mut dyn PacketStream> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn datagram_round_trip_preserves_boundaries() {
        let mut sender = UdpStream::bind("udp:port=0;address=127.0.0.1").unwrap();
        let mut receiver = UdpStream::bind("udp:port=0;address=127.0.0.1").unwrap();
        let receiver_port: u16 = receiver.target_parameter("port").unwrap().parse().unwrap();
        let sender_port: u16 = sender.target_parameter("port").unwrap().parse().unwrap();

        sender.write(b"PING\0").unwrap();
        sender
            .send(&Ipv4Address::new(Ipv4Addr::LOCALHOST, receiver_port))
            .unwrap();

        let source = receiver.receive().unwrap();
        assert_eq!(source.port, sender_port);

        let mut payload = [0u8; 5];
        receiver.read(&mut payload).unwrap();
        assert_eq!(&payload, b"PING\0");

        // The send buffer was emptied by send().
        assert!(sender.send_buffer.is_empty());
    }

    #[test]
    fn receive_replaces_previous_payload() {
        let mut sender = UdpStream::bind("udp:port=0;address=127.0.0.1").unwrap();
        let mut receiver = UdpStream::bind("udp:port=0;address=127.0.0.1").unwrap();
        let dest = Ipv4Address::new(
            Ipv4Addr::LOCALHOST,
            receiver.target_parameter("port").unwrap().parse().unwrap(),
        );

        sender.write(b"first").unwrap();
        sender.send(&dest).unwrap();
        sender.write(b"second!").unwrap();
        sender.send(&dest).unwrap();

        receiver.receive().unwrap();
        receiver.receive().unwrap();
        let mut payload = [0u8; 7];
        receiver.read(&mut payload).unwrap();
        assert_eq!(&payload, b"second!");
    }

    #[test]
    fn reading_past_the_datagram_fails() {
        let mut sender = UdpStream::bind("udp:port=0;address=127.0.0.1").unwrap();
        let mut receiver = UdpStream::bind("udp:port=0;address=127.0.0.1").unwrap();
        let dest = Ipv4Address::new(
            Ipv4Addr::LOCALHOST,
            receiver.target_parameter("port").unwrap().parse().unwrap(),
        );

        sender.write(b"abc").unwrap();
        sender.send(&dest).unwrap();
        receiver.receive().unwrap();

        let err = receiver.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IoError);
        assert!(receiver.failed());
    }

    fn wait_for_datagram(stream: &mut UdpStream) -> FillStatus {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match stream.fill_recv_buffer().unwrap() {
                FillStatus::WouldBlock => {
                    assert!(std::time::Instant::now() < deadline, "datagram never arrived");
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                status => return status,
            }
        }
    }

    #[test]
    fn every_queued_datagram_gets_its_own_notification() {
        let mut sender = UdpStream::bind("udp:port=0;address=127.0.0.1").unwrap();
        let mut receiver = UdpStream::bind("udp:port=0;address=127.0.0.1").unwrap();
        let dest = Ipv4Address::new(
            Ipv4Addr::LOCALHOST,
            receiver.target_parameter("port").unwrap().parse().unwrap(),
        );

        for payload in [b"one", b"two", b"six"] {
            sender.write(payload).unwrap();
            sender.send(&dest).unwrap();
        }

        for _ in 0..3 {
            assert_eq!(wait_for_datagram(&mut receiver), FillStatus::Filled);
            assert!(receiver.is_data_in_recv_buffer());
            assert!(!receiver.is_data_in_recv_buffer());
            receiver.receive().unwrap();
        }
        assert_eq!(receiver.fill_recv_buffer().unwrap(), FillStatus::WouldBlock);
    }

    #[test]
    fn unreceived_datagram_fails_the_stream() {
        let mut sender = UdpStream::bind("udp:port=0;address=127.0.0.1").unwrap();
        let mut receiver = UdpStream::bind("udp:port=0;address=127.0.0.1").unwrap();
        let dest = Ipv4Address::new(
            Ipv4Addr::LOCALHOST,
            receiver.target_parameter("port").unwrap().parse().unwrap(),
        );

        sender.write(b"ignored").unwrap();
        sender.send(&dest).unwrap();

        assert_eq!(wait_for_datagram(&mut receiver), FillStatus::Filled);
        assert!(receiver.is_data_in_recv_buffer());

        // The handler round ended without receive(): the next notification
        // reports the protocol violation and fails the stream.
        let err = receiver.fill_recv_buffer().unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreviousIncomingDataNotRead);
        assert!(receiver.failed());
    }

    #[test]
    fn port_zero_is_written_back() {
        let stream = UdpStream::bind("udp:port=0").unwrap();
        let port: u16 = stream.target_parameter("port").unwrap().parse().unwrap();
        assert_ne!(port, 0);
    }
}
