//! Data-stream multiplexer library.
//!
//! This crate provides a uniform blocking stream abstraction over TCP
//! clients, TCP listeners, poll-only sockets, UDP datagrams, serial ports,
//! local files, and standard input/output, and lets an application wait on
//! any combination of these sources in a single event loop.
//!
//! # Architecture
//!
//! ```text
//! Application (implements HubHandler)
//!     ↓ callbacks            ↑ connect("proto:params")
//! Hub (readiness loop, stream ownership, dispatch)
//!     ↓                      ↑
//! StreamTypeRegistry → concrete streams (tcp, tcpin, tcppoll, udp,
//!     ↓                      file, stdin, stdout, ser)
//! OS readiness + socket/file/serial primitives
//! ```
//!
//! Streams are created from URI-like *targets* such as
//! `tcp:host=localhost;port=33333`, `tcpin:port=0`, `udp:port=9000`,
//! `ser:/dev/ttyUSB0;baud=57600`, or `file:/var/log/data;mode=read`. Each
//! protocol owns a template fixing its parameter names, positional order,
//! and defaults.
//!
//! The [`Hub`] owns every stream it creates. Its event loop waits for
//! readiness on all of them at once and dispatches typed callbacks:
//! [`HubHandler::connection_created`] when a data stream appears,
//! [`HubHandler::incoming_data`] while bytes await reading, and
//! [`HubHandler::connection_closed`] exactly once when a stream goes away.
//! Callbacks run synchronously on the thread driving [`Hub::run`]; the only
//! cross-thread entry points are [`Hub::stop`] and the [`HubHandle`].
//!
//! # Example
//!
//! A line-echo server:
//!
//! ```rust,ignore
//! use streamhub::{Hub, HubContext, HubHandler, Result, StreamId};
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! impl HubHandler for Echo {
//!     fn incoming_data(&mut self, ctx: &mut HubContext<'_>, stream: StreamId) -> Result<()> {
//!         let s = ctx.stream_mut(stream).unwrap();
//!         let mut byte = [0u8; 1];
//!         s.read(&mut byte)?;
//!         s.write(&byte)?;
//!         s.flush()?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let mut hub = Hub::new(Echo)?;
//!     hub.connect("tcpin:port=33333")?;
//!     hub.run()
//! }
//! ```
//!
//! # Failure model
//!
//! Every fallible operation returns a [`StreamError`] carrying an
//! [`ErrorKind`], the OS error number, a readable reason, and the offending
//! stream id when one exists. A stream that fails is destroyed by the hub
//! on its next iteration, after `connection_closed(abnormal = true)`.

pub mod address;
pub mod error;
pub mod file;
pub mod hub;
pub mod params;
pub mod registry;
#[cfg(unix)]
pub mod serial;
pub mod stream;
pub mod tcp;
pub mod udp;

pub use address::Ipv4Address;
pub use error::{ErrorKind, Result, StreamError};
pub use file::FileStream;
pub use hub::{Hub, HubContext, HubHandle, HubHandler, StreamId, StreamsGuard};
pub use params::ParameterSet;
pub use registry::{StreamCreator, StreamTypeRegistry};
#[cfg(unix)]
pub use serial::SerialStream;
pub use stream::{
    FillStatus, PacketStream, SelectableStream, Stream, StreamCore, StreamExt, StreamKind,
};
pub use tcp::{TcpClientStream, TcpListenerStream, TcpPollStream};
pub use udp::UdpStream;
