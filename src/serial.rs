//! Serial-port streams.
//!
//! The line itself (baud, character size, parity, stop bits, flow control,
//! DTR) is programmed through the `serialport` crate, which also provides
//! enumeration and exclusive access; this module owns target parsing, the
//! selector logic, and the stream contract on top of the opened port.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits, TTYPort};
use tracing::debug;

use crate::error::{ErrorKind, Result, StreamError};
use crate::params::ParameterSet;
use crate::stream::{
    wait_fd_readable, wait_fd_writable, FillStatus, RecvBuffer, SelectableStream, Stream,
    StreamCore,
};

/// Enumerate the serial ports of the system.
///
/// Returns a map from the 1-based index accepted by the `port` parameter to
/// the device path and a human-readable description.
pub fn available_ports() -> Result<BTreeMap<usize, (String, String)>> {
    let infos = serialport::available_ports().map_err(|e| {
        StreamError::new(
            ErrorKind::EnumerationError,
            format!("cannot enumerate serial ports: {e}"),
        )
    })?;
    let mut ports = BTreeMap::new();
    for (index, info) in infos.iter().enumerate() {
        let product = match &info.port_type {
            SerialPortType::UsbPort(usb) => usb.product.clone(),
            _ => None,
        };
        let description = format!(
            "{} ({})",
            product.as_deref().unwrap_or("Serial Port"),
            info.port_name
        );
        ports.insert(index + 1, (info.port_name.clone(), description));
    }
    Ok(ports)
}

/// Validated line settings parsed from a `ser:` target.
#[derive(Debug)]
struct LineSettings {
    baud: u32,
    bits: DataBits,
    stop: StopBits,
    parity: Parity,
    flow_control: FlowControl,
    dtr: bool,
}

fn line_settings(params: &ParameterSet) -> Result<LineSettings> {
    let bits = match params.get("bits")? {
        "5" => DataBits::Five,
        "6" => DataBits::Six,
        "7" => DataBits::Seven,
        "8" => DataBits::Eight,
        _ => {
            return Err(StreamError::new(
                ErrorKind::InvalidTarget,
                "invalid number of bits per character, must be 5, 6, 7, or 8.",
            ))
        }
    };
    let stop = match params.get("stop")? {
        "1" => StopBits::One,
        "2" => StopBits::Two,
        "1.5" => {
            return Err(StreamError::new(
                ErrorKind::InvalidTarget,
                "1.5 stop bits are not supported by the POSIX line discipline.",
            ))
        }
        _ => {
            return Err(StreamError::new(
                ErrorKind::InvalidTarget,
                "invalid stop bits count, must be 1 or 2.",
            ))
        }
    };
    let parity = match params.get("parity")? {
        "none" => Parity::None,
        "even" => Parity::Even,
        "odd" => Parity::Odd,
        "mark" | "space" => {
            return Err(StreamError::new(
                ErrorKind::InvalidTarget,
                "mark and space parity are not supported by the POSIX line discipline.",
            ))
        }
        _ => {
            return Err(StreamError::new(
                ErrorKind::InvalidTarget,
                "invalid parity type, must be none, even, or odd.",
            ))
        }
    };
    let flow_control = match params.get("fc")? {
        "none" => FlowControl::None,
        "hard" => FlowControl::Hardware,
        _ => {
            return Err(StreamError::new(
                ErrorKind::InvalidTarget,
                "invalid flow control type, must be none or hard.",
            ))
        }
    };
    Ok(LineSettings {
        baud: params.get_parsed("baud")?,
        bits,
        stop,
        parity,
        flow_control,
        dtr: params.get_parsed("dtr")?,
    })
}

/// Pick the device path from the selector parameters.
///
/// Priority is `device` (a literal path), then `name` (substring match
/// against the enumerated descriptions), then `port` (1-based enumeration
/// index, default 1). The matched selector is promoted to the front of the
/// target and the losing selectors are erased, so the target echo shows how
/// the port was actually chosen.
fn resolve_selector(
    params: &mut ParameterSet,
    ports: &BTreeMap<usize, (String, String)>,
) -> Result<String> {
    if params.is_set("device") {
        params.add_param("device", None, true);
        params.erase("port");
        params.erase("name");
        return Ok(params.get("device")?.to_string());
    }
    if params.is_set("name") {
        params.add_param("name", None, true);
        params.erase("port");
        params.erase("device");
        let wanted = params.get("name")?;
        let found = ports
            .values()
            .find(|(_, description)| description.contains(wanted))
            .map(|(path, _)| path.clone());
        return found.ok_or_else(|| {
            StreamError::new(
                ErrorKind::ConnectionFailed,
                "the specified name could not be found among the serial ports.",
            )
        });
    }
    params.erase("device");
    params.erase("name");
    let index: usize = params.get_parsed("port")?;
    ports.get(&index).map(|(path, _)| path.clone()).ok_or_else(|| {
        StreamError::new(
            ErrorKind::ConnectionFailed,
            "the specified serial port does not exist.",
        )
    })
}

/// A serial-port stream (`ser:`).
#[derive(Debug)]
pub struct SerialStream {
    core: StreamCore,
    port: TTYPort,
    recv: RecvBuffer,
}

impl SerialStream {
    /// Open from a `ser:` target.
    pub fn open(target: &str) -> Result<Self> {
        let mut params = ParameterSet::new();
        params
            .add("ser:device;name;port=1;baud=115200;stop=1;parity=none;fc=none;bits=8;dtr=true")?;
        params.add(target)?;

        let settings = line_settings(&params)?;
        let device = if params.is_set("device") {
            // Skip enumeration when an explicit path was given.
            resolve_selector(&mut params, &BTreeMap::new())?
        } else {
            resolve_selector(&mut params, &available_ports()?)?
        };

        let mut port = serialport::new(&device, settings.baud)
            .data_bits(settings.bits)
            .stop_bits(settings.stop)
            .parity(settings.parity)
            .flow_control(settings.flow_control)
            .timeout(Duration::ZERO)
            .open_native()
            .map_err(|e| {
                StreamError::with_source(
                    ErrorKind::ConnectionFailed,
                    "cannot open serial port.",
                    e.into(),
                )
            })?;
        port.set_exclusive(true).map_err(|e| {
            StreamError::with_source(
                ErrorKind::ConnectionFailed,
                "cannot lock serial port.",
                e.into(),
            )
        })?;
        port.write_data_terminal_ready(settings.dtr).map_err(|e| {
            StreamError::with_source(
                ErrorKind::ConnectionFailed,
                "cannot setup serial port.",
                e.into(),
            )
        })?;
        debug!(target: "streamhub::serial", device = %device, baud = settings.baud, "serial port open");

        Ok(Self {
            core: StreamCore::new("ser", params),
            port,
            recv: RecvBuffer::new(),
        })
    }
}

fn is_would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

impl Stream for SerialStream {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StreamCore {
        &mut self.core
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            match self.port.write(&data[written..]) {
                Ok(0) => {
                    return Err(self
                        .core
                        .fail(ErrorKind::ConnectionLost, None, "connection lost."))
                }
                Ok(n) => written += n,
                Err(e) if is_would_block(&e) => {
                    if let Err(e) = wait_fd_writable(self.port.as_raw_fd()) {
                        return Err(self.core.fail(
                            ErrorKind::IoError,
                            Some(e),
                            "serial port write I/O error.",
                        ));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self.core.fail(
                        ErrorKind::IoError,
                        Some(e),
                        "serial port write I/O error.",
                    ))
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // Bytes leave on write; the line has no buffered layer to push.
        Ok(())
    }

    fn read(&mut self, data: &mut [u8]) -> Result<()> {
        let mut filled = self.recv.consume(data);
        while filled < data.len() {
            match self.port.read(&mut data[filled..]) {
                Ok(0) => {
                    return Err(self
                        .core
                        .fail(ErrorKind::ConnectionLost, None, "connection lost."))
                }
                Ok(n) => filled += n,
                Err(e) if is_would_block(&e) => {
                    if let Err(e) = wait_fd_readable(self.port.as_raw_fd()) {
                        return Err(self.core.fail(
                            ErrorKind::IoError,
                            Some(e),
                            "serial port read I/O error.",
                        ));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self.core.fail(
                        ErrorKind::IoError,
                        Some(e),
                        "serial port read I/O error.",
                    ))
                }
            }
        }
        Ok(())
    }
}

impl SelectableStream for SerialStream {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        let fd = self.port.as_raw_fd();
        registry.register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        Ok(true)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        let fd = self.port.as_raw_fd();
        registry.deregister(&mut SourceFd(&fd))
    }

    fn fill_recv_buffer(&mut self) -> Result<FillStatus> {
        loop {
            match self.recv.refill(&mut self.port) {
                Ok(0) => return Ok(FillStatus::Eof),
                Ok(_) => return Ok(FillStatus::Filled),
                Err(e) if is_would_block(&e) => return Ok(FillStatus::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self.core.fail(
                        ErrorKind::IoError,
                        Some(e),
                        "serial port read I/O error.",
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

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str =
        "ser:device;name;port=1;baud=115200;stop=1;parity=none;fc=none;bits=8;dtr=true";

    fn params_for(target: &str) -> ParameterSet {
        let mut params = ParameterSet::new();
        params.add(TEMPLATE).unwrap();
        params.add(target).unwrap();
        params
    }

    fn fake_ports() -> BTreeMap<usize, (String, String)> {
        let mut ports = BTreeMap::new();
        ports.insert(
            1,
            ("/dev/ttyS0".to_string(), "Serial Port (/dev/ttyS0)".to_string()),
        );
        ports.insert(
            2,
            (
                "/dev/ttyUSB0".to_string(),
                "Thymio-II Robot (/dev/ttyUSB0)".to_string(),
            ),
        );
        ports
    }

    #[test]
    fn device_takes_priority_over_name_and_port() {
        let mut params = params_for("ser:device=/dev/ttyACM9;name=Thymio;port=2");
        let device = resolve_selector(&mut params, &fake_ports()).unwrap();
        assert_eq!(device, "/dev/ttyACM9");
        assert!(!params.is_set("name"));
        assert!(!params.is_set("port"));
        assert!(params.get_string().starts_with("device="));
    }

    #[test]
    fn positional_device_path_is_the_selector() {
        let mut params = params_for("ser:/dev/ttyUSB0;baud=57600");
        let device = resolve_selector(&mut params, &fake_ports()).unwrap();
        assert_eq!(device, "/dev/ttyUSB0");
        assert_eq!(params.get("baud").unwrap(), "57600");
    }

    #[test]
    fn name_matches_description_substring() {
        let mut params = params_for("ser:name=Thymio");
        let device = resolve_selector(&mut params, &fake_ports()).unwrap();
        assert_eq!(device, "/dev/ttyUSB0");
    }

    #[test]
    fn name_without_match_is_connection_failed() {
        let mut params = params_for("ser:name=Khepera");
        let err = resolve_selector(&mut params, &fake_ports()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionFailed);
    }

    #[test]
    fn port_index_selects_from_the_enumeration() {
        let mut params = params_for("ser:baud=9600;port=2");
        let device = resolve_selector(&mut params, &fake_ports()).unwrap();
        assert_eq!(device, "/dev/ttyUSB0");

        let mut params = params_for("ser:baud=9600");
        let device = resolve_selector(&mut params, &fake_ports()).unwrap();
        assert_eq!(device, "/dev/ttyS0");

        let mut params = params_for("ser:port=7");
        let err = resolve_selector(&mut params, &fake_ports()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionFailed);
    }

    #[test]
    fn line_settings_are_validated_before_any_device_access() {
        let err = line_settings(&params_for("ser:/dev/null;bits=9")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);

        let err = line_settings(&params_for("ser:/dev/null;stop=1.5")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);

        let err = line_settings(&params_for("ser:/dev/null;parity=mark")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);

        let err = line_settings(&params_for("ser:/dev/null;fc=soft")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);

        let settings = line_settings(&params_for("ser:/dev/null;baud=57600;stop=2")).unwrap();
        assert_eq!(settings.baud, 57600);
        assert_eq!(settings.stop, StopBits::Two);
        assert!(settings.dtr);
    }
}
