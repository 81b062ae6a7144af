//! File-descriptor streams: local files, standard input, standard output.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd};

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::error::{ErrorKind, Result, StreamError};
use crate::params::ParameterSet;
use crate::stream::{FillStatus, RecvBuffer, SelectableStream, Stream, StreamCore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileMode {
    Read,
    Write,
    ReadWrite,
}

/// A stream over a file descriptor: a local file or one of the standard
/// descriptors.
///
/// Regular files cannot be watched by the poller; the hub treats them as
/// perpetually read-ready, the way `poll(2)` does. Pipes, ttys, and other
/// character devices are registered normally. Descriptors adopted through
/// the `fd` parameter (stdin, stdout) are not closed on drop.
#[derive(Debug)]
pub struct FileStream {
    core: StreamCore,
    file: ManuallyDrop<File>,
    owns_fd: bool,
    mode: FileMode,
    regular: bool,
    recv: RecvBuffer,
    registered: bool,
}

impl FileStream {
    /// Open from a `file:` target.
    pub fn open(target: &str) -> Result<Self> {
        let mut params = ParameterSet::new();
        params.add("file:name;mode=read;fd=-1")?;
        params.add(target)?;

        let mode_name = params.get("mode")?.to_string();
        let mode = match mode_name.as_str() {
            "read" => FileMode::Read,
            "write" => FileMode::Write,
            "readwrite" => FileMode::ReadWrite,
            other => {
                return Err(StreamError::new(
                    ErrorKind::InvalidTarget,
                    format!("invalid file mode: {other}"),
                ))
            }
        };

        let fd: i32 = params.get_parsed("fd")?;
        let (file, owns_fd) = if fd >= 0 {
            params.erase("fd");
            // Safety: the fd parameter is an internal adoption channel; the
            // descriptor stays open for the process lifetime (fd 0/1) and is
            // never closed here (see Drop).
            (unsafe { File::from_raw_fd(fd) }, false)
        } else {
            let name = params.get("name")?.to_string();
            let open_result = match mode {
                FileMode::Read => File::open(&name),
                FileMode::Write => OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&name),
                FileMode::ReadWrite => OpenOptions::new().read(true).write(true).open(&name),
            };
            let file = open_result.map_err(|e| {
                StreamError::with_source(
                    ErrorKind::ConnectionFailed,
                    format!("cannot open file {name} for {mode_name}."),
                    e,
                )
            })?;
            (file, true)
        };

        let regular = file.metadata().map(|m| m.is_file()).unwrap_or(false);
        debug!(target: "streamhub::file", fd = file.as_raw_fd(), regular, "opened file stream");

        Ok(Self {
            core: StreamCore::new("file", params),
            file: ManuallyDrop::new(file),
            owns_fd,
            mode,
            regular,
            recv: RecvBuffer::new(),
            registered: false,
        })
    }

    /// The standard input stream: a read-only file stream on descriptor 0.
    pub fn stdin() -> Result<Self> {
        Self::open("file:name=/dev/stdin;mode=read;fd=0")
    }

    /// The standard output stream: a write-only file stream on descriptor 1.
    pub fn stdout() -> Result<Self> {
        Self::open("file:name=/dev/stdout;mode=write;fd=1")
    }
}

impl Stream for FileStream {
    fn core(&self) -> &StreamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StreamCore {
        &mut self.core
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.mode == FileMode::Read {
            return Err(self.core.fail(
                ErrorKind::InvalidOperation,
                None,
                "cannot write to a read-only stream.",
            ));
        }
        let mut written = 0;
        while written < data.len() {
            match self.file.write(&data[written..]) {
                Ok(0) => return Err(self.core.fail(ErrorKind::ConnectionLost, None, "file full.")),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self.core.fail(
                        ErrorKind::IoError,
                        Some(e),
                        "file write I/O error.",
                    ))
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // Durability only applies to regular files; character devices have
        // nothing to sync and reject it.
        if self.mode != FileMode::Read && self.regular {
            if let Err(e) = self.file.sync_data() {
                return Err(self
                    .core
                    .fail(ErrorKind::IoError, Some(e), "file flush error."));
            }
        }
        Ok(())
    }

    fn read(&mut self, data: &mut [u8]) -> Result<()> {
        if self.mode == FileMode::Write {
            return Err(self.core.fail(
                ErrorKind::InvalidOperation,
                None,
                "cannot read from a write-only stream.",
            ));
        }
        let mut filled = self.recv.consume(data);
        while filled < data.len() {
            match self.file.read(&mut data[filled..]) {
                Ok(0) => {
                    return Err(self.core.fail(
                        ErrorKind::ConnectionLost,
                        None,
                        "reached end of file.",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self
                        .core
                        .fail(ErrorKind::IoError, Some(e), "file read I/O error."))
                }
            }
        }
        Ok(())
    }
}

impl SelectableStream for FileStream {
    fn write_only(&self) -> bool {
        self.mode == FileMode::Write
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        if self.write_only() || self.regular {
            return Ok(false);
        }
        let fd = self.file.as_raw_fd();
        registry.register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.registered = true;
        Ok(true)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        if self.registered {
            let fd = self.file.as_raw_fd();
            registry.deregister(&mut SourceFd(&fd))?;
            self.registered = false;
        }
        Ok(())
    }

    fn fill_recv_buffer(&mut self) -> Result<FillStatus> {
        // One read per notification: the descriptor stays blocking, so a
        // second read before new readiness could stall the hub.
        loop {
            match self.recv.refill(&mut *self.file) {
                Ok(0) => return Ok(FillStatus::Eof),
                Ok(_) => return Ok(FillStatus::Latched),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(self
                        .core
                        .fail(ErrorKind::IoError, Some(e), "file read I/O error."))
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

impl Drop for FileStream {
    fn drop(&mut self) {
        if self.owns_fd {
            // Safety: dropped exactly once, and only for descriptors this
            // stream opened itself.
            unsafe { ManuallyDrop::drop(&mut self.file) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("streamhub-file-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn write_then_read_round_trip() {
        let path = temp_path("roundtrip");
        let target_write = format!("file:name={};mode=write", path.display());
        let mut writer = FileStream::open(&target_write).unwrap();
        writer.write(b"forty-two\n").unwrap();
        writer.flush().unwrap();
        drop(writer);

        let target_read = format!("file:{}", path.display());
        let mut reader = FileStream::open(&target_read).unwrap();
        assert_eq!(reader.protocol_name(), "file");
        let mut buf = [0u8; 10];
        reader.read(&mut buf).unwrap();
        assert_eq!(&buf, b"forty-two\n");

        // Past the end of file the stream reports a lost connection.
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionLost);
        assert!(reader.failed());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn regular_files_are_not_registrable() {
        let path = temp_path("poll");
        std::fs::write(&path, b"abc").unwrap();
        let mut stream = FileStream::open(&format!("file:{}", path.display())).unwrap();

        let poll = mio::Poll::new().unwrap();
        let registered = stream.register(poll.registry(), Token(1)).unwrap();
        assert!(!registered);

        // The hub's always-ready path: refill, consume, then end of file.
        assert_eq!(stream.fill_recv_buffer().unwrap(), FillStatus::Latched);
        assert_eq!(stream.recv_buffered_len(), 3);
        let mut buf = [0u8; 3];
        stream.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(stream.fill_recv_buffer().unwrap(), FillStatus::Eof);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn direction_mismatch_is_invalid_operation() {
        let path = temp_path("direction");
        let mut writer = FileStream::open(&format!("file:{};mode=write", path.display())).unwrap();
        let err = writer.read(&mut [0u8; 1]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidOperation);

        let mut reader = FileStream::open(&format!("file:{}", path.display())).unwrap();
        let err = reader.write(b"x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidOperation);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let err = FileStream::open("file:/tmp/x;mode=append").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);
    }

    #[test]
    fn missing_file_is_connection_failed() {
        let err = FileStream::open("file:/definitely/not/here").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionFailed);
        assert_ne!(err.errno, 0);
    }
}
