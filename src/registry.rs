//! The stream-type registry: protocol name to constructor.

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::{ErrorKind, Result, StreamError};
use crate::file::FileStream;
use crate::stream::SelectableStream;
use crate::tcp::{TcpClientStream, TcpListenerStream, TcpPollStream};
use crate::udp::UdpStream;

/// Builds a stream from a full target string.
pub type StreamCreator = fn(&str) -> Result<Box<dyn SelectableStream>>;

/// Maps protocol tags to stream constructors.
///
/// [`StreamTypeRegistry::default`] knows the built-in protocols; applications
/// can register additional ones before handing the registry to a hub.
pub struct StreamTypeRegistry {
    creators: BTreeMap<String, StreamCreator>,
}

impl StreamTypeRegistry {
    /// An empty registry, without even the built-in protocols.
    pub fn new() -> Self {
        Self {
            creators: BTreeMap::new(),
        }
    }

    /// Register a protocol. A later registration under the same tag replaces
    /// the earlier one.
    pub fn register(&mut self, protocol: impl Into<String>, creator: StreamCreator) {
        self.creators.insert(protocol.into(), creator);
    }

    /// Instantiate a stream from a target string.
    ///
    /// The tag before the first `:` selects the constructor; the full target
    /// is passed through to it.
    pub fn create(&self, target: &str) -> Result<Box<dyn SelectableStream>> {
        let proto = match target.split_once(':') {
            Some((proto, _)) => proto,
            None => {
                return Err(StreamError::new(
                    ErrorKind::InvalidTarget,
                    "no protocol specified in target",
                ))
            }
        };
        let creator = self.creators.get(proto).ok_or_else(|| {
            StreamError::new(
                ErrorKind::InvalidTarget,
                format!(
                    "invalid protocol in target: {proto}, known protocols are: {}",
                    self.list()
                ),
            )
        })?;
        trace!(target: "streamhub::registry", proto, "creating stream");
        creator(target)
    }

    /// The known protocol tags, comma-separated.
    pub fn list(&self) -> String {
        self.creators
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for StreamTypeRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("file", |t| {
            FileStream::open(t).map(|s| Box::new(s) as Box<dyn SelectableStream>)
        });
        registry.register("stdin", |_| {
            FileStream::stdin().map(|s| Box::new(s) as Box<dyn SelectableStream>)
        });
        registry.register("stdout", |_| {
            FileStream::stdout().map(|s| Box::new(s) as Box<dyn SelectableStream>)
        });
        #[cfg(unix)]
        registry.register("ser", |t| {
            crate::serial::SerialStream::open(t).map(|s| Box::new(s) as Box<dyn SelectableStream>)
        });
        registry.register("tcpin", |t| {
            TcpListenerStream::bind(t).map(|s| Box::new(s) as Box<dyn SelectableStream>)
        });
        registry.register("tcp", |t| {
            TcpClientStream::connect(t).map(|s| Box::new(s) as Box<dyn SelectableStream>)
        });
        registry.register("tcppoll", |t| {
            TcpPollStream::connect(t).map(|s| Box::new(s) as Box<dyn SelectableStream>)
        });
        registry.register("udp", |t| {
            UdpStream::bind(t).map(|s| Box::new(s) as Box<dyn SelectableStream>)
        });
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protocol_lists_the_known_ones() {
        let registry = StreamTypeRegistry::default();
        let err = registry.create("warp:drive=5").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);
        assert!(err.reason.contains("tcp"));
        assert!(err.reason.contains("udp"));
        assert!(err.reason.contains("file"));
    }

    #[test]
    fn target_without_protocol_is_rejected() {
        let registry = StreamTypeRegistry::default();
        let err = registry.create("just-a-name").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);
    }
}
