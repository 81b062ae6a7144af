//! The hub: stream ownership, the readiness loop, and callback dispatch.
//!
//! A [`Hub`] owns every stream created through it and turns OS readiness
//! into typed callbacks on a [`HubHandler`]: `connection_created` when a
//! data stream appears, `incoming_data` while buffered bytes await reading,
//! `connection_closed` exactly once when a stream goes away. All callbacks
//! fire synchronously from [`Hub::step`] on the thread that runs the loop,
//! with the stream lock held; [`Hub::stop`] (or a [`HubHandle`]) is the one
//! thread-safe way in from outside.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mio::{Events, Poll, Registry, Token, Waker};
use tracing::{debug, trace, warn};

use crate::error::{ErrorKind, Result, StreamError};
use crate::registry::StreamTypeRegistry;
use crate::stream::{FillStatus, PacketStream, SelectableStream, StreamKind};

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 128;

/// Identifier of a stream owned by a hub. Ids are never reused within one
/// hub, so a stale id simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub(crate) usize);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct StreamEntry {
    stream: Box<dyn SelectableStream>,
    /// Whether the poller watches this stream. Unwatchable streams (regular
    /// files) are treated as perpetually read-ready instead.
    registered: bool,
    listener: bool,
}

/// Stream set shared between the hub, its handles, and lock guards.
pub(crate) struct State {
    streams: BTreeMap<StreamId, StreamEntry>,
    next_id: usize,
    poll_registry: Registry,
}

impl State {
    fn create_stream(&mut self, types: &StreamTypeRegistry, target: &str) -> Result<StreamId> {
        let mut stream = types.create(target)?;
        let id = StreamId(self.next_id);
        self.next_id += 1;
        stream.core_mut().set_id(id);

        let listener = stream.kind() == StreamKind::Listener;
        let registered = if stream.write_only() {
            false
        } else {
            stream
                .register(&self.poll_registry, Token(id.0))
                .map_err(|e| {
                    StreamError::with_source(
                        ErrorKind::SyncError,
                        "cannot register stream with the poller.",
                        e,
                    )
                })?
        };
        debug!(
            target: "streamhub::hub",
            %id,
            stream = %stream.target_name(),
            "stream created"
        );
        self.streams.insert(
            id,
            StreamEntry {
                stream,
                registered,
                listener,
            },
        );
        Ok(id)
    }

    fn remove_stream(&mut self, id: StreamId) {
        if let Some(mut entry) = self.streams.remove(&id) {
            if entry.registered {
                if let Err(e) = entry.stream.deregister(&self.poll_registry) {
                    warn!(target: "streamhub::hub", %id, error = %e, "cannot deregister stream");
                }
            }
            debug!(target: "streamhub::hub", %id, "stream removed");
        }
    }

    fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    fn stream(&self, id: StreamId) -> Option<&dyn SelectableStream> {
        self.streams.get(&id).map(|e| e.stream.as_ref())
    }

    fn stream_mut(&mut self, id: StreamId) -> Option<&mut (dyn SelectableStream + '_)> {
        match self.streams.get_mut(&id) {
            Some(e) => Some(e.stream.as_mut()),
            None => None,
        }
    }

    fn data_streams(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|(_, e)| !e.listener)
            .map(|(id, _)| *id)
            .collect()
    }
}

fn lock_state(state: &Arc<Mutex<State>>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Application callbacks, dispatched synchronously from [`Hub::step`].
///
/// All methods default to doing nothing. `connection_created` and
/// `incoming_data` return a [`Result`] so stream failures inside a callback
/// propagate naturally with `?`; the hub swallows such errors and uses the
/// stream's failed flag to decide whether the stream must be closed.
pub trait HubHandler {
    /// A data stream was created, either by [`Hub::connect`] or by a
    /// listener accepting a peer. The stream is already in the hub's set.
    /// Not called for listeners.
    fn connection_created(&mut self, ctx: &mut HubContext<'_>, stream: StreamId) -> Result<()> {
        let _ = (ctx, stream);
        Ok(())
    }

    /// Data is available for reading. The handler must consume at least one
    /// byte, otherwise the stream fails with
    /// [`ErrorKind::PreviousIncomingDataNotRead`].
    fn incoming_data(&mut self, ctx: &mut HubContext<'_>, stream: StreamId) -> Result<()> {
        let _ = (ctx, stream);
        Ok(())
    }

    /// The stream is going away; delivered at most once per stream. Only the
    /// target echo is still meaningful, I/O on the stream is not. `abnormal`
    /// is true when the closure came from a failure rather than an orderly
    /// remote close. Do not call [`HubContext::close_stream`] on this stream
    /// from here, the hub owns the transition.
    fn connection_closed(&mut self, ctx: &mut HubContext<'_>, stream: StreamId, abnormal: bool) {
        let _ = (ctx, stream, abnormal);
    }
}

/// Hub access handed to callbacks.
///
/// Supports I/O on any owned stream, creating and closing streams
/// mid-callback, and requesting a stop. Streams created from inside a
/// callback have their `connection_created` delivered right after the
/// current callback returns.
pub struct HubContext<'a> {
    state: &'a mut State,
    types: &'a StreamTypeRegistry,
    waker: &'a Waker,
    current: Option<StreamId>,
    pending_created: Vec<StreamId>,
    close_current: bool,
}

impl HubContext<'_> {
    pub fn stream(&self, id: StreamId) -> Option<&dyn SelectableStream> {
        self.state.stream(id)
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut dyn SelectableStream> {
        self.state.stream_mut(id)
    }

    /// The datagram surface of a stream, for `udp:` streams.
    pub fn packet_stream_mut(&mut self, id: StreamId) -> Option<&mut dyn PacketStream> {
        self.state.stream_mut(id).and_then(|s| s.as_packet_stream())
    }

    /// Ids of every non-listener stream, in creation order.
    pub fn data_streams(&self) -> Vec<StreamId> {
        self.state.data_streams()
    }

    /// Create a stream from a target, as [`Hub::connect`] does.
    pub fn connect(&mut self, target: &str) -> Result<StreamId> {
        let id = self.state.create_stream(self.types, target)?;
        let listener = self.state.streams.get(&id).is_some_and(|e| e.listener);
        if !listener {
            self.pending_created.push(id);
        }
        Ok(id)
    }

    /// Remove and destroy a stream without firing `connection_closed`.
    ///
    /// Closing the stream currently being dispatched is deferred until the
    /// callback returns.
    pub fn close_stream(&mut self, id: StreamId) {
        if self.current == Some(id) {
            self.close_current = true;
            return;
        }
        self.state.remove_stream(id);
    }

    /// Request the event loop to stop, as [`Hub::stop`] does.
    pub fn stop(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(target: "streamhub::hub", error = %e, "cannot signal the wakeup primitive");
        }
    }
}

/// Immutable surroundings threaded through dispatch.
struct DispatchEnv<'a> {
    types: &'a StreamTypeRegistry,
    waker: &'a Waker,
    resolve_incoming_names: bool,
}

#[derive(PartialEq)]
enum StreamFate {
    Alive,
    Removed,
}

/// Run one callback with a fresh context, then apply the mutations the
/// callback queued: deferred close of the current stream first, then the
/// `connection_created` chain of any streams it added.
fn run_callback<H, R>(
    handler: &mut H,
    state: &mut State,
    env: &DispatchEnv<'_>,
    current: Option<StreamId>,
    invoke: impl FnOnce(&mut H, &mut HubContext<'_>) -> R,
) -> Result<R>
where
    H: HubHandler,
{
    let mut ctx = HubContext {
        state: &mut *state,
        types: env.types,
        waker: env.waker,
        current,
        pending_created: Vec::new(),
        close_current: false,
    };
    let result = invoke(handler, &mut ctx);
    let pending = std::mem::take(&mut ctx.pending_created);
    let close_current = ctx.close_current;
    drop(ctx);

    if close_current {
        if let Some(id) = current {
            state.remove_stream(id);
        }
    }
    for child in pending {
        fire_created(handler, state, env, child)?;
    }
    Ok(result)
}

/// Deliver `connection_created` for a freshly inserted data stream.
fn fire_created<H: HubHandler>(
    handler: &mut H,
    state: &mut State,
    env: &DispatchEnv<'_>,
    id: StreamId,
) -> Result<()> {
    run_callback(handler, state, env, Some(id), |handler, ctx| {
        handler.connection_created(ctx, id)
    })?
}

/// Deliver `connection_closed` and destroy the stream.
fn fire_closed<H: HubHandler>(
    handler: &mut H,
    state: &mut State,
    env: &DispatchEnv<'_>,
    id: StreamId,
    abnormal: bool,
) -> Result<()> {
    if !state.contains(id) {
        return Ok(());
    }
    debug!(target: "streamhub::hub", %id, abnormal, "connection closed");
    run_callback(handler, state, env, Some(id), |handler, ctx| {
        handler.connection_closed(ctx, id, abnormal)
    })?;
    state.remove_stream(id);
    Ok(())
}

/// Deliver `incoming_data` while the stream holds buffered bytes.
///
/// A callback error is swallowed; the stream's failed flag then decides
/// whether an abnormal close follows. A callback that consumes nothing
/// fails the stream with `PreviousIncomingDataNotRead`.
fn deliver_buffered<H: HubHandler>(
    handler: &mut H,
    state: &mut State,
    env: &DispatchEnv<'_>,
    id: StreamId,
) -> Result<StreamFate> {
    loop {
        let Some(stream) = state.stream_mut(id) else {
            return Ok(StreamFate::Removed);
        };
        if !stream.is_data_in_recv_buffer() {
            return Ok(StreamFate::Alive);
        }
        let before = stream.recv_buffered_len();

        let callback_result = run_callback(handler, state, env, Some(id), |handler, ctx| {
            handler.incoming_data(ctx, id)
        })?;
        if let Err(e) = callback_result {
            debug!(target: "streamhub::hub", %id, error = %e, "incoming_data error swallowed");
        }

        let Some(stream) = state.stream_mut(id) else {
            return Ok(StreamFate::Removed);
        };
        if stream.failed() {
            fire_closed(handler, state, env, id, true)?;
            return Ok(StreamFate::Removed);
        }
        if before > 0 && stream.recv_buffered_len() == before {
            let err = stream.core_mut().fail(
                ErrorKind::PreviousIncomingDataNotRead,
                None,
                "the incoming data was not read by the handler.",
            );
            debug!(target: "streamhub::hub", %id, error = %err, "handler did not consume data");
            fire_closed(handler, state, env, id, true)?;
            return Ok(StreamFate::Removed);
        }
    }
}

/// Dispatch a read-readiness notification on a data stream: refill the
/// read-ahead state, deliver buffered bytes, detect remote closure.
fn dispatch_data_readable<H: HubHandler>(
    handler: &mut H,
    state: &mut State,
    env: &DispatchEnv<'_>,
    id: StreamId,
    activity: &mut bool,
) -> Result<()> {
    loop {
        let status = {
            let Some(stream) = state.stream_mut(id) else {
                return Ok(());
            };
            match stream.fill_recv_buffer() {
                Ok(status) => status,
                Err(e) => {
                    *activity = true;
                    debug!(target: "streamhub::hub", %id, error = %e, "stream failed while receiving");
                    fire_closed(handler, state, env, id, true)?;
                    return Ok(());
                }
            }
        };
        match status {
            FillStatus::Eof => {
                *activity = true;
                fire_closed(handler, state, env, id, false)?;
                return Ok(());
            }
            FillStatus::WouldBlock => return Ok(()),
            FillStatus::Filled => {
                *activity = true;
                if deliver_buffered(handler, state, env, id)? == StreamFate::Removed {
                    return Ok(());
                }
                // Edge-triggered poller: drain until the OS runs dry.
            }
            FillStatus::Latched => {
                *activity = true;
                deliver_buffered(handler, state, env, id)?;
                return Ok(());
            }
        }
    }
}

/// Accept every pending child off a ready listener, connecting each one.
fn dispatch_accept<H: HubHandler>(
    handler: &mut H,
    state: &mut State,
    env: &DispatchEnv<'_>,
    id: StreamId,
    activity: &mut bool,
) -> Result<()> {
    loop {
        let target = {
            let Some(stream) = state.stream_mut(id) else {
                return Ok(());
            };
            match stream.accept_target(env.resolve_incoming_names)? {
                Some(target) => target,
                None => return Ok(()),
            }
        };
        *activity = true;
        trace!(target: "streamhub::hub", listener = %id, child = %target, "accepting");
        let child = state.create_stream(env.types, &target)?;
        fire_created(handler, state, env, child)?;
    }
}

/// The central owner of streams: creates and destroys them, waits for
/// readiness on all of them at once, and dispatches callbacks.
///
/// The handler value lives inside the hub (it is the Rust rendition of
/// subclassing the hub) and is reachable through [`Hub::handler`] /
/// [`Hub::handler_mut`].
pub struct Hub<H: HubHandler> {
    handler: H,
    poll: Poll,
    events: Events,
    state: Arc<Mutex<State>>,
    waker: Arc<Waker>,
    types: StreamTypeRegistry,
    resolve_incoming_names: bool,
}

impl<H: HubHandler> Hub<H> {
    /// A hub that reverse-resolves the peer names of accepted connections.
    pub fn new(handler: H) -> Result<Self> {
        Self::with_resolve_incoming_names(handler, true)
    }

    /// A hub with explicit control over peer-name resolution on accept.
    pub fn with_resolve_incoming_names(handler: H, resolve_incoming_names: bool) -> Result<Self> {
        let poll = Poll::new().map_err(|e| {
            StreamError::with_source(ErrorKind::Unknown, "cannot create the readiness poller.", e)
        })?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(|e| {
            StreamError::with_source(ErrorKind::Unknown, "cannot create the wakeup primitive.", e)
        })?;
        let poll_registry = poll.registry().try_clone().map_err(|e| {
            StreamError::with_source(ErrorKind::Unknown, "cannot clone the poller registry.", e)
        })?;
        Ok(Self {
            handler,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            state: Arc::new(Mutex::new(State {
                streams: BTreeMap::new(),
                next_id: 0,
                poll_registry,
            })),
            waker: Arc::new(waker),
            types: StreamTypeRegistry::default(),
            resolve_incoming_names,
        })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// The protocol registry, for registering application stream types.
    pub fn registry_mut(&mut self) -> &mut StreamTypeRegistry {
        &mut self.types
    }

    /// Create a stream from a target and take ownership of it.
    ///
    /// For data streams, `connection_created` fires before this returns; a
    /// handler error propagates to the caller, with the stream already in
    /// the hub's set.
    pub fn connect(&mut self, target: &str) -> Result<StreamId> {
        let env = DispatchEnv {
            types: &self.types,
            waker: &self.waker,
            resolve_incoming_names: self.resolve_incoming_names,
        };
        let mut guard = lock_state(&self.state);
        let id = guard.create_stream(env.types, target)?;
        let listener = guard.streams.get(&id).is_some_and(|e| e.listener);
        if !listener {
            fire_created(&mut self.handler, &mut guard, &env, id)?;
        }
        Ok(id)
    }

    /// Remove a stream and destroy it. Does not fire `connection_closed`,
    /// and does nothing for an id that no longer resolves.
    pub fn close_stream(&mut self, id: StreamId) {
        lock_state(&self.state).remove_stream(id);
    }

    /// Wait for readiness, dispatch callbacks, and drain all activity.
    ///
    /// `None` blocks until something happens, `Some(Duration::ZERO)` polls.
    /// Returns `Ok(false)` once a stop was requested.
    pub fn step(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let env = DispatchEnv {
            types: &self.types,
            waker: &self.waker,
            resolve_incoming_names: self.resolve_incoming_names,
        };
        let mut first_poll = true;
        let mut interrupted = false;
        let mut guard = lock_state(&self.state);

        loop {
            let mut activity = false;

            // Streams the poller cannot watch are serviced once per pass, so
            // their presence degrades the wait into a poll.
            let always_ready: Vec<StreamId> = guard
                .streams
                .iter()
                .filter(|(_, e)| {
                    !e.registered && !e.listener && !e.stream.write_only() && !e.stream.failed()
                })
                .map(|(id, _)| *id)
                .collect();

            let poll_timeout = if first_poll && always_ready.is_empty() {
                timeout
            } else {
                Some(Duration::ZERO)
            };
            first_poll = false;

            // The lock is dropped only across the wait itself.
            drop(guard);
            loop {
                match self.poll.poll(&mut self.events, poll_timeout) {
                    Ok(()) => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        return Err(StreamError::with_source(
                            ErrorKind::SyncError,
                            "error during poll.",
                            e,
                        ))
                    }
                }
            }
            guard = lock_state(&self.state);

            let mut ready = Vec::with_capacity(EVENTS_CAPACITY);
            for event in self.events.iter() {
                if event.token() == WAKER_TOKEN {
                    trace!(target: "streamhub::hub", "wakeup received");
                    interrupted = true;
                    continue;
                }
                ready.push((
                    StreamId(event.token().0),
                    event.is_error(),
                    event.is_readable(),
                    event.is_read_closed(),
                ));
            }

            for (id, is_error, is_readable, is_read_closed) in ready {
                let state = &mut *guard;
                let Some(entry) = state.streams.get_mut(&id) else {
                    // Removed by an earlier callback in this same pass.
                    continue;
                };
                let listener = entry.listener;
                if is_error {
                    activity = true;
                    let err = entry.stream.core_mut().fail(
                        ErrorKind::SyncError,
                        None,
                        "error on stream during poll.",
                    );
                    debug!(target: "streamhub::hub", %id, error = %err, "poll reported stream error");
                    fire_closed(&mut self.handler, state, &env, id, true)?;
                } else if listener {
                    if is_readable {
                        dispatch_accept(&mut self.handler, state, &env, id, &mut activity)?;
                    }
                } else if is_readable {
                    // Readable first: buffered bytes are delivered before a
                    // hangup is honored, so nothing sent before the close is
                    // lost.
                    dispatch_data_readable(&mut self.handler, state, &env, id, &mut activity)?;
                } else if is_read_closed {
                    activity = true;
                    fire_closed(&mut self.handler, state, &env, id, false)?;
                }
            }

            for id in always_ready {
                dispatch_data_readable(&mut self.handler, &mut guard, &env, id, &mut activity)?;
            }

            // Sweep streams failed by callbacks that wrote to them.
            let failed: Vec<StreamId> = guard
                .streams
                .iter()
                .filter(|(_, e)| e.stream.failed())
                .map(|(id, _)| *id)
                .collect();
            for id in failed {
                fire_closed(&mut self.handler, &mut guard, &env, id, true)?;
            }

            if !activity || interrupted {
                break;
            }
        }
        Ok(!interrupted)
    }

    /// Run the event loop until a stop is requested.
    pub fn run(&mut self) -> Result<()> {
        while self.step(None)? {}
        Ok(())
    }

    /// Request a running [`Hub::run`] / [`Hub::step`] to return. The only
    /// hub operation that is safe from any thread without the lock.
    pub fn stop(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(target: "streamhub::hub", error = %e, "cannot signal the wakeup primitive");
        }
    }

    /// Lock the stream set for direct access between iterations.
    pub fn lock(&self) -> StreamsGuard<'_> {
        StreamsGuard {
            guard: lock_state(&self.state),
        }
    }

    /// A clonable, thread-safe handle carrying [`HubHandle::stop`] and
    /// [`HubHandle::lock`] to other threads.
    pub fn handle(&self) -> HubHandle {
        HubHandle {
            state: Arc::clone(&self.state),
            waker: Arc::clone(&self.waker),
        }
    }
}

impl<H: HubHandler> Drop for Hub<H> {
    fn drop(&mut self) {
        let mut guard = lock_state(&self.state);
        let ids: Vec<StreamId> = guard.streams.keys().copied().collect();
        for id in ids {
            guard.remove_stream(id);
        }
    }
}

/// RAII lock over a hub's stream set, for inspection and I/O from outside
/// the callbacks. Holding it keeps the event loop from advancing.
pub struct StreamsGuard<'a> {
    guard: MutexGuard<'a, State>,
}

impl StreamsGuard<'_> {
    pub fn stream(&self, id: StreamId) -> Option<&dyn SelectableStream> {
        self.guard.stream(id)
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut dyn SelectableStream> {
        self.guard.stream_mut(id)
    }

    pub fn packet_stream_mut(&mut self, id: StreamId) -> Option<&mut dyn PacketStream> {
        self.guard.stream_mut(id).and_then(|s| s.as_packet_stream())
    }

    /// Ids of every owned stream, in creation order.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.guard.streams.keys().copied().collect()
    }

    /// Ids of every non-listener stream, in creation order.
    pub fn data_streams(&self) -> Vec<StreamId> {
        self.guard.data_streams()
    }
}

/// Thread-safe view of a hub: stopping the loop and locking the streams.
#[derive(Clone)]
pub struct HubHandle {
    state: Arc<Mutex<State>>,
    waker: Arc<Waker>,
}

impl HubHandle {
    /// Request the hub's event loop to stop.
    pub fn stop(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(target: "streamhub::hub", error = %e, "cannot signal the wakeup primitive");
        }
    }

    /// Lock the hub's stream set from this thread.
    pub fn lock(&self) -> StreamsGuard<'_> {
        StreamsGuard {
            guard: lock_state(&self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        created: Vec<StreamId>,
        closed: Vec<(StreamId, bool)>,
    }

    impl HubHandler for Recorder {
        fn connection_created(
            &mut self,
            _ctx: &mut HubContext<'_>,
            stream: StreamId,
        ) -> Result<()> {
            self.created.push(stream);
            Ok(())
        }

        fn connection_closed(&mut self, _ctx: &mut HubContext<'_>, stream: StreamId, abnormal: bool) {
            self.closed.push((stream, abnormal));
        }
    }

    #[test]
    fn idle_step_with_zero_timeout_reports_no_stop() {
        let mut hub = Hub::new(Recorder::default()).unwrap();
        assert!(hub.step(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn stop_before_step_interrupts_the_next_wait() {
        let mut hub = Hub::new(Recorder::default()).unwrap();
        hub.stop();
        assert!(!hub.step(None).unwrap());
        // The wakeup is consumed; the next poll runs normally again.
        assert!(hub.step(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn stop_from_handle_interrupts_a_blocking_run() {
        let mut hub = Hub::new(Recorder::default()).unwrap();
        let handle = hub.handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.stop();
        });
        hub.run().unwrap();
        stopper.join().unwrap();
    }

    #[test]
    fn connect_fires_connection_created_for_data_streams() {
        let mut hub = Hub::new(Recorder::default()).unwrap();
        let udp = hub.connect("udp:port=0").unwrap();
        assert_eq!(hub.handler().created, vec![udp]);

        let listener = hub.connect("tcpin:port=0").unwrap();
        assert_eq!(hub.handler().created, vec![udp]);
        assert_eq!(hub.lock().stream_ids(), vec![udp, listener]);
        assert_eq!(hub.lock().data_streams(), vec![udp]);
    }

    #[test]
    fn close_stream_is_idempotent_and_silent() {
        let mut hub = Hub::new(Recorder::default()).unwrap();
        let udp = hub.connect("udp:port=0").unwrap();
        hub.close_stream(udp);
        hub.close_stream(udp);
        assert!(hub.lock().stream_ids().is_empty());
        assert!(hub.handler().closed.is_empty());
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let mut hub = Hub::new(Recorder::default()).unwrap();
        let err = hub.connect("quic:host=nowhere").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTarget);
        assert!(hub.handler().created.is_empty());
    }
}
