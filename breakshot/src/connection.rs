// Copyright 2020 Joyent, Inc.

//! Framed connections owned by a thread context.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, ErrorKind, Read, Write};
use std::panic::{self, AssertUnwindSafe};

use mio::{Interest, Registry, Token};
use slog::{debug, error, trace, Logger};

use crate::error::Error;
use crate::protocol;
use crate::subscription::{Publisher, Subscription};
use crate::thread_context::types::{Event, EventMask};
use crate::thread_context::ThreadContext;
use crate::transport::Transport;

const READ_CHUNK: usize = 16 * 1024;

type Handler = dyn FnMut(&mut AsyncConnection) + Send;

/// What happened to a connection, as seen by the pool that allocated it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    Recycled,
    /// The connection is gone; `was_connected` is false when the transport
    /// never finished connecting.
    Closed { was_connected: bool },
}

pub(crate) type LifecycleHook =
    Box<dyn FnMut(Lifecycle, &ConnectionHandle) + Send>;

// Deferred outcome requested by a handler; applied at the end of the loop
// iteration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Disposition {
    Keep,
    Recycle,
    Close,
}

#[derive(Default)]
struct Handlers {
    read: Publisher<Handler>,
    write: Publisher<Handler>,
    error: Publisher<Handler>,
    close: Publisher<Handler>,
    recycle: Publisher<Handler>,
}

impl Handlers {
    fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
        self.error.clear();
        self.close.clear();
        self.recycle.clear();
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Read,
    Write,
    Error,
    Close,
    Recycle,
}

/// One transport plus its framing buffers and event handlers.
///
/// A connection lives in the slot map of exactly one `LoopContext` and all of
/// its handlers run on that loop's thread. Outgoing frames queued with
/// [`send`](AsyncConnection::send) are flushed by the loop; incoming frames
/// are handed out by [`recv`](AsyncConnection::recv) from a read handler.
pub struct AsyncConnection {
    token: Token,
    name: String,
    context: ThreadContext,
    socket: Box<dyn Transport>,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    writable: bool,
    connected: bool,
    events: EventMask,
    leases: u64,
    failure: Option<String>,
    failure_reported: bool,
    disposition: Disposition,
    handlers: Handlers,
    lifecycle: Option<LifecycleHook>,
    log: Logger,
}

impl AsyncConnection {
    pub(crate) fn new(
        token: Token,
        name: String,
        context: ThreadContext,
        socket: Box<dyn Transport>,
        connected: bool,
        log: Logger,
    ) -> Self {
        AsyncConnection {
            token,
            name,
            context,
            socket,
            inbound: Vec::new(),
            outbound: Vec::new(),
            writable: false,
            connected,
            events: EventMask::default(),
            leases: 0,
            failure: None,
            failure_reported: false,
            disposition: Disposition::Keep,
            handlers: Handlers::default(),
            lifecycle: None,
            log,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A sendable reference to this connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            context: self.context.clone(),
            token: self.token,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Number of times this connection was handed out by its pool.
    pub fn lease_count(&self) -> u64 {
        self.leases
    }

    /// The transport failure that is about to close this connection, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn on_read<F>(&mut self, handler: F) -> Subscription
    where
        F: FnMut(&mut AsyncConnection) + Send + 'static,
    {
        self.handlers.read.subscribe(Box::new(handler))
    }

    pub fn on_write<F>(&mut self, handler: F) -> Subscription
    where
        F: FnMut(&mut AsyncConnection) + Send + 'static,
    {
        self.handlers.write.subscribe(Box::new(handler))
    }

    pub fn on_error<F>(&mut self, handler: F) -> Subscription
    where
        F: FnMut(&mut AsyncConnection) + Send + 'static,
    {
        self.handlers.error.subscribe(Box::new(handler))
    }

    pub fn on_close<F>(&mut self, handler: F) -> Subscription
    where
        F: FnMut(&mut AsyncConnection) + Send + 'static,
    {
        self.handlers.close.subscribe(Box::new(handler))
    }

    pub fn on_recycle<F>(&mut self, handler: F) -> Subscription
    where
        F: FnMut(&mut AsyncConnection) + Send + 'static,
    {
        self.handlers.recycle.subscribe(Box::new(handler))
    }

    /// Select which events are delivered to handlers. Events outside the mask
    /// still update the connection state; they are just not published.
    pub fn set_events(&mut self, events: &[Event]) {
        self.events = EventMask::of(events);
    }

    pub fn events(&self) -> EventMask {
        self.events
    }

    /// Queue one message for delivery as a single frame.
    pub fn send(&mut self, body: &[u8]) {
        self.outbound.extend_from_slice(&protocol::frame(body));
    }

    /// Pop the next complete incoming message.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        match protocol::take_frame(&mut self.inbound) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(e.to_string());
                None
            }
        }
    }

    /// Hand the connection back to its pool once the current handler
    /// returns. User handlers are cleared before the pool sees it again.
    pub fn recycle(&mut self) {
        if self.disposition == Disposition::Keep {
            self.disposition = Disposition::Recycle;
        }
    }

    /// Close the connection once the current handler returns.
    pub fn close(&mut self) {
        self.disposition = Disposition::Close;
    }

    pub(crate) fn begin_lease(&mut self) -> u64 {
        self.leases += 1;
        self.leases
    }

    pub(crate) fn set_lifecycle_hook(&mut self, hook: LifecycleHook) {
        self.lifecycle = Some(hook);
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(
            &mut *self.socket,
            self.token,
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    pub(crate) fn disposition(&self) -> Disposition {
        self.disposition
    }

    fn fail(&mut self, reason: String) {
        if self.failure.is_none() {
            debug!(self.log, "connection failed";
                "connection" => &self.name, "reason" => &reason);
            self.failure = Some(reason);
        }
    }

    fn check_connected(&mut self) {
        if self.connected {
            return;
        }
        match self.socket.take_error() {
            Ok(None) => {
                trace!(self.log, "connection established";
                    "connection" => &self.name, "peer" => self.socket.peer());
                self.connected = true;
            }
            Ok(Some(e)) | Err(e) => self.fail(format!("connect: {}", e)),
        }
    }

    // Readiness reported by the poller.
    pub(crate) fn handle_readiness(&mut self, event: &mio::event::Event) {
        if event.is_writable() {
            self.check_connected();
            self.writable = true;
            self.flush();
        }
        if event.is_readable() || event.is_read_closed() {
            if !self.connected {
                self.check_connected();
            }
            self.fill();
        }
        if event.is_error() {
            match self.socket.take_error() {
                Ok(Some(e)) | Err(e) => self.fail(e.to_string()),
                Ok(None) => self.fail(String::from("socket error")),
            }
        }
    }

    fn fill(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) => {
                    self.fail(String::from("connection closed by peer"));
                    break;
                }
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(e.to_string());
                    break;
                }
            }
        }
    }

    pub(crate) fn flush(&mut self) {
        while self.writable && self.connected && !self.outbound.is_empty() {
            match self.socket.write(&self.outbound) {
                Ok(0) => {
                    self.fail(String::from("write returned zero bytes"));
                    break;
                }
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.writable = false;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => {
                    self.fail(e.to_string());
                    break;
                }
            }
        }
    }

    fn publish(&mut self, kind: Kind) {
        let mut taken = match kind {
            Kind::Read => self.handlers.read.take(),
            Kind::Write => self.handlers.write.take(),
            Kind::Error => self.handlers.error.take(),
            Kind::Close => self.handlers.close.take(),
            Kind::Recycle => self.handlers.recycle.take(),
        };
        taken.for_each(|handler| {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| handler(&mut *self)));
            if result.is_err() {
                error!(self.log, "connection handler panicked";
                    "connection" => &self.name);
            }
        });
        match kind {
            Kind::Read => self.handlers.read.restore(taken),
            Kind::Write => self.handlers.write.restore(taken),
            Kind::Error => self.handlers.error.restore(taken),
            Kind::Close => self.handlers.close.restore(taken),
            Kind::Recycle => self.handlers.recycle.restore(taken),
        }
    }

    fn read_ready(&self) -> bool {
        self.events.contains(Event::Read)
            && !self.handlers.read.is_empty()
            && protocol::has_frame(&self.inbound)
    }

    fn write_ready(&self) -> bool {
        self.events.contains(Event::Write)
            && self.writable
            && self.connected
            && !self.handlers.write.is_empty()
    }

    /// Level-triggered delivery: runs once per loop iteration.
    pub(crate) fn pump(&mut self) {
        self.flush();
        if self.failure.is_some() {
            if !self.failure_reported {
                self.failure_reported = true;
                if self.events.contains(Event::Error) {
                    self.publish(Kind::Error);
                }
            }
            self.disposition = Disposition::Close;
            return;
        }
        if self.disposition != Disposition::Keep {
            return;
        }
        if self.read_ready() {
            self.publish(Kind::Read);
        }
        if self.disposition == Disposition::Keep && self.write_ready() {
            self.publish(Kind::Write);
        }
        self.flush();
    }

    /// True when another pump would deliver something right away.
    pub(crate) fn has_pending_work(&self) -> bool {
        self.disposition != Disposition::Keep
            || (self.failure.is_some() && !self.failure_reported)
            || self.read_ready()
            || self.write_ready()
    }

    /// Apply a requested recycle: notify, clear user handlers, reset the
    /// event mask and tell the owning pool.
    pub(crate) fn finish_recycle(&mut self) {
        self.publish(Kind::Recycle);
        self.handlers.clear();
        self.events = EventMask::default();
        self.disposition = Disposition::Keep;
        trace!(self.log, "connection recycled"; "connection" => &self.name);
        self.notify_lifecycle(Lifecycle::Recycled);
    }

    /// Tear down a connection already removed from its loop's slot map.
    pub(crate) fn finish_close(
        &mut self,
        registry: &Registry,
    ) -> io::Result<()> {
        let deregistered = registry.deregister(&mut *self.socket);
        let shutdown = match self.socket.shutdown() {
            Err(ref e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            other => other,
        };
        self.publish(Kind::Close);
        self.handlers.clear();
        debug!(self.log, "connection closed"; "connection" => &self.name);
        self.notify_lifecycle(Lifecycle::Closed {
            was_connected: self.connected,
        });
        deregistered.and(shutdown)
    }

    fn notify_lifecycle(&mut self, event: Lifecycle) {
        let handle = self.handle();
        if let Some(hook) = self.lifecycle.as_mut() {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| hook(event, &handle)));
            if result.is_err() {
                error!(self.log, "lifecycle hook panicked";
                    "connection" => &self.name);
            }
        }
    }
}

impl fmt::Debug for AsyncConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AsyncConnection")
            .field("token", &self.token)
            .field("name", &self.name)
            .field("connected", &self.connected)
            .field("events", &self.events)
            .field("leases", &self.leases)
            .field("failure", &self.failure)
            .finish()
    }
}

/// Names a connection from any thread: the context that owns it and its
/// token in that context's slot map.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub context: ThreadContext,
    pub token: Token,
}

impl ConnectionHandle {
    /// Run `f` against the connection on its owning thread. `f` is dropped
    /// without running if the connection is gone by then.
    pub fn with<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut AsyncConnection) + Send + 'static,
    {
        let token = self.token;
        self.context.do_in_thread(move |lc| {
            if let Some(connection) = lc.connection_mut(token) {
                f(connection);
            }
        })
    }

    pub fn recycle(&self) -> Result<(), Error> {
        self.with(|c| c.recycle())
    }

    pub fn close(&self) -> Result<(), Error> {
        self.with(|c| c.close())
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &ConnectionHandle) -> bool {
        self.context.index() == other.context.index()
            && self.token == other.token
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.context.index().hash(state);
        self.token.hash(state);
    }
}
