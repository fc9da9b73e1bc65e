// Copyright 2020 Joyent, Inc.

//! Single-threaded event loops that own connections.
//!
//! A [`ThreadContextPool`] starts a fixed number of threads. Each thread runs
//! a loop around its own `mio::Poll`, owns every connection placed on it, and
//! accepts work from other threads through its [`ThreadContext`] handle.
//! One iteration of a loop:
//!
//! 1. poll for readiness (one second, or not at all when work is pending)
//! 2. run tasks queued with [`ThreadContext::do_in_thread`]
//! 3. move bytes for every ready socket
//! 4. deliver read and write events to connection handlers
//! 5. apply recycles and closes requested by handlers
//! 6. run the post-loop hooks
//!
//! Nothing that runs on a loop may block; pool acquisition in particular must
//! happen on other threads.

pub mod types;

use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slog::{debug, error, info, o, trace, warn, Drain, Logger};

use crate::connection::{AsyncConnection, ConnectionHandle, Disposition};
use crate::error::Error;
use crate::subscription::Subscription;
use crate::thread_context::types::{
    Command, PostLoopHook, ThreadContextPoolOptions,
};
use crate::transport::{SocketFactory, Transport};

const WAKE_TOKEN: Token = Token(0);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const EVENTS_CAPACITY: usize = 256;
const DEFAULT_NAME: &str = "breakshot";

/// Default number of event loop threads: one per CPU plus one.
pub fn default_io_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        + 1
}

struct ContextShared {
    index: usize,
    name: String,
    sender: Mutex<Sender<Command>>,
    waker: Waker,
    running: AtomicBool,
}

/// Cross-thread handle to one event loop.
#[derive(Clone)]
pub struct ThreadContext {
    shared: Arc<ContextShared>,
}

impl ThreadContext {
    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        self.shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(command)
            .map_err(|_| Error::NotRunning)?;
        self.shared.waker.wake()?;
        Ok(())
    }

    /// Schedule `task` on this loop's thread. Never blocks.
    pub fn do_in_thread<F>(&self, task: F) -> Result<(), Error>
    where
        F: FnOnce(&mut LoopContext) + Send + 'static,
    {
        self.send(Command::Task(Box::new(task)))
    }

    /// Run `hook` once per loop iteration until its subscription is
    /// cancelled. The hook receives its own subscription so it can cancel
    /// itself.
    pub fn on_post_loop<F>(&self, hook: F) -> Result<Subscription, Error>
    where
        F: FnMut(&mut LoopContext, &Subscription) + Send + 'static,
    {
        let subscription = Subscription::new();
        self.send(Command::PostLoop(subscription.clone(), Box::new(hook)))?;
        Ok(subscription)
    }

    /// Allocate a connection on this loop. The handle is delivered to
    /// `on_allocated` on the loop thread.
    pub fn allocate_new_connection<F>(
        &self,
        name: String,
        factory: SocketFactory,
        on_allocated: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut LoopContext, io::Result<ConnectionHandle>)
            + Send
            + 'static,
    {
        self.do_in_thread(move |lc| {
            let result = lc.allocate_new_connection(name, &factory);
            on_allocated(lc, result)
        })
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("index", &self.shared.index)
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Hands out thread contexts in rotation. Cheap to clone; clones share the
/// rotation.
#[derive(Clone, Debug)]
pub struct ContextSelector {
    contexts: Arc<Vec<ThreadContext>>,
    next: Arc<AtomicUsize>,
}

impl ContextSelector {
    fn new(contexts: Vec<ThreadContext>) -> Self {
        ContextSelector {
            contexts: Arc::new(contexts),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn next(&self) -> ThreadContext {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.contexts[n % self.contexts.len()].clone()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn contexts(&self) -> &[ThreadContext] {
        &self.contexts
    }
}

/// A fixed set of event loop threads.
pub struct ThreadContextPool {
    selector: ContextSelector,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    running: AtomicBool,
    log: Logger,
}

impl ThreadContextPool {
    pub fn start(options: ThreadContextPoolOptions) -> Result<Self, Error> {
        let io_threads = options.io_threads.unwrap_or_else(default_io_threads);
        if io_threads == 0 {
            return Err(Error::InvalidConfiguration(String::from(
                "io_threads must be at least 1",
            )));
        }
        let name = options.name.unwrap_or_else(|| DEFAULT_NAME.to_string());
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("thread_context_pool" => name.clone()));

        // Every thread builds its poller and publishes its handle before the
        // barrier releases start().
        let barrier = Arc::new(Barrier::new(io_threads + 1));
        let (ready_tx, ready_rx) = channel();
        let mut threads = Vec::with_capacity(io_threads);

        for index in 0..io_threads {
            let barrier_clone = barrier.clone();
            let ready_tx = ready_tx.clone();
            let thread_name = format!("{}-io-{}", name, index);
            let thread_log = log.new(o!("thread" => index));
            let context_name = thread_name.clone();
            let spawned = thread::Builder::new().name(thread_name).spawn(
                move || {
                    let built =
                        LoopContext::build(index, context_name, thread_log);
                    match built {
                        Ok((loop_context, handle)) => {
                            let _ = ready_tx.send(Ok(handle));
                            drop(ready_tx);
                            barrier_clone.wait();
                            loop_context.run();
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            drop(ready_tx);
                            barrier_clone.wait();
                        }
                    }
                },
            );
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    error!(log, "failed to spawn event loop thread: {}", e);
                    return Err(Error::Io(e));
                }
            }
        }
        drop(ready_tx);
        barrier.wait();

        let mut contexts = Vec::with_capacity(io_threads);
        let mut failure = None;
        for ready in ready_rx.iter() {
            match ready {
                Ok(context) => contexts.push(context),
                Err(e) => failure = Some(e),
            }
        }
        contexts.sort_by_key(|c: &ThreadContext| c.index());

        let pool = ThreadContextPool {
            selector: ContextSelector::new(contexts),
            threads: Mutex::new(threads),
            running: AtomicBool::new(true),
            log,
        };

        if let Some(e) = failure {
            let _ = pool.stop();
            return Err(Error::Io(e));
        }

        info!(pool.log, "started {} event loop thread(s)", io_threads);
        Ok(pool)
    }

    /// The next context in round-robin order.
    pub fn next(&self) -> ThreadContext {
        self.selector.next()
    }

    pub fn selector(&self) -> ContextSelector {
        self.selector.clone()
    }

    pub fn len(&self) -> usize {
        self.selector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selector.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shut down every loop, closing all of their connections and
    /// listeners, then join the threads. Must not be called from a loop.
    pub fn stop(&self) -> Result<(), Error> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        trace!(self.log, "stopping event loops");
        for context in self.selector.contexts() {
            if let Err(e) = context.send(Command::Shutdown) {
                warn!(self.log, "failed to signal event loop {}: {}",
                    context.index(), e);
            }
        }
        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in threads {
            if handle.join().is_err() {
                error!(self.log, "event loop thread panicked");
            }
        }
        info!(self.log, "event loops stopped");
        Ok(())
    }
}

impl Drop for ThreadContextPool {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

impl fmt::Debug for ThreadContextPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadContextPool")
            .field("contexts", &self.selector.len())
            .field("running", &self.is_running())
            .finish()
    }
}

struct Listener {
    socket: TcpListener,
    on_accept: Box<dyn FnMut(&mut AsyncConnection) + Send>,
}

/// The state of one event loop, only reachable from its own thread.
pub struct LoopContext {
    handle: ThreadContext,
    poll: Poll,
    receiver: Receiver<Command>,
    connections: HashMap<Token, AsyncConnection>,
    listeners: HashMap<Token, Listener>,
    post_loop: Vec<(Subscription, PostLoopHook)>,
    next_token: usize,
    running: bool,
    log: Logger,
}

impl LoopContext {
    fn build(
        index: usize,
        name: String,
        log: Logger,
    ) -> io::Result<(LoopContext, ThreadContext)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (sender, receiver) = channel();
        let handle = ThreadContext {
            shared: Arc::new(ContextShared {
                index,
                name,
                sender: Mutex::new(sender),
                waker,
                running: AtomicBool::new(true),
            }),
        };
        let loop_context = LoopContext {
            handle: handle.clone(),
            poll,
            receiver,
            connections: HashMap::new(),
            listeners: HashMap::new(),
            post_loop: Vec::new(),
            next_token: WAKE_TOKEN.0 + 1,
            running: true,
            log,
        };
        Ok((loop_context, handle))
    }

    /// The cross-thread handle of this loop.
    pub fn thread_context(&self) -> &ThreadContext {
        &self.handle
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Build a transport with `factory` and register it for read and write
    /// readiness on this loop.
    pub fn allocate_new_connection(
        &mut self,
        name: String,
        factory: &SocketFactory,
    ) -> io::Result<ConnectionHandle> {
        let socket = factory()?;
        let token = self.allocate_token();
        let handle = self.insert_connection(token, name, socket, false)?;
        trace!(self.log, "allocated connection"; "token" => token.0);
        Ok(handle)
    }

    fn insert_connection(
        &mut self,
        token: Token,
        name: String,
        socket: Box<dyn Transport>,
        connected: bool,
    ) -> io::Result<ConnectionHandle> {
        let log = self.log.new(o!("connection" => name.clone()));
        let mut connection = AsyncConnection::new(
            token,
            name,
            self.handle.clone(),
            socket,
            connected,
            log,
        );
        connection.register(self.poll.registry())?;
        let handle = connection.handle();
        self.connections.insert(token, connection);
        Ok(handle)
    }

    pub fn connection_mut(
        &mut self,
        token: Token,
    ) -> Option<&mut AsyncConnection> {
        self.connections.get_mut(&token)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close a connection right away, publishing its close event. Closing a
    /// connection that is already gone is not an error.
    pub fn close_connection(&mut self, token: Token) -> io::Result<()> {
        match self.connections.remove(&token) {
            Some(mut connection) => {
                connection.finish_close(self.poll.registry())
            }
            None => Ok(()),
        }
    }

    /// Listen on `addr`. Each accepted stream becomes a connection on this
    /// loop and is handed to `on_accept` to install its handlers.
    pub fn listen<F>(
        &mut self,
        addr: SocketAddr,
        on_accept: F,
    ) -> io::Result<(Token, SocketAddr)>
    where
        F: FnMut(&mut AsyncConnection) + Send + 'static,
    {
        let mut socket = TcpListener::bind(addr)?;
        let local = socket.local_addr()?;
        let token = self.allocate_token();
        self.poll
            .registry()
            .register(&mut socket, token, Interest::READABLE)?;
        self.listeners.insert(
            token,
            Listener {
                socket,
                on_accept: Box::new(on_accept),
            },
        );
        info!(self.log, "listening"; "address" => local.to_string());
        Ok((token, local))
    }

    pub fn close_listener(&mut self, token: Token) -> io::Result<()> {
        match self.listeners.remove(&token) {
            Some(mut listener) => {
                self.poll.registry().deregister(&mut listener.socket)
            }
            None => Ok(()),
        }
    }

    fn accept(&mut self, token: Token) {
        let mut accepted: Vec<(TcpStream, SocketAddr)> = Vec::new();
        if let Some(listener) = self.listeners.get_mut(&token) {
            loop {
                match listener.socket.accept() {
                    Ok(pair) => accepted.push(pair),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e)
                        if e.kind() == ErrorKind::ConnectionAborted
                            || e.kind() == ErrorKind::ConnectionReset =>
                    {
                        warn!(self.log, "transient accept failure: {}", e);
                    }
                    Err(e) => {
                        error!(self.log, "accept failed: {}", e);
                        break;
                    }
                }
            }
        }

        for (stream, peer) in accepted {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(self.log, "set_nodelay failed: {}", e);
            }
            let conn_token = self.allocate_token();
            let name = format!("accepted:{}", peer);
            let inserted = self.insert_connection(
                conn_token,
                name,
                Box::new(stream),
                true,
            );
            if let Err(e) = inserted {
                warn!(self.log, "failed to register accepted stream: {}", e);
                continue;
            }
            let mut on_accept = match self.listeners.get_mut(&token) {
                Some(listener) => std::mem::replace(
                    &mut listener.on_accept,
                    Box::new(|_| ()),
                ),
                None => continue,
            };
            if let Some(connection) = self.connections.get_mut(&conn_token) {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    on_accept(connection)
                }));
                if result.is_err() {
                    error!(self.log, "accept handler panicked");
                }
            }
            if let Some(listener) = self.listeners.get_mut(&token) {
                listener.on_accept = on_accept;
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.receiver.try_recv() {
            match command {
                Command::Task(task) => {
                    let result =
                        panic::catch_unwind(AssertUnwindSafe(|| task(self)));
                    if result.is_err() {
                        error!(self.log, "task panicked");
                    }
                }
                Command::PostLoop(subscription, hook) => {
                    self.post_loop.push((subscription, hook));
                }
                Command::Shutdown => self.running = false,
            }
        }
    }

    fn pump(&mut self) {
        for connection in self.connections.values_mut() {
            connection.pump();
        }
    }

    fn settle(&mut self) {
        let pending: Vec<(Token, Disposition)> = self
            .connections
            .iter()
            .filter(|(_, c)| c.disposition() != Disposition::Keep)
            .map(|(t, c)| (*t, c.disposition()))
            .collect();

        for (token, disposition) in pending {
            match disposition {
                Disposition::Recycle => {
                    if let Some(connection) = self.connections.get_mut(&token)
                    {
                        connection.finish_recycle();
                    }
                }
                Disposition::Close => {
                    if let Err(e) = self.close_connection(token) {
                        debug!(self.log, "error while closing connection";
                            "token" => token.0, "error" => e.to_string());
                    }
                }
                Disposition::Keep => (),
            }
        }
    }

    fn run_post_loop(&mut self) {
        let mut hooks = std::mem::take(&mut self.post_loop);
        hooks.retain(|(s, _)| s.is_active());
        for (subscription, hook) in hooks.iter_mut() {
            if !subscription.is_active() {
                continue;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                hook(self, subscription)
            }));
            if result.is_err() {
                error!(self.log, "post-loop hook panicked");
            }
        }
        hooks.retain(|(s, _)| s.is_active());
        hooks.append(&mut self.post_loop);
        self.post_loop = hooks;
    }

    fn has_pending_work(&self) -> bool {
        self.connections.values().any(|c| c.has_pending_work())
    }

    fn run(mut self) {
        debug!(self.log, "event loop running");
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while self.running {
            let timeout = if self.has_pending_work() {
                Duration::from_millis(0)
            } else {
                POLL_INTERVAL
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != ErrorKind::Interrupted {
                    error!(self.log, "poll failed: {}", e);
                    break;
                }
            }

            self.drain_commands();

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                if self.listeners.contains_key(&token) {
                    self.accept(token);
                } else if let Some(connection) =
                    self.connections.get_mut(&token)
                {
                    connection.handle_readiness(event);
                }
            }

            self.pump();
            self.settle();
            self.run_post_loop();
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.shared.running.store(false, Ordering::SeqCst);
        let tokens: Vec<Token> = self.connections.keys().cloned().collect();
        for token in tokens {
            if let Err(e) = self.close_connection(token) {
                debug!(self.log, "error while closing connection";
                    "token" => token.0, "error" => e.to_string());
            }
        }
        let listeners: Vec<Token> = self.listeners.keys().cloned().collect();
        for token in listeners {
            let _ = self.close_listener(token);
        }
        for (subscription, _) in self.post_loop.drain(..) {
            subscription.unsubscribe();
        }
        // Tasks still queued are dropped unrun.
        while self.receiver.try_recv().is_ok() {}
        debug!(self.log, "event loop stopped");
    }
}

impl fmt::Debug for LoopContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoopContext")
            .field("index", &self.handle.index())
            .field("connections", &self.connections.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    fn test_pool(threads: usize) -> ThreadContextPool {
        let options = ThreadContextPoolOptions {
            io_threads: Some(threads),
            ..Default::default()
        };
        ThreadContextPool::start(options).unwrap()
    }

    #[test]
    fn round_robin_placement() {
        let pool = test_pool(3);
        let picked: Vec<usize> = (0..7).map(|_| pool.next().index()).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2, 0]);
        pool.stop().unwrap();
    }

    #[test]
    fn tasks_run_on_owning_thread() {
        let pool = test_pool(2);
        let (tx, rx) = sync_channel(1);
        let context = pool.next();
        context
            .do_in_thread(move |lc| {
                let name = thread::current().name().map(String::from);
                let _ = tx.send((lc.thread_context().index(), name));
            })
            .unwrap();
        let (index, name) = rx.recv().unwrap();
        assert_eq!(index, 0);
        assert_eq!(name.as_deref(), Some("breakshot-io-0"));
        pool.stop().unwrap();
    }

    #[test]
    fn panicking_task_does_not_kill_loop() {
        let pool = test_pool(1);
        let context = pool.next();
        context.do_in_thread(|_| panic!("boom")).unwrap();
        let (tx, rx) = sync_channel(1);
        context
            .do_in_thread(move |_| {
                let _ = tx.send(());
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        pool.stop().unwrap();
    }

    #[test]
    fn post_loop_hook_can_unsubscribe_itself() {
        let pool = test_pool(1);
        let (tx, rx) = channel();
        let mut runs = 0;
        let subscription = pool
            .next()
            .on_post_loop(move |_, sub| {
                runs += 1;
                let _ = tx.send(runs);
                if runs == 3 {
                    sub.unsubscribe();
                }
            })
            .unwrap();
        // Wake the loop a few times.
        for _ in 0..5 {
            pool.next().do_in_thread(|_| ()).unwrap();
        }
        let mut seen = Vec::new();
        while let Ok(n) = rx.recv_timeout(Duration::from_secs(3)) {
            seen.push(n);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(!subscription.is_active());
        pool.stop().unwrap();
    }

    #[test]
    fn allocated_connections_live_on_their_loop() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let factory = crate::transport::tcp_socket_factory(
            listener.local_addr().unwrap(),
        );
        let pool = test_pool(1);
        let context = pool.next();

        let (tx, rx) = sync_channel(1);
        context
            .allocate_new_connection(String::from("a"), factory, move |lc, allocated| {
                let handle = allocated.unwrap();
                let _ = tx.send((lc.connection_count(), handle));
            })
            .unwrap();
        let (count, handle) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(count, 1);

        let (tx, rx) = sync_channel(1);
        context
            .do_in_thread(move |lc| {
                let _ = lc.close_connection(handle.token);
                let _ = tx.send(lc.connection_count());
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

        // Factory failures are handed to the callback.
        let failing: SocketFactory = Arc::new(|| {
            Err(io::Error::new(io::ErrorKind::Other, "no sockets left"))
        });
        let (tx, rx) = sync_channel(1);
        context
            .allocate_new_connection(String::from("b"), failing, move |lc, allocated| {
                let _ = tx.send((allocated.is_err(), lc.connection_count()));
            })
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            (true, 0)
        );
        pool.stop().unwrap();
    }

    #[test]
    fn stop_twice_is_an_error() {
        let pool = test_pool(1);
        let context = pool.next();
        pool.stop().unwrap();
        assert!(matches!(pool.stop(), Err(Error::NotRunning)));
        assert!(matches!(
            context.do_in_thread(|_| ()),
            Err(Error::NotRunning)
        ));
    }

    #[test]
    fn zero_threads_rejected() {
        let options = ThreadContextPoolOptions {
            io_threads: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            ThreadContextPool::start(options),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
