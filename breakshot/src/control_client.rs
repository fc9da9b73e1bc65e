// Copyright 2020 Joyent, Inc.

//! Request/response client for the control protocol.
//!
//! Every request gets a sequence number from the client and is written to a
//! connection leased from an [`AsyncConnectionPool`]. The connection goes
//! back to the pool when the matching reply arrives and is closed if the
//! transport fails or the request times out while still holding it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use slog::{debug, o, trace, warn, Drain, Logger};
use timer::Guard;

use crate::connection::{AsyncConnection, ConnectionHandle};
use crate::connection_pool::AsyncConnectionPool;
use crate::error::Error;
use crate::id::{InstanceId, NodeId};
use crate::protocol::{
    decode_channel_id, decode_count, ChannelId, Command, InstanceStatus,
    Request, Response, RoutingStatus,
};
use crate::thread_context::types::Event;

// Default request timeout in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 5000;
// Extra time a blocking caller waits past the request timeout
const REPLY_GRACE: Duration = Duration::from_millis(500);

/// The configuration options for a control client.
#[derive(Clone, Debug, Default)]
pub struct ControlClientOptions {
    /// An optional timeout in milliseconds applied to requests issued
    /// without an explicit one. The default is 5000.
    pub request_timeout: Option<u64>,
    /// The instance channels are opened for. A random id is used if none is
    /// given.
    pub origin: Option<InstanceId>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain.
    pub log: Option<Logger>,
}

type ReplyFn = Box<dyn FnOnce(Result<Response, Error>) + Send>;

struct Pending {
    reply: ReplyFn,
    // The connection carrying the request and its lease number once written.
    lease: Option<(ConnectionHandle, u64)>,
    // Set right after the entry is inserted.
    _timeout: Option<Guard>,
}

struct ClientInner {
    pool: AsyncConnectionPool,
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    timer: Mutex<timer::Timer>,
    default_timeout: Duration,
    origin: InstanceId,
    log: Logger,
}

/// Issues control requests over a connection pool. Clones share the pool
/// and the sequence space.
#[derive(Clone)]
pub struct ControlClient {
    inner: Arc<ClientInner>,
}

impl ControlClient {
    pub fn new(pool: AsyncConnectionPool, options: ControlClientOptions) -> Self {
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("control_client" => pool.name().to_string()));
        let default_timeout = Duration::from_millis(
            options.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        );
        ControlClient {
            inner: Arc::new(ClientInner {
                pool,
                seq: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                timer: Mutex::new(timer::Timer::new()),
                default_timeout,
                origin: options.origin.unwrap_or_else(InstanceId::new_random),
                log,
            }),
        }
    }

    pub fn pool(&self) -> &AsyncConnectionPool {
        &self.inner.pool
    }

    /// The instance this client opens channels for.
    pub fn origin(&self) -> &InstanceId {
        &self.inner.origin
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending_lock().len()
    }

    /// Ask the remote instance which nodes it hosts.
    pub fn get_instance_status(
        &self,
        timeout: Option<Duration>,
    ) -> Result<InstanceStatus, Error> {
        let payload = self.request(Command::GetInstanceStatus, timeout)?;
        InstanceStatus::decode(&payload)
    }

    /// Like [`get_instance_status`](ControlClient::get_instance_status) but
    /// returns once the request is written out. `consumer` runs on the
    /// thread that completes the request and must not block.
    pub fn get_instance_status_with<F>(
        &self,
        timeout: Option<Duration>,
        consumer: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(Result<InstanceStatus, Error>) + Send + 'static,
    {
        self.request_with(Command::GetInstanceStatus, timeout, move |result| {
            consumer(
                result
                    .and_then(Response::into_result)
                    .and_then(|payload| InstanceStatus::decode(&payload)),
            )
        })
        .map(|_| ())
    }

    /// Open a logical channel to `node` on the remote instance, on behalf
    /// of this client's origin.
    pub fn open_channel(&self, node: &NodeId) -> Result<ChannelId, Error> {
        let command = Command::OpenChannel {
            node: node.clone(),
            origin: self.inner.origin.clone(),
        };
        let payload = self.request(command, None)?;
        decode_channel_id(&payload)
    }

    /// Every channel open on the remote instance.
    pub fn get_routing_status(
        &self,
        timeout: Option<Duration>,
    ) -> Result<RoutingStatus, Error> {
        let payload = self.request(Command::GetRoutingStatus, timeout)?;
        RoutingStatus::decode(&payload)
    }

    /// Close every channel the remote instance holds for `origin`. Returns
    /// how many were closed.
    pub fn close_channels_from(&self, origin: &InstanceId) -> Result<u32, Error> {
        let payload =
            self.request(Command::CloseChannelsFrom(origin.clone()), None)?;
        decode_count(&payload)
    }

    pub fn close_channel(&self, channel: ChannelId) -> Result<(), Error> {
        self.request(Command::CloseChannel(channel), None).map(|_| ())
    }

    /// Send an opaque payload through an open channel and wait for the reply
    /// payload.
    pub fn invoke(
        &self,
        channel: ChannelId,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        let command = Command::Invoke {
            channel,
            payload: payload.to_vec(),
        };
        self.request(command, timeout)
    }

    /// Issue `command` and block until its reply, a transport failure or the
    /// timeout. The timeout covers the wait for a pool connection too.
    /// Failure responses become `Error::Remote`.
    pub fn request(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let started = Instant::now();
        let (tx, rx) = sync_channel(1);
        let seq = self.request_with(command, Some(timeout), move |result| {
            let _ = tx.send(result);
        })?;
        let remaining = (timeout + REPLY_GRACE).saturating_sub(started.elapsed());
        match rx.recv_timeout(remaining) {
            Ok(result) => result.and_then(Response::into_result),
            Err(_) => {
                self.inner.retire(seq);
                Err(Error::Timeout { seq, timeout })
            }
        }
    }

    /// Issue `command` and hand its outcome to `on_reply` later. Returns the
    /// sequence number of the request.
    ///
    /// Waits for a pool connection but not for the reply, and never longer
    /// than the timeout: a request still without a connection by then fails
    /// with `Error::Timeout`. `on_reply` is called exactly once unless this
    /// returns an error, and may run on an event loop or timer thread.
    pub fn request_with<F>(
        &self,
        command: Command,
        timeout: Option<Duration>,
        on_reply: F,
    ) -> Result<u64, Error>
    where
        F: FnOnce(Result<Response, Error>) + Send + 'static,
    {
        let inner = &self.inner;
        let timeout = timeout.unwrap_or(inner.default_timeout);
        let seq = inner.seq.fetch_add(1, Ordering::Relaxed);
        let body = Request { seq, command }.encode();

        let deadline = Instant::now() + timeout;

        inner.pending_lock().insert(
            seq,
            Pending {
                reply: Box::new(on_reply),
                lease: None,
                _timeout: None,
            },
        );
        let weak = Arc::downgrade(inner);
        let guard = inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .schedule_with_delay(
                chrono::Duration::milliseconds(timeout.as_millis() as i64),
                move || expire(&weak, seq, timeout),
            );
        // Already expired if the entry is gone.
        if let Some(pending) = inner.pending_lock().get_mut(&seq) {
            pending._timeout = Some(guard);
        }
        trace!(inner.log, "request queued"; "seq" => seq);

        let weak = Arc::downgrade(inner);
        let acquired = inner.pool.acquire_next_available_connection_until(
            deadline,
            move |connection| attach(&weak, seq, &body, connection),
        );
        let error = match acquired {
            Ok(()) => return Ok(seq),
            Err(e) => e,
        };
        if inner.pending_lock().remove(&seq).is_none() {
            // The timer got there first and already told `on_reply`.
            return Ok(seq);
        }
        match error {
            Error::ClaimTimeout(_) => {
                debug!(inner.log, "request timed out waiting for a connection";
                    "seq" => seq);
                Err(Error::Timeout { seq, timeout })
            }
            e => Err(e),
        }
    }
}

impl fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ControlClient")
            .field("pool", &self.inner.pool)
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl ClientInner {
    fn pending_lock(&self) -> std::sync::MutexGuard<HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete a pending request. Returns false for a sequence that is
    /// unknown or already retired.
    fn complete(&self, seq: u64, result: Result<Response, Error>) -> bool {
        let pending = self.pending_lock().remove(&seq);
        match pending {
            Some(pending) => {
                (pending.reply)(result);
                true
            }
            None => false,
        }
    }

    fn retire(&self, seq: u64) -> Option<Pending> {
        let pending = self.pending_lock().remove(&seq);
        if let Some((handle, lease)) =
            pending.as_ref().and_then(|p| p.lease.clone())
        {
            close_if_leased(&handle, lease);
        }
        pending
    }
}

fn close_if_leased(handle: &ConnectionHandle, lease: u64) {
    let _ = handle.with(move |connection| {
        if connection.lease_count() == lease {
            connection.close();
        }
    });
}

// Timer callback.
fn expire(weak: &Weak<ClientInner>, seq: u64, timeout: Duration) {
    if let Some(inner) = weak.upgrade() {
        if let Some(pending) = inner.retire(seq) {
            debug!(inner.log, "request timed out"; "seq" => seq);
            (pending.reply)(Err(Error::Timeout { seq, timeout }));
        }
    }
}

// Runs on the connection's thread once the pool hands it over.
fn attach(
    weak: &Weak<ClientInner>,
    seq: u64,
    body: &[u8],
    connection: &mut AsyncConnection,
) {
    let inner = match weak.upgrade() {
        Some(inner) => inner,
        None => {
            connection.recycle();
            return;
        }
    };

    let lease = (connection.handle(), connection.lease_count());
    match inner.pending_lock().get_mut(&seq) {
        Some(pending) => pending.lease = Some(lease),
        None => {
            // Timed out while waiting for the connection.
            connection.recycle();
            return;
        }
    }

    connection.set_events(&[Event::Read, Event::Error]);

    let on_read = weak.clone();
    connection.on_read(move |c| {
        if let Some(inner) = on_read.upgrade() {
            read_replies(&inner, seq, c);
        }
    });
    let on_error = weak.clone();
    connection.on_error(move |c| {
        if let Some(inner) = on_error.upgrade() {
            let reason = c.last_error().unwrap_or("transport error").to_string();
            debug!(inner.log, "request failed"; "seq" => seq, "reason" => &reason);
            inner.complete(seq, Err(Error::ConnectionLost(reason)));
        }
        c.close();
    });
    let on_close = weak.clone();
    connection.on_close(move |_| {
        if let Some(inner) = on_close.upgrade() {
            inner.complete(
                seq,
                Err(Error::ConnectionLost(String::from("connection closed"))),
            );
        }
    });

    connection.send(body);
}

// Only the request holding the lease is completed from this connection.
fn read_replies(inner: &ClientInner, seq: u64, connection: &mut AsyncConnection) {
    while let Some(body) = connection.recv() {
        let response = match Response::decode(&body) {
            Ok(response) => response,
            Err(e) => {
                warn!(inner.log, "undecodable reply: {}", e; "seq" => seq);
                inner.complete(seq, Err(e));
                connection.close();
                return;
            }
        };
        if response.seq != seq {
            warn!(inner.log, "dropping reply for another sequence";
                "seq" => response.seq, "expected" => seq);
            continue;
        }
        if !inner.complete(seq, Ok(response)) {
            warn!(inner.log, "dropping reply for retired sequence"; "seq" => seq);
        }
        connection.recycle();
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_pool::types::AsyncConnectionPoolOptions;
    use crate::thread_context::types::ThreadContextPoolOptions;
    use crate::thread_context::ThreadContextPool;
    use crate::transport::tcp_socket_factory;
    use std::net::TcpListener;

    #[test]
    fn request_times_out_when_peer_is_silent() {
        // Accepts but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let contexts = ThreadContextPool::start(ThreadContextPoolOptions {
            io_threads: Some(1),
            ..Default::default()
        })
        .unwrap();
        let pool = AsyncConnectionPool::new(
            AsyncConnectionPoolOptions {
                min_connections: Some(0),
                max_connections: Some(2),
                ..Default::default()
            },
            &contexts,
            tcp_socket_factory(addr),
        )
        .unwrap();
        let client = ControlClient::new(pool.clone(), Default::default());

        let timeout = Duration::from_millis(200);
        match client.get_instance_status(Some(timeout)) {
            Err(Error::Timeout { timeout: t, .. }) => assert_eq!(t, timeout),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(client.pending_requests(), 0);

        pool.close().unwrap();
        contexts.stop().unwrap();
        drop(listener);
    }
}
