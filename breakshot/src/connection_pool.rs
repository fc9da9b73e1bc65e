// Copyright 2020 Joyent, Inc.

//! A bounded pool of connections to one destination.
//!
//! The pool tracks every connection it allocated (`connections`) and the
//! subset ready to be handed out (`available`). Connections are created on
//! the thread contexts in round-robin order, either on demand by an acquirer
//! or by the per-context maintenance hook that keeps the pool at its
//! minimum size. Whoever receives a connection hands it back by calling
//! [`AsyncConnection::recycle`] or gives it up with
//! [`AsyncConnection::close`].

pub mod types;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use slog::{debug, info, o, trace, warn, Drain, Logger};

use crate::connection::{AsyncConnection, ConnectionHandle, Lifecycle};
use crate::connection_pool::types::{
    AsyncConnectionPoolOptions, ConnectionPoolStats, PoolData, ProtectedData,
};
use crate::error::Error;
use crate::subscription::Subscription;
use crate::thread_context::{
    ContextSelector, LoopContext, ThreadContext, ThreadContextPool,
};
use crate::transport::SocketFactory;

// Default number of minimum pool connections
pub const DEFAULT_MIN_CONNECTIONS: u32 = 10;
// Default number of maximum pool connections
pub const DEFAULT_MAX_CONNECTIONS: u32 = 100;
const DEFAULT_NAME: &str = "pool";
// Shortest wait while a backoff is about to expire
const MIN_RETRY_WAIT: Duration = Duration::from_millis(1);

type Consumer = Box<dyn FnOnce(&mut AsyncConnection) + Send>;

struct PoolInner {
    name: String,
    min_connections: u32,
    max_connections: u32,
    acquire_timeout: Option<Duration>,
    selector: ContextSelector,
    factory: SocketFactory,
    protected_data: ProtectedData,
    maintenance: Mutex<Vec<Subscription>>,
    connection_seq: AtomicU64,
    log: Logger,
}

/// A pool of connections to a single destination, spread over the contexts
/// of a [`ThreadContextPool`]. Clones share the same pool.
#[derive(Clone)]
pub struct AsyncConnectionPool {
    inner: Arc<PoolInner>,
}

impl AsyncConnectionPool {
    /// Create a pool. No connection is opened here; the maintenance hooks
    /// bring the pool up to its minimum over the next loop iterations.
    pub fn new(
        options: AsyncConnectionPoolOptions,
        contexts: &ThreadContextPool,
        factory: SocketFactory,
    ) -> Result<Self, Error> {
        let min_connections =
            options.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS);
        let max_connections =
            options.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if min_connections >= max_connections {
            return Err(Error::InvalidConfiguration(format!(
                "min_connections ({}) must be less than max_connections ({})",
                min_connections, max_connections
            )));
        }

        let name = options.name.unwrap_or_else(|| DEFAULT_NAME.to_string());
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("pool" => name.clone()));

        let inner = Arc::new(PoolInner {
            name,
            min_connections,
            max_connections,
            acquire_timeout: options.acquire_timeout.map(Duration::from_millis),
            selector: contexts.selector(),
            factory,
            protected_data: ProtectedData::new(PoolData::new(
                max_connections as usize,
            )),
            maintenance: Mutex::new(Vec::new()),
            connection_seq: AtomicU64::new(0),
            log,
        });

        let mut subscriptions = Vec::with_capacity(contexts.len());
        for context in inner.selector.contexts() {
            let weak = Arc::downgrade(&inner);
            let subscription = context
                .on_post_loop(move |lc, sub| ensure_minimum(&weak, lc, sub))?;
            subscriptions.push(subscription);
        }
        *inner
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = subscriptions;

        info!(
            inner.log,
            "connection pool created (min {}, max {})",
            min_connections,
            max_connections
        );
        Ok(AsyncConnectionPool { inner })
    }

    /// Wait for an available connection and run `consumer` with it on the
    /// connection's own thread.
    ///
    /// Blocks the calling thread, which must not be a thread context. Fails
    /// with `Error::NotOpen` once the pool is closed and with
    /// `Error::ClaimTimeout` when an `acquire_timeout` is configured and
    /// expires.
    pub fn acquire_next_available_connection<F>(
        &self,
        consumer: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut AsyncConnection) + Send + 'static,
    {
        acquire(&self.inner, None, Box::new(consumer))
    }

    /// Like [`acquire_next_available_connection`](Self::acquire_next_available_connection)
    /// but gives up with `Error::ClaimTimeout` once `deadline` passes, even
    /// when the pool has no `acquire_timeout` of its own. The earlier of the
    /// two applies.
    pub fn acquire_next_available_connection_until<F>(
        &self,
        deadline: Instant,
        consumer: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut AsyncConnection) + Send + 'static,
    {
        acquire(&self.inner, Some(deadline), Box::new(consumer))
    }

    /// Close the pool and every connection it tracks.
    ///
    /// Waiting acquirers fail with `Error::NotOpen`. The call blocks until
    /// each connection's owning thread has closed it and reports all
    /// failures together as `Error::Aggregate`. Closing a closed pool only
    /// logs a warning.
    pub fn close(&self) -> Result<(), Error> {
        let handles: Vec<ConnectionHandle> = {
            let mut data = self.inner.protected_data.pool_data_lock();
            if !data.open {
                warn!(self.inner.log, "close called on a closed pool");
                return Ok(());
            }
            data.open = false;
            data.available.clear();
            data.connections.iter().cloned().collect()
        };
        self.inner.protected_data.condvar_notify_all();
        self.inner.stop_maintenance();

        debug!(self.inner.log, "closing {} connection(s)", handles.len());
        let mut failures = Vec::new();
        let (tx, rx) = channel();
        for handle in handles {
            let tx = tx.clone();
            let token = handle.token;
            let scheduled = handle.context.do_in_thread(move |lc| {
                let _ = tx.send(lc.close_connection(token).map_err(Error::Io));
            });
            match scheduled {
                Ok(()) => (),
                // A stopped loop has already closed its connections.
                Err(Error::NotRunning) => (),
                Err(e) => failures.push(e),
            }
        }
        drop(tx);

        // Tasks dropped by a loop shutting down drop their sender too, so
        // this ends once every scheduled close ran or vanished.
        for result in rx.iter() {
            if let Err(e) = result {
                warn!(self.inner.log, "failed to close connection: {}", e);
                failures.push(e);
            }
        }

        info!(self.inner.log, "connection pool closed");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(failures))
        }
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        self.inner.protected_data.pool_data_lock().stats()
    }

    pub fn is_open(&self) -> bool {
        self.inner.protected_data.pool_data_lock().open
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn min_connections(&self) -> u32 {
        self.inner.min_connections
    }

    pub fn max_connections(&self) -> u32 {
        self.inner.max_connections
    }
}

impl std::fmt::Debug for AsyncConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AsyncConnectionPool")
            .field("name", &self.inner.name)
            .field("min_connections", &self.inner.min_connections)
            .field("max_connections", &self.inner.max_connections)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    fn stop_maintenance(&self) {
        let subscriptions = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for subscription in subscriptions.iter() {
            subscription.unsubscribe();
        }
    }

    fn next_connection_name(&self) -> String {
        let n = self.connection_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.name, n)
    }
}

impl Drop for PoolInner {
    // A pool dropped without close() gives its connections up without
    // waiting for them.
    fn drop(&mut self) {
        self.stop_maintenance();
        let data = self.protected_data.pool_data_lock();
        if data.open {
            for handle in data.connections.iter() {
                let _ = handle.close();
            }
        }
    }
}

fn acquire(
    inner: &Arc<PoolInner>,
    until: Option<Instant>,
    consumer: Consumer,
) -> Result<(), Error> {
    let handle = next_available(inner, until)?;
    dispatch(inner, handle, until, consumer)
}

// Pop an available connection, triggering at most one allocation per pass,
// and wait on the condvar otherwise.
fn next_available(
    inner: &Arc<PoolInner>,
    until: Option<Instant>,
) -> Result<ConnectionHandle, Error> {
    let started = Instant::now();
    let deadline = match (inner.acquire_timeout.map(|t| started + t), until) {
        (Some(configured), Some(until)) => Some(configured.min(until)),
        (configured, until) => configured.or(until),
    };
    let mut data = inner.protected_data.pool_data_lock();

    loop {
        if !data.open {
            return Err(Error::NotOpen);
        }
        if let Some(handle) = data.available.pop_front() {
            trace!(inner.log, "acquired connection"; "token" => handle.token.0);
            return Ok(handle);
        }
        if data.size() < inner.max_connections && !data.backing_off() {
            data.allocating += 1;
            let context = inner.selector.next();
            if let Err(e) = schedule_allocation(inner, &context) {
                data.allocating -= 1;
                return Err(e);
            }
        }

        let now = Instant::now();
        let mut wait = match deadline {
            Some(d) if now >= d => {
                debug!(inner.log, "timed out waiting for a connection");
                return Err(Error::ClaimTimeout(
                    d.saturating_duration_since(started),
                ));
            }
            Some(d) => Some(d - now),
            None => None,
        };
        if let Some(at) = data.retry_at {
            let until = at.saturating_duration_since(now).max(MIN_RETRY_WAIT);
            wait = Some(wait.map_or(until, |w| w.min(until)));
        }

        let (guard, _timed_out) =
            inner.protected_data.condvar_wait(data, wait);
        data = guard;
    }
}

fn schedule_allocation(
    inner: &Arc<PoolInner>,
    context: &ThreadContext,
) -> Result<(), Error> {
    let weak = Arc::downgrade(inner);
    context.allocate_new_connection(
        inner.next_connection_name(),
        inner.factory.clone(),
        move |lc, allocated| match weak.upgrade() {
            Some(inner) => adopt_connection(&inner, lc, allocated),
            None => {
                if let Ok(handle) = allocated {
                    let _ = lc.close_connection(handle.token);
                }
            }
        },
    )
}

fn allocate_connection(inner: &Arc<PoolInner>, lc: &mut LoopContext) {
    let name = inner.next_connection_name();
    let allocated = lc.allocate_new_connection(name, &inner.factory);
    adopt_connection(inner, lc, allocated);
}

// Runs on the loop thread that owns the new connection.
fn adopt_connection(
    inner: &Arc<PoolInner>,
    lc: &mut LoopContext,
    allocated: io::Result<ConnectionHandle>,
) {
    let handle = match allocated {
        Ok(handle) => handle,
        Err(e) => {
            warn!(inner.log, "failed to allocate connection: {}", e);
            let mut data = inner.protected_data.pool_data_lock();
            data.allocating -= 1;
            data.allocation_failed();
            drop(data);
            inner.protected_data.condvar_notify_all();
            return;
        }
    };

    if let Some(connection) = lc.connection_mut(handle.token) {
        let weak = Arc::downgrade(inner);
        connection.set_lifecycle_hook(Box::new(move |event, handle| {
            if let Some(inner) = weak.upgrade() {
                connection_lifecycle(&inner, event, handle);
            }
        }));
    }

    let mut data = inner.protected_data.pool_data_lock();
    data.allocating -= 1;
    if !data.open {
        drop(data);
        let _ = lc.close_connection(handle.token);
        return;
    }
    data.connections.insert(handle.clone());
    data.available.push_back(handle);
    drop(data);
    inner.protected_data.condvar_notify_all();
}

fn connection_lifecycle(
    inner: &Arc<PoolInner>,
    event: Lifecycle,
    handle: &ConnectionHandle,
) {
    let mut data = inner.protected_data.pool_data_lock();
    match event {
        Lifecycle::Recycled => {
            if data.open
                && data.connections.contains(handle)
                && !data.available.contains(handle)
            {
                data.available.push_back(handle.clone());
            }
            data.allocation_succeeded();
        }
        Lifecycle::Closed { was_connected } => {
            data.connections.remove(handle);
            data.available.retain(|h| h != handle);
            if was_connected {
                data.allocation_succeeded();
            } else if data.open {
                debug!(inner.log, "connection closed before connecting");
                data.allocation_failed();
            }
        }
    }
    drop(data);
    inner.protected_data.condvar_notify_all();
}

// Post-loop hook: each context adds its share of the connections missing
// below the minimum, rounded up.
fn ensure_minimum(
    weak: &Weak<PoolInner>,
    lc: &mut LoopContext,
    subscription: &Subscription,
) {
    let inner = match weak.upgrade() {
        Some(inner) => inner,
        None => {
            subscription.unsubscribe();
            return;
        }
    };

    let to_add = {
        let mut data = inner.protected_data.pool_data_lock();
        if !data.open {
            subscription.unsubscribe();
            return;
        }
        let size = data.size();
        if size >= inner.min_connections || data.backing_off() {
            return;
        }
        let missing = inner.min_connections - size;
        let contexts = inner.selector.len().max(1) as u32;
        let share = (missing + contexts - 1) / contexts;
        let to_add = share
            .min(missing)
            .min(inner.max_connections.saturating_sub(size));
        data.allocating += to_add;
        to_add
    };

    if to_add > 0 {
        trace!(inner.log, "maintenance adding {} connection(s)", to_add;
            "thread" => lc.thread_context().index());
    }
    for _ in 0..to_add {
        allocate_connection(&inner, lc);
    }
}

fn dispatch(
    inner: &Arc<PoolInner>,
    handle: ConnectionHandle,
    until: Option<Instant>,
    consumer: Consumer,
) -> Result<(), Error> {
    let token = handle.token;
    let retry = inner.clone();
    let scheduled = handle.context.do_in_thread(move |lc| {
        match lc.connection_mut(token) {
            Some(connection) => {
                connection.begin_lease();
                consumer(connection);
            }
            None => {
                // Closed between acquisition and now; the loop may not
                // block, so wait for a replacement elsewhere.
                debug!(retry.log, "acquired connection vanished, retrying");
                let log = retry.log.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{}-reacquire", retry.name))
                    .spawn(move || {
                        if let Err(e) = acquire(&retry, until, consumer) {
                            warn!(log, "re-acquisition failed: {}", e);
                        }
                    });
                if let Err(e) = spawned {
                    warn!(lc.logger(), "failed to spawn re-acquisition: {}", e);
                }
            }
        }
    });

    if let Err(e) = scheduled {
        let mut data = inner.protected_data.pool_data_lock();
        data.connections.remove(&handle);
        return Err(e);
    }
    Ok(())
}
