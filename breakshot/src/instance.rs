// Copyright 2020 Joyent, Inc.

//! Connections between runtime instances.
//!
//! An `InstanceConnectionService` makes the local instance reachable by
//! binding a control listener, and reaches its peers by following a
//! discovery service. Every discovered host gets exactly one connection pool
//! with a control client on top. Once the peer's status has been read over
//! it the host is promoted to an active [`InstanceConnection`] and
//! connect subscribers are told.
//!
//! All discovery traffic funnels through one receiver thread so host state
//! changes are applied in order. Status reads run on short-lived worker
//! threads so one slow peer never holds up another.

pub mod types;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender};
use std::sync::{Arc, Barrier, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::Token;
use slog::{debug, error, info, o, trace, warn, Drain, Logger};
use timer::Guard;

use crate::connection::ConnectionHandle;
use crate::connection_pool::types::AsyncConnectionPoolOptions;
use crate::connection_pool::AsyncConnectionPool;
use crate::control_client::{ControlClient, ControlClientOptions};
use crate::control_server::{ControlServer, RequestDispatcher};
use crate::discovery::{InstanceDiscoveryService, InstanceHostInfo};
use crate::error::Error;
use crate::id::{InstanceId, NodeId};
use crate::invoker::RemoteInvoker;
use crate::protocol::InstanceStatus;
use crate::subscription::{Publisher, Subscription};
use crate::thread_context::{ThreadContext, ThreadContextPool};
use crate::transport::{resolve_address, tcp_socket_factory};

use self::types::{
    InstanceBinding, InstanceConnection, InstanceConnectionServiceOptions,
    ResolvedOptions,
};

type ConnectionListener = dyn FnMut(&InstanceConnection) + Send;

enum ServiceMsg {
    Discovered(InstanceHostInfo),
    Undiscovered(InstanceHostInfo),
    StatusFetched {
        host: InstanceHostInfo,
        generation: u64,
        result: Result<InstanceStatus, Error>,
    },
    Refresh,
    Stop,
}

// A host with a pool, pending until its status has been read once.
struct ManagedHost {
    generation: u64,
    invoker: Arc<RemoteInvoker>,
    fetching: bool,
    connection: Option<InstanceConnection>,
}

struct Listening {
    context: ThreadContext,
    token: Token,
    address: SocketAddr,
}

#[derive(Default)]
struct ServiceState {
    running: bool,
    hosts: HashMap<InstanceHostInfo, ManagedHost>,
    // Known hosts that turned out to be this instance's own listener.
    own_hosts: HashSet<InstanceHostInfo>,
    listening: Option<Listening>,
    sender: Option<Sender<ServiceMsg>>,
    receiver_thread: Option<JoinHandle<()>>,
    subscriptions: Vec<Subscription>,
    timers: Vec<Guard>,
    next_generation: u64,
}

struct ServiceInner {
    instance_id: InstanceId,
    options: ResolvedOptions,
    contexts: Arc<ThreadContextPool>,
    discovery: Arc<dyn InstanceDiscoveryService>,
    server: ControlServer,
    state: Mutex<ServiceState>,
    changed: Condvar,
    served: Mutex<HashSet<ConnectionHandle>>,
    on_connect: Mutex<Publisher<ConnectionListener>>,
    on_disconnect: Mutex<Publisher<ConnectionListener>>,
    publishing: Mutex<()>,
    timer: Mutex<timer::Timer>,
    log: Logger,
}

/// Keeps the local instance connected to every peer its discovery service
/// knows about.
pub struct InstanceConnectionService {
    inner: Arc<ServiceInner>,
}

impl InstanceConnectionService {
    /// Create a stopped service with a fresh instance id.
    pub fn new(
        options: InstanceConnectionServiceOptions,
        contexts: Arc<ThreadContextPool>,
        discovery: Arc<dyn InstanceDiscoveryService>,
    ) -> Result<Self, Error> {
        let resolved = ResolvedOptions::resolve(&options)?;
        let instance_id = InstanceId::new_random();
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("instance" => instance_id.to_string()));
        let server = ControlServer::new(instance_id.clone(), log.clone());

        Ok(InstanceConnectionService {
            inner: Arc::new(ServiceInner {
                instance_id,
                options: resolved,
                contexts,
                discovery,
                server,
                state: Mutex::new(ServiceState::default()),
                changed: Condvar::new(),
                served: Mutex::new(HashSet::new()),
                on_connect: Mutex::new(Publisher::new()),
                on_disconnect: Mutex::new(Publisher::new()),
                publishing: Mutex::new(()),
                timer: Mutex::new(timer::Timer::new()),
                log,
            }),
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.instance_id
    }

    pub fn is_running(&self) -> bool {
        self.inner.state_lock().running
    }

    /// The address the control listener is bound to while running.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner.state_lock().listening.as_ref().map(|l| l.address)
    }

    /// Bind the control listener, follow the discovery service and connect
    /// to every host it already knows.
    pub fn start(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let mut state = inner.state_lock();
        if state.running {
            return Err(Error::AlreadyRunning);
        }

        let listening = bind_listener(inner)?;
        info!(inner.log, "control listener bound";
            "address" => listening.address.to_string());

        let (tx, rx) = channel();
        let barrier = Arc::new(Barrier::new(2));
        let barrier_clone = barrier.clone();
        let service = Arc::downgrade(inner);
        let log = inner.log.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-discovery", short_name(&inner.instance_id)))
            .spawn(move || {
                barrier_clone.wait();
                discovery_recv_loop(rx, service, log)
            });
        let receiver_thread = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                close_listener(&listening);
                return Err(Error::Io(e));
            }
        };
        barrier.wait();

        let discovered = tx.clone();
        let on_discovery = move |host: &InstanceHostInfo| {
            let _ = discovered.send(ServiceMsg::Discovered(host.clone()));
        };
        let undiscovered = tx.clone();
        let on_undiscovery = move |host: &InstanceHostInfo| {
            let _ = undiscovered.send(ServiceMsg::Undiscovered(host.clone()));
        };
        state.subscriptions = vec![
            inner.discovery.subscribe_to_discovery(Box::new(on_discovery)),
            inner.discovery.subscribe_to_undiscovery(Box::new(on_undiscovery)),
        ];

        let timer = inner.timer.lock().unwrap_or_else(PoisonError::into_inner);
        let refresh = tx.clone();
        let refresh_interval = inner.options.refresh_interval;
        debug!(inner.log,
            "starting refresh task, interval {} seconds", refresh_interval);
        let refresh_guard = timer.schedule_repeating(
            chrono::Duration::seconds(refresh_interval as i64),
            move || {
                let _ = refresh.send(ServiceMsg::Refresh);
            },
        );
        let report_interval = inner.options.report_interval;
        let reporter = Arc::downgrade(inner);
        debug!(inner.log,
            "starting status report task, interval {} seconds", report_interval);
        let report_guard = timer.schedule_repeating(
            chrono::Duration::seconds(report_interval as i64),
            move || {
                if let Some(inner) = reporter.upgrade() {
                    report_status(&inner);
                }
            },
        );
        drop(timer);
        state.timers = vec![refresh_guard, report_guard];

        state.listening = Some(listening);
        state.sender = Some(tx.clone());
        state.receiver_thread = Some(receiver_thread);
        state.running = true;
        drop(state);

        for host in inner.discovery.known_hosts() {
            let _ = tx.send(ServiceMsg::Discovered(host));
        }
        info!(inner.log, "instance connection service started");
        Ok(())
    }

    /// Stop following discovery, close the listener and every peer pool.
    /// Active peers are reported to disconnect subscribers.
    pub fn stop(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let (subscriptions, timers, sender, receiver_thread, listening, hosts) = {
            let mut state = inner.state_lock();
            if !state.running {
                return Err(Error::NotRunning);
            }
            state.running = false;
            state.own_hosts.clear();
            (
                mem::take(&mut state.subscriptions),
                mem::take(&mut state.timers),
                state.sender.take(),
                state.receiver_thread.take(),
                state.listening.take(),
                state.hosts.drain().collect::<Vec<_>>(),
            )
        };
        inner.changed.notify_all();

        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        drop(timers);

        if let Some(sender) = sender {
            let _ = sender.send(ServiceMsg::Stop);
        }
        if let Some(handle) = receiver_thread {
            // Stopping from a subscriber callback must not join itself.
            if handle.thread().id() != thread::current().id()
                && handle.join().is_err()
            {
                error!(inner.log, "discovery receiver thread panicked");
            }
        }

        if let Some(listening) = listening {
            close_listener(&listening);
        }
        let served: Vec<ConnectionHandle> = inner.served_lock().drain().collect();
        for handle in served {
            let _ = handle.close();
        }

        for (host, managed) in hosts {
            debug!(inner.log, "closing peer pool"; "host" => %host);
            close_managed(inner, managed, true);
        }
        info!(inner.log, "instance connection service stopped");
        Ok(())
    }

    /// Route control traffic for `node` to `dispatcher`. The node must
    /// belong to this instance.
    pub fn open_binding<D>(
        &self,
        node: NodeId,
        dispatcher: D,
    ) -> Result<InstanceBinding, Error>
    where
        D: RequestDispatcher + 'static,
    {
        if node.instance_id() != self.inner.instance_id {
            return Err(Error::InvalidId(format!(
                "node {} does not belong to instance {}",
                node, self.inner.instance_id
            )));
        }
        self.inner.server.bind(node.clone(), Arc::new(dispatcher))?;
        Ok(InstanceBinding {
            node,
            server: self.inner.server.clone(),
            closed: false,
        })
    }

    /// This instance's id and the nodes currently bound on it.
    pub fn get_instance_status(&self) -> InstanceStatus {
        self.inner.server.status()
    }

    /// Connect to known hosts without a pool and wait until every known host
    /// is active. Fails with `Error::Timeout` if that takes longer than
    /// `timeout`.
    pub fn refresh(&self, timeout: Duration) -> Result<(), Error> {
        let inner = &self.inner;
        match inner.state_lock().sender.as_ref() {
            Some(sender) => {
                let _ = sender.send(ServiceMsg::Refresh);
            }
            None => return Err(Error::NotRunning),
        }

        let deadline = Instant::now() + timeout;
        let mut state = inner.state_lock();
        loop {
            if !state.running {
                return Err(Error::NotRunning);
            }
            let settled = inner.discovery.known_hosts().iter().all(|host| {
                state.own_hosts.contains(host)
                    || state
                        .hosts
                        .get(host)
                        .map_or(false, |m| m.connection.is_some())
            });
            if settled {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                // Client sequence numbers start at 1.
                return Err(Error::Timeout { seq: 0, timeout });
            }
            state = inner
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drop the pool to `host`. A host that is still known is reconnected
    /// by the next refresh. Returns false if no pool existed.
    pub fn disconnect(&self, host: &InstanceHostInfo) -> bool {
        remove_host(&self.inner, host)
    }

    pub fn active_connections(&self) -> Vec<InstanceConnection> {
        self.inner
            .state_lock()
            .hosts
            .values()
            .filter_map(|m| m.connection.clone())
            .collect()
    }

    /// Hosts with a pool, pending or active.
    pub fn managed_hosts(&self) -> Vec<InstanceHostInfo> {
        let mut hosts: Vec<InstanceHostInfo> =
            self.inner.state_lock().hosts.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// The active peer that owns or hosts `node`.
    pub fn connection_for_node(&self, node: &NodeId) -> Option<InstanceConnection> {
        let instance = node.instance_id();
        let state = self.inner.state_lock();
        let mut active = state.hosts.values().filter_map(|m| m.connection.as_ref());
        active
            .find(|c| c.instance_id() == &instance || c.hosts_node(node))
            .cloned()
    }

    /// Call `callback` on the discovery receiver thread each time a peer
    /// becomes active.
    pub fn subscribe_to_connect<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&InstanceConnection) + Send + 'static,
    {
        self.inner
            .on_connect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe(Box::new(callback))
    }

    /// Call `callback` each time an active peer is dropped.
    pub fn subscribe_to_disconnect<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&InstanceConnection) + Send + 'static,
    {
        self.inner
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe(Box::new(callback))
    }
}

impl Drop for InstanceConnectionService {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

impl fmt::Debug for InstanceConnectionService {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.state_lock();
        f.debug_struct("InstanceConnectionService")
            .field("instance_id", &self.inner.instance_id)
            .field("running", &state.running)
            .field("hosts", &state.hosts.len())
            .finish()
    }
}

impl ServiceInner {
    fn state_lock(&self) -> MutexGuard<ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn served_lock(&self) -> MutexGuard<HashSet<ConnectionHandle>> {
        self.served.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn short_name(instance_id: &InstanceId) -> String {
    instance_id.as_encoded().chars().take(8).collect()
}

fn bind_listener(inner: &Arc<ServiceInner>) -> Result<Listening, Error> {
    let address = resolve_address(&inner.options.bind_address)?;
    let context = inner.contexts.next();
    let server = inner.server.clone();
    let service = Arc::downgrade(inner);
    let (tx, rx) = sync_channel(1);
    context.do_in_thread(move |lc| {
        let bound = lc.listen(address, move |connection| {
            if let Some(inner) = service.upgrade() {
                let handle = connection.handle();
                inner.served_lock().insert(handle.clone());
                let service = Arc::downgrade(&inner);
                connection.on_close(move |_| {
                    if let Some(inner) = service.upgrade() {
                        inner.served_lock().remove(&handle);
                    }
                });
            }
            server.serve(connection);
        });
        let _ = tx.send(bound);
    })?;
    let (token, address) = rx.recv().map_err(|_| Error::NotRunning)??;
    Ok(Listening {
        context,
        token,
        address,
    })
}

fn close_listener(listening: &Listening) {
    let token = listening.token;
    let _ = listening.context.do_in_thread(move |lc| {
        let _ = lc.close_listener(token);
    });
}

fn discovery_recv_loop(
    rx: Receiver<ServiceMsg>,
    service: Weak<ServiceInner>,
    log: Logger,
) {
    let mut done = false;

    while !done {
        let msg = match rx.recv() {
            Ok(ServiceMsg::Stop) | Err(_) => {
                done = true;
                continue;
            }
            Ok(msg) => msg,
        };
        let inner = match service.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        match msg {
            ServiceMsg::Discovered(host) => {
                info!(log, "discovered host"; "host" => %host);
                add_host(&inner, host);
            }
            ServiceMsg::Undiscovered(host) => {
                info!(log, "host undiscovered"; "host" => %host);
                remove_host(&inner, &host);
            }
            ServiceMsg::StatusFetched {
                host,
                generation,
                result,
            } => status_fetched(&inner, host, generation, result),
            ServiceMsg::Refresh => refresh_hosts(&inner),
            ServiceMsg::Stop => done = true,
        }
    }
    debug!(log, "discovery receiver exiting");
}

fn add_host(inner: &Arc<ServiceInner>, host: InstanceHostInfo) {
    let mut state = inner.state_lock();
    if !state.running
        || state.hosts.contains_key(&host)
        || state.own_hosts.contains(&host)
    {
        return;
    }

    let address = match resolve_address(&host.connect_address) {
        Ok(address) => address,
        Err(e) => {
            warn!(inner.log, "unable to resolve host: {}", e; "host" => %host);
            return;
        }
    };
    if state.listening.as_ref().map(|l| l.address) == Some(address) {
        debug!(inner.log, "ignoring own address"; "host" => %host);
        state.own_hosts.insert(host);
        inner.changed.notify_all();
        return;
    }

    let pool = AsyncConnectionPool::new(
        AsyncConnectionPoolOptions {
            min_connections: Some(inner.options.min_connections),
            max_connections: Some(inner.options.max_connections),
            acquire_timeout: Some(inner.options.request_timeout.as_millis() as u64),
            name: Some(format!("peer-{}", host)),
            log: Some(inner.log.clone()),
        },
        &inner.contexts,
        tcp_socket_factory(address),
    );
    let pool = match pool {
        Ok(pool) => pool,
        Err(e) => {
            error!(inner.log, "unable to create peer pool: {}", e;
                "host" => %host);
            return;
        }
    };
    let client = ControlClient::new(
        pool,
        ControlClientOptions {
            request_timeout: Some(inner.options.request_timeout.as_millis() as u64),
            origin: Some(inner.instance_id.clone()),
            log: Some(inner.log.clone()),
        },
    );
    let invoker = Arc::new(RemoteInvoker::new(client, Some(inner.log.clone())));

    let generation = state.next_generation;
    state.next_generation += 1;
    let fetching = spawn_status_fetch(inner, &state, &host, generation, &invoker);
    state.hosts.insert(
        host,
        ManagedHost {
            generation,
            invoker,
            fetching,
            connection: None,
        },
    );
    inner.changed.notify_all();
}

/// Drop the pool to `host`, telling disconnect subscribers if it was active.
fn remove_host(inner: &Arc<ServiceInner>, host: &InstanceHostInfo) -> bool {
    let removed = {
        let mut state = inner.state_lock();
        state.own_hosts.remove(host);
        state.hosts.remove(host)
    };
    inner.changed.notify_all();
    match removed {
        Some(managed) => {
            close_managed(inner, managed, false);
            true
        }
        None => false,
    }
}

// Runs on the receiver thread.
fn status_fetched(
    inner: &Arc<ServiceInner>,
    host: InstanceHostInfo,
    generation: u64,
    result: Result<InstanceStatus, Error>,
) {
    let mut state = inner.state_lock();
    let running = state.running;
    match state.hosts.get_mut(&host) {
        Some(managed) if running && managed.generation == generation => {
            managed.fetching = false;
        }
        _ => {
            trace!(inner.log, "dropping stale status"; "host" => %host);
            return;
        }
    }

    match result {
        Ok(status) => {
            let (promoted, connection) = match state.hosts.get_mut(&host) {
                Some(managed) => {
                    let connection = InstanceConnection {
                        host: host.clone(),
                        status,
                        invoker: managed.invoker.clone(),
                    };
                    let promoted = managed.connection.is_none();
                    managed.connection = Some(connection.clone());
                    (promoted, connection)
                }
                None => return,
            };
            inner.changed.notify_all();
            drop(state);
            if promoted {
                info!(inner.log, "peer connected"; "host" => %host,
                    "peer" => connection.instance_id().to_string(),
                    "nodes" => connection.nodes().len());
                publish(inner, &inner.on_connect, &connection);
            }
        }
        Err(e) => {
            warn!(inner.log, "unable to read peer status: {}", e;
                "host" => %host);
            let removed = state.hosts.remove(&host);
            inner.changed.notify_all();
            drop(state);
            if let Some(managed) = removed {
                close_managed(inner, managed, false);
            }
        }
    }
}

// Runs on the receiver thread.
fn refresh_hosts(inner: &Arc<ServiceInner>) {
    let known = inner.discovery.known_hosts();
    {
        let mut state = inner.state_lock();
        if !state.running {
            return;
        }
        let idle: Vec<(InstanceHostInfo, u64, Arc<RemoteInvoker>)> = state
            .hosts
            .iter()
            .filter(|(_, m)| !m.fetching)
            .map(|(h, m)| (h.clone(), m.generation, m.invoker.clone()))
            .collect();
        for (host, generation, invoker) in idle {
            let fetching =
                spawn_status_fetch(inner, &state, &host, generation, &invoker);
            if let Some(managed) = state.hosts.get_mut(&host) {
                managed.fetching = fetching;
            }
        }
    }
    for host in known {
        add_host(inner, host);
    }
}

/// Read the peer's status on a worker thread and report back to the
/// receiver. Returns false if no worker could be started.
fn spawn_status_fetch(
    inner: &ServiceInner,
    state: &ServiceState,
    host: &InstanceHostInfo,
    generation: u64,
    invoker: &Arc<RemoteInvoker>,
) -> bool {
    let sender = match state.sender.as_ref() {
        Some(sender) => sender.clone(),
        None => return false,
    };
    let client = invoker.client().clone();
    let timeout = inner.options.request_timeout;
    let host_clone = host.clone();
    let spawned = thread::Builder::new()
        .name(format!("{}-status", short_name(&inner.instance_id)))
        .spawn(move || {
            let result = client.get_instance_status(Some(timeout));
            let _ = sender.send(ServiceMsg::StatusFetched {
                host: host_clone,
                generation,
                result,
            });
        });
    match spawned {
        Ok(_) => true,
        Err(e) => {
            warn!(inner.log, "unable to start status read: {}", e;
                "host" => %host);
            false
        }
    }
}

fn close_managed(inner: &ServiceInner, managed: ManagedHost, graceful: bool) {
    let result = if graceful {
        managed.invoker.close()
    } else {
        managed.invoker.client().pool().close()
    };
    if let Err(e) = result {
        warn!(inner.log, "errors closing peer pool: {}", e);
    }
    if let Some(connection) = managed.connection {
        info!(inner.log, "peer disconnected"; "host" => %connection.host());
        publish(inner, &inner.on_disconnect, &connection);
    }
}

fn publish(
    inner: &ServiceInner,
    publisher: &Mutex<Publisher<ConnectionListener>>,
    connection: &InstanceConnection,
) {
    let _serial = inner.publishing.lock().unwrap_or_else(PoisonError::into_inner);
    let mut taken = publisher
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    taken.for_each(|callback| {
        let called = panic::catch_unwind(AssertUnwindSafe(|| callback(connection)));
        if called.is_err() {
            error!(inner.log, "connection subscriber panicked";
                "host" => %connection.host());
        }
    });
    publisher
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .restore(taken);
}

// Timer callback.
fn report_status(inner: &ServiceInner) {
    let (pending, active) = {
        let state = inner.state_lock();
        let active = state
            .hosts
            .values()
            .filter(|m| m.connection.is_some())
            .count();
        (state.hosts.len() - active, active)
    };
    info!(inner.log, "instance status";
        "bound_nodes" => inner.server.bound_nodes().len(),
        "open_channels" => inner.server.open_channels(),
        "active_peers" => active,
        "pending_peers" => pending,
        "served_connections" => inner.served_lock().len());
}
