// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Interest, Registry, Token};
use slog::{o, Drain, Logger};

use breakshot::discovery::{
    DiscoveryCallback, InstanceDiscoveryService, InstanceHostInfo,
};
use breakshot::error::Error;
use breakshot::protocol::{frame, Request, Response};
use breakshot::subscription::{Publisher, Subscription};
use breakshot::thread_context::types::ThreadContextPoolOptions;
use breakshot::thread_context::ThreadContextPool;
use breakshot::transport::{SocketFactory, Transport};

pub const WAIT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn start_contexts(io_threads: usize) -> ThreadContextPool {
    ThreadContextPool::start(ThreadContextPoolOptions {
        io_threads: Some(io_threads),
        name: Some(String::from("test")),
        log: Some(test_log()),
    })
    .unwrap()
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// A plain TCP server that accepts connections and discards whatever it
/// receives. Stops accepting when dropped.
pub struct SinkServer {
    pub addr: SocketAddr,
    done: Arc<AtomicBool>,
}

impl SinkServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        thread::spawn(move || {
            while !done_clone.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        thread::spawn(move || {
                            let mut buf = [0u8; 1024];
                            while let Ok(n) = stream.read(&mut buf) {
                                if n == 0 {
                                    break;
                                }
                            }
                        });
                    }
                    Err(_) => thread::sleep(POLL_INTERVAL),
                }
            }
        });
        SinkServer { addr, done }
    }
}

impl Drop for SinkServer {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

/// A TCP transport that cannot be shut down cleanly.
pub struct StuckStream {
    stream: mio::net::TcpStream,
}

impl Source for StuckStream {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

impl Read for StuckStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for StuckStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for StuckStream {
    fn shutdown(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "shutdown refused"))
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.stream.take_error()
    }

    fn peer(&self) -> String {
        String::from("stuck")
    }
}

/// Opens `StuckStream`s to `addr`.
pub fn stuck_socket_factory(addr: SocketAddr) -> SocketFactory {
    Arc::new(move || {
        let stream = mio::net::TcpStream::connect(addr)?;
        Ok(Box::new(StuckStream { stream }) as Box<dyn Transport>)
    })
}

/// Read one control request off a blocking stream.
pub fn read_request(stream: &mut TcpStream) -> Request {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut body).unwrap();
    Request::decode(&body).unwrap()
}

pub fn write_response(stream: &mut TcpStream, response: &Response) {
    stream.write_all(&frame(&response.encode())).unwrap();
    stream.flush().unwrap();
}

/// An address nothing listens on.
pub fn closed_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

type HostListener = dyn FnMut(&InstanceHostInfo) + Send;

#[derive(Default)]
struct ListState {
    hosts: BTreeSet<InstanceHostInfo>,
    discovery: Publisher<HostListener>,
    undiscovery: Publisher<HostListener>,
}

/// A discovery service driven by the test.
#[derive(Default)]
pub struct ListDiscovery {
    state: Mutex<ListState>,
}

impl ListDiscovery {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&self, address: &str) {
        let host = InstanceHostInfo::new(address);
        let mut state = self.state.lock().unwrap();
        if state.hosts.insert(host.clone()) {
            state.discovery.for_each(|callback| callback(&host));
        }
    }

    pub fn remove(&self, address: &str) {
        let host = InstanceHostInfo::new(address);
        let mut state = self.state.lock().unwrap();
        if state.hosts.remove(&host) {
            state.undiscovery.for_each(|callback| callback(&host));
        }
    }
}

impl InstanceDiscoveryService for ListDiscovery {
    fn start(&self) -> Result<(), Error> {
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        Ok(())
    }

    fn known_hosts(&self) -> Vec<InstanceHostInfo> {
        self.state.lock().unwrap().hosts.iter().cloned().collect()
    }

    fn subscribe_to_discovery(&self, callback: DiscoveryCallback) -> Subscription {
        self.state.lock().unwrap().discovery.subscribe(callback)
    }

    fn subscribe_to_undiscovery(
        &self,
        callback: DiscoveryCallback,
    ) -> Subscription {
        self.state.lock().unwrap().undiscovery.subscribe(callback)
    }
}
