// Copyright 2020 Joyent, Inc.

//! A pooled, readiness-polled transport for clustered runtime instances
//!
//! Breakshot connects the instances of a cluster to each other. Every
//! instance listens for control connections, learns about its peers from a
//! discovery service and keeps a small pool of connections to each of them.
//! Requests to remote nodes travel over those pools.
//!
//! ## Thread contexts
//!
//! All socket I/O happens on a fixed set of event loop threads, the
//! [`ThreadContextPool`](thread_context/struct.ThreadContextPool.html). Each
//! thread owns a `mio` poll and every connection registered with it. Other
//! threads never touch a connection directly. They post work to its owning
//! [`ThreadContext`](thread_context/struct.ThreadContext.html) with
//! `do_in_thread` and the loop runs it on its next iteration.
//!
//! New connections are spread over the threads round robin. A loop iteration
//! waits for readiness, runs posted tasks, delivers read, write and error
//! events to the handlers of each connection, settles connections their
//! handlers recycled or closed, and finally runs the post-loop hooks. Read
//! and write events are level triggered from the handler's point of view:
//! as long as a whole frame is buffered, or the socket is writable and write
//! events are requested, the handlers are called again on the next
//! iteration.
//!
//! ## Connection pools
//!
//! An [`AsyncConnectionPool`](connection_pool/struct.AsyncConnectionPool.html)
//! keeps between `min_connections` and `max_connections` connections to one
//! address. Connections are never handed out as values. A caller asks for
//! the next available connection and supplies a consumer that runs on the
//! connection's own thread:
//!
//! ```rust,ignore
//! pool.acquire_next_available_connection(move |connection| {
//!     connection.set_events(&[Event::Read, Event::Error]);
//!     connection.on_read(|c| {
//!         while let Some(frame) = c.recv() {
//!             // handle frame
//!         }
//!         c.recycle();
//!     });
//!     connection.send(b"hello");
//! })?;
//! ```
//!
//! The consumer, or a handler it installs, must eventually `recycle()` the
//! connection, which hands it back to the pool with its handlers cleared, or
//! `close()` it. The pool tops itself up to its minimum from a post-loop
//! hook on every thread and allocates past the minimum on demand. Failed
//! allocations back off exponentially.
//!
//! ## Control protocol
//!
//! Peers talk a small length-prefixed request/response protocol. A
//! [`ControlServer`](control_server/struct.ControlServer.html) answers for
//! the nodes bound on the local instance and a
//! [`ControlClient`](control_client/struct.ControlClient.html) correlates
//! requests and replies by sequence number. A
//! [`RemoteInvoker`](invoker/struct.RemoteInvoker.html) adds per-node
//! channels on top of the client.
//!
//! ## Instances and discovery
//!
//! The [`InstanceConnectionService`](instance/struct.InstanceConnectionService.html)
//! ties the pieces together. Hosts come from an implementation of the
//! [`InstanceDiscoveryService`](discovery/trait.InstanceDiscoveryService.html)
//! trait. Each one gets a pool and is reported to connect subscribers once
//! its status has been read. The `breakshot-static-discovery` crate provides
//! a discovery service backed by a list of addresses.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use breakshot::id::{ApplicationId, NodeId};
//! use breakshot::instance::InstanceConnectionService;
//! use breakshot::thread_context::ThreadContextPool;
//! use breakshot_static_discovery::StaticInstanceDiscoveryService;
//!
//! let contexts = Arc::new(ThreadContextPool::start(Default::default())?);
//! let discovery = Arc::new(StaticInstanceDiscoveryService::new(
//!     vec!["10.0.0.2:7400".into(), "10.0.0.3:7400".into()],
//!     None,
//! ));
//! let service = InstanceConnectionService::new(
//!     Default::default(),
//!     contexts,
//!     discovery,
//! )?;
//! service.start()?;
//!
//! let node = NodeId::new(service.instance_id(), &ApplicationId::new_random());
//! let _binding = service.open_binding(
//!     node,
//!     |_: &NodeId, payload: &[u8]| -> Result<Vec<u8>, String> {
//!         Ok(payload.to_vec())
//!     },
//! )?;
//!
//! service.refresh(Duration::from_secs(5))?;
//! for peer in service.active_connections() {
//!     println!("{} hosts {} nodes", peer.instance_id(), peer.nodes().len());
//! }
//! ```

#![allow(missing_docs)]

pub mod connection;
pub mod connection_pool;
pub mod control_client;
pub mod control_server;
pub mod discovery;
pub mod error;
pub mod id;
pub mod instance;
pub mod invoker;
pub mod protocol;
pub mod subscription;
pub mod thread_context;
pub mod transport;
