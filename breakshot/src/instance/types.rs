// Copyright 2020 Joyent, Inc.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use slog::Logger;

use crate::control_client::ControlClient;
use crate::control_server::ControlServer;
use crate::discovery::InstanceHostInfo;
use crate::error::Error;
use crate::id::{InstanceId, NodeId};
use crate::invoker::RemoteInvoker;
use crate::protocol::InstanceStatus;

// Default address the control listener binds
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:0";
// Default seconds between refresh passes over the known hosts
pub const DEFAULT_REFRESH_INTERVAL: u64 = 10;
// Default seconds between status reports in the log
pub const DEFAULT_REPORT_INTERVAL: u64 = 15;
// Default minimum connections of each per-host pool
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
// Default maximum connections of each per-host pool
pub const DEFAULT_MAX_CONNECTIONS: u32 = 100;
// Default control request timeout in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 5000;

/// The configuration options for an instance connection service.
#[derive(Clone, Debug, Default)]
pub struct InstanceConnectionServiceOptions {
    /// Address the control listener binds, in `host:port` form. Port 0 picks
    /// a free port; see
    /// [`local_address`](super::InstanceConnectionService::local_address).
    pub bind_address: Option<String>,
    /// Seconds between refresh passes. Each pass connects to known hosts
    /// without a pool and re-reads the status of active peers.
    pub refresh_interval: Option<u64>,
    /// Seconds between status reports in the log.
    pub report_interval: Option<u64>,
    /// Minimum connections of each per-host pool.
    pub min_connections: Option<u32>,
    /// Maximum connections of each per-host pool.
    pub max_connections: Option<u32>,
    /// Timeout in milliseconds of the control requests sent to peers.
    pub request_timeout: Option<u64>,
    /// Whether peers are reached without transport security. Only plaintext
    /// transport exists, so `Some(false)` is rejected.
    pub plaintext: Option<bool>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain.
    pub log: Option<Logger>,
}

/// Options with every default applied.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedOptions {
    pub bind_address: String,
    pub refresh_interval: u64,
    pub report_interval: u64,
    pub min_connections: u32,
    pub max_connections: u32,
    pub request_timeout: Duration,
}

impl ResolvedOptions {
    pub fn resolve(
        options: &InstanceConnectionServiceOptions,
    ) -> Result<Self, Error> {
        if options.plaintext == Some(false) {
            return Err(Error::InvalidConfiguration(String::from(
                "only plaintext transport is supported",
            )));
        }
        let resolved = ResolvedOptions {
            bind_address: options
                .bind_address
                .clone()
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            refresh_interval: options
                .refresh_interval
                .unwrap_or(DEFAULT_REFRESH_INTERVAL),
            report_interval: options
                .report_interval
                .unwrap_or(DEFAULT_REPORT_INTERVAL),
            min_connections: options
                .min_connections
                .unwrap_or(DEFAULT_MIN_CONNECTIONS),
            max_connections: options
                .max_connections
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            request_timeout: Duration::from_millis(
                options.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            ),
        };
        if resolved.refresh_interval == 0 || resolved.report_interval == 0 {
            return Err(Error::InvalidConfiguration(String::from(
                "refresh and report intervals must be positive",
            )));
        }
        Ok(resolved)
    }
}

/// An active connection to a peer instance.
///
/// Clones share the peer's pool. The hosted node set is the one last read
/// from the peer and is refreshed periodically.
#[derive(Clone)]
pub struct InstanceConnection {
    pub(crate) host: InstanceHostInfo,
    pub(crate) status: InstanceStatus,
    pub(crate) invoker: Arc<RemoteInvoker>,
}

impl InstanceConnection {
    pub fn host(&self) -> &InstanceHostInfo {
        &self.host
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.status.instance_id
    }

    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        &self.status.nodes
    }

    pub fn hosts_node(&self, node: &NodeId) -> bool {
        self.status.nodes.contains(node)
    }

    pub fn client(&self) -> &ControlClient {
        self.invoker.client()
    }

    pub fn invoker(&self) -> &RemoteInvoker {
        &self.invoker
    }

    /// Invoke `node` on this peer.
    pub fn invoke(
        &self,
        node: &NodeId,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        self.invoker.invoke(node, payload, timeout)
    }
}

impl fmt::Debug for InstanceConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InstanceConnection")
            .field("host", &self.host)
            .field("instance_id", &self.status.instance_id)
            .field("nodes", &self.status.nodes.len())
            .finish()
    }
}

/// A node bound on the local instance. Dropping it, or calling
/// [`close`](InstanceBinding::close), removes the binding and every channel
/// peers opened to the node.
pub struct InstanceBinding {
    pub(crate) node: NodeId,
    pub(crate) server: ControlServer,
    pub(crate) closed: bool,
}

impl InstanceBinding {
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.server.unbind(&self.node);
        }
    }
}

impl Drop for InstanceBinding {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for InstanceBinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InstanceBinding")
            .field("node", &self.node)
            .field("closed", &self.closed)
            .finish()
    }
}
