// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use slog::{debug, o, Drain, Logger};

use crate::control_client::ControlClient;
use crate::error::Error;
use crate::id::NodeId;
use crate::protocol::{ChannelId, ResponseCode};

/// Invokes remote nodes hosted by one instance.
///
/// Logical channels are opened lazily, one per node, and cached. A channel
/// the remote side no longer knows about is reopened once before the call
/// is given up.
pub struct RemoteInvoker {
    client: ControlClient,
    channels: Mutex<HashMap<NodeId, ChannelId>>,
    log: Logger,
}

impl RemoteInvoker {
    pub fn new(client: ControlClient, log: Option<Logger>) -> Self {
        let log = log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("invoker" => client.pool().name().to_string()));
        RemoteInvoker {
            client,
            channels: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn client(&self) -> &ControlClient {
        &self.client
    }

    pub fn invoke(
        &self,
        node: &NodeId,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        let channel = self.channel_for(node)?;
        match self.client.invoke(channel, payload, timeout) {
            Err(Error::Remote {
                code: ResponseCode::UnknownChannel,
                ..
            }) => {
                debug!(self.log, "channel went stale, reopening";
                    "node" => %node, "channel" => channel);
                self.forget(node, channel);
                let channel = self.channel_for(node)?;
                self.client.invoke(channel, payload, timeout)
            }
            result => result,
        }
    }

    /// Nodes with a cached channel.
    pub fn open_channels(&self) -> Vec<NodeId> {
        self.channels_lock().keys().cloned().collect()
    }

    /// Close the channels the remote instance holds for this client's
    /// origin, then the client's pool. Channels opened by other clones of
    /// the client are closed too.
    pub fn close(&self) -> Result<(), Error> {
        let cached = {
            let mut channels = self.channels_lock();
            let cached = channels.len();
            channels.clear();
            cached
        };
        let mut errors = Vec::new();
        if cached > 0 {
            match self.client.close_channels_from(self.client.origin()) {
                Ok(closed) => {
                    debug!(self.log, "closed channels";
                        "cached" => cached, "closed" => closed);
                }
                Err(e) => {
                    debug!(self.log, "failed to close channels: {}", e);
                    errors.push(e);
                }
            }
        }
        if let Err(e) = self.client.pool().close() {
            errors.push(e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(errors))
        }
    }

    fn channel_for(&self, node: &NodeId) -> Result<ChannelId, Error> {
        if let Some(channel) = self.channels_lock().get(node) {
            return Ok(*channel);
        }
        let channel = self.client.open_channel(node)?;
        let mut channels = self.channels_lock();
        // Another caller may have opened one in the meantime; keep theirs.
        let kept = *channels.entry(node.clone()).or_insert(channel);
        drop(channels);
        if kept != channel {
            let _ = self.client.close_channel(channel);
        }
        Ok(kept)
    }

    fn forget(&self, node: &NodeId, channel: ChannelId) {
        let mut channels = self.channels_lock();
        if channels.get(node) == Some(&channel) {
            channels.remove(node);
        }
    }

    fn channels_lock(
        &self,
    ) -> std::sync::MutexGuard<HashMap<NodeId, ChannelId>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RemoteInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RemoteInvoker")
            .field("client", &self.client)
            .field("channels", &self.channels_lock().len())
            .finish()
    }
}
