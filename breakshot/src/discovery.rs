// Copyright 2020 Joyent, Inc.

//! The contract between the instance connection service and whatever finds
//! peer instances.

use std::fmt;

use crate::error::Error;
use crate::subscription::Subscription;

/// The address a peer instance accepts control connections on, in
/// `host:port` form.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstanceHostInfo {
    pub connect_address: String,
}

impl InstanceHostInfo {
    pub fn new<S: Into<String>>(connect_address: S) -> Self {
        InstanceHostInfo {
            connect_address: connect_address.into(),
        }
    }
}

impl fmt::Display for InstanceHostInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.connect_address)
    }
}

/// A callback for discovery events. Callbacks may run on any thread and
/// should hand their work off rather than block.
pub type DiscoveryCallback = Box<dyn FnMut(&InstanceHostInfo) + Send>;

/// Finds peer instances and reports them as they come and go.
///
/// Implementations publish a host once per appearance: a host already
/// known is not discovered again until it has been undiscovered.
pub trait InstanceDiscoveryService: Send + Sync {
    fn start(&self) -> Result<(), Error>;

    fn stop(&self) -> Result<(), Error>;

    /// Hosts currently known, in no particular order.
    fn known_hosts(&self) -> Vec<InstanceHostInfo>;

    fn subscribe_to_discovery(&self, callback: DiscoveryCallback) -> Subscription;

    fn subscribe_to_undiscovery(
        &self,
        callback: DiscoveryCallback,
    ) -> Subscription;
}
