// Copyright 2020 Joyent, Inc.

//! An instance discovery service backed by a host list maintained by hand.
//!
//! Hosts given at construction are known from the start. Hosts added or
//! removed later are published to subscribers while the service is started.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use slog::{debug, info, o, Drain, Logger};

use breakshot::discovery::{
    DiscoveryCallback, InstanceDiscoveryService, InstanceHostInfo,
};
use breakshot::error::Error;
use breakshot::subscription::{Publisher, Subscription};

type HostListener = dyn FnMut(&InstanceHostInfo) + Send;

struct DiscoveryState {
    hosts: BTreeSet<InstanceHostInfo>,
    started: bool,
    discovery: Publisher<HostListener>,
    undiscovery: Publisher<HostListener>,
}

pub struct StaticInstanceDiscoveryService {
    state: Mutex<DiscoveryState>,
    log: Logger,
}

impl StaticInstanceDiscoveryService {
    pub fn new(hosts: Vec<String>, log: Option<Logger>) -> Self {
        let log = log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("discovery" => "static"));
        StaticInstanceDiscoveryService {
            state: Mutex::new(DiscoveryState {
                hosts: hosts.into_iter().map(InstanceHostInfo::new).collect(),
                started: false,
                discovery: Publisher::new(),
                undiscovery: Publisher::new(),
            }),
            log,
        }
    }

    /// Add hosts to the list. Returns how many were new; those are
    /// published to discovery subscribers if the service is started.
    ///
    /// Subscribers are called with the service locked and must not call
    /// back into it.
    pub fn add_hosts<I, S>(&self, hosts: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state_lock();
        let mut added = 0;
        for host in hosts {
            let host = InstanceHostInfo::new(host);
            if state.hosts.insert(host.clone()) {
                added += 1;
                debug!(self.log, "host added"; "host" => %host);
                if state.started {
                    state.discovery.for_each(|callback| callback(&host));
                }
            }
        }
        added
    }

    /// Remove hosts from the list. Returns how many were present; those are
    /// published to undiscovery subscribers if the service is started.
    pub fn remove_hosts<I, S>(&self, hosts: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state_lock();
        let mut removed = 0;
        for host in hosts {
            let host = InstanceHostInfo::new(host);
            if state.hosts.remove(&host) {
                removed += 1;
                debug!(self.log, "host removed"; "host" => %host);
                if state.started {
                    state.undiscovery.for_each(|callback| callback(&host));
                }
            }
        }
        removed
    }

    pub fn is_started(&self) -> bool {
        self.state_lock().started
    }

    fn state_lock(&self) -> MutexGuard<DiscoveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InstanceDiscoveryService for StaticInstanceDiscoveryService {
    fn start(&self) -> Result<(), Error> {
        let mut state = self.state_lock();
        if state.started {
            return Err(Error::AlreadyRunning);
        }
        state.started = true;
        info!(self.log, "static discovery started";
            "hosts" => state.hosts.len());
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        let mut state = self.state_lock();
        if !state.started {
            return Err(Error::NotRunning);
        }
        state.started = false;
        info!(self.log, "static discovery stopped");
        Ok(())
    }

    fn known_hosts(&self) -> Vec<InstanceHostInfo> {
        self.state_lock().hosts.iter().cloned().collect()
    }

    fn subscribe_to_discovery(&self, callback: DiscoveryCallback) -> Subscription {
        self.state_lock().discovery.subscribe(callback)
    }

    fn subscribe_to_undiscovery(
        &self,
        callback: DiscoveryCallback,
    ) -> Subscription {
        self.state_lock().undiscovery.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn changes_are_published_while_started() {
        let discovery =
            StaticInstanceDiscoveryService::new(vec!["a:1".into()], None);
        let (tx, rx) = channel();
        let added = tx.clone();
        let _sub = discovery.subscribe_to_discovery(Box::new(
            move |host: &InstanceHostInfo| {
                added.send(format!("+{}", host)).unwrap();
            },
        ));
        let _unsub = discovery.subscribe_to_undiscovery(Box::new(
            move |host: &InstanceHostInfo| {
                tx.send(format!("-{}", host)).unwrap();
            },
        ));

        // Not started: the list changes silently.
        assert_eq!(discovery.add_hosts(vec!["b:2"]), 1);
        assert!(rx.try_recv().is_err());

        discovery.start().unwrap();
        assert_eq!(discovery.add_hosts(vec!["b:2", "c:3"]), 1);
        assert_eq!(discovery.remove_hosts(vec!["a:1", "z:9"]), 1);
        assert_eq!(rx.try_recv().unwrap(), "+c:3");
        assert_eq!(rx.try_recv().unwrap(), "-a:1");
        assert!(rx.try_recv().is_err());

        let known: Vec<String> = discovery
            .known_hosts()
            .into_iter()
            .map(|h| h.connect_address)
            .collect();
        assert_eq!(known, vec!["b:2", "c:3"]);
    }

    #[test]
    fn start_and_stop_are_checked() {
        let discovery = StaticInstanceDiscoveryService::new(Vec::new(), None);
        assert!(matches!(discovery.stop(), Err(Error::NotRunning)));
        discovery.start().unwrap();
        assert!(matches!(discovery.start(), Err(Error::AlreadyRunning)));
        discovery.stop().unwrap();
    }

    #[test]
    fn unsubscribed_callbacks_are_not_called() {
        let discovery = StaticInstanceDiscoveryService::new(Vec::new(), None);
        discovery.start().unwrap();
        let (tx, rx) = channel();
        let sub = discovery.subscribe_to_discovery(Box::new(
            move |host: &InstanceHostInfo| {
                tx.send(host.clone()).unwrap();
            },
        ));
        sub.unsubscribe();
        discovery.add_hosts(vec!["a:1"]);
        assert!(rx.try_recv().is_err());
    }
}
