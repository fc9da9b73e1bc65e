// Copyright 2020 Joyent, Inc.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::connection::ConnectionHandle;

/// The connection counts for an async connection pool
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionPoolStats {
    /// The total number of connections, in use or not
    pub total_connections: ConnectionCount,
    /// The number of connections waiting to be acquired
    pub available_connections: ConnectionCount,
    /// The number of connections scheduled but not yet created
    pub allocating_connections: ConnectionCount,
}

/// The configuration options for an async connection pool.
#[derive(Clone, Debug, Default)]
pub struct AsyncConnectionPoolOptions {
    /// An optional minimum number of connections the pool keeps open. If not
    /// specified the default is 10.
    pub min_connections: Option<u32>,
    /// An optional maximum number of connections. If not specified the
    /// default is 100. Must be greater than the minimum.
    pub max_connections: Option<u32>,
    /// An optional timeout in milliseconds for acquisition calls waiting on
    /// the pool. If not specified the calls wait until a connection frees up
    /// or the pool closes.
    pub acquire_timeout: Option<u64>,
    /// An optional name for connections and log entries.
    pub name: Option<String>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain.
    pub log: Option<Logger>,
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

// The internal state of an async connection pool.
#[doc(hidden)]
#[derive(Debug)]
pub struct PoolData {
    pub open: bool,
    pub connections: HashSet<ConnectionHandle>,
    pub available: VecDeque<ConnectionHandle>,
    pub allocating: u32,
    pub backoff: ExponentialBackoff,
    pub retry_at: Option<Instant>,
}

impl PoolData {
    #[doc(hidden)]
    pub fn new(max_size: usize) -> Self {
        PoolData {
            open: true,
            connections: HashSet::with_capacity(max_size),
            available: VecDeque::with_capacity(max_size),
            allocating: 0,
            backoff: ExponentialBackoff {
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            },
            retry_at: None,
        }
    }

    /// Connections that exist or are on their way.
    pub fn size(&self) -> u32 {
        self.connections.len() as u32 + self.allocating
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        ConnectionPoolStats {
            total_connections: (self.connections.len() as u32).into(),
            available_connections: (self.available.len() as u32).into(),
            allocating_connections: self.allocating.into(),
        }
    }

    /// True while a recent allocation failure holds off new attempts.
    pub fn backing_off(&self) -> bool {
        match self.retry_at {
            Some(at) => Instant::now() < at,
            None => false,
        }
    }

    pub fn allocation_failed(&mut self) {
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval);
        self.retry_at = Some(Instant::now() + delay);
    }

    pub fn allocation_succeeded(&mut self) {
        self.backoff.reset();
        self.retry_at = None;
    }
}

// Protected access to the internal pool state
#[doc(hidden)]
#[derive(Debug)]
pub struct ProtectedData(Arc<(Mutex<PoolData>, Condvar)>);

impl ProtectedData {
    pub fn new(pool_data: PoolData) -> Self {
        ProtectedData(Arc::new((Mutex::new(pool_data), Condvar::new())))
    }

    pub fn pool_data_lock(&self) -> MutexGuard<PoolData> {
        (self.0).0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, PoolData>,
        m_timeout: Option<Duration>,
    ) -> (MutexGuard<'a, PoolData>, bool) {
        match m_timeout {
            Some(timeout) => {
                let (guard, result) = (self.0)
                    .1
                    .wait_timeout(g, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, result.timed_out())
            }
            None => (
                (self.0).1.wait(g).unwrap_or_else(PoisonError::into_inner),
                false,
            ),
        }
    }

    pub fn condvar_notify_all(&self) {
        (self.0).1.notify_all()
    }
}

impl Clone for ProtectedData {
    fn clone(&self) -> ProtectedData {
        ProtectedData(Arc::clone(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_holds_off_and_resets() {
        let mut data = PoolData::new(4);
        assert!(!data.backing_off());
        data.allocation_failed();
        assert!(data.backing_off());
        data.allocation_succeeded();
        assert!(!data.backing_off());
    }

    #[test]
    fn stats_reflect_counts() {
        let mut data = PoolData::new(4);
        data.allocating = 2;
        let stats = data.stats();
        assert_eq!(stats.allocating_connections, ConnectionCount::from(2));
        assert_eq!(stats.total_connections, ConnectionCount::from(0));
        assert_eq!(data.size(), 2);
    }
}
