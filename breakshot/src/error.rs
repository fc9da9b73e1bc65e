// Copyright 2020 Joyent, Inc.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::id::NodeId;
use crate::protocol::ResponseCode;

/// The error type shared by every breakshot component.
///
/// State errors (`NotOpen`, `AlreadyRunning`, `NotRunning`) are always
/// returned synchronously to the caller that misused a pool or service.
/// Transport failures on a single connection are logged where they happen
/// and only show up here through the request they broke, or collected into
/// `Aggregate` when a pool is shut down.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection pool is not open")]
    NotOpen,
    #[error("already running")]
    AlreadyRunning,
    #[error("not running")]
    NotRunning,
    #[error("timed out claiming a connection after {0:?}")]
    ClaimTimeout(Duration),
    #[error("request {seq} timed out after {timeout:?}")]
    Timeout { seq: u64, timeout: Duration },
    #[error("{} failure(s) while closing connections", .0.len())]
    Aggregate(Vec<Error>),
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
    #[error("remote returned {code}: {message}")]
    Remote { code: ResponseCode, message: String },
    #[error("protocol failure: {0}")]
    Protocol(String),
    #[error("invalid identifier: {0}")]
    InvalidId(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("binding already open for node {0}")]
    BindingExists(NodeId),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}
