// Copyright 2020 Joyent, Inc.

use std::fmt;

use slog::Logger;

use crate::subscription::Subscription;
use crate::thread_context::LoopContext;

/// The configuration options for a thread context pool.
#[derive(Clone, Debug, Default)]
pub struct ThreadContextPoolOptions {
    /// An optional number of event loop threads. If not specified the
    /// default is the number of CPUs plus one.
    pub io_threads: Option<usize>,
    /// An optional name used for thread names and log entries. The default
    /// is `breakshot`.
    pub name: Option<String>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to using the
    /// [`slog-stdlog`](https://docs.rs/slog-stdlog) drain.
    pub log: Option<Logger>,
}

/// The readiness events a connection delivers to its handlers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    Read,
    Write,
    Error,
}

/// The set of events a connection currently delivers.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const ALL: EventMask = EventMask(0b111);

    fn bit(event: Event) -> u8 {
        match event {
            Event::Read => 0b001,
            Event::Write => 0b010,
            Event::Error => 0b100,
        }
    }

    pub fn of(events: &[Event]) -> EventMask {
        EventMask(events.iter().fold(0, |m, e| m | Self::bit(*e)))
    }

    pub fn contains(self, event: Event) -> bool {
        self.0 & Self::bit(event) != 0
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::ALL
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<&str> = [Event::Read, Event::Write, Event::Error]
            .iter()
            .filter(|e| self.contains(**e))
            .map(|e| match e {
                Event::Read => "read",
                Event::Write => "write",
                Event::Error => "error",
            })
            .collect();
        write!(f, "EventMask({})", names.join("|"))
    }
}

pub(crate) type Task = Box<dyn FnOnce(&mut LoopContext) + Send>;
pub(crate) type PostLoopHook =
    Box<dyn FnMut(&mut LoopContext, &Subscription) + Send>;

// Messages from other threads to an event loop.
pub(crate) enum Command {
    Task(Task),
    PostLoop(Subscription, PostLoopHook),
    Shutdown,
}
