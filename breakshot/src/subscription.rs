// Copyright 2020 Joyent, Inc.

//! Callback registration with cancellable handles.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Handle to a registered callback. Cloning shares the registration, so any
/// clone may cancel it.
#[derive(Clone)]
pub struct Subscription(Arc<AtomicBool>);

impl Subscription {
    pub fn new() -> Self {
        Subscription(Arc::new(AtomicBool::new(true)))
    }

    /// Cancel the registration. The callback is not invoked again once this
    /// returns, except for an invocation that is already running.
    pub fn unsubscribe(&self) {
        self.0.store(false, Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Subscription").field(&self.is_active()).finish()
    }
}

/// An ordered list of callbacks of type `F`, usually a `dyn FnMut(..)`.
pub struct Publisher<F: ?Sized> {
    subscribers: Vec<(Subscription, Box<F>)>,
}

impl<F: ?Sized> Publisher<F> {
    pub fn new() -> Self {
        Publisher {
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, callback: Box<F>) -> Subscription {
        let subscription = Subscription::new();
        self.subscribers.push((subscription.clone(), callback));
        subscription
    }

    /// Hand every active callback to `invoke` in registration order, dropping
    /// the cancelled ones.
    pub fn for_each<I>(&mut self, mut invoke: I)
    where
        I: FnMut(&mut F),
    {
        self.subscribers.retain(|(s, _)| s.is_active());
        for (subscription, callback) in self.subscribers.iter_mut() {
            if subscription.is_active() {
                invoke(callback);
            }
        }
    }

    /// Cancel and drop every callback.
    pub fn clear(&mut self) {
        for (subscription, _) in self.subscribers.drain(..) {
            subscription.unsubscribe();
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.iter().filter(|(s, _)| s.is_active()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the callbacks out so they can run while their owner is borrowed.
    /// Pair with [`Publisher::restore`].
    pub fn take(&mut self) -> Publisher<F> {
        Publisher {
            subscribers: std::mem::take(&mut self.subscribers),
        }
    }

    /// Put taken callbacks back in front of any registered in the meantime.
    pub fn restore(&mut self, mut taken: Publisher<F>) {
        taken.subscribers.append(&mut self.subscribers);
        self.subscribers = taken.subscribers;
    }
}

impl<F: ?Sized> Default for Publisher<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for Publisher<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("subscribers", &self.len())
            .finish()
    }
}
