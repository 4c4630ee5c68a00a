//! Snapshot publication for the presentation layer.
//!
//! Each store owns one [`Observable`] and publishes a fresh immutable snapshot after
//! every mutation. Readers either poll [`Observable::load`] or hold a [`Subscription`].

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;

pub struct Observable<S> {
    current: ArcSwap<S>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Arc<S>>>>,
}

impl<S> Observable<S> {
    pub fn new(initial: S) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the most recently published snapshot.
    pub fn load(&self) -> Arc<S> {
        self.current.load_full()
    }

    pub fn publish(&self, snapshot: S) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Self::store_and_notify(&self.current, &mut subscribers, Arc::new(snapshot));
    }

    /// Edits a copy of the current snapshot and publishes it.
    ///
    /// Writers are serialized, so two concurrent updates never lose each other's edits.
    pub fn update<R>(&self, edit: impl FnOnce(&mut S) -> R) -> R
    where
        S: Clone,
    {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = S::clone(&self.current.load());
        let result = edit(&mut next);
        Self::store_and_notify(&self.current, &mut subscribers, Arc::new(next));
        result
    }

    fn store_and_notify(
        current: &ArcSwap<S>,
        subscribers: &mut Vec<mpsc::UnboundedSender<Arc<S>>>,
        snapshot: Arc<S>,
    ) {
        current.store(snapshot.clone());
        subscribers.retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
    }

    pub fn subscribe(&self) -> Subscription<S> {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(updates_tx);
        Subscription {
            updates: updates_rx,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<S: Default> Default for Observable<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

/// Receiving end of an [`Observable`]; dropping it unsubscribes on the next publish.
pub struct Subscription<S> {
    updates: mpsc::UnboundedReceiver<Arc<S>>,
}

impl<S> Subscription<S> {
    pub async fn recv(&mut self) -> Option<Arc<S>> {
        self.updates.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<S>> {
        self.updates.try_recv().ok()
    }

    /// Drains queued updates and keeps only the newest one.
    pub fn latest(&mut self) -> Option<Arc<S>> {
        let mut newest = None;
        while let Some(snapshot) = self.try_recv() {
            newest = Some(snapshot);
        }
        newest
    }
}
