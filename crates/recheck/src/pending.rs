//! Correlation of request ids with waiting callers.
//!
//! The registry also owns the "pinned" signal: it flips to `true` when the
//! first entry is registered and back to `false` when the last one leaves,
//! and never fires in between. Owners use it to keep their host alive
//! exactly while work is outstanding.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::agent::AgentError;
use crate::options::{ProgressSender, progress_text};

/// Id-keyed table of outstanding work.
pub struct PendingRegistry<E> {
    next_id: u64,
    entries: HashMap<u64, E>,
    pinned: watch::Sender<bool>,
}

impl<E> Default for PendingRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> PendingRegistry<E> {
    pub fn new() -> Self {
        let (pinned, _) = watch::channel(false);
        Self {
            next_id: 0,
            entries: HashMap::new(),
            pinned,
        }
    }

    /// Next id. Strictly increasing, starting at 0, never reused.
    pub fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn register(&mut self, id: u64, entry: E) {
        if self.entries.insert(id, entry).is_some() {
            tracing::error!(id, "Bug: id registered twice, previous entry dropped");
        }
        self.sync_pin();
    }

    pub fn get(&self, id: u64) -> Option<&E> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut E> {
        self.entries.get_mut(&id)
    }

    /// Remove an entry. `None` if it was already settled or never existed.
    pub fn remove(&mut self, id: u64) -> Option<E> {
        let entry = self.entries.remove(&id);
        if entry.is_some() {
            self.sync_pin();
        }
        entry
    }

    /// Remove every entry, in ascending id order.
    pub fn drain(&mut self) -> Vec<(u64, E)> {
        let mut drained: Vec<_> = self.entries.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        self.sync_pin();
        drained
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Observe the pinned signal.
    pub fn pinned(&self) -> watch::Receiver<bool> {
        self.pinned.subscribe()
    }

    pub fn is_pinned(&self) -> bool {
        *self.pinned.borrow()
    }

    fn sync_pin(&self) {
        let outstanding = !self.entries.is_empty();
        let changed = self.pinned.send_if_modified(|pinned| {
            if *pinned == outstanding {
                return false;
            }
            *pinned = outstanding;
            true
        });
        if changed {
            if outstanding {
                tracing::debug!("Pinned: work outstanding");
            } else {
                tracing::debug!("Unpinned: no work outstanding");
            }
        }
    }
}

/// Sender half that settles one agent request.
pub type Resolver = oneshot::Sender<Result<Value, AgentError>>;

/// Where progress pushes for one request go.
#[derive(Debug, Clone)]
pub enum Subscriber {
    /// Raw message payloads.
    Raw(mpsc::UnboundedSender<Value>),
    /// Messages rendered as text (check progress).
    Text(ProgressSender),
}

impl Subscriber {
    /// Returns `false` once the receiving side is gone.
    pub fn send(&self, message: Value) -> bool {
        match self {
            Self::Raw(tx) => tx.send(message).is_ok(),
            Self::Text(tx) => tx.send(progress_text(message)).is_ok(),
        }
    }
}

impl From<mpsc::UnboundedSender<Value>> for Subscriber {
    fn from(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self::Raw(tx)
    }
}

impl From<ProgressSender> for Subscriber {
    fn from(tx: ProgressSender) -> Self {
        Self::Text(tx)
    }
}

/// A caller waiting on an agent request.
pub struct PendingCall {
    resolve: Resolver,
    subscribe: Option<Subscriber>,
}

impl PendingCall {
    pub fn new(resolve: Resolver, subscribe: Option<Subscriber>) -> Self {
        Self { resolve, subscribe }
    }
}

impl PendingRegistry<PendingCall> {
    /// Settle `id` with a terminal value. Unknown ids are a silent no-op.
    pub fn resolve(&mut self, id: u64, result: Value) -> bool {
        self.settle(id, Ok(result))
    }

    /// Settle `id` with an error. Unknown ids are a silent no-op.
    pub fn reject(&mut self, id: u64, error: AgentError) -> bool {
        self.settle(id, Err(error))
    }

    /// Forward a progress message without settling. Unknown ids are ignored.
    pub fn push(&mut self, id: u64, message: Value) -> bool {
        let Some(call) = self.entries.get(&id) else {
            return false;
        };
        if let Some(subscribe) = &call.subscribe
            && !subscribe.send(message)
        {
            tracing::trace!(id, "Progress subscriber dropped");
        }
        true
    }

    /// Reject every outstanding call with the error produced by `error`.
    pub fn reject_all(&mut self, error: impl Fn() -> AgentError) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for (id, call) in drained {
            if call.resolve.send(Err(error())).is_err() {
                tracing::trace!(id, "Caller gone before rejection");
            }
        }
        count
    }

    fn settle(&mut self, id: u64, outcome: Result<Value, AgentError>) -> bool {
        let Some(call) = self.remove(id) else {
            tracing::trace!(id, "Ignoring response for unknown id");
            return false;
        };
        if call.resolve.send(outcome).is_err() {
            tracing::trace!(id, "Caller gone before response");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> (PendingCall, oneshot::Receiver<Result<Value, AgentError>>) {
        let (tx, rx) = oneshot::channel();
        (PendingCall::new(tx, None), rx)
    }

    #[test]
    fn allocate_is_monotonic_from_zero() {
        let mut registry = PendingRegistry::<()>::new();
        let ids: Vec<u64> = (0..5).map(|_| registry.allocate()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn ids_are_not_reused_after_settling() {
        let mut registry = PendingRegistry::new();
        let id = registry.allocate();
        registry.register(id, ());
        registry.remove(id);
        assert_eq!(registry.allocate(), 1);
    }

    #[tokio::test]
    async fn resolve_settles_once() {
        let mut registry = PendingRegistry::new();
        let id = registry.allocate();
        let (entry, rx) = call();
        registry.register(id, entry);

        assert!(registry.resolve(id, json!(42)));
        assert!(!registry.resolve(id, json!(43)));
        assert_eq!(registry.size(), 0);
        assert_eq!(rx.await.unwrap().unwrap(), json!(42));
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut registry = PendingRegistry::<PendingCall>::new();
        assert!(!registry.resolve(99, json!({})));
        assert!(!registry.push(99, json!("m")));
        assert!(!registry.reject(99, AgentError::Killed));
    }

    #[tokio::test]
    async fn push_forwards_without_settling() {
        let mut registry = PendingRegistry::new();
        let (tx, rx) = oneshot::channel();
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<Value>();
        let id = registry.allocate();
        registry.register(id, PendingCall::new(tx, Some(Subscriber::from(sub_tx))));

        assert!(registry.push(id, json!("first")));
        assert!(registry.push(id, json!("second")));
        assert_eq!(registry.size(), 1);

        registry.resolve(id, json!(null));
        assert_eq!(sub_rx.recv().await, Some(json!("first")));
        assert_eq!(sub_rx.recv().await, Some(json!("second")));
        // Subscriber closes once the call settles.
        assert_eq!(sub_rx.recv().await, None);
        assert_eq!(rx.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn text_subscriber_renders_messages() {
        let mut registry = PendingRegistry::new();
        let (tx, _rx) = oneshot::channel();
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<String>();
        let id = registry.allocate();
        registry.register(id, PendingCall::new(tx, Some(sub_tx.into())));

        registry.push(id, json!("analyzing"));
        registry.push(id, json!({"phase": 2}));
        assert_eq!(sub_rx.recv().await.as_deref(), Some("analyzing"));
        assert_eq!(sub_rx.recv().await.as_deref(), Some(r#"{"phase":2}"#));
    }

    #[test]
    fn pin_fires_only_on_boundaries() {
        let mut registry = PendingRegistry::new();
        let mut pinned = registry.pinned();
        assert!(!*pinned.borrow_and_update());

        registry.register(0, ());
        assert!(pinned.has_changed().unwrap());
        assert!(*pinned.borrow_and_update());

        registry.register(1, ());
        assert!(!pinned.has_changed().unwrap());

        registry.remove(0);
        assert!(!pinned.has_changed().unwrap());
        assert!(registry.is_pinned());

        registry.remove(1);
        assert!(pinned.has_changed().unwrap());
        assert!(!*pinned.borrow_and_update());

        // Removing an unknown id does not re-fire.
        registry.remove(1);
        assert!(!pinned.has_changed().unwrap());
    }

    #[tokio::test]
    async fn reject_all_drains_and_unpins() {
        let mut registry = PendingRegistry::new();
        let (a, rx_a) = call();
        let (b, rx_b) = call();
        let first = registry.allocate();
        let second = registry.allocate();
        registry.register(first, a);
        registry.register(second, b);

        assert_eq!(registry.reject_all(|| AgentError::Killed), 2);
        assert!(!registry.is_pinned());
        assert!(matches!(rx_a.await.unwrap(), Err(AgentError::Killed)));
        assert!(matches!(rx_b.await.unwrap(), Err(AgentError::Killed)));
    }
}
