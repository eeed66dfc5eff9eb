//! Lifecycle handler collections.
//!
//! A [`HandlerSet`] can be linked to child sets: handlers added to or removed
//! from the parent are forwarded to every child, so a multiplexer registers
//! a handler once and each underlying channel sees it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};

use super::core::{Channel, ChannelInformation};
use crate::error::LimeError;
use crate::protocol::{Node, SessionState};
use crate::sync::lock;

/// Snapshot of a channel whose operation or creation failed.
#[derive(Debug, Clone)]
pub struct FailedChannelInformation {
    /// Session ID, if the channel got that far
    pub session_id: Option<String>,
    /// Session state at failure time
    pub state: SessionState,
    /// Local node
    pub local_node: Option<Node>,
    /// Remote node
    pub remote_node: Option<Node>,
    /// Whether the transport was still connected
    pub is_connected: bool,
    /// The failure
    pub error: Arc<LimeError>,
    /// Name of the failed operation
    pub operation_name: String,
}

impl FailedChannelInformation {
    /// Snapshot `channel` after `error` in `operation_name`
    pub fn from_channel(channel: &Channel, error: Arc<LimeError>, operation_name: &str) -> Self {
        let ChannelInformation {
            session_id,
            state,
            local_node,
            remote_node,
        } = channel.information();
        Self {
            session_id,
            state,
            local_node,
            remote_node,
            is_connected: channel.transport().is_connected(),
            error,
            operation_name: operation_name.to_string(),
        }
    }

    /// Failure without a channel, such as a failed build
    pub fn without_channel(state: SessionState, error: Arc<LimeError>, operation_name: &str) -> Self {
        Self {
            session_id: None,
            state,
            local_node: None,
            remote_node: None,
            is_connected: false,
            error,
            operation_name: operation_name.to_string(),
        }
    }
}

/// Called when a channel is created or discarded
pub type ChannelHandler = Arc<dyn Fn(ChannelInformation) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called when a channel operation or creation fails. Returning `true` asks
/// for a retry on a new channel.
pub type FailedChannelHandler =
    Arc<dyn Fn(FailedChannelInformation) -> BoxFuture<'static, bool> + Send + Sync>;

/// Identifies a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

struct Entries<H> {
    handlers: Vec<(HandlerId, H)>,
    children: Vec<HandlerSet<H>>,
}

/// Shared, linkable collection of handlers.
///
/// Cloning yields another handle to the same collection.
pub struct HandlerSet<H> {
    entries: Arc<Mutex<Entries<H>>>,
}

impl<H> Clone for HandlerSet<H> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<H> Default for HandlerSet<H> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                handlers: Vec::new(),
                children: Vec::new(),
            })),
        }
    }
}

impl<H> fmt::Debug for HandlerSet<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = lock(&self.entries);
        f.debug_struct("HandlerSet")
            .field("handlers", &entries.handlers.len())
            .field("children", &entries.children.len())
            .finish()
    }
}

impl<H: Clone> HandlerSet<H> {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler here and in every linked child
    pub fn add(&self, handler: H) -> HandlerId {
        let id = HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed));
        self.insert(id, handler);
        id
    }

    /// Unregister a handler here and in every linked child
    pub fn remove(&self, id: HandlerId) -> bool {
        let children = {
            let mut entries = lock(&self.entries);
            let before = entries.handlers.len();
            entries.handlers.retain(|(handler_id, _)| *handler_id != id);
            if entries.handlers.len() == before {
                return false;
            }
            entries.children.clone()
        };
        for child in children {
            child.remove(id);
        }
        true
    }

    /// Forward current and future registrations to `child`
    pub fn link(&self, child: &HandlerSet<H>) {
        let existing = {
            let mut entries = lock(&self.entries);
            entries.children.push(child.clone());
            entries.handlers.clone()
        };
        for (id, handler) in existing {
            child.insert(id, handler);
        }
    }

    /// Registered handlers in registration order
    pub fn snapshot(&self) -> Vec<H> {
        lock(&self.entries)
            .handlers
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        lock(&self.entries).handlers.len()
    }

    /// Check if no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, id: HandlerId, handler: H) {
        let children = {
            let mut entries = lock(&self.entries);
            if entries.handlers.iter().any(|(existing, _)| *existing == id) {
                return;
            }
            entries.handlers.push((id, handler.clone()));
            entries.children.clone()
        };
        for child in children {
            child.insert(id, handler.clone());
        }
    }
}

impl HandlerSet<ChannelHandler> {
    /// Await every handler with the same snapshot
    pub async fn invoke(&self, information: ChannelInformation) {
        join_all(
            self.snapshot()
                .into_iter()
                .map(|handler| handler(information.clone())),
        )
        .await;
    }
}

impl HandlerSet<FailedChannelHandler> {
    /// Await every handler; `true` only if at least one is registered and
    /// all of them ask for a retry.
    pub async fn invoke(&self, information: FailedChannelInformation) -> bool {
        let handlers = self.snapshot();
        if handlers.is_empty() {
            return false;
        }
        join_all(handlers.into_iter().map(|handler| handler(information.clone())))
            .await
            .into_iter()
            .all(|retry| retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> ChannelHandler {
        let counter = counter.clone();
        Arc::new(move |_info: ChannelInformation| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    fn answering(retry: bool) -> FailedChannelHandler {
        Arc::new(move |_info: FailedChannelInformation| async move { retry }.boxed())
    }

    fn information() -> ChannelInformation {
        ChannelInformation {
            session_id: None,
            state: SessionState::Established,
            local_node: None,
            remote_node: None,
        }
    }

    fn failure() -> FailedChannelInformation {
        FailedChannelInformation::without_channel(
            SessionState::New,
            Arc::new(LimeError::Transport("reset".to_string())),
            "build",
        )
    }

    #[tokio::test]
    async fn test_invoke_all_handlers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let set: HandlerSet<ChannelHandler> = HandlerSet::new();
        set.add(counting(&counter));
        set.add(counting(&counter));

        set.invoke(information()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_handlers_vote() {
        let set: HandlerSet<FailedChannelHandler> = HandlerSet::new();
        assert!(!set.invoke(failure()).await);

        let yes = set.add(answering(true));
        assert!(set.invoke(failure()).await);

        let no = set.add(answering(false));
        assert!(!set.invoke(failure()).await);

        set.remove(no);
        assert!(set.invoke(failure()).await);
        set.remove(yes);
        assert!(!set.invoke(failure()).await);
    }

    #[test]
    fn test_link_forwards_add_and_remove() {
        let counter = Arc::new(AtomicUsize::new(0));
        let parent: HandlerSet<ChannelHandler> = HandlerSet::new();
        let child = HandlerSet::new();
        let other_child = HandlerSet::new();

        let early = parent.add(counting(&counter));
        parent.link(&child);
        parent.link(&other_child);
        assert_eq!(child.len(), 1);

        let late = parent.add(counting(&counter));
        assert_eq!(child.len(), 2);
        assert_eq!(other_child.len(), 2);

        // Handlers registered directly on a child stay local to it.
        child.add(counting(&counter));
        assert_eq!(parent.len(), 2);
        assert_eq!(child.len(), 3);

        assert!(parent.remove(early));
        assert!(parent.remove(late));
        assert_eq!(child.len(), 1);
        assert!(other_child.is_empty());
        assert!(!parent.remove(late));
    }
}
