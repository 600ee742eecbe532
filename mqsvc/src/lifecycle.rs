//! Ownership tree for disposable messaging resources.
//!
//! Every owner (connection, channel, RPC client) embeds a [`Lifecycle`].
//! An owner holds its live children by id until they are disposed; a child
//! disposed on its own removes its entry through its [`ChildToken`], and an
//! owner being disposed walks the remaining entries depth-first before
//! releasing its own resource. The `disposed` flag is the visited guard:
//! whoever flips it first does the work, everybody else waits until that
//! work has released the resource.

use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// A node of the ownership tree.
#[async_trait]
pub trait Disposable: Send + Sync + 'static {
    /// Dispose descendants, then release this node's resource. Idempotent.
    async fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Disposal state and child registry of one node.
pub struct Lifecycle {
    resource: &'static str,
    disposed: AtomicBool,
    released: watch::Sender<bool>,
    children: DashMap<u64, Arc<dyn Disposable>>,
    next_child: AtomicU64,
}

impl Lifecycle {
    pub fn new(resource: &'static str) -> Arc<Self> {
        Arc::new(Self {
            resource,
            disposed: AtomicBool::new(false),
            released: watch::Sender::new(false),
            children: DashMap::new(),
            next_child: AtomicU64::new(1),
        })
    }

    pub fn resource(&self) -> &'static str {
        self.resource
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Fails with [`Error::Disposed`] once disposal has begun.
    pub fn ensure_alive(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::disposed(self.resource))
        } else {
            Ok(())
        }
    }

    /// Reserve a slot for a child that is about to be built.
    pub fn reserve(self: &Arc<Self>) -> ChildToken {
        ChildToken {
            parent: Arc::downgrade(self),
            id: self.next_child.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Track `child` under `token`.
    ///
    /// Fails if this node is already being disposed; the caller still owns
    /// the child and must dispose it.
    pub fn attach(&self, token: &ChildToken, child: Arc<dyn Disposable>) -> Result<()> {
        self.children.insert(token.id, child);
        // Re-check after the insert: a concurrent dispose either drained the
        // entry already or will not see it.
        if self.is_disposed() {
            self.children.remove(&token.id);
            return Err(Error::disposed(self.resource));
        }
        Ok(())
    }

    fn detach(&self, id: u64) {
        self.children.remove(&id);
    }

    pub fn live_children(&self) -> usize {
        self.children.len()
    }

    /// Flip the visited guard. Returns `true` for the first caller only,
    /// who must call [`finish_dispose`](Self::finish_dispose) once the
    /// resource is released. Later callers wait for that and get `false`.
    pub async fn begin_dispose(&self) -> bool {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            return true;
        }
        self.wait_released().await;
        false
    }

    /// Mark the resource released and wake every waiting disposer.
    pub fn finish_dispose(&self) {
        self.released.send_replace(true);
    }

    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    async fn wait_released(&self) {
        let mut released = self.released.subscribe();
        // The sender lives in `self`, so the wait cannot fail.
        let _ = released.wait_for(|done| *done).await;
    }

    /// Dispose every child still tracked, concurrently. Must follow
    /// [`begin_dispose`](Self::begin_dispose).
    pub async fn dispose_children(&self) {
        let ids: Vec<u64> = self.children.iter().map(|entry| *entry.key()).collect();
        // Shard locks are released before any child is awaited.
        let children: Vec<Arc<dyn Disposable>> = ids
            .into_iter()
            .filter_map(|id| self.children.remove(&id).map(|(_, child)| child))
            .collect();
        join_all(children.iter().map(|child| child.dispose())).await;
    }
}

/// A child's handle on its slot in the parent.
pub struct ChildToken {
    parent: Weak<Lifecycle>,
    id: u64,
}

impl ChildToken {
    /// Remove the child from its parent; a no-op if the parent is gone.
    pub fn detach(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.detach(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Node {
        lifecycle: Arc<Lifecycle>,
        token: Option<ChildToken>,
        released: AtomicUsize,
        release_delay: Option<Duration>,
    }

    impl Node {
        fn root() -> Arc<Self> {
            Arc::new(Self {
                lifecycle: Lifecycle::new("node"),
                token: None,
                released: AtomicUsize::new(0),
                release_delay: None,
            })
        }

        fn child(parent: &Arc<Node>) -> Result<Arc<Self>> {
            Self::slow_child(parent, None)
        }

        fn slow_child(parent: &Arc<Node>, release_delay: Option<Duration>) -> Result<Arc<Self>> {
            let node = Arc::new(Self {
                lifecycle: Lifecycle::new("node"),
                token: Some(parent.lifecycle.reserve()),
                released: AtomicUsize::new(0),
                release_delay,
            });
            let child: Arc<dyn Disposable> = node.clone();
            parent
                .lifecycle
                .attach(node.token.as_ref().expect("token set"), child)?;
            Ok(node)
        }
    }

    #[async_trait]
    impl Disposable for Node {
        async fn dispose(&self) {
            if !self.lifecycle.begin_dispose().await {
                return;
            }
            self.lifecycle.dispose_children().await;
            if let Some(delay) = self.release_delay {
                tokio::time::sleep(delay).await;
            }
            self.released.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.token {
                token.detach();
            }
            self.lifecycle.finish_dispose();
        }

        fn is_disposed(&self) -> bool {
            self.lifecycle.is_disposed()
        }
    }

    #[tokio::test]
    async fn test_cascade_disposes_every_descendant_once() {
        let root = Node::root();
        let a = Node::child(&root).unwrap();
        let b = Node::child(&root).unwrap();
        let a1 = Node::child(&a).unwrap();
        let b1 = Node::child(&b).unwrap();

        root.dispose().await;
        root.dispose().await;

        for node in [&root, &a, &b, &a1, &b1] {
            assert!(node.is_disposed());
            assert_eq!(node.released.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_child_disposed_first_detaches() {
        let root = Node::root();
        let a = Node::child(&root).unwrap();
        let _b = Node::child(&root).unwrap();
        assert_eq!(root.lifecycle.live_children(), 2);

        a.dispose().await;
        assert_eq!(root.lifecycle.live_children(), 1);

        root.dispose().await;
        assert_eq!(a.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_dispose_releases_once() {
        let root = Node::root();
        let children: Vec<_> = (0..16).map(|_| Node::child(&root).unwrap()).collect();

        let mut handles = Vec::new();
        for child in children.iter().take(8).cloned() {
            handles.push(tokio::spawn(async move { child.dispose().await }));
        }
        let root_clone = root.clone();
        handles.push(tokio::spawn(async move { root_clone.dispose().await }));
        for handle in handles {
            handle.await.unwrap();
        }

        for child in &children {
            assert_eq!(child.released.load(Ordering::SeqCst), 1);
        }
        assert_eq!(root.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attach_after_dispose_fails() {
        let root = Node::root();
        root.dispose().await;
        let err = Node::child(&root).err().expect("attach must fail");
        assert!(matches!(err, Error::Disposed { .. }));
        assert_eq!(root.lifecycle.live_children(), 0);
    }

    #[tokio::test]
    async fn test_second_disposer_waits_for_release() {
        let root = Node::root();
        let slow = Node::slow_child(&root, Some(Duration::from_millis(50))).unwrap();

        let first = {
            let slow = slow.clone();
            tokio::spawn(async move { slow.dispose().await })
        };
        while !slow.is_disposed() {
            tokio::task::yield_now().await;
        }

        slow.dispose().await;
        assert!(slow.lifecycle.is_released());
        assert_eq!(slow.released.load(Ordering::SeqCst), 1);
        first.await.unwrap();
    }
}
