//! Cancellation tree for in-flight calls and long-running loops.
//!
//! A [`Context`] can be cloned freely; clones share the same node. A child
//! created with [`Context::child`] is cancelled whenever its parent is, but
//! cancelling the child leaves the parent and its siblings alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Node {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<Node>>>,
}

impl Node {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();

        let children = std::mem::take(
            &mut *self
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// A node in the cancellation tree.
#[derive(Debug, Clone, Default)]
pub struct Context {
    node: Arc<Node>,
}

impl Context {
    /// Creates a new root context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a child context.
    pub fn child(&self) -> Self {
        let child = Self::new();

        let mut children = self
            .node
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            drop(children);
            child.cancel();
            return child;
        }
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&child.node));

        child
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.node.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.node.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the context has been cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.node.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Returns a guard that cancels this context when dropped.
    pub fn drop_guard(&self) -> DropGuard {
        DropGuard {
            ctx: Some(self.clone()),
        }
    }
}

/// Cancels the wrapped context on drop unless disarmed.
#[derive(Debug)]
pub struct DropGuard {
    ctx: Option<Context>,
}

impl DropGuard {
    pub fn disarm(mut self) {
        self.ctx = None;
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parent_cancels_children() {
        let parent = Context::new();
        let a = parent.child();
        let b = a.child();

        parent.cancel();

        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn child_does_not_cancel_parent_or_sibling() {
        let parent = Context::new();
        let a = parent.child();
        let b = parent.child();

        a.cancel();

        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let parent = Context::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn drop_guard_cancels_unless_disarmed() {
        let ctx = Context::new();
        drop(ctx.drop_guard());
        assert!(ctx.is_cancelled());

        let other = Context::new();
        other.drop_guard().disarm();
        assert!(!other.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let parent = Context::new();
        let child = parent.child();

        let waiter = tokio::spawn(async move { child.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        parent.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke up")
            .expect("task joined");
    }
}
