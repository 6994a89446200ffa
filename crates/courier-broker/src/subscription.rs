// Subscriber-facing handles: receive queue plus an RAII unsubscribe guard.
use courier_authz::SubjectPattern;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::Message;
use crate::account::Account;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Broker-wide unique subscription id. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options accepted by `subscribe`.
///
/// ```
/// use courier_broker::SubscribeOptions;
///
/// let options = SubscribeOptions::queue("workers");
/// assert_eq!(options.queue.as_deref(), Some("workers"));
/// assert!(SubscribeOptions::default().queue.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub queue: Option<String>,
}

impl SubscribeOptions {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            queue: Some(name.into()),
        }
    }
}

/// Cloneable reference to a registered subscription. Unlike the guard it
/// does not own the registration.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    account: Weak<Account>,
    key: usize,
    id: SubscriptionId,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the subscription once it has been handed `max` messages in
    /// total. The limit is enforced at routing time, so a queue group member
    /// that reaches it stops taking its turn. A `max` of zero, or one already
    /// reached, removes it now; queued messages remain receivable.
    ///
    /// Returns `false` if the subscription is already gone.
    pub fn unsubscribe_after(&self, max: u64) -> bool {
        self.account
            .upgrade()
            .is_some_and(|account| account.limit_deliveries(self.key, self.id, max))
    }

    fn remove(&self) {
        if let Some(account) = self.account.upgrade() {
            account.remove(self.key, self.id);
        }
    }
}

/// RAII handle that unregisters a subscription on drop.
#[derive(Debug)]
pub struct SubscriptionGuard {
    handle: SubscriptionHandle,
}

impl SubscriptionGuard {
    pub(crate) fn new(account: &Arc<Account>, key: usize, id: SubscriptionId) -> Self {
        Self {
            handle: SubscriptionHandle {
                account: Arc::downgrade(account),
                key,
                id,
            },
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.handle.id
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.handle.remove();
    }
}

/// Receiver wrapper that keeps the unsubscribe guard alive for the receiver lifetime.
///
/// `recv` yields messages in the order they were routed to this subscription
/// and returns `None` once the subscription is removed (unsubscribe, message
/// limit or disconnect) and its queue is drained.
#[derive(Debug)]
pub struct Subscription {
    pattern: SubjectPattern,
    queue: Option<Arc<str>>,
    receiver: mpsc::Receiver<Message>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub(crate) fn new(
        pattern: SubjectPattern,
        queue: Option<Arc<str>>,
        receiver: mpsc::Receiver<Message>,
        guard: SubscriptionGuard,
    ) -> Self {
        Self {
            pattern,
            queue,
            receiver,
            guard,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.guard.id()
    }

    pub fn subject(&self) -> &SubjectPattern {
        &self.pattern
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Message, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.receiver.poll_recv(cx)
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.guard.handle()
    }

    /// See [`SubscriptionHandle::unsubscribe_after`].
    pub fn unsubscribe_after(&self, max: u64) -> bool {
        self.guard.handle.unsubscribe_after(max)
    }

    /// Messages queued but not yet received.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Remove the subscription now. Already-queued messages are discarded.
    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn into_parts(self) -> (mpsc::Receiver<Message>, SubscriptionGuard) {
        (self.receiver, self.guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let first = SubscriptionId::next();
        let second = SubscriptionId::next();
        assert!(second > first);
        assert_eq!(first.to_string(), first.as_u64().to_string());
    }

    #[test]
    fn orphaned_guard_drop_is_noop() {
        let guard = SubscriptionGuard {
            handle: SubscriptionHandle {
                account: Weak::new(),
                key: 0,
                id: SubscriptionId::next(),
            },
        };
        assert!(!guard.handle().unsubscribe_after(1));
        drop(guard);
    }
}
