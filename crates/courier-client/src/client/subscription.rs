// Client subscription handles: pull-based receiver and callback-driven task.
use courier_broker::{Subscription as BrokerSubscription, SubscriptionId};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use crate::client::delivery::{Delivery, Responder};

/// Pull-based subscription. Also usable as a [`Stream`] of [`Delivery`].
pub struct Subscription {
    // None once unsubscribed or the message limit was reached.
    inner: Option<BrokerSubscription>,
    responder: Responder,
    id: SubscriptionId,
    subject: String,
}

impl Subscription {
    pub(crate) fn new(inner: BrokerSubscription, responder: Responder) -> Self {
        let id = inner.id();
        let subject = inner.subject().to_string();
        Self {
            inner: Some(inner),
            responder,
            id,
            subject,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue(&self) -> Option<&str> {
        self.inner.as_ref().and_then(|inner| inner.queue())
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    /// Stop after `max` messages in total. The broker stops routing to this
    /// subscription once the limit is reached, so queue group peers pick up
    /// the rest. `0` unsubscribes immediately.
    pub fn unsubscribe_after(&mut self, max: u64) {
        if max == 0 {
            self.inner = None;
            return;
        }
        if let Some(inner) = self.inner.as_ref() {
            inner.unsubscribe_after(max);
        }
    }

    pub fn unsubscribe(&mut self) {
        self.inner = None;
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        let message = self.inner.as_mut()?.recv().await;
        self.observe(message)
    }

    /// Next queued delivery without waiting. An empty queue leaves the
    /// subscription active.
    pub fn try_next(&mut self) -> Option<Delivery> {
        match self.inner.as_mut()?.try_recv() {
            Ok(message) => self.observe(Some(message)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.observe(None),
        }
    }

    fn observe(&mut self, message: Option<courier_broker::Message>) -> Option<Delivery> {
        let Some(message) = message else {
            self.inner = None;
            return None;
        };
        Some(self.responder.wrap(message))
    }
}

impl Stream for Subscription {
    type Item = Delivery;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.poll_recv(cx) {
            Poll::Ready(message) => Poll::Ready(this.observe(message)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("active", &self.inner.is_some())
            .finish()
    }
}

/// Handle for a callback subscription. Dropping it stops the callback task
/// and removes the subscription.
#[derive(Debug)]
pub struct CallbackSubscription {
    id: SubscriptionId,
    task: Option<JoinHandle<()>>,
}

impl CallbackSubscription {
    pub(crate) fn new(id: SubscriptionId, task: JoinHandle<()>) -> Self {
        Self {
            id,
            task: Some(task),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for CallbackSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
