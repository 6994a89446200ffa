// Connection handle bound to one broker session.
use anyhow::{Context, Result};
use bytes::Bytes;
use courier_broker::{Broker, Message, Session, SubscribeOptions};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::client::delivery::{Delivery, Responder};
use crate::client::subscription::{CallbackSubscription, Subscription};
use crate::config::ConnectOptions;

/// Client connection to an in-process broker.
///
/// Clones share one session. The session is closed by [`Connection::close`]
/// or when the last clone is dropped; either way its subscriptions go away
/// and its outstanding requests fail.
///
/// ```
/// use courier_broker::{Broker, SubscribeOptions};
/// use courier_client::{ConnectOptions, Connection};
/// use std::sync::Arc;
///
/// let broker = Arc::new(Broker::open());
/// let conn = Connection::connect(broker, ConnectOptions::named("docs")).expect("connect");
/// let mut sub = conn
///     .subscribe("greetings.*", SubscribeOptions::default())
///     .expect("subscribe");
/// conn.publish("greetings.world", "hello").expect("publish");
/// assert_eq!(sub.try_next().expect("delivery").text(), "hello");
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    broker: Arc<Broker>,
    session: Session,
    options: ConnectOptions,
    // Callback tasks owned by this connection; aborted on close.
    callbacks: Mutex<Vec<AbortHandle>>,
}

impl Connection {
    /// Authenticate against `broker`.
    ///
    /// Credential failures surface the broker's `Authorization Violation`.
    pub fn connect(broker: Arc<Broker>, options: ConnectOptions) -> Result<Self> {
        let session = broker.connect(&options.credentials)?;
        tracing::debug!(
            name = options.name.as_deref(),
            connection_id = %session.id(),
            "client connected"
        );
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                broker,
                session,
                options,
                callbacks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.options.name.as_deref()
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.inner.broker
    }

    pub fn is_closed(&self) -> bool {
        self.inner.session.is_closed()
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.options.request_timeout
    }

    fn responder(&self) -> Responder {
        Responder::new(Arc::clone(&self.inner.broker), self.inner.session.clone())
    }

    pub fn subscribe(&self, subject: &str, options: SubscribeOptions) -> Result<Subscription> {
        let inner = self
            .inner
            .broker
            .subscribe(&self.inner.session, subject, options)?;
        Ok(Subscription::new(inner, self.responder()))
    }

    /// Subscribe and run `callback` for each delivery on its own task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe_with<F>(
        &self,
        subject: &str,
        options: SubscribeOptions,
        mut callback: F,
    ) -> Result<CallbackSubscription>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .context("callback subscriptions need a tokio runtime")?;
        let mut subscription = self.subscribe(subject, options)?;
        let id = subscription.id();
        let task = runtime.spawn(async move {
            while let Some(delivery) = subscription.next().await {
                callback(delivery);
            }
        });
        let mut callbacks = self.inner.callbacks.lock();
        callbacks.retain(|handle| !handle.is_finished());
        callbacks.push(task.abort_handle());
        Ok(CallbackSubscription::new(id, task))
    }

    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<usize> {
        self.publish_message(Message::new(subject, payload))
    }

    pub fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl Into<Bytes>,
    ) -> Result<usize> {
        self.publish_message(Message::new(subject, payload).with_reply(reply))
    }

    pub fn publish_message(&self, message: Message) -> Result<usize> {
        Ok(self.inner.broker.publish(&self.inner.session, message)?)
    }

    /// Request with the connection's default timeout.
    pub async fn request(&self, subject: &str, payload: impl Into<Bytes>) -> Result<Delivery> {
        self.request_with_timeout(subject, payload, self.inner.options.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Delivery> {
        let reply = self
            .inner
            .broker
            .request(&self.inner.session, subject, payload, timeout)
            .await?;
        Ok(self.responder().wrap(reply))
    }

    /// Close the session. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.inner.shutdown()
    }
}

impl ConnectionInner {
    fn shutdown(&self) -> bool {
        for handle in self.callbacks.lock().drain(..) {
            handle.abort();
        }
        let closed = self.broker.disconnect(&self.session);
        if closed {
            tracing::debug!(
                name = self.options.name.as_deref(),
                connection_id = %self.session.id(),
                "client closed"
            );
        }
        closed
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.options.name)
            .field("connection_id", &self.inner.session.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
