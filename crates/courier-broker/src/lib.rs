// In-process subject-based pub/sub broker.
// Accounts partition the subject namespace; each account owns its own
// subscription table, routing snapshot, and pending-request table so no lock
// is shared across tenants.
use ahash::RandomState;
use bytes::Bytes;
use courier_authz::{Action, SubjectPattern, validate_subject};
use courier_common::ids::{ConnectionId, ServerId};
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

mod account;
mod auth;
mod config;
mod message;
mod request;
mod session;
mod subscription;

use account::{Account, NewSubscription, Sink};
use auth::Authenticator;
use session::SessionRegistry;

pub use auth::{Credentials, Principal};
pub use config::{AccountConfig, AuthConfig, GLOBAL_ACCOUNT, UserConfig, UserPermissions};
pub use courier_authz::AuthzError;
pub use courier_common::LimitsConfig;
pub use message::{Headers, Message};
pub use request::{DEFAULT_INBOX_PREFIX, RequestState, new_inbox};
use request::InboxGuard;
pub use session::Session;
pub use subscription::{
    SubscribeOptions, Subscription, SubscriptionGuard, SubscriptionHandle, SubscriptionId,
};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Authorization Violation")]
    AuthorizationViolation,
    #[error("Permissions Violation for Publish to \"{subject}\"")]
    PublishViolation { subject: String },
    #[error("request to {subject} timed out")]
    Timeout { subject: String },
    #[error("no responders available for request to {subject}")]
    NoResponders { subject: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("Maximum Payload Violation ({size} > {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("invalid queue group: {0:?}")]
    InvalidQueueGroup(String),
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error(transparent)]
    Authz(#[from] AuthzError),
}

impl From<courier_common::Error> for BrokerError {
    fn from(err: courier_common::Error) -> Self {
        match err {
            courier_common::Error::Config(reason) => BrokerError::Config(reason),
            other => BrokerError::Config(other.to_string()),
        }
    }
}

/// Broker core shared by every connection.
///
/// ```
/// use courier_broker::{Broker, Credentials, Message, SubscribeOptions};
///
/// let broker = Broker::open();
/// let session = broker.connect(&Credentials::Anonymous).expect("connect");
/// let mut sub = broker
///     .subscribe(&session, "orders.*", SubscribeOptions::default())
///     .expect("subscribe");
/// let delivered = broker
///     .publish(&session, Message::new("orders.created", "id=7"))
///     .expect("publish");
/// assert_eq!(delivered, 1);
/// assert_eq!(sub.try_recv().expect("message").payload().as_ref(), b"id=7");
/// ```
#[derive(Debug)]
pub struct Broker {
    server_id: ServerId,
    authenticator: Authenticator,
    accounts: HashMap<Arc<str>, Arc<Account>, RandomState>,
    sessions: SessionRegistry,
    limits: LimitsConfig,
    inbox_prefix: Arc<str>,
}

impl Broker {
    /// Build a broker from validated authorization config.
    pub fn new(config: AuthConfig) -> Result<Self> {
        let authenticator = Authenticator::from_config(&config)?;
        let broker = Self::with_authenticator(authenticator, config.account_names());
        tracing::info!(
            server_id = %broker.server_id,
            accounts = broker.accounts.len(),
            auth_required = broker.auth_required(),
            "broker initialized"
        );
        Ok(broker)
    }

    /// Broker without authentication; every connection lands in the global
    /// account with full permissions.
    pub fn open() -> Self {
        Self::with_authenticator(Authenticator::open(), vec![GLOBAL_ACCOUNT])
    }

    fn with_authenticator(authenticator: Authenticator, account_names: Vec<&str>) -> Self {
        let mut accounts = HashMap::with_hasher(RandomState::new());
        for name in account_names {
            let name: Arc<str> = Arc::from(name);
            accounts.insert(Arc::clone(&name), Arc::new(Account::new(name)));
        }
        Self {
            server_id: ServerId::new(),
            authenticator,
            accounts,
            sessions: SessionRegistry::default(),
            limits: LimitsConfig::default(),
            inbox_prefix: Arc::from(DEFAULT_INBOX_PREFIX),
        }
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Result<Self> {
        limits.validate()?;
        self.limits = limits;
        Ok(self)
    }

    pub fn with_inbox_prefix(mut self, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_subject(&prefix)?;
        self.inbox_prefix = Arc::from(prefix);
        Ok(self)
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn auth_required(&self) -> bool {
        self.authenticator.auth_required()
    }

    pub fn limits(&self) -> LimitsConfig {
        self.limits
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Live session for `id`, if it is still connected.
    pub fn session(&self, id: ConnectionId) -> Option<Session> {
        self.sessions.get(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.accounts
            .values()
            .map(|account| account.subscription_count())
            .sum()
    }

    pub fn pending_request_count(&self) -> usize {
        self.accounts
            .values()
            .map(|account| account.correlator.len())
            .sum()
    }

    /// Authenticate and register a new session.
    ///
    /// # Errors
    /// [`BrokerError::AuthorizationViolation`] for any credential mismatch.
    pub fn connect(&self, credentials: &Credentials) -> Result<Session> {
        let principal = match self.authenticator.authenticate(credentials) {
            Ok(principal) => principal,
            Err(err) => {
                metrics::counter!("courier_auth_failures_total").increment(1);
                tracing::warn!(credentials = ?credentials, "authentication failed");
                return Err(err);
            }
        };
        if !self.accounts.contains_key(principal.account()) {
            return Err(BrokerError::UnknownAccount(principal.account().to_string()));
        }
        let session = self.sessions.register(principal);
        tracing::info!(
            connection_id = %session.id(),
            principal = session.principal().id(),
            account = session.account(),
            "session connected"
        );
        Ok(session)
    }

    /// Close a session: its subscriptions are removed and its pending
    /// requests fail with [`BrokerError::ConnectionClosed`]. Returns `false`
    /// if the session was already closed.
    pub fn disconnect(&self, session: &Session) -> bool {
        if !session.mark_closed() {
            return false;
        }
        self.sessions.deregister(session.id());
        let (mut failed, mut removed) = (0, 0);
        if let Some(account) = self.accounts.get(session.account()) {
            failed = account.correlator.fail_owner(session.id());
            removed = account.remove_owner(session.id());
        }
        tracing::info!(
            connection_id = %session.id(),
            account = session.account(),
            subscriptions = removed,
            failed_requests = failed,
            "session disconnected"
        );
        true
    }

    /// Register a subscription for `subject` (wildcards allowed).
    ///
    /// A pattern the principal may not subscribe to still returns a handle,
    /// but the subscription is inert and never receives messages.
    pub fn subscribe(
        &self,
        session: &Session,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let account = self.session_account(session)?;
        let pattern = SubjectPattern::parse(subject)?;
        let queue = match options.queue {
            Some(name) if name.is_empty() || name.contains(char::is_whitespace) => {
                return Err(BrokerError::InvalidQueueGroup(name));
            }
            Some(name) => Some(Arc::<str>::from(name)),
            None => None,
        };
        let authorized = session
            .principal()
            .permissions()
            .allows(Action::Subscribe, pattern.as_str());
        if !authorized {
            metrics::counter!("courier_permission_violations_total", "action" => Action::Subscribe.as_str())
                .increment(1);
            tracing::debug!(
                connection_id = %session.id(),
                subject = pattern.as_str(),
                "subscription registered inert: permission denied"
            );
        }

        let (sender, receiver) = mpsc::channel(self.limits.max_pending);
        let (key, id) = account.insert(NewSubscription {
            owner: session.id(),
            pattern: pattern.clone(),
            queue: queue.clone(),
            authorized,
            sink: Sink::Channel(sender),
        });
        // A concurrent disconnect may have swept the table before this insert.
        if session.is_closed() {
            account.remove(key, id);
            return Err(BrokerError::ConnectionClosed);
        }
        tracing::debug!(
            connection_id = %session.id(),
            subscription = %id,
            subject = pattern.as_str(),
            queue = queue.as_deref(),
            "subscribed"
        );
        Ok(Subscription::new(
            pattern,
            queue,
            receiver,
            SubscriptionGuard::new(account, key, id),
        ))
    }

    /// Route a message to the session's account. Returns the number of
    /// subscriptions that accepted it.
    ///
    /// # Errors
    /// - [`BrokerError::PublishViolation`] when the principal may not publish
    ///   to the subject; nothing is delivered.
    /// - [`BrokerError::PayloadTooLarge`] above the configured limit.
    pub fn publish(&self, session: &Session, message: Message) -> Result<usize> {
        let account = self.session_account(session)?;
        validate_subject(message.subject())?;
        if let Some(reply) = message.reply() {
            validate_subject(reply)?;
        }
        let size = message.payload().len();
        if size > self.limits.max_payload {
            return Err(BrokerError::PayloadTooLarge {
                size,
                max: self.limits.max_payload,
            });
        }
        if !session
            .principal()
            .permissions()
            .allows(Action::Publish, message.subject())
        {
            metrics::counter!("courier_permission_violations_total", "action" => Action::Publish.as_str())
                .increment(1);
            tracing::warn!(
                connection_id = %session.id(),
                principal = session.principal().id(),
                subject = message.subject(),
                "publish denied"
            );
            return Err(BrokerError::PublishViolation {
                subject: message.subject().to_string(),
            });
        }

        metrics::counter!("courier_messages_published_total").increment(1);
        Ok(account.dispatch(&message))
    }

    /// Publish `payload` to the reply subject of `request`. Returns `false`
    /// when the request carried no reply subject or nobody was listening.
    pub fn respond(
        &self,
        session: &Session,
        request: &Message,
        payload: impl Into<Bytes>,
    ) -> Result<bool> {
        let Some(reply) = request.reply() else {
            return Ok(false);
        };
        let delivered = self.publish(session, Message::new(reply, payload))?;
        Ok(delivered > 0)
    }

    pub async fn request(
        &self,
        session: &Session,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        self.request_message(session, Message::new(subject, payload), timeout)
            .await
    }

    /// Publish `message` with a fresh inbox as its reply subject and wait for
    /// the first reply.
    ///
    /// # Errors
    /// - [`BrokerError::NoResponders`] if the publish reached nobody.
    /// - [`BrokerError::Timeout`] if no reply arrived within `timeout`.
    /// - [`BrokerError::ConnectionClosed`] if the session disconnects first.
    pub async fn request_message(
        &self,
        session: &Session,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let account = self.session_account(session)?;
        let subject = message.subject().to_string();
        let inbox: Arc<str> = Arc::from(new_inbox(&self.inbox_prefix, session.inbox_root()));
        let pattern = SubjectPattern::parse(&inbox)?;
        let authorized = session
            .principal()
            .permissions()
            .allows(Action::Subscribe, &inbox);

        let mut reply_rx = account.correlator.register(Arc::clone(&inbox), session.id());
        let (key, id) = account.insert(NewSubscription {
            owner: session.id(),
            pattern,
            queue: None,
            authorized,
            sink: Sink::Inbox,
        });
        // Cleans up on every exit, including a dropped future.
        let _inbox = InboxGuard::new(account, Arc::clone(&inbox), key, id);

        let published = self.publish(session, message.with_reply(Arc::clone(&inbox)))?;
        if published == 0 {
            return Err(BrokerError::NoResponders { subject });
        }
        match tokio::time::timeout(timeout, &mut reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::ConnectionClosed),
            Err(_) => {
                if account.correlator.expire(&inbox) {
                    Err(BrokerError::Timeout { subject })
                } else {
                    // Resolved between the deadline and the expire call.
                    reply_rx
                        .try_recv()
                        .unwrap_or(Err(BrokerError::Timeout { subject }))
                }
            }
        }
    }

    fn session_account(&self, session: &Session) -> Result<&Arc<Account>> {
        if session.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }
        self.accounts
            .get(session.account())
            .ok_or_else(|| BrokerError::UnknownAccount(session.account().to_string()))
    }
}
