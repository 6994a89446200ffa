// Request-reply correlation: one pending entry per generated inbox subject.
use ahash::RandomState;
use courier_common::ids::ConnectionId;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::account::Account;
use crate::subscription::SubscriptionId;
use crate::{BrokerError, Message, Result};

pub const DEFAULT_INBOX_PREFIX: &str = "_INBOX";

/// Lifecycle of a request. Entries leave the table on the first transition
/// out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Resolved,
    TimedOut,
    Closed,
}

impl RequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Resolved => "resolved",
            RequestState::TimedOut => "timed_out",
            RequestState::Closed => "closed",
        }
    }
}

/// Build a fresh inbox subject: `<prefix>.<session root>.<random token>`.
pub fn new_inbox(prefix: &str, root: &str) -> String {
    format!("{prefix}.{root}.{}", Uuid::new_v4().simple())
}

#[derive(Debug)]
struct PendingRequest {
    owner: ConnectionId,
    created_at: Instant,
    state: RequestState,
    reply_tx: oneshot::Sender<Result<Message>>,
}

impl PendingRequest {
    fn finish(mut self, inbox: &str, state: RequestState, outcome: Option<Result<Message>>) {
        self.state = state;
        metrics::counter!("courier_requests_total", "state" => self.state.as_str()).increment(1);
        tracing::debug!(
            inbox,
            owner = %self.owner,
            state = self.state.as_str(),
            elapsed_us = self.created_at.elapsed().as_micros() as u64,
            "request finished"
        );
        if let Some(outcome) = outcome {
            // The requester may have given up already; nothing to do then.
            let _ = self.reply_tx.send(outcome);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Correlator {
    pending: Mutex<HashMap<Arc<str>, PendingRequest, RandomState>>,
}

impl Correlator {
    pub(crate) fn register(
        &self,
        inbox: Arc<str>,
        owner: ConnectionId,
    ) -> oneshot::Receiver<Result<Message>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(
            inbox,
            PendingRequest {
                owner,
                created_at: Instant::now(),
                state: RequestState::Pending,
                reply_tx,
            },
        );
        reply_rx
    }

    /// Hand the first reply to the waiting requester. Later replies find no
    /// entry and return `false`.
    pub(crate) fn resolve(&self, inbox: &str, message: Message) -> bool {
        let Some(request) = self.pending.lock().remove(inbox) else {
            return false;
        };
        request.finish(inbox, RequestState::Resolved, Some(Ok(message)));
        true
    }

    pub(crate) fn expire(&self, inbox: &str) -> bool {
        let Some(request) = self.pending.lock().remove(inbox) else {
            return false;
        };
        request.finish(inbox, RequestState::TimedOut, None);
        true
    }

    // Drop an entry nobody is waiting on any more.
    pub(crate) fn cancel(&self, inbox: &str) -> bool {
        let Some(request) = self.pending.lock().remove(inbox) else {
            return false;
        };
        request.finish(inbox, RequestState::Closed, None);
        true
    }

    /// Fail every pending request owned by a disconnecting session.
    pub(crate) fn fail_owner(&self, owner: ConnectionId) -> usize {
        let failed: Vec<(Arc<str>, PendingRequest)> = {
            let mut pending = self.pending.lock();
            pending
                .extract_if(|_, request| request.owner == owner)
                .collect()
        };
        let count = failed.len();
        for (inbox, request) in failed {
            request.finish(
                &inbox,
                RequestState::Closed,
                Some(Err(BrokerError::ConnectionClosed)),
            );
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Tears down a request's inbox subscription and pending entry when the
/// request finishes or its future is dropped.
pub(crate) struct InboxGuard<'a> {
    account: &'a Account,
    inbox: Arc<str>,
    key: usize,
    id: SubscriptionId,
}

impl<'a> InboxGuard<'a> {
    pub(crate) fn new(account: &'a Account, inbox: Arc<str>, key: usize, id: SubscriptionId) -> Self {
        Self {
            account,
            inbox,
            key,
            id,
        }
    }
}

impl Drop for InboxGuard<'_> {
    fn drop(&mut self) {
        if self.account.correlator.cancel(&self.inbox) {
            tracing::debug!(inbox = %self.inbox, "request abandoned before completion");
        }
        self.account.remove(self.key, self.id);
    }
}
