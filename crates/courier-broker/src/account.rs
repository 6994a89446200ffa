// Per-account subscription table and message dispatch.
//
// Each account is an isolated subject namespace with its own lock. Mutations
// (subscribe, unsubscribe, disconnect) take the table mutex and rebuild an
// immutable routing snapshot; publish only loads the snapshot.
use ahash::RandomState;
use arc_swap::ArcSwap;
use courier_authz::SubjectPattern;
use courier_common::ids::ConnectionId;
use hashbrown::HashMap;
use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::Message;
use crate::request::Correlator;
use crate::subscription::SubscriptionId;

/// Where matched messages for one subscription go.
#[derive(Debug)]
pub(crate) enum Sink {
    // Regular subscriber queue.
    Channel(mpsc::Sender<Message>),
    // Request inbox; resolved through the account's correlator.
    Inbox,
}

#[derive(Debug)]
pub(crate) struct SubscriptionEntry {
    id: SubscriptionId,
    key: usize,
    owner: ConnectionId,
    pattern: SubjectPattern,
    queue: Option<Arc<str>>,
    // Evaluated once at registration; inert entries never enter the routing snapshot.
    authorized: bool,
    sink: Sink,
    limit: DeliveryLimit,
}

// Auto-unsubscribe bookkeeping; `max == 0` means unlimited.
#[derive(Debug, Default)]
struct DeliveryLimit {
    max: AtomicU64,
    delivered: AtomicU64,
}

impl DeliveryLimit {
    // Claim one delivery; false once `max` deliveries have been claimed.
    fn reserve(&self) -> bool {
        let mut delivered = self.delivered.load(Ordering::Acquire);
        loop {
            let max = self.max.load(Ordering::Acquire);
            if max != 0 && delivered >= max {
                return false;
            }
            match self.delivered.compare_exchange_weak(
                delivered,
                delivered + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => delivered = actual,
            }
        }
    }

    // Give back a claim whose send did not happen.
    fn release(&self) {
        self.delivered.fetch_sub(1, Ordering::AcqRel);
    }

    fn exhausted(&self) -> bool {
        let max = self.max.load(Ordering::Acquire);
        max != 0 && self.delivered.load(Ordering::Acquire) >= max
    }

    fn set_max(&self, max: u64) -> bool {
        self.max.store(max, Ordering::Release);
        self.exhausted()
    }
}

pub(crate) struct NewSubscription {
    pub(crate) owner: ConnectionId,
    pub(crate) pattern: SubjectPattern,
    pub(crate) queue: Option<Arc<str>>,
    pub(crate) authorized: bool,
    pub(crate) sink: Sink,
}

type QueueKey = (SubjectPattern, Arc<str>);

#[derive(Debug, Default)]
struct SubscriptionTable {
    entries: Slab<Arc<SubscriptionEntry>>,
    // Round-robin cursors outlive snapshot rebuilds so rotation stays even.
    cursors: HashMap<QueueKey, Arc<AtomicUsize>, RandomState>,
}

#[derive(Debug)]
struct QueueRoute {
    pattern: SubjectPattern,
    group: Arc<str>,
    members: Vec<Arc<SubscriptionEntry>>,
    cursor: Arc<AtomicUsize>,
}

#[derive(Debug, Default)]
struct RoutingSnapshot {
    plain: Vec<Arc<SubscriptionEntry>>,
    groups: Vec<QueueRoute>,
}

enum Delivery {
    Delivered,
    // Delivered, and the subscription reached its message limit.
    Last,
    Full,
    Exhausted,
    Closed,
}

#[derive(Debug)]
pub(crate) struct Account {
    name: Arc<str>,
    table: Mutex<SubscriptionTable>,
    routes: ArcSwap<RoutingSnapshot>,
    pub(crate) correlator: Correlator,
}

impl Account {
    pub(crate) fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            table: Mutex::new(SubscriptionTable::default()),
            routes: ArcSwap::from_pointee(RoutingSnapshot::default()),
            correlator: Correlator::default(),
        }
    }

    pub(crate) fn insert(&self, new: NewSubscription) -> (usize, SubscriptionId) {
        let mut table = self.table.lock();
        let id = SubscriptionId::next();
        let slot = table.entries.vacant_entry();
        let key = slot.key();
        slot.insert(Arc::new(SubscriptionEntry {
            id,
            key,
            owner: new.owner,
            pattern: new.pattern,
            queue: new.queue,
            authorized: new.authorized,
            sink: new.sink,
            limit: DeliveryLimit::default(),
        }));
        self.rebuild_routes(&mut table);
        (key, id)
    }

    /// Remove one subscription. The id check keeps a recycled slab slot safe.
    pub(crate) fn remove(&self, key: usize, id: SubscriptionId) -> bool {
        let mut table = self.table.lock();
        let matches = table.entries.get(key).is_some_and(|entry| entry.id == id);
        if matches {
            table.entries.remove(key);
            self.rebuild_routes(&mut table);
        }
        matches
    }

    /// Cap the subscription at `max` total deliveries, removing it now if it
    /// already reached that many (or `max` is zero). Returns `false` if the
    /// subscription is gone.
    pub(crate) fn limit_deliveries(&self, key: usize, id: SubscriptionId, max: u64) -> bool {
        let mut table = self.table.lock();
        let exhausted = match table.entries.get(key) {
            Some(entry) if entry.id == id => max == 0 || entry.limit.set_max(max),
            _ => return false,
        };
        if exhausted {
            table.entries.remove(key);
            self.rebuild_routes(&mut table);
        }
        true
    }

    pub(crate) fn remove_owner(&self, owner: ConnectionId) -> usize {
        let mut table = self.table.lock();
        let before = table.entries.len();
        table.entries.retain(|_, entry| entry.owner != owner);
        let removed = before - table.entries.len();
        if removed > 0 {
            self.rebuild_routes(&mut table);
        }
        removed
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.table.lock().entries.len()
    }

    fn rebuild_routes(&self, table: &mut SubscriptionTable) {
        let mut plain = Vec::new();
        let mut grouped: HashMap<QueueKey, Vec<Arc<SubscriptionEntry>>, RandomState> =
            HashMap::with_hasher(RandomState::new());
        for (_, entry) in table.entries.iter() {
            if !entry.authorized {
                continue;
            }
            match &entry.queue {
                Some(group) => grouped
                    .entry((entry.pattern.clone(), Arc::clone(group)))
                    .or_default()
                    .push(Arc::clone(entry)),
                None => plain.push(Arc::clone(entry)),
            }
        }

        table.cursors.retain(|key, _| grouped.contains_key(key));
        let mut groups = Vec::with_capacity(grouped.len());
        for (key, members) in grouped {
            let cursor = Arc::clone(table.cursors.entry(key.clone()).or_default());
            groups.push(QueueRoute {
                pattern: key.0,
                group: key.1,
                members,
                cursor,
            });
        }
        // Stable order so multi-route buckets always pick the same leading cursor.
        groups.sort_by(|a, b| (&a.group, &a.pattern).cmp(&(&b.group, &b.pattern)));

        metrics::gauge!("courier_subscriptions", "account" => self.name.to_string())
            .set(table.entries.len() as f64);
        self.routes.store(Arc::new(RoutingSnapshot { plain, groups }));
    }

    /// Route a message to every matching subscription, one member per queue
    /// group. Returns the number of deliveries.
    pub(crate) fn dispatch(&self, message: &Message) -> usize {
        let routes = self.routes.load();
        let subject = message.subject();
        let mut delivered = 0usize;

        for entry in routes.plain.iter() {
            if entry.pattern.matches(subject) && self.deliver(entry, message) {
                delivered += 1;
            }
        }

        // One bucket per distinct group name among the matching routes.
        let mut buckets: SmallVec<[(&str, SmallVec<[&QueueRoute; 2]>); 4]> = SmallVec::new();
        for route in routes.groups.iter() {
            if !route.pattern.matches(subject) {
                continue;
            }
            match buckets
                .iter_mut()
                .find(|(group, _)| *group == route.group.as_ref())
            {
                Some((_, bucket)) => bucket.push(route),
                None => {
                    let mut bucket = SmallVec::new();
                    bucket.push(route);
                    buckets.push((route.group.as_ref(), bucket));
                }
            }
        }
        for (_, bucket) in buckets {
            if self.deliver_to_group(&bucket, message) {
                delivered += 1;
            }
        }

        if delivered > 0 {
            metrics::counter!("courier_messages_delivered_total").increment(delivered as u64);
        }
        delivered
    }

    // Round-robin from the bucket's cursor; full, exhausted or closed members are skipped.
    fn deliver_to_group(&self, bucket: &[&QueueRoute], message: &Message) -> bool {
        let Some(leader) = bucket.first() else {
            return false;
        };
        let members: SmallVec<[&Arc<SubscriptionEntry>; 8]> = bucket
            .iter()
            .flat_map(|route| route.members.iter())
            .collect();
        if members.is_empty() {
            return false;
        }
        let start = leader.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..members.len() {
            let member = members[start.wrapping_add(offset) % members.len()];
            if self.deliver(member, message) {
                return true;
            }
        }
        tracing::debug!(
            account = %self.name,
            group = %leader.group,
            subject = message.subject(),
            "no queue group member could accept message"
        );
        false
    }

    fn deliver(&self, entry: &Arc<SubscriptionEntry>, message: &Message) -> bool {
        match self.try_deliver(entry, message) {
            Delivery::Delivered => true,
            Delivery::Last => {
                tracing::debug!(
                    account = %self.name,
                    subscription = %entry.id,
                    "subscription reached its message limit"
                );
                self.remove(entry.key, entry.id);
                true
            }
            Delivery::Full => {
                metrics::counter!("courier_slow_consumer_drops_total").increment(1);
                tracing::debug!(
                    account = %self.name,
                    subscription = %entry.id,
                    subject = message.subject(),
                    "subscriber queue full; message dropped"
                );
                false
            }
            Delivery::Exhausted | Delivery::Closed => {
                self.remove(entry.key, entry.id);
                false
            }
        }
    }

    fn try_deliver(&self, entry: &SubscriptionEntry, message: &Message) -> Delivery {
        match &entry.sink {
            Sink::Channel(sender) => {
                if !entry.limit.reserve() {
                    return Delivery::Exhausted;
                }
                match sender.try_send(message.clone()) {
                    Ok(()) if entry.limit.exhausted() => Delivery::Last,
                    Ok(()) => Delivery::Delivered,
                    Err(TrySendError::Full(_)) => {
                        entry.limit.release();
                        Delivery::Full
                    }
                    Err(TrySendError::Closed(_)) => Delivery::Closed,
                }
            }
            Sink::Inbox => {
                if self
                    .correlator
                    .resolve(entry.pattern.as_str(), message.clone())
                {
                    // One reply per request: the inbox closes with its first delivery.
                    self.remove(entry.key, entry.id);
                    Delivery::Delivered
                } else {
                    Delivery::Closed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(value: &str) -> SubjectPattern {
        value.parse().expect("pattern")
    }

    fn channel_sub(
        account: &Account,
        owner: ConnectionId,
        subject: &str,
        queue: Option<&str>,
        capacity: usize,
    ) -> (usize, SubscriptionId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (key, id) = account.insert(NewSubscription {
            owner,
            pattern: pattern(subject),
            queue: queue.map(Arc::from),
            authorized: true,
            sink: Sink::Channel(tx),
        });
        (key, id, rx)
    }

    #[test]
    fn plain_subscriptions_all_receive() {
        let account = Account::new("$G");
        let owner = ConnectionId::new();
        let (_, _, mut first) = channel_sub(&account, owner, "ucserver.A.*", None, 8);
        let (_, _, mut second) = channel_sub(&account, owner, ">", None, 8);
        let (_, _, mut other) = channel_sub(&account, owner, "ucserver.B.*", None, 8);

        let delivered = account.dispatch(&Message::new("ucserver.A.AsnHello", "hi"));
        assert_eq!(delivered, 2);
        assert_eq!(first.try_recv().expect("first").subject(), "ucserver.A.AsnHello");
        assert!(second.try_recv().is_ok());
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn queue_group_round_robins() {
        let account = Account::new("$G");
        let owner = ConnectionId::new();
        let (_, _, mut a) = channel_sub(&account, owner, "ucserver.X.*", Some("q"), 64);
        let (_, _, mut b) = channel_sub(&account, owner, "ucserver.X.*", Some("q"), 64);

        for _ in 0..10 {
            assert_eq!(account.dispatch(&Message::new("ucserver.X.Tick", "t")), 1);
        }
        let mut count_a = 0;
        while a.try_recv().is_ok() {
            count_a += 1;
        }
        let mut count_b = 0;
        while b.try_recv().is_ok() {
            count_b += 1;
        }
        assert_eq!(count_a, 5);
        assert_eq!(count_b, 5);
    }

    #[test]
    fn same_group_name_across_patterns_is_one_bucket() {
        let account = Account::new("$G");
        let owner = ConnectionId::new();
        let (_, _, mut a) = channel_sub(&account, owner, "orders.*", Some("q"), 8);
        let (_, _, mut b) = channel_sub(&account, owner, "orders.>", Some("q"), 8);
        assert_eq!(account.dispatch(&Message::new("orders.new", "x")), 1);
        let total = usize::from(a.try_recv().is_ok()) + usize::from(b.try_recv().is_ok());
        assert_eq!(total, 1);
    }

    #[test]
    fn full_member_is_skipped() {
        let account = Account::new("$G");
        let owner = ConnectionId::new();
        let (_, _, mut a) = channel_sub(&account, owner, "jobs", Some("w"), 1);
        let (_, _, mut b) = channel_sub(&account, owner, "jobs", Some("w"), 16);
        for _ in 0..6 {
            assert_eq!(account.dispatch(&Message::new("jobs", "x")), 1);
        }
        let mut count_a = 0;
        while a.try_recv().is_ok() {
            count_a += 1;
        }
        let mut count_b = 0;
        while b.try_recv().is_ok() {
            count_b += 1;
        }
        assert_eq!(count_a, 1);
        assert_eq!(count_b, 5);
    }

    #[test]
    fn delivery_limit_counts_to_max() {
        let limit = DeliveryLimit::default();
        assert!(limit.reserve());
        assert!(!limit.set_max(3));
        assert!(limit.reserve());
        assert!(limit.reserve());
        assert!(limit.exhausted());
        assert!(!limit.reserve());
        limit.release();
        assert!(!limit.exhausted());
        assert!(limit.set_max(2));
    }

    #[test]
    fn limited_member_hands_off_to_the_rest_of_the_group() {
        let account = Account::new("$G");
        let owner = ConnectionId::new();
        let (a_key, a_id, mut a) = channel_sub(&account, owner, "jobs", Some("w"), 16);
        let (_, _, mut b) = channel_sub(&account, owner, "jobs", Some("w"), 16);
        assert!(account.limit_deliveries(a_key, a_id, 1));

        for _ in 0..4 {
            assert_eq!(account.dispatch(&Message::new("jobs", "x")), 1);
        }
        let mut count_a = 0;
        while a.try_recv().is_ok() {
            count_a += 1;
        }
        let mut count_b = 0;
        while b.try_recv().is_ok() {
            count_b += 1;
        }
        assert_eq!(count_a, 1);
        assert_eq!(count_b, 3);
        assert_eq!(account.subscription_count(), 1);
        assert!(!account.limit_deliveries(a_key, a_id, 5));
    }

    #[test]
    fn limit_at_or_below_delivered_removes_now() {
        let account = Account::new("$G");
        let owner = ConnectionId::new();
        let (key, id, mut rx) = channel_sub(&account, owner, "a", None, 8);
        assert_eq!(account.dispatch(&Message::new("a", "1")), 1);
        assert_eq!(account.dispatch(&Message::new("a", "2")), 1);
        assert!(account.limit_deliveries(key, id, 2));
        assert_eq!(account.subscription_count(), 0);
        assert_eq!(account.dispatch(&Message::new("a", "3")), 0);
        // Messages already queued are still handed out.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        let (key, id, _rx) = channel_sub(&account, owner, "b", None, 8);
        assert!(account.limit_deliveries(key, id, 0));
        assert_eq!(account.subscription_count(), 0);
    }

    #[test]
    fn inert_subscription_never_matches() {
        let account = Account::new("$G");
        let (tx, mut rx) = mpsc::channel(4);
        account.insert(NewSubscription {
            owner: ConnectionId::new(),
            pattern: pattern(">"),
            queue: None,
            authorized: false,
            sink: Sink::Channel(tx),
        });
        assert_eq!(account.subscription_count(), 1);
        assert_eq!(account.dispatch(&Message::new("a.b", "x")), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_receivers_are_pruned() {
        let account = Account::new("$G");
        let owner = ConnectionId::new();
        let (_, _, rx) = channel_sub(&account, owner, "a", None, 4);
        drop(rx);
        assert_eq!(account.dispatch(&Message::new("a", "x")), 0);
        assert_eq!(account.subscription_count(), 0);
    }

    #[test]
    fn remove_checks_subscription_id() {
        let account = Account::new("$G");
        let owner = ConnectionId::new();
        let (key, id, _rx) = channel_sub(&account, owner, "a", None, 4);
        assert!(account.remove(key, id));
        let (reused_key, _, _rx2) = channel_sub(&account, owner, "b", None, 4);
        assert_eq!(reused_key, key);
        assert!(!account.remove(key, id));
        assert_eq!(account.subscription_count(), 1);
    }

    #[test]
    fn remove_owner_drops_only_owned() {
        let account = Account::new("$G");
        let owner = ConnectionId::new();
        let other = ConnectionId::new();
        let (_, _, _a) = channel_sub(&account, owner, "a", None, 4);
        let (_, _, _b) = channel_sub(&account, owner, "b", Some("q"), 4);
        let (_, _, _c) = channel_sub(&account, other, "a", None, 4);
        assert_eq!(account.remove_owner(owner), 2);
        assert_eq!(account.subscription_count(), 1);
        assert_eq!(account.dispatch(&Message::new("b", "x")), 0);
    }

    #[tokio::test]
    async fn inbox_closes_after_first_reply() {
        let account = Account::new("$G");
        let owner = ConnectionId::new();
        let inbox: Arc<str> = Arc::from("_INBOX.root.token");
        let reply_rx = account.correlator.register(inbox.clone(), owner);
        account.insert(NewSubscription {
            owner,
            pattern: pattern(&inbox),
            queue: None,
            authorized: true,
            sink: Sink::Inbox,
        });
        assert_eq!(account.dispatch(&Message::new(inbox.clone(), "pong")), 1);
        assert_eq!(account.subscription_count(), 0);
        assert_eq!(account.dispatch(&Message::new(inbox.clone(), "again")), 0);
        let reply = reply_rx.await.expect("sender").expect("reply");
        assert_eq!(reply.payload().as_ref(), b"pong");
    }
}
