// Per-connection subscription table keyed by client-chosen sid.
//
// Each sid owns a forwarder task that moves messages from its broker
// subscription onto the connection's outbound queue. Aborting the task drops
// the subscription, which removes it from the broker.
use courier_broker::{Message, Subscription, SubscriptionHandle};
use courier_wire::ServerOp;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub(super) struct SidTable {
    entries: HashMap<String, SidEntry>,
}

#[derive(Debug)]
struct SidEntry {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

impl Drop for SidEntry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl SidTable {
    /// Start forwarding `subscription` under `sid`. A previous entry with the
    /// same sid is replaced.
    pub(super) fn insert(
        &mut self,
        sid: String,
        subscription: Subscription,
        out: mpsc::Sender<ServerOp>,
    ) {
        self.prune();
        let handle = subscription.handle();
        let task = tokio::spawn(forward(Arc::from(sid.as_str()), subscription, out));
        if self.entries.insert(sid, SidEntry { handle, task }).is_some() {
            tracing::debug!("sid reused; previous subscription replaced");
        }
    }

    /// Remove `sid` now, or once it has been handed `max` messages in total.
    pub(super) fn unsubscribe(&mut self, sid: &str, max: Option<u64>) -> bool {
        self.prune();
        let Some(entry) = self.entries.get(sid) else {
            return false;
        };
        match max {
            // The forwarder drains what was already routed, then exits.
            Some(max) if max > 0 => {
                entry.handle.unsubscribe_after(max);
            }
            _ => {
                self.entries.remove(sid);
            }
        }
        true
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn clear(&mut self) {
        self.entries.clear();
    }

    // Forget sids whose subscription ended on its own.
    fn prune(&mut self) {
        self.entries.retain(|_, entry| !entry.task.is_finished());
    }
}

async fn forward(sid: Arc<str>, mut subscription: Subscription, out: mpsc::Sender<ServerOp>) {
    while let Some(message) = subscription.recv().await {
        if out.send(server_message(&sid, message)).await.is_err() {
            return;
        }
    }
    tracing::debug!(sid = %sid, "subscription ended");
}

pub(super) fn server_message(sid: &str, message: Message) -> ServerOp {
    let subject = message.subject().to_string();
    let reply = message.reply().map(str::to_string);
    let headers = message
        .headers()
        .filter(|headers| !headers.is_empty())
        .map(|headers| {
            headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect::<Vec<_>>()
        });
    let payload = message.into_payload();
    match headers {
        Some(headers) => ServerOp::HMsg {
            subject,
            sid: sid.to_string(),
            reply,
            headers,
            payload,
        },
        None => ServerOp::Msg {
            subject,
            sid: sid.to_string(),
            reply,
            payload,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_broker::{Broker, Credentials, Headers, SubscribeOptions};
    use std::time::Duration;

    #[test]
    fn headers_select_hmsg() {
        let mut headers = Headers::new();
        headers.insert("Trace", "42");
        let op = server_message(
            "9",
            Message::new("orders.new", "ok")
                .with_reply("_INBOX.r.1")
                .with_headers(headers),
        );
        assert_eq!(
            op,
            ServerOp::HMsg {
                subject: "orders.new".to_string(),
                sid: "9".to_string(),
                reply: Some("_INBOX.r.1".to_string()),
                headers: vec![("Trace".to_string(), "42".to_string())],
                payload: "ok".into(),
            }
        );
        let plain = server_message("1", Message::new("a", "b").with_headers(Headers::new()));
        assert!(matches!(plain, ServerOp::Msg { reply: None, .. }));
    }

    #[tokio::test]
    async fn forwarder_stops_after_limit() -> anyhow::Result<()> {
        let broker = Broker::open();
        let session = broker.connect(&Credentials::Anonymous)?;
        let subscription = broker.subscribe(&session, "a.*", SubscribeOptions::default())?;
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let mut table = SidTable::default();
        table.insert("1".to_string(), subscription, out_tx);
        assert!(table.unsubscribe("1", Some(2)));
        assert_eq!(table.len(), 1);

        let delivered: usize = (0..3)
            .map(|n| broker.publish(&session, Message::new("a.b", format!("m{n}"))))
            .sum::<courier_broker::Result<usize>>()?;
        assert_eq!(delivered, 2);
        for _ in 0..2 {
            let op = tokio::time::timeout(Duration::from_secs(5), out_rx.recv()).await?;
            assert!(matches!(op, Some(ServerOp::Msg { .. })));
        }
        // The forwarder exits and drops its sender.
        let end = tokio::time::timeout(Duration::from_secs(5), out_rx.recv()).await?;
        assert!(end.is_none());
        assert_eq!(broker.subscription_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unsubscribe_without_max_removes_immediately() -> anyhow::Result<()> {
        let broker = Broker::open();
        let session = broker.connect(&Credentials::Anonymous)?;
        let subscription = broker.subscribe(&session, "a.*", SubscribeOptions::default())?;
        let (out_tx, _out_rx) = mpsc::channel(16);
        let mut table = SidTable::default();
        table.insert("1".to_string(), subscription, out_tx);
        assert!(table.unsubscribe("1", None));
        assert!(!table.unsubscribe("1", None));
        assert_eq!(table.len(), 0);
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.subscription_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await?;
        Ok(())
    }
}
