// TCP accept loop and per-connection protocol handling.
use anyhow::{Context, Result};
use courier_broker::{AuthzError, Broker, BrokerError, Headers, Message, Session, SubscribeOptions};
use courier_wire::{ClientOp, Error as WireError, HeaderList, ServerCodec, ServerOp};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::BrokerConfig;
use crate::transport::{CLIENT_ID, OUTBOUND_QUEUE_DEPTH};

mod handshake;
mod sids;
mod writer;

use handshake::Reader;
use sids::SidTable;

const INVALID_SUBJECT_TEXT: &str = "Invalid Subject";

pub async fn serve(listener: TcpListener, broker: Arc<Broker>, config: BrokerConfig) -> Result<()> {
    // Main accept loop: spawn a task per client connection.
    loop {
        let (stream, peer) = listener.accept().await.context("accept client connection")?;
        let broker = Arc::clone(&broker);
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(broker, stream, peer, config).await {
                tracing::warn!(peer = %peer, error = %err, "client connection handler failed");
            }
        });
    }
}

pub(crate) async fn handle_connection(
    broker: Arc<Broker>,
    stream: TcpStream,
    peer: SocketAddr,
    config: BrokerConfig,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let local = stream.local_addr().ok();
    let (read, write) = stream.into_split();
    let max_payload = broker.limits().max_payload;
    let mut reader = FramedRead::new(read, ServerCodec::new(max_payload));
    let mut writer = FramedWrite::new(write, ServerCodec::new(max_payload));

    let client_id = CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let info = handshake::server_info(&broker, local, client_id);
    writer
        .send(ServerOp::Info(Box::new(info)))
        .await
        .context("send INFO")?;

    let Some(connect) =
        handshake::await_connect(&mut reader, &mut writer, config.auth_timeout()).await?
    else {
        return Ok(());
    };
    let session = match broker.connect(&handshake::credentials(&connect)) {
        Ok(session) => session,
        Err(err) => {
            tracing::info!(peer = %peer, client_id, "client rejected");
            handshake::reject(&mut writer, &err.to_string()).await;
            return Ok(());
        }
    };
    tracing::debug!(
        peer = %peer,
        client_id,
        connection_id = %session.id(),
        name = connect.name.as_deref(),
        "client connected"
    );

    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let writer_task = tokio::spawn(writer::run_writer_loop(writer, out_rx));
    let mut connection = ClientConnection {
        broker,
        session,
        verbose: connect.verbose,
        out: out_tx,
        sids: SidTable::default(),
    };
    if connection.ok().await.is_continue() {
        connection.run(&mut reader).await;
    }
    // Disconnect before waiting on the writer so forwarders release it.
    drop(connection);
    let _ = writer_task.await;
    tracing::debug!(peer = %peer, client_id, "client connection closed");
    Ok(())
}

struct ClientConnection {
    broker: Arc<Broker>,
    session: Session,
    verbose: bool,
    out: mpsc::Sender<ServerOp>,
    sids: SidTable,
}

impl ClientConnection {
    async fn run(&mut self, reader: &mut Reader) {
        while let Some(frame) = reader.next().await {
            let op = match frame {
                Ok(op) => op,
                Err(WireError::Io(err)) => {
                    tracing::debug!(connection_id = %self.session.id(), error = %err, "client read failed");
                    return;
                }
                Err(err) => {
                    tracing::info!(connection_id = %self.session.id(), error = %err, "protocol error");
                    metrics::counter!("courier_protocol_errors_total").increment(1);
                    let _ = self.send(ServerOp::err(err.protocol_text())).await;
                    return;
                }
            };
            if self.apply(op).await.is_break() {
                return;
            }
        }
    }

    async fn apply(&mut self, op: ClientOp) -> ControlFlow<()> {
        match op {
            ClientOp::Ping => self.send(ServerOp::Pong).await,
            ClientOp::Pong => ControlFlow::Continue(()),
            ClientOp::Connect(_) => self.ok().await,
            ClientOp::Pub {
                subject,
                reply,
                payload,
            } => self.publish(with_reply(Message::new(subject, payload), reply)).await,
            ClientOp::HPub {
                subject,
                reply,
                headers,
                payload,
            } => {
                let message = Message::new(subject, payload).with_headers(to_headers(headers));
                self.publish(with_reply(message, reply)).await
            }
            ClientOp::Sub {
                subject,
                queue,
                sid,
            } => self.subscribe(&subject, queue, sid).await,
            ClientOp::Unsub { sid, max } => {
                if !self.sids.unsubscribe(&sid, max) {
                    tracing::debug!(connection_id = %self.session.id(), sid = %sid, "unsubscribe for unknown sid");
                }
                self.ok().await
            }
        }
    }

    async fn publish(&mut self, message: Message) -> ControlFlow<()> {
        match self.broker.publish(&self.session, message) {
            Ok(_) => self.ok().await,
            Err(err) => self.fail(err).await,
        }
    }

    async fn subscribe(
        &mut self,
        subject: &str,
        queue: Option<String>,
        sid: String,
    ) -> ControlFlow<()> {
        let options = SubscribeOptions { queue };
        match self.broker.subscribe(&self.session, subject, options) {
            Ok(subscription) => {
                self.sids.insert(sid, subscription, self.out.clone());
                self.ok().await
            }
            Err(err) => self.fail(err).await,
        }
    }

    // Report a broker error; only fatal ones close the connection.
    async fn fail(&mut self, err: BrokerError) -> ControlFlow<()> {
        match err {
            BrokerError::ConnectionClosed => ControlFlow::Break(()),
            BrokerError::PayloadTooLarge { .. } => {
                let _ = self.send(ServerOp::err("Maximum Payload Violation")).await;
                ControlFlow::Break(())
            }
            BrokerError::Authz(AuthzError::InvalidSubject(_) | AuthzError::InvalidPattern(_)) => {
                self.send(ServerOp::err(INVALID_SUBJECT_TEXT)).await
            }
            other => self.send(ServerOp::err(other.to_string())).await,
        }
    }

    async fn ok(&self) -> ControlFlow<()> {
        if self.verbose {
            self.send(ServerOp::Ok).await
        } else {
            ControlFlow::Continue(())
        }
    }

    async fn send(&self, op: ServerOp) -> ControlFlow<()> {
        match self.out.send(op).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        let subscriptions = self.sids.len();
        self.sids.clear();
        if self.broker.disconnect(&self.session) {
            tracing::debug!(
                connection_id = %self.session.id(),
                subscriptions,
                "client session closed"
            );
        }
    }
}

fn with_reply(message: Message, reply: Option<String>) -> Message {
    match reply {
        Some(reply) => message.with_reply(reply),
        None => message,
    }
}

fn to_headers(list: HeaderList) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in list {
        headers.insert(name, value);
    }
    headers
}
