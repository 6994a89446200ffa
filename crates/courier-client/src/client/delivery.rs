// Received messages that know how to answer their requester.
use anyhow::Result;
use bytes::Bytes;
use courier_broker::{Broker, Headers, Message, Session};
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct Responder {
    broker: Arc<Broker>,
    session: Session,
}

impl Responder {
    pub(crate) fn new(broker: Arc<Broker>, session: Session) -> Self {
        Self { broker, session }
    }

    pub(crate) fn wrap(&self, message: Message) -> Delivery {
        Delivery {
            message,
            responder: self.clone(),
        }
    }
}

/// A message handed to a subscriber.
///
/// `respond` publishes to the message's reply subject from the receiving
/// connection, so the reply is checked against that connection's publish
/// permissions.
#[derive(Clone)]
pub struct Delivery {
    message: Message,
    responder: Responder,
}

impl Delivery {
    pub fn subject(&self) -> &str {
        self.message.subject()
    }

    pub fn payload(&self) -> &Bytes {
        self.message.payload()
    }

    pub fn reply(&self) -> Option<&str> {
        self.message.reply()
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.message.headers()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Lossy UTF-8 view of the payload.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.message.payload()).into_owned()
    }

    /// Reply to the requester. `Ok(false)` when there is no reply subject or
    /// the request was already answered.
    pub fn respond(&self, payload: impl Into<Bytes>) -> Result<bool> {
        Ok(self
            .responder
            .broker
            .respond(&self.responder.session, &self.message, payload)?)
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.message.subject())
            .field("reply", &self.message.reply())
            .field("len", &self.message.payload().len())
            .finish()
    }
}
