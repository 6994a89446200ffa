// INFO greeting and CONNECT handling before a session exists.
use anyhow::Result;
use courier_broker::{Broker, Credentials};
use courier_wire::{ClientOp, ConnectInfo, PROTOCOL_VERSION, ServerCodec, ServerInfo, ServerOp};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio_util::codec::FramedRead;

use super::writer::Writer;

pub(super) const AUTH_TIMEOUT_TEXT: &str = "Authentication Timeout";
pub(super) const AUTH_VIOLATION_TEXT: &str = "Authorization Violation";

pub(super) type Reader = FramedRead<OwnedReadHalf, ServerCodec>;

pub(super) fn server_info(broker: &Broker, local: Option<SocketAddr>, client_id: u64) -> ServerInfo {
    ServerInfo {
        server_id: broker.server_id().simple(),
        server_name: None,
        version: env!("CARGO_PKG_VERSION").to_string(),
        proto: PROTOCOL_VERSION,
        host: local.map(|addr| addr.ip().to_string()),
        port: local.map(|addr| addr.port()),
        max_payload: broker.limits().max_payload,
        headers: true,
        auth_required: broker.auth_required(),
        client_id: Some(client_id),
    }
}

/// Wait for the client's CONNECT. Anything else, a decode error or the
/// deadline passing gets an `-ERR` and `None`.
pub(super) async fn await_connect(
    reader: &mut Reader,
    writer: &mut Writer,
    timeout: Duration,
) -> Result<Option<ConnectInfo>> {
    let first = match tokio::time::timeout(timeout, reader.next()).await {
        Err(_) => {
            tracing::info!(timeout_ms = timeout.as_millis() as u64, "client did not send CONNECT in time");
            reject(writer, AUTH_TIMEOUT_TEXT).await;
            return Ok(None);
        }
        Ok(None) => return Ok(None),
        Ok(Some(frame)) => frame,
    };
    match first {
        Ok(ClientOp::Connect(info)) => Ok(Some(info)),
        Ok(op) => {
            tracing::debug!(op = op.name(), "operation before CONNECT");
            reject(writer, AUTH_VIOLATION_TEXT).await;
            Ok(None)
        }
        Err(err) => {
            tracing::debug!(error = %err, "invalid CONNECT");
            reject(writer, err.protocol_text()).await;
            Ok(None)
        }
    }
}

/// Send `-ERR '<text>'` and shut the write half down.
pub(super) async fn reject(writer: &mut Writer, text: &str) {
    let _ = writer.send(ServerOp::err(text)).await;
    let _ = writer.close().await;
}

pub(super) fn credentials(info: &ConnectInfo) -> Credentials {
    if let Some(token) = &info.auth_token {
        return Credentials::token(token.clone());
    }
    match (&info.user, &info.pass) {
        (Some(user), pass) => {
            Credentials::user_password(user.clone(), pass.clone().unwrap_or_default())
        }
        (None, _) => Credentials::Anonymous,
    }
}
