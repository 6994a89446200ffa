// Writer loop owns the socket write half and serializes all outbound ops.
use courier_wire::{ServerCodec, ServerOp};
use futures::SinkExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;

use crate::transport::WRITE_BATCH;

pub(super) type Writer = FramedWrite<OwnedWriteHalf, ServerCodec>;

// Drains queued ops, flushing once per batch. Exits when every sender is
// gone or the socket fails, then shuts the write half down.
pub(super) async fn run_writer_loop(mut writer: Writer, mut out_rx: mpsc::Receiver<ServerOp>) {
    'outer: while let Some(op) = out_rx.recv().await {
        if let Err(err) = writer.feed(op).await {
            tracing::info!(error = %err, "client write failed");
            break;
        }
        for _ in 1..WRITE_BATCH {
            let Ok(op) = out_rx.try_recv() else { break };
            if let Err(err) = writer.feed(op).await {
                tracing::info!(error = %err, "client write failed");
                break 'outer;
            }
        }
        if let Err(err) = writer.flush().await {
            tracing::info!(error = %err, "client flush failed");
            break;
        }
    }
    let _ = writer.close().await;
}
