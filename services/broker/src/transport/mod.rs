// Client-facing transports for the broker service.
//! TCP transport speaking the courier text protocol.

pub mod tcp;

use std::sync::atomic::AtomicU64;

/// Outbound ops buffered per connection before forwarders wait on the socket.
pub(crate) const OUTBOUND_QUEUE_DEPTH: usize = 1024;
/// Max ops written between flushes.
pub(crate) const WRITE_BATCH: usize = 64;
pub(crate) static CLIENT_ID: AtomicU64 = AtomicU64::new(1);

pub use tcp::serve;
