// Client-side modules for connections, subscriptions, and received messages.
#![allow(clippy::module_inception)]
pub mod connection;
pub mod delivery;
pub mod subscription;
