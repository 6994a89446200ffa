// Client facade over an in-process courier broker.
// A `Connection` owns one authenticated broker session; subscriptions hand out
// `Delivery` values that can answer request-reply exchanges with `respond`.
pub mod client;
pub mod config;

pub use client::connection::Connection;
pub use client::delivery::Delivery;
pub use client::subscription::{CallbackSubscription, Subscription};
pub use config::ConnectOptions;
pub use courier_broker::{Broker, BrokerError, Credentials, SubscribeOptions};
