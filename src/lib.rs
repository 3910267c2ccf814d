#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub mod events;
pub mod subscription;
pub mod ws;

pub use error::Error;
pub use events::{Event, EventBus, ListenerId, Topic};
pub use subscription::{Subscription, SubscriptionOptions, SubscriptionRegistry};
pub use ws::config::Config;
pub use ws::{
    ConnectionManager, ConnectionState, StateSnapshot, Stats, WeakConnectionManager, WsError,
};

pub type Result<T> = std::result::Result<T, Error>;
