//! Connection Management
//!
//! Owns the STOMP session on top of a [`Transport`](crate::transport::Transport),
//! exposes its lifecycle as a [`ConnectionState`] and hands out [`Subscription`]s.

mod manager;
mod state;
mod subscription;

pub use manager::{ConnectionConfig, StompClient, DEFAULT_HEARTBEAT, DEFAULT_WS_PATH};
pub use state::ConnectionState;
pub use subscription::Subscription;

pub(crate) use manager::ConnectionCommand;
