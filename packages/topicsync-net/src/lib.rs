#![forbid(unsafe_code)]
//! Networking for topicsync documents: a reconnecting session, the
//! websocket transport under it, and the relay sessions talk to.

pub mod backoff;
pub mod config;
pub mod error;
pub mod relay;
pub mod session;
pub mod transport;

pub use backoff::Backoff;
pub use config::{AwarenessConfig, ReconnectPolicy, RelayConfig, SyncConfig};
pub use error::{NetError, Result};
pub use relay::{room_from_path, RelayHub, RelayServer};
pub use session::{ConnectionState, SessionHandle, SharedDocument};
pub use transport::{websocket_link, Connector, Link, MemoryConnector, WebSocketConnector};
