//! Connection management: transports, reconnection backoff and keep-alive.

pub mod backoff;
pub mod connection;
pub mod keep_alive;
pub mod transport;

pub use backoff::{Backoff, BackoffPolicy};
pub use connection::{ConnectionCommand, ConnectionEvent, ConnectionHandle, ConnectionManager};
pub use keep_alive::KeepAlive;
pub use transport::{
    Connectable, Transport, TransportError, TransportEvent, TransportEvents, TransportSignal,
};
