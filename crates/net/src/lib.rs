//! Outbound network calls that can be forcibly cancelled.
//!
//! Every socket is opened through a [`CancellablePool`]. Closing the pool shuts
//! down all of its live sockets, which makes a thread parked in a blocking read
//! or write return immediately. [`UrlFetcher`] and [`RpcTransport`] run each
//! request on a fresh pool inside a `BoundedCall` and close that pool as the
//! cancellation callback.
//!
//! Plain HTTP/1.1 only; TLS is not supported.

pub mod error;
pub mod fetch;
pub mod pool;
pub mod rpc;
mod wire;

pub use error::NetError;
pub use fetch::{FetchRequest, UrlFetcher};
pub use pool::{CancellablePool, PooledConnection};
pub use rpc::RpcTransport;
