//! The HTTP/2-framed transport: wraps one TLS-terminated TCP
//! connection to the edge in an `h2` server connection, since the edge
//! initiates every stream (control, proxied HTTP, TCP, websocket) against
//! the agent.

mod connection;
mod dispatch;
mod stream_io;

pub use connection::Connection;
pub use dispatch::{classify_request, to_mux_headers};
