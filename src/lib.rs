//! Lightweight, stream-based WebSockets for Rust.
//!
//! Both endpoint roles are supported: [`Server::bind`] accepts inbound
//! connections, [`connect`] originates one. Either way you end up with a
//! [`Connection`] over a blocking byte stream, whose [`recv`](Connection::recv)
//! yields typed [`Event`]s: the handshake completion, complete text
//! messages, binary messages readable as lazy [`InStream`]s, pongs, and
//! the one close notification of the connection's lifetime. Outgoing
//! binary messages can be streamed fragment by fragment through an
//! [`OutStream`].
//!
//! ```no_run
//! use scheelite::{connect, Event};
//!
//! let mut conn = connect("ws://127.0.0.1:8080/chat")?;
//! if let Event::Open = conn.recv()? {
//!     conn.send_text("hello")?;
//! }
//! # Ok::<(), scheelite::Error>(())
//! ```
//!
//! The optional [`dispatch`] module adds a JSON envelope convention on
//! top: text payloads of the shape `{"sign": tag, "data": ...}` routed to
//! chains of middleware handlers.

#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub mod client;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod stream;

pub use crate::client::{connect, connect_with, ClientOptions};
pub use crate::dispatch::{SendSign, SignDispatcher};
pub use crate::error::{Error, Result};
pub use crate::protocol::frame::coding::CloseCode;
pub use crate::protocol::streams::{InStream, OutStream};
pub use crate::protocol::{
    CloseFrame, Connection, ConnectionConfig, Event, Message, ReadyState, Role,
};
pub use crate::server::Server;
