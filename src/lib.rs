//! Sockline
//!
//! A single-connection socket transport for HTTP-shaped exchanges.
//!
//! A [`Connection`] writes a request made of a header block and an opaque
//! body, then reads the response: a header block terminated by a blank line,
//! followed by a body which runs to the end of the stream. Hooks registered on
//! the connection can edit the request before it is sent, interpret the
//! response head, end the exchange before the body, and post-process the
//! complete response.
//!
//! ```no_run
//! # async fn demo() -> Result<(), sockline::Error> {
//! use sockline::{hooks, Connection, Options};
//!
//! let mut connection = Connection::new(Options::new("http://example.com"));
//! connection
//!     .on_header_received()
//!     .register("parse-head", hooks::parse_head())
//!     .register("skip-body", hooks::skip_body_for_status());
//!
//! let response = connection
//!     .send("GET / HTTP/1.1\r\nhost: example.com\r\nconnection: close\r\n\r\n")
//!     .await?;
//! println!("{:?} {:?}", response.status(), response.body());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod buffer;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod hooks;
pub mod options;
pub mod payload;
pub mod session;
pub mod token;

pub use buffer::ScratchBuffer;
pub use connection::{Connection, ConnectionState};
pub use error::{ConnectError, Error, TransportCallError};
pub use exchange::{Exchange, Response};
pub use options::{Options, OptionsSnapshot, SocketOptions};
pub use payload::Payload;
pub use token::AccessToken;

/// Boxed error type used for hook failures and error sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
