//! Transport negotiation and connection core for a SignalR-protocol
//! client: negotiation, transport selection and lifecycle, the
//! connection state machine, and the long-polling loop.
//!
//! Hub invocation bookkeeping and message framing live in layers above
//! this crate; this crate only carries bytes between a negotiated
//! transport and a [`connection::ConnectionDelegate`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod error;
pub mod negotiate;
pub mod transport;
pub mod types;

pub use config::{HttpConnectionOptions, LimitsConfig, TimeoutConfig, TlsConfig};
pub use connection::{ConnectionDelegate, HttpConnection};
pub use error::{TransportError, TransportResult};
pub use negotiate::{decode_negotiation_response, NegotiateDecodeError, NegotiationResponse};
pub use transport::{BoxFuture, Transport, TransportDelegate};
pub use types::{ConnectionState, TransferFormat, TransportDescription, TransportKind};
