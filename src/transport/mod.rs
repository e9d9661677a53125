//! The transport abstraction: a single physical connection over which
//! framed bytes flow, plus the upward delegate callbacks used to report
//! open/receive/close events (spec §4.2).

pub mod factory;
pub mod long_polling;
pub mod websocket;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::error::TransportError;
use crate::types::TransferFormat;

/// A boxed, `Send` future, used throughout this crate in place of
/// `async fn` in traits so that `Transport` and `TransportDelegate`
/// remain object-safe (`Arc<dyn Transport>`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A single physical transport connection (spec §4.2).
///
/// Implementors own exactly one underlying connection (a WebSocket, or
/// a long-polling session) and report activity upward through a
/// [`TransportDelegate`] rather than by returning data from `start`.
pub trait Transport: Send + Sync {
    /// Opens the underlying connection at `url` and begins delivering
    /// events to `delegate`. Must be idempotent-safe to call only once;
    /// a second call is a logic error in the caller.
    fn start(
        &self,
        url: &str,
        transfer_format: TransferFormat,
        delegate: std::sync::Weak<dyn TransportDelegate>,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Sends one frame over the transport. Must not be called before
    /// `start` resolves or after `close`.
    fn send(&self, data: Bytes) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Closes the transport. Idempotent: a second call while the first
    /// is in flight joins the first rather than issuing a second
    /// teardown (spec §4.3 close queue, §4.2 general contract).
    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Whether this transport itself keeps the logical connection
    /// alive (as WebSockets do via ping/pong), so the connection layer
    /// should not layer its own keep-alive timer on top.
    fn inherent_keep_alive(&self) -> bool;
}

/// Upward callbacks a [`Transport`] uses to report activity to its
/// owner. Held as a `Weak` reference by transports so that a transport
/// whose owning connection has already been dropped does not spuriously
/// keep it alive (spec §4.2, §5).
pub trait TransportDelegate: Send + Sync {
    /// The transport finished opening successfully.
    fn transport_did_open(&self);

    /// The transport received one frame of application data.
    fn transport_did_receive_data(&self, data: Bytes);

    /// The transport closed, with `error` set if the closure was not
    /// caller-initiated.
    fn transport_did_close(&self, error: Option<TransportError>);
}
