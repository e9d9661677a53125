//! WebSocket transport: a thin adapter over `tokio-tungstenite` (spec
//! §4.2's ambient networking toolkit, reused rather than reimplemented).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::transport::{BoxFuture, Transport, TransportDelegate};
use crate::types::TransferFormat;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

/// WebSocket transport.
///
/// Never inherently keep-alive: the upper layer is responsible for
/// sending application-level pings if liveness detection is needed
/// (spec §4.1's `inherentKeepAlive` property).
pub struct WebSocketTransport {
    writer: Arc<AsyncMutex<Option<WsSink>>>,
    started: AtomicBool,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    /// Creates a new, not-yet-started WebSocket transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            writer: Arc::new(AsyncMutex::new(None)),
            started: AtomicBool::new(false),
        }
    }

    fn ws_url(url: &str) -> String {
        if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            url.to_string()
        }
    }
}

async fn run_reader(
    mut reader: WsSource,
    writer: Arc<AsyncMutex<Option<WsSink>>>,
    delegate: Weak<dyn TransportDelegate>,
) {
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(delegate) = delegate.upgrade() {
                    delegate.transport_did_receive_data(Bytes::from(text.into_bytes()));
                }
            }
            Some(Ok(Message::Binary(data))) => {
                if let Some(delegate) = delegate.upgrade() {
                    delegate.transport_did_receive_data(Bytes::from(data));
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                trace!("websocket ping received, replying with pong");
                if let Some(writer_guard) = writer.lock().await.as_mut() {
                    let _ = writer_guard.send(Message::Pong(payload)).await;
                }
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "websocket closed by peer");
                if let Some(delegate) = delegate.upgrade() {
                    delegate.transport_did_close(None);
                }
                return;
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(err)) => {
                warn!(error = %err, "websocket read error");
                if let Some(delegate) = delegate.upgrade() {
                    delegate.transport_did_close(Some(TransportError::from(err)));
                }
                return;
            }
            None => {
                if let Some(delegate) = delegate.upgrade() {
                    delegate.transport_did_close(None);
                }
                return;
            }
        }
    }
}

impl Transport for WebSocketTransport {
    fn start(
        &self,
        url: &str,
        _transfer_format: TransferFormat,
        delegate: Weak<dyn TransportDelegate>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let url = Self::ws_url(url);
        let writer_slot = Arc::clone(&self.writer);
        Box::pin(async move {
            let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
            let (sink, source) = stream.split();
            *writer_slot.lock().await = Some(sink);
            self.started.store(true, Ordering::SeqCst);

            if let Some(delegate_ref) = delegate.upgrade() {
                delegate_ref.transport_did_open();
            }

            tokio::spawn(run_reader(source, Arc::clone(&writer_slot), delegate));
            Ok(())
        })
    }

    fn send(&self, data: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.started.load(Ordering::SeqCst) {
                return Err(TransportError::InvalidState(
                    "send called before websocket transport finished starting".to_string(),
                ));
            }
            let mut guard = self.writer.lock().await;
            let sink = guard.as_mut().ok_or_else(|| {
                TransportError::InvalidState("websocket transport is closed".to_string())
            })?;
            sink.send(Message::Binary(data.to_vec().into()))
                .await
                .map_err(TransportError::from)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let mut guard = self.writer.lock().await;
            if let Some(mut sink) = guard.take() {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
            Ok(())
        })
    }

    fn inherent_keep_alive(&self) -> bool {
        false
    }
}
