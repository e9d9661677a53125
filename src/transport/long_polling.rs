//! HTTP long-polling transport (spec §4.3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{trace, warn};

use crate::error::TransportError;
use crate::transport::{BoxFuture, Transport, TransportDelegate};
use crate::types::TransferFormat;

/// Shared poll-loop state, cloned into the spawned background task so
/// that it can outlive the `&self` borrow of [`Transport::start`].
struct Shared {
    client: reqwest::Client,
    poll_timeout: Duration,
    active: AtomicBool,
    opened: AtomicBool,
    close_called: AtomicBool,
    close_error: StdMutex<Option<TransportError>>,
    close_queue: AsyncMutex<()>,
    url: StdMutex<String>,
    /// The delegate installed by the most recent `start()`, kept
    /// around so a direct `close()` call (as opposed to the poll loop
    /// reaching its own end-of-life) can still deliver
    /// `transport_did_close` to the real listener rather than a
    /// permanently-dangling `Weak`.
    delegate: StdMutex<Option<Weak<dyn TransportDelegate>>>,
}

impl Shared {
    fn poll_url(&self) -> String {
        let base = self.url.lock().expect("lock poisoned").clone();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{base}{separator}_={now}")
    }

    fn stored_delegate(&self) -> Weak<dyn TransportDelegate> {
        self.delegate
            .lock()
            .expect("lock poisoned")
            .clone()
            .unwrap_or_else(Weak::new)
    }

    async fn run_poll_loop(self: Arc<Self>, delegate: Weak<dyn TransportDelegate>) {
        loop {
            if !self.active.load(Ordering::SeqCst) {
                break;
            }

            let response = self
                .client
                .get(self.poll_url())
                .timeout(self.poll_timeout)
                .send()
                .await;

            match response {
                Err(err) if err.is_timeout() => {
                    trace!("long-poll GET timed out client-side, reissuing");
                    continue;
                }
                Err(err) => {
                    *self.close_error.lock().expect("lock poisoned") =
                        Some(TransportError::from(err));
                    self.active.store(false, Ordering::SeqCst);
                }
                Ok(response) => match response.status().as_u16() {
                    204 => {
                        *self.close_error.lock().expect("lock poisoned") = None;
                        self.active.store(false, Ordering::SeqCst);
                    }
                    200 => {
                        if !self.opened.swap(true, Ordering::SeqCst) {
                            if let Some(delegate) = delegate.upgrade() {
                                delegate.transport_did_open();
                            }
                            // First 200 is a handshake; body is discarded.
                        } else {
                            match response.bytes().await {
                                Ok(body) if !body.is_empty() => {
                                    if let Some(delegate) = delegate.upgrade() {
                                        delegate.transport_did_receive_data(body);
                                    }
                                }
                                Ok(_) => {
                                    trace!("empty long-poll body, server-side timeout, reissuing");
                                }
                                Err(err) => {
                                    *self.close_error.lock().expect("lock poisoned") =
                                        Some(TransportError::from(err));
                                    self.active.store(false, Ordering::SeqCst);
                                }
                            }
                        }
                    }
                    404 if !self.active.load(Ordering::SeqCst) => {
                        // Shutdown race: close() already ran, server has
                        // already torn the session down. Not an error.
                    }
                    status => {
                        warn!(status, "long-poll GET failed");
                        *self.close_error.lock().expect("lock poisoned") =
                            Some(TransportError::WebError { status });
                        self.active.store(false, Ordering::SeqCst);
                    }
                },
            }

            if !self.active.load(Ordering::SeqCst) {
                break;
            }
        }

        self.run_close(delegate).await;
    }

    async fn run_close(&self, delegate: Weak<dyn TransportDelegate>) {
        let _guard = self.close_queue.lock().await;
        if self.close_called.swap(true, Ordering::SeqCst) {
            return;
        }

        self.active.store(false, Ordering::SeqCst);
        let url = self.url.lock().expect("lock poisoned").clone();
        let delete_result = self.client.delete(url).send().await;

        let close_error = self.close_error.lock().expect("lock poisoned").clone();
        let reported = match (close_error, delete_result) {
            (Some(original), _) => Some(original),
            (None, Err(err)) => Some(TransportError::from(err)),
            (None, Ok(response)) if !response.status().is_success() => Some(TransportError::WebError {
                status: response.status().as_u16(),
            }),
            (None, Ok(_)) => None,
        };

        if let Some(delegate) = delegate.upgrade() {
            delegate.transport_did_close(reported);
        }
    }
}

/// HTTP long-polling transport.
///
/// Inherently keeps the logical connection alive: a standing request is
/// always in flight, so the connection layer needs no separate
/// keep-alive timer (spec §4.1's `inherentKeepAlive` property).
pub struct LongPollingTransport {
    shared: Arc<Shared>,
}

impl LongPollingTransport {
    /// Creates a new, not-yet-started long-polling transport using
    /// `client` for all GET/POST/DELETE traffic. `poll_timeout` bounds
    /// each poll GET specifically — it must exceed the server's own
    /// long-poll hold time, which is typically far longer than the
    /// client's general request timeout (spec §4.1 `TimeoutConfig::poll`).
    #[must_use]
    pub fn new(client: reqwest::Client, poll_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                poll_timeout,
                active: AtomicBool::new(false),
                opened: AtomicBool::new(false),
                close_called: AtomicBool::new(false),
                close_error: StdMutex::new(None),
                close_queue: AsyncMutex::new(()),
                url: StdMutex::new(String::new()),
                delegate: StdMutex::new(None),
            }),
        }
    }
}

impl Transport for LongPollingTransport {
    fn start(
        &self,
        url: &str,
        _transfer_format: TransferFormat,
        delegate: Weak<dyn TransportDelegate>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let url = url.to_string();
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            *shared.url.lock().expect("lock poisoned") = url;
            shared.active.store(true, Ordering::SeqCst);
            shared.opened.store(false, Ordering::SeqCst);
            shared.close_called.store(false, Ordering::SeqCst);
            *shared.close_error.lock().expect("lock poisoned") = None;
            *shared.delegate.lock().expect("lock poisoned") = Some(delegate.clone());

            tokio::spawn(Arc::clone(&shared).run_poll_loop(delegate));
            Ok(())
        })
    }

    fn send(&self, data: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            if !shared.active.load(Ordering::SeqCst) {
                return Err(TransportError::InvalidState(
                    "send called while long-polling transport is inactive".to_string(),
                ));
            }
            let url = shared.url.lock().expect("lock poisoned").clone();
            let response = shared.client.post(url).body(data).send().await?;
            if response.status().as_u16() == 200 {
                Ok(())
            } else {
                Err(TransportError::WebError {
                    status: response.status().as_u16(),
                })
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.active.store(false, Ordering::SeqCst);
            // The in-flight poll loop (if any) observes `active` false
            // and runs `run_close` itself; a transport that was never
            // started, or whose loop already exited, needs it run here
            // so a direct `close()` call is never silently dropped. In
            // either case the real delegate installed by `start()` is
            // used, never a dangling one, so `transport_did_close`
            // always reaches whoever is actually listening.
            if !shared.close_called.load(Ordering::SeqCst) {
                shared.run_close(shared.stored_delegate()).await;
            }
            Ok(())
        })
    }

    fn inherent_keep_alive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RecordingDelegate {
        opened: AtomicBool,
        received: StdMutex<Vec<Bytes>>,
        closed: StdMutex<Option<Option<TransportError>>>,
    }

    impl RecordingDelegate {
        fn new() -> Self {
            Self {
                opened: AtomicBool::new(false),
                received: StdMutex::new(Vec::new()),
                closed: StdMutex::new(None),
            }
        }
    }

    impl TransportDelegate for RecordingDelegate {
        fn transport_did_open(&self) {
            self.opened.store(true, Ordering::SeqCst);
        }

        fn transport_did_receive_data(&self, data: Bytes) {
            self.received.lock().expect("lock poisoned").push(data);
        }

        fn transport_did_close(&self, error: Option<TransportError>) {
            *self.closed.lock().expect("lock poisoned") = Some(error);
        }
    }

    fn test_transport() -> LongPollingTransport {
        LongPollingTransport::new(reqwest::Client::new(), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn open_then_receive_then_graceful_204() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/poll"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/poll"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/poll"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let transport = test_transport();
        let delegate = Arc::new(RecordingDelegate::new());
        let url = format!("{}/poll", server.uri());
        let weak_delegate: Weak<dyn TransportDelegate> = Arc::downgrade(&delegate);

        transport
            .start(&url, TransferFormat::Text, weak_delegate)
            .await
            .unwrap();

        for _ in 0..50 {
            if delegate.closed.lock().expect("lock poisoned").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        assert!(delegate.opened.load(Ordering::SeqCst));
        assert_eq!(
            delegate.received.lock().expect("lock poisoned").as_slice(),
            &[Bytes::from_static(b"hello")]
        );
        assert_eq!(*delegate.closed.lock().expect("lock poisoned"), Some(None));
    }

    #[tokio::test]
    async fn send_while_inactive_fails_synchronously() {
        let transport = test_transport();
        let err = transport.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));
    }

    #[tokio::test]
    async fn close_before_start_is_a_no_op_success() {
        let transport = test_transport();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn direct_close_after_start_delivers_transport_did_close_to_real_delegate() {
        let server = MockServer::start().await;

        // Only ever returns the handshake 200; the transport is closed
        // directly rather than via a server-initiated 204, so the
        // in-flight poll is whatever is racing the DELETE below.
        Mock::given(method("GET"))
            .and(path("/poll"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/poll"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let transport = test_transport();
        let delegate = Arc::new(RecordingDelegate::new());
        let url = format!("{}/poll", server.uri());
        let weak_delegate: Weak<dyn TransportDelegate> = Arc::downgrade(&delegate);

        transport
            .start(&url, TransferFormat::Text, weak_delegate)
            .await
            .unwrap();

        // Let the handshake GET land so `opened` flips before closing.
        for _ in 0..50 {
            if delegate.opened.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        transport.close().await.unwrap();

        for _ in 0..50 {
            if delegate.closed.lock().expect("lock poisoned").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert!(
            delegate.closed.lock().expect("lock poisoned").is_some(),
            "transport_did_close must reach the delegate installed by start(), not a dangling one"
        );
    }
}
