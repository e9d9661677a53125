//! The connection state machine: negotiation, transport startup, and
//! the start/stop lifecycle that ties them together (spec §4.5, §5).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::HttpConnectionOptions;
use crate::error::{TransportError, TransportResult};
use crate::negotiate::{decode_negotiation_response, NegotiationResponse};
use crate::transport::factory::select_transport;
use crate::transport::long_polling::LongPollingTransport;
use crate::transport::websocket::WebSocketTransport;
use crate::transport::{Transport, TransportDelegate};
use crate::types::{ConnectionState, TransferFormat, TransportKind};

/// The maximum number of negotiate redirections followed before giving
/// up (spec §9, resolved Open Question 4). Guards against a
/// misconfigured or malicious server forcing an infinite redirect loop.
const MAX_NEGOTIATE_REDIRECTS: u32 = 100;

/// Builds the `/negotiate` request URL by joining `negotiate` onto `base`
/// the way a browser resolves a relative link, so a trailing (or missing)
/// slash on `base` never produces a double slash, and any query string
/// already on `base` survives alongside `negotiateVersion=1`.
fn negotiate_request_url(base: &str) -> TransportResult<String> {
    let mut base_url = Url::parse(base)
        .map_err(|err| TransportError::InvalidNegotiationResponse(format!("invalid base url: {err}")))?;
    let existing_query: Vec<(String, String)> = base_url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }
    let mut url = base_url
        .join("negotiate")
        .map_err(|err| TransportError::InvalidNegotiationResponse(format!("invalid negotiate url: {err}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &existing_query {
            pairs.append_pair(key, value);
        }
        pairs.append_pair("negotiateVersion", "1");
    }
    Ok(url.into())
}

/// Upward callbacks fired by a [`HttpConnection`] (spec §4.5).
///
/// Exactly one of `{connection_did_open eventually followed by
/// connection_did_close, connection_did_fail_to_open}` fires per
/// connection lifetime.
pub trait ConnectionDelegate: Send + Sync {
    /// The connection finished opening; `send` is now legal.
    fn connection_did_open(&self);

    /// One frame of application data arrived.
    fn connection_did_receive_data(&self, data: Bytes);

    /// `start()` failed before the connection ever opened.
    fn connection_did_fail_to_open(&self, error: TransportError);

    /// The connection closed after having opened. `error` is `None` for
    /// a caller-initiated `stop()` with no error.
    fn connection_did_close(&self, error: Option<TransportError>);
}

/// A one-shot barrier: `start()` enters it immediately and whichever
/// path resolves start (open or fail) leaves it. `stop()` waits on it
/// so shutdown never races an in-flight negotiate (spec §5).
struct StartBarrier {
    notify: Notify,
    done: AtomicBool,
}

impl StartBarrier {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            done: AtomicBool::new(false),
        }
    }

    /// Marks the barrier resolved. Idempotent: only the first caller's
    /// notification has any effect, later callers are no-ops.
    fn resolve(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        if self.done.load(Ordering::SeqCst) {
            return;
        }
        self.notify.notified().await;
    }
}

/// The core connection: negotiates a transport, starts it, and
/// forwards its events upward through a [`ConnectionDelegate`].
pub struct HttpConnection {
    base_url: StdMutex<String>,
    state: AtomicU8,
    transport: StdMutex<Option<Arc<dyn Transport>>>,
    stop_error: StdMutex<Option<TransportError>>,
    access_token_override: StdMutex<Option<String>>,
    start_barrier: StartBarrier,
    options: HttpConnectionOptions,
    http_client: reqwest::Client,
    delegate: StdMutex<Option<Weak<dyn ConnectionDelegate>>>,
    /// Guards the single terminal callback — `connection_did_fail_to_open`
    /// xor `connection_did_close` — against being fired twice when
    /// `stop()` races a `start()` that is about to fail open on its own
    /// (spec §8 scenario 6: whichever of the two reaches this flag
    /// first wins, the other is a no-op).
    terminal_reported: AtomicBool,
}

impl HttpConnection {
    /// Creates a new connection targeting `url`, not yet started.
    #[must_use]
    pub fn new(url: impl Into<String>, options: HttpConnectionOptions) -> Arc<Self> {
        let http_client = (options.http_client_factory)();
        Arc::new(Self {
            base_url: StdMutex::new(url.into()),
            state: AtomicU8::new(ConnectionState::Initial as u8),
            transport: StdMutex::new(None),
            stop_error: StdMutex::new(None),
            access_token_override: StdMutex::new(None),
            start_barrier: StartBarrier::new(),
            options,
            http_client,
            delegate: StdMutex::new(None),
            terminal_reported: AtomicBool::new(false),
        })
    }

    /// Claims the single terminal-event slot. Returns `true` for the
    /// first caller only; later callers (whichever loses the race
    /// between `stop()` and an in-flight `start()` failing open) get
    /// `false` and must not fire their callback.
    fn claim_terminal_report(&self) -> bool {
        !self.terminal_reported.swap(true, Ordering::SeqCst)
    }

    /// Registers the delegate that receives lifecycle callbacks.
    pub fn set_delegate(&self, delegate: Weak<dyn ConnectionDelegate>) {
        *self.delegate.lock().expect("lock poisoned") = Some(delegate);
    }

    fn delegate(&self) -> Option<Arc<dyn ConnectionDelegate>> {
        self.delegate
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_tag(self.state.load(Ordering::SeqCst))
    }

    /// Compare-and-set the state. `from = None` force-sets. Returns the
    /// previous state iff the CAS succeeded.
    fn change_state(&self, from: Option<ConnectionState>, to: ConnectionState) -> Option<ConnectionState> {
        match from {
            None => {
                let previous = self.state.swap(to as u8, Ordering::SeqCst);
                Some(ConnectionState::from_tag(previous))
            }
            Some(expected) => {
                match self.state.compare_exchange(
                    expected as u8,
                    to as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(previous) => Some(ConnectionState::from_tag(previous)),
                    Err(_) => None,
                }
            }
        }
    }

    /// Starts the connection: negotiates (unless `skip_negotiation`),
    /// selects a transport, and opens it (spec §4.5 start sequence).
    pub async fn start(self: &Arc<Self>) {
        if self
            .change_state(Some(ConnectionState::Initial), ConnectionState::Connecting)
            .is_none()
        {
            self.fail_open(TransportError::InvalidState(
                "start() called more than once".to_string(),
            ));
            return;
        }

        if self.options.skip_negotiation {
            let url = self.base_url.lock().expect("lock poisoned").clone();
            self.start_transport(TransportKind::WebSockets, None, &url).await;
            return;
        }

        let mut redirects = 0u32;
        let mut negotiate_url = self.base_url.lock().expect("lock poisoned").clone();

        loop {
            if redirects > MAX_NEGOTIATE_REDIRECTS {
                self.fail_open(TransportError::InvalidNegotiationResponse(
                    "too many redirects".to_string(),
                ));
                return;
            }

            match self.negotiate_once(&negotiate_url).await {
                Ok(NegotiationResponse::Error { message }) => {
                    self.fail_open(TransportError::InvalidNegotiationResponse(message));
                    return;
                }
                Ok(NegotiationResponse::Redirection { url, access_token }) => {
                    *self.base_url.lock().expect("lock poisoned") = url.clone();
                    *self.access_token_override.lock().expect("lock poisoned") = Some(access_token);
                    negotiate_url = url;
                    redirects += 1;
                    continue;
                }
                Ok(response) => {
                    let transports = response.available_transports().unwrap_or(&[]);
                    if transports.is_empty() {
                        self.fail_open(TransportError::InvalidNegotiationResponse(
                            "empty list of available transports".to_string(),
                        ));
                        return;
                    }
                    let kind = match select_transport(transports) {
                        Ok(kind) => kind,
                        Err(err) => {
                            self.fail_open(err);
                            return;
                        }
                    };
                    let routing_id = response.routing_id().map(str::to_string);
                    self.start_transport(kind, routing_id, &negotiate_url).await;
                    return;
                }
                Err(err) => {
                    self.fail_open(err);
                    return;
                }
            }
        }
    }

    async fn negotiate_once(&self, base: &str) -> TransportResult<NegotiationResponse> {
        let url = negotiate_request_url(base)?;
        debug!(url = %url, "negotiating");

        let mut request = self.http_client.post(&url);
        if let Some(token) = self.current_access_token().await {
            request = request.bearer_auth(token);
        }
        for (key, value) in &self.options.headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::WebError {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        decode_negotiation_response(&body)
            .map_err(|err| TransportError::InvalidNegotiationResponse(err.to_string()))
    }

    async fn current_access_token(&self) -> Option<String> {
        if let Some(token) = self.access_token_override.lock().expect("lock poisoned").clone() {
            return Some(token);
        }
        match &self.options.access_token_provider {
            Some(provider) => provider().await,
            None => None,
        }
    }

    async fn start_transport(self: &Arc<Self>, kind: TransportKind, routing_id: Option<String>, base_url: &str) {
        if self.state() != ConnectionState::Connecting {
            self.fail_open(TransportError::ConnectionIsBeingClosed);
            return;
        }

        let start_url = match &routing_id {
            Some(id) => {
                let separator = if base_url.contains('?') { '&' } else { '?' };
                format!("{base_url}{separator}id={id}")
            }
            None => base_url.to_string(),
        };

        let transport: Arc<dyn Transport> = match kind {
            TransportKind::WebSockets => Arc::new(WebSocketTransport::new()),
            TransportKind::LongPolling => Arc::new(LongPollingTransport::new(
                self.http_client.clone(),
                self.options.timeouts.poll,
            )),
            TransportKind::ServerSentEvents => {
                self.fail_open(TransportError::InvalidNegotiationResponse(
                    "server-sent events is not a selectable transport".to_string(),
                ));
                return;
            }
        };

        *self.transport.lock().expect("lock poisoned") = Some(Arc::clone(&transport));

        let delegate_adapter: Weak<dyn TransportDelegate> = Arc::downgrade(self);
        let result = transport
            .start(&start_url, TransferFormat::Text, delegate_adapter)
            .await;

        if let Err(err) = result {
            self.fail_open(err);
        }
    }

    fn fail_open(&self, error: TransportError) {
        self.change_state(None, ConnectionState::Stopped);
        self.start_barrier.resolve();
        if self.claim_terminal_report()
            && let Some(delegate) = self.delegate()
        {
            delegate.connection_did_fail_to_open(error);
        }
    }

    /// Sends one frame. Legal only in the `Connected` state.
    pub async fn send(&self, data: Bytes) -> TransportResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::InvalidState(
                "send() called while not connected".to_string(),
            ));
        }
        let transport = self.transport.lock().expect("lock poisoned").clone();
        match transport {
            Some(transport) => transport.send(data).await,
            None => Err(TransportError::InvalidState(
                "send() called with no transport installed".to_string(),
            )),
        }
    }

    /// Stops the connection. `error` becomes the `stopError` that takes
    /// precedence over whatever the transport itself reports (spec
    /// §4.5 stop, §7).
    pub async fn stop(&self, error: Option<TransportError>) {
        let previous = self.change_state(None, ConnectionState::Stopped);

        match previous {
            Some(ConnectionState::Stopped) => return,
            Some(ConnectionState::Initial) => {
                warn!("stop() called on a connection that was never started");
                return;
            }
            _ => {}
        }

        *self.stop_error.lock().expect("lock poisoned") = error.clone();
        self.start_barrier.wait().await;

        let transport = self.transport.lock().expect("lock poisoned").clone();
        match transport {
            Some(transport) => {
                if let Err(close_err) = transport.close().await {
                    warn!(error = %close_err, "transport close reported an error during stop()");
                }
            }
            None => {
                if self.claim_terminal_report()
                    && let Some(delegate) = self.delegate()
                {
                    delegate.connection_did_close(error);
                }
            }
        }
    }
}

impl TransportDelegate for HttpConnection {
    fn transport_did_open(&self) {
        if self
            .change_state(Some(ConnectionState::Connecting), ConnectionState::Connected)
            .is_some()
        {
            self.start_barrier.resolve();
            if let Some(delegate) = self.delegate() {
                delegate.connection_did_open();
            }
        }
        // CAS failure means the connection already moved (e.g. stopped
        // while the transport was opening); nothing user-visible to do.
    }

    fn transport_did_receive_data(&self, data: Bytes) {
        if let Some(delegate) = self.delegate() {
            delegate.connection_did_receive_data(data);
        }
    }

    fn transport_did_close(&self, error: Option<TransportError>) {
        let previous_tag = self.state.swap(ConnectionState::Stopped as u8, Ordering::SeqCst);
        let previous = ConnectionState::from_tag(previous_tag);
        let stop_error = self.stop_error.lock().expect("lock poisoned").clone();
        let reported = stop_error.or(error);

        match previous {
            ConnectionState::Connecting => {
                self.start_barrier.resolve();
                if self.claim_terminal_report()
                    && let Some(delegate) = self.delegate()
                {
                    delegate.connection_did_fail_to_open(
                        reported.unwrap_or_else(|| {
                            TransportError::ProtocolViolation(
                                "transport closed before opening with no error".to_string(),
                            )
                        }),
                    );
                }
            }
            _ => {
                info!("connection closed");
                if self.claim_terminal_report()
                    && let Some(delegate) = self.delegate()
                {
                    delegate.connection_did_close(reported);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingDelegate {
        opened: AtomicUsize,
        failed: StdMutex<Option<TransportError>>,
        closed: AtomicUsize,
    }

    impl ConnectionDelegate for RecordingDelegate {
        fn connection_did_open(&self) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }
        fn connection_did_receive_data(&self, _data: Bytes) {}
        fn connection_did_fail_to_open(&self, error: TransportError) {
            *self.failed.lock().expect("lock poisoned") = Some(error);
        }
        fn connection_did_close(&self, _error: Option<TransportError>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn negotiate_failure_with_no_transports_fails_open() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/negotiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "connectionId": "abc",
                "connectionToken": "tok",
                "negotiateVersion": 1,
                "availableTransports": []
            })))
            .mount(&server)
            .await;

        let connection = HttpConnection::new(server.uri(), HttpConnectionOptions::default());
        let delegate = Arc::new(RecordingDelegate::default());
        let weak_delegate: Weak<dyn ConnectionDelegate> = Arc::downgrade(&delegate);
        connection.set_delegate(weak_delegate);

        connection.start().await;

        assert_eq!(connection.state(), ConnectionState::Stopped);
        assert!(delegate.failed.lock().expect("lock poisoned").is_some());
        assert_eq!(delegate.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn negotiate_non_200_fails_open_with_web_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/negotiate"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let connection = HttpConnection::new(server.uri(), HttpConnectionOptions::default());
        let delegate = Arc::new(RecordingDelegate::default());
        let weak_delegate: Weak<dyn ConnectionDelegate> = Arc::downgrade(&delegate);
        connection.set_delegate(weak_delegate);

        connection.start().await;

        let failed = delegate.failed.lock().expect("lock poisoned").clone();
        assert!(matches!(failed, Some(TransportError::WebError { status: 500 })));
    }

    #[tokio::test]
    async fn stop_before_start_warns_and_is_a_no_op() {
        let connection = HttpConnection::new("http://example.test", HttpConnectionOptions::default());
        connection.stop(None).await;
        assert_eq!(connection.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn double_start_fails_open_with_invalid_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/negotiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "connectionId": "abc",
                "connectionToken": "tok",
                "negotiateVersion": 1,
                "availableTransports": []
            })))
            .mount(&server)
            .await;

        let connection = HttpConnection::new(server.uri(), HttpConnectionOptions::default());
        connection.start().await;
        assert_eq!(connection.state(), ConnectionState::Stopped);

        let delegate = Arc::new(RecordingDelegate::default());
        let weak_delegate: Weak<dyn ConnectionDelegate> = Arc::downgrade(&delegate);
        connection.set_delegate(weak_delegate);
        connection.start().await;

        let failed = delegate.failed.lock().expect("lock poisoned").clone();
        assert!(matches!(failed, Some(TransportError::InvalidState(_))));
    }

    #[tokio::test]
    async fn redirect_once_follows_new_url_and_sends_bearer_token() {
        let first = MockServer::start().await;
        let second = MockServer::start().await;

        // The redirect target carries a trailing slash, which is exactly
        // what makes a naive `format!("{base}/negotiate")` join produce a
        // double slash.
        let second_uri = format!("{}/", second.uri());

        Mock::given(method("POST"))
            .and(path("/negotiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": second_uri,
                "accessToken": "redirect-token",
            })))
            .mount(&first)
            .await;

        Mock::given(method("POST"))
            .and(path("/negotiate"))
            .and(header("authorization", "Bearer redirect-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "connectionId": "abc",
                "connectionToken": "tok",
                "negotiateVersion": 1,
                "availableTransports": []
            })))
            .mount(&second)
            .await;

        let connection = HttpConnection::new(first.uri(), HttpConnectionOptions::default());
        let delegate = Arc::new(RecordingDelegate::default());
        let weak_delegate: Weak<dyn ConnectionDelegate> = Arc::downgrade(&delegate);
        connection.set_delegate(weak_delegate);

        connection.start().await;

        // If the redirect, the bearer token, or the URL join had gone
        // wrong, wiremock would have returned a 404 and this would be a
        // `WebError`. Getting all the way to "empty list of available
        // transports" proves the second negotiate request landed on the
        // redirected server, authenticated with the redirect's token, at
        // a correctly-joined (non-doubled-slash) path.
        let failed = delegate.failed.lock().expect("lock poisoned").clone();
        assert!(
            matches!(
                failed,
                Some(TransportError::InvalidNegotiationResponse(ref msg))
                    if msg.contains("empty list of available transports")
            ),
            "expected the redirected negotiate to succeed and fail open only on \
             empty transports, got {failed:?}"
        );
    }

    #[tokio::test]
    async fn stop_during_connecting_reports_exactly_one_terminal_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/negotiate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "connectionId": "abc",
                        "connectionToken": "tok",
                        "negotiateVersion": 1,
                        "availableTransports": []
                    }))
                    .set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;

        let connection = HttpConnection::new(server.uri(), HttpConnectionOptions::default());
        let delegate = Arc::new(RecordingDelegate::default());
        let weak_delegate: Weak<dyn ConnectionDelegate> = Arc::downgrade(&delegate);
        connection.set_delegate(weak_delegate);

        let starter = Arc::clone(&connection);
        let start_handle = tokio::spawn(async move {
            starter.start().await;
        });

        // Let start() past the CAS into Connecting and into the delayed
        // negotiate request before racing stop() against it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        connection.stop(None).await;
        start_handle.await.expect("start() task panicked");

        let failed = usize::from(delegate.failed.lock().expect("lock poisoned").is_some());
        let closed = delegate.closed.load(Ordering::SeqCst);
        assert_eq!(
            failed + closed,
            1,
            "exactly one terminal callback must fire (spec §4.5/§8 scenario 6), \
             got failed={failed} closed={closed}"
        );
    }
}
