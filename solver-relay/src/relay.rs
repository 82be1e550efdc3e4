//! # Relay Client
//!
//! Persistent bidirectional client for the intents relay.
//!
//! The relay fans out `quote` requests and `quote_status` fill notifications
//! to all connected solvers and accepts correlated JSON-RPC requests
//! (`subscribe`, `quote_response`) in return. This client owns the websocket
//! connection, correlates outbound requests with their responses, routes
//! event notifications to per-kind handler channels and reconnects forever
//! when the transport drops.
//!
//! The client is cloneable so it can be shared across tasks: the connection
//! task, the quote orchestrator and the shutdown path all hold the same
//! underlying state.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, error::TrySendError, Receiver, Sender},
        oneshot, Mutex,
    },
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        protocol::Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::dto::{EventNotification, JsonRpcRequest, JsonRpcResponse, RelayMessage, RelayMethod};

pub use crate::dto::EventKind;

#[derive(Error, Debug)]
pub enum RelayError {
    /// Failed to parse the provided relay url.
    #[error("Failed to parse relay url: {0}. Error: {1}")]
    UrlParsing(String, String),

    /// The client has no active connection but was asked to send something.
    #[error("The client is not connected!")]
    NotConnected,

    /// The connect method was called while the client already had an active connection.
    #[error("The client is already connected!")]
    AlreadyConnected,

    /// The transport write for an outbound request failed.
    #[error("Failed to send request: {0}")]
    SendFailed(String),

    /// No matching response arrived within the call timeout.
    #[error("Request timed out")]
    RequestTimeout,

    /// The relay answered a correlated request with an error object.
    #[error("The relay replied with an error: {0}")]
    Server(Value),

    /// The connection was closed by the relay.
    #[error("The relay closed the connection!")]
    ConnectionClosed,

    /// The connection encountered a transport level error.
    #[error("Connection error: {0}")]
    ConnectionError(#[from] Box<tungstenite::Error>),

    /// A fatal error that cannot be recovered from, e.g. a serialization bug.
    #[error("Fatal relay client error: {0}")]
    Fatal(String),
}

/// The outbound correlated-call surface of the relay client.
///
/// The quote orchestrator replies through this trait so tests can observe
/// outbound calls without a live websocket.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Sends a correlated JSON-RPC request and waits for the matching
    /// response.
    ///
    /// Resolves with the response's `result`, rejects with
    /// [`RelayError::Server`] if the relay answered with an error object,
    /// [`RelayError::RequestTimeout`] if no response arrived in time or
    /// [`RelayError::SendFailed`] if the transport write failed. The pending
    /// entry is removed in all three outcomes.
    async fn call(&self, method: RelayMethod, params: Vec<Value>) -> Result<Value, RelayError>;
}

type WebSocketSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connection-scoped state. `None` in the client means disconnected.
struct Inner {
    /// Websocket sender handle.
    sink: WebSocketSink,
    /// In-flight correlated calls awaiting a response by request id.
    pending: HashMap<u64, oneshot::Sender<Result<Value, RelayError>>>,
    /// Server-assigned subscription ids mapped to their event kind.
    subscriptions: HashMap<String, EventKind>,
}

impl Inner {
    fn new(sink: WebSocketSink) -> Self {
        Self { sink, pending: HashMap::new(), subscriptions: HashMap::new() }
    }
}

/// Websocket implementation of the relay protocol client.
///
/// State machine: disconnected -> connecting -> connected, falling back to
/// disconnected on any transport error. Reconnection retries forever on a
/// fixed cooldown since the service has no other liveness path; only the
/// connection task owns the retry loop so it is never duplicated. [`close`]
/// is terminal.
///
/// [`close`]: WsRelayClient::close
#[derive(Clone)]
pub struct WsRelayClient {
    /// The relay websocket url.
    url: String,
    /// Optional authorization key sent during the handshake.
    auth_key: Option<String>,
    /// How long a correlated call waits for its response.
    call_timeout: Duration,
    /// Duration to wait between reconnection attempts.
    retry_cooldown: Duration,
    /// The client buffers this many events per kind before dropping new ones.
    event_buffer_size: usize,
    /// Monotonically increasing request id, never reused within the client's
    /// lifetime.
    request_counter: Arc<AtomicU64>,
    /// Handler channels per event kind, in registration order. Populated
    /// before `connect`, read-only afterwards.
    handlers: Vec<(EventKind, Sender<Value>)>,
    /// Shared connection state.
    inner: Arc<Mutex<Option<Inner>>>,
    /// Handle used by `close` to end the connection task.
    stop_tx: Arc<Mutex<Option<Sender<()>>>>,
    /// Set once `close` was called; the client cannot be restarted.
    stopped: Arc<AtomicBool>,
}

impl WsRelayClient {
    const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);
    const DEFAULT_RETRY_COOLDOWN: Duration = Duration::from_secs(5);

    pub fn new(url: &str, auth_key: Option<&str>) -> Result<Self, RelayError> {
        // Validate the url early so connect failures are retried for
        // transient reasons only.
        url.into_client_request()
            .map_err(|e| RelayError::UrlParsing(url.to_string(), e.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            auth_key: auth_key.map(|s| s.to_string()),
            call_timeout: Self::DEFAULT_CALL_TIMEOUT,
            retry_cooldown: Self::DEFAULT_RETRY_COOLDOWN,
            event_buffer_size: 128,
            request_counter: Arc::new(AtomicU64::new(0)),
            handlers: Vec::new(),
            inner: Arc::new(Mutex::new(None)),
            stop_tx: Arc::new(Mutex::new(None)),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_retry_cooldown(mut self, cooldown: Duration) -> Self {
        self.retry_cooldown = cooldown;
        self
    }

    /// Registers a handler channel for an event kind.
    ///
    /// Must be called before [`connect`]: the client subscribes to every
    /// registered kind each time a connection is established and routes
    /// matching event notifications into the returned receiver.
    ///
    /// [`connect`]: WsRelayClient::connect
    pub fn register(&mut self, kind: EventKind) -> Receiver<Value> {
        let (tx, rx) = mpsc::channel(self.event_buffer_size);
        self.handlers.push((kind, tx));
        rx
    }

    /// Whether the client currently holds an active connection.
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Starts the client's connection task.
    ///
    /// Returns once the first connection attempt resolved; if it failed the
    /// task keeps retrying in the background. The returned handle completes
    /// only after [`close`] was called.
    ///
    /// [`close`]: WsRelayClient::close
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<JoinHandle<Result<(), RelayError>>, RelayError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RelayError::NotConnected);
        }
        if self.is_connected().await {
            return Err(RelayError::AlreadyConnected);
        }
        info!(url = %self.url, "Starting relay websocket client");

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        {
            let mut guard = self.stop_tx.lock().await;
            *guard = Some(stop_tx);
        }
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let mut ready_tx = Some(ready_tx);

        let this = self.clone();
        let jh = tokio::spawn(async move {
            let mut attempts: u64 = 0;
            'retry: loop {
                if attempts > 0 {
                    tokio::select! {
                        _ = sleep(this.retry_cooldown) => {}
                        _ = stop_rx.recv() => break 'retry,
                    }
                    info!(attempts, "Attempting to reconnect to the relay");
                }

                let request = this.client_request()?;
                let (conn, _) = match connect_async(request).await {
                    Ok(conn) => conn,
                    Err(error) => {
                        attempts += 1;
                        warn!(error = %error, attempts, "Failed to connect to the relay; retrying");
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                        continue 'retry;
                    }
                };

                let (sink, stream) = conn.split();
                {
                    let mut guard = this.inner.lock().await;
                    *guard = Some(Inner::new(sink));
                }
                attempts = 0;
                info!("Connected to the relay");
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }

                // Issue the subscribe calls concurrently with the read loop,
                // their responses are resolved through the pending table.
                let subscriber = {
                    let client = this.clone();
                    tokio::spawn(async move { client.subscribe_registered().await })
                };

                let mut msg_rx = stream.boxed();
                loop {
                    let res = tokio::select! {
                        msg = msg_rx.next() => match msg {
                            Some(msg) => this.handle_msg(msg).await,
                            None => Err(RelayError::ConnectionClosed),
                        },
                        _ = stop_rx.recv() => {
                            subscriber.abort();
                            break 'retry;
                        }
                    };
                    if let Err(error) = res {
                        attempts += 1;
                        warn!(?error, attempts, "Connection dropped unexpectedly; reconnecting");
                        subscriber.abort();
                        // Dropping the connection state rejects all pending
                        // calls: their response channels are closed.
                        let mut guard = this.inner.lock().await;
                        *guard = None;
                        continue 'retry;
                    }
                }
            }

            info!("Relay client stopped");
            let mut guard = this.inner.lock().await;
            *guard = None;
            Ok(())
        });

        let _ = ready_rx.await;
        Ok(jh)
    }

    /// Closes the connection and ends the connection task. Terminal: no
    /// further reconnection happens and the client cannot be restarted.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), RelayError> {
        info!("Closing relay client");
        self.stopped.store(true, Ordering::SeqCst);
        let guard = self.stop_tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(())
                .await
                .map_err(|_| RelayError::NotConnected),
            None => Err(RelayError::NotConnected),
        }
    }

    fn client_request(&self) -> Result<tungstenite::handshake::client::Request, RelayError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::UrlParsing(self.url.clone(), e.to_string()))?;
        if let Some(key) = &self.auth_key {
            let value: HeaderValue = key
                .parse()
                .map_err(|_| RelayError::Fatal("Invalid authorization key".to_string()))?;
            request
                .headers_mut()
                .insert(AUTHORIZATION, value);
        }
        Ok(request)
    }

    /// Subscribes to every registered event kind and records the returned
    /// subscription ids. Failures are logged, not propagated: the relay sends
    /// nothing for a failed subscription and the next reconnect retries it.
    async fn subscribe_registered(&self) {
        let kinds = self
            .handlers
            .iter()
            .map(|(kind, _)| *kind)
            .collect::<Vec<_>>();
        for kind in kinds {
            match self
                .call(RelayMethod::Subscribe, vec![Value::String(kind.to_string())])
                .await
            {
                Ok(Value::String(subscription_id)) => {
                    debug!(%kind, %subscription_id, "Subscription confirmed");
                    let mut guard = self.inner.lock().await;
                    if let Some(inner) = guard.as_mut() {
                        inner
                            .subscriptions
                            .insert(subscription_id, kind);
                    }
                }
                Ok(other) => {
                    error!(%kind, ?other, "Relay returned an unexpected subscription id")
                }
                Err(error) => error!(%kind, ?error, "Failed to subscribe"),
            }
        }
    }

    /// Main inbound message handling logic.
    ///
    /// Inbound messages are processed in arrival order, one at a time. An
    /// error return makes the connection task reconnect; malformed or
    /// unrecognized payloads are dropped without closing the connection.
    async fn handle_msg(&self, msg: Result<Message, tungstenite::Error>) -> Result<(), RelayError> {
        match msg {
            Ok(Message::Text(text)) => {
                // Deserialize in two steps: untagged enums report much better
                // errors on a `Value` than on a raw reader.
                let value = match serde_json::from_str::<Value>(&text) {
                    Ok(value) => value,
                    Err(error) => {
                        debug!(%error, "Dropping message with invalid JSON");
                        return Ok(());
                    }
                };
                match serde_json::from_value::<RelayMessage>(value) {
                    Ok(RelayMessage::Response(response)) => self.handle_response(response).await,
                    Ok(RelayMessage::Event(event)) => self.handle_event(event).await,
                    Err(error) => {
                        debug!(%error, msg = %text, "Dropping message with unrecognized shape");
                    }
                }
                Ok(())
            }
            Ok(Message::Ping(_)) => {
                let mut guard = self.inner.lock().await;
                if let Some(inner) = guard.as_mut() {
                    if let Err(error) = inner.sink.send(Message::Pong(Vec::new())).await {
                        debug!(?error, "Failed to send pong");
                    }
                }
                Ok(())
            }
            Ok(Message::Pong(_)) => Ok(()),
            Ok(Message::Close(_)) => Err(RelayError::ConnectionClosed),
            Ok(unknown) => {
                trace!(?unknown, "Ignoring unexpected message type");
                Ok(())
            }
            Err(error) => {
                error!(?error, "Websocket error");
                Err(match error {
                    tungstenite::Error::ConnectionClosed => RelayError::ConnectionClosed,
                    e @ (tungstenite::Error::Io(_) |
                    tungstenite::Error::Protocol(_) |
                    tungstenite::Error::AlreadyClosed) => RelayError::ConnectionError(Box::new(e)),
                    e => RelayError::Fatal(e.to_string()),
                })
            }
        }
    }

    /// Resolves or rejects the pending call matching the response id.
    /// Unknown ids are logged and dropped, they are not fatal.
    async fn handle_response(&self, response: JsonRpcResponse) {
        let mut guard = self.inner.lock().await;
        let Some(inner) = guard.as_mut() else {
            return;
        };
        match inner.pending.remove(&response.id) {
            Some(tx) => {
                let outcome = match response.error {
                    Some(error) => Err(RelayError::Server(error)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                if tx.send(outcome).is_err() {
                    debug!(id = response.id, "Caller for response has gone away");
                }
            }
            None => debug!(id = response.id, "Dropping response with unknown request id"),
        }
    }

    /// Routes an event notification to the handler registered for its
    /// subscription's event kind. Unknown subscription ids are dropped.
    async fn handle_event(&self, event: EventNotification) {
        let subscription_id = event.params.subscription;
        let kind = {
            let guard = self.inner.lock().await;
            let Some(inner) = guard.as_ref() else {
                return;
            };
            match inner
                .subscriptions
                .get(&subscription_id)
            {
                Some(kind) => *kind,
                None => {
                    debug!(%subscription_id, "Dropping event for unknown subscription");
                    return;
                }
            }
        };
        trace!(%kind, "Routing event to handler");
        match self
            .handlers
            .iter()
            .find(|(registered, _)| *registered == kind)
        {
            Some((_, tx)) => match tx.try_send(event.params.data) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(%kind, "Event buffer full, dropping event")
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(%kind, "Event handler has gone away, dropping event")
                }
            },
            None => debug!(%kind, "No handler registered for event kind"),
        }
    }
}

#[async_trait]
impl RelayClient for WsRelayClient {
    #[instrument(skip(self, params))]
    async fn call(&self, method: RelayMethod, params: Vec<Value>) -> Result<Value, RelayError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RelayError::NotConnected);
        }
        let id = self
            .request_counter
            .fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.inner.lock().await;
            let inner = guard
                .as_mut()
                .ok_or(RelayError::NotConnected)?;
            let request = JsonRpcRequest::new(id, method, params);
            let text = serde_json::to_string(&request)
                .map_err(|e| RelayError::Fatal(format!("Failed to serialize request: {e}")))?;
            inner.pending.insert(id, tx);
            if let Err(error) = inner.sink.send(Message::Text(text)).await {
                inner.pending.remove(&id);
                return Err(RelayError::SendFailed(error.to_string()));
            }
        }

        trace!(id, "Waiting for relay response");
        match timeout(self.call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The connection state was dropped while we waited, taking the
            // pending entry with it.
            Ok(Err(_)) => Err(RelayError::ConnectionClosed),
            Err(_) => {
                let mut guard = self.inner.lock().await;
                if let Some(inner) = guard.as_mut() {
                    inner.pending.remove(&id);
                }
                Err(RelayError::RequestTimeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_log::test;
    use tokio::{net::TcpListener, time::timeout};

    use super::*;
    use crate::dto::QuoteRequest;

    #[derive(Clone)]
    enum ExpectedComm {
        Receive(u64, Message),
        Send(Message),
    }

    /// Mock relay accepting one connection per script.
    async fn mock_relay_ws(scripts: Vec<Vec<ExpectedComm>>) -> (SocketAddr, JoinHandle<()>) {
        // zero port here means the OS chooses an open port
        let server = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("localhost bind failed");
        let addr = server.local_addr().unwrap();

        let jh = tokio::spawn(async move {
            for script in scripts {
                let (stream, _) = server
                    .accept()
                    .await
                    .expect("accept failed");
                let mut websocket = tokio_tungstenite::accept_async(stream)
                    .await
                    .unwrap();

                for comm in script {
                    match comm {
                        ExpectedComm::Receive(t, exp) => {
                            let msg = timeout(Duration::from_millis(t), websocket.next())
                                .await
                                .expect("Receive timeout")
                                .expect("Stream exhausted")
                                .expect("Failed to receive message");
                            assert_eq!(msg, exp);
                        }
                        ExpectedComm::Send(data) => {
                            websocket
                                .send(data)
                                .await
                                .expect("Failed to send message");
                        }
                    }
                }
                sleep(Duration::from_millis(100)).await;
                let _ = websocket.close(None).await;
            }
        });
        (addr, jh)
    }

    fn event_text(subscription: &str, data: Value) -> String {
        json!({
            "jsonrpc": "2.0",
            "method": "event",
            "params": {"subscription": subscription, "data": data}
        })
        .to_string()
    }

    fn quote_request_data() -> Value {
        json!({
            "quote_id": "q-1",
            "asset_in": "nep141:usdc.near",
            "asset_out": "nep141:wnear.near",
            "exact_amount_in": "1000000",
            "min_deadline_ms": 30000
        })
    }

    #[test(tokio::test)]
    async fn test_call_resolves_on_matching_response() {
        let (addr, server) = mock_relay_ws(vec![vec![
            ExpectedComm::Receive(
                100,
                Message::Text(
                    r#"{"id":0,"jsonrpc":"2.0","method":"subscribe","params":["quote"]}"#
                        .to_string(),
                ),
            ),
            ExpectedComm::Send(Message::Text(
                r#"{"id":0,"jsonrpc":"2.0","result":"sub-1"}"#.to_string(),
            )),
        ]])
        .await;
        let client = WsRelayClient::new(&format!("ws://{addr}"), None).unwrap();
        let jh = client.connect().await.unwrap();

        let res = client
            .call(RelayMethod::Subscribe, vec![json!("quote")])
            .await
            .unwrap();

        assert_eq!(res, json!("sub-1"));

        client.close().await.unwrap();
        jh.await.unwrap().unwrap();
        server.await.unwrap();
        assert!(!client.is_connected().await);
        assert!(matches!(
            client
                .call(RelayMethod::Subscribe, vec![json!("quote")])
                .await,
            Err(RelayError::NotConnected)
        ));
    }

    #[test(tokio::test)]
    async fn test_unknown_response_id_is_dropped() {
        let (addr, server) = mock_relay_ws(vec![vec![
            ExpectedComm::Receive(
                100,
                Message::Text(
                    r#"{"id":0,"jsonrpc":"2.0","method":"subscribe","params":["quote"]}"#
                        .to_string(),
                ),
            ),
            // Unmatched response must not affect the pending call.
            ExpectedComm::Send(Message::Text(
                r#"{"id":99,"jsonrpc":"2.0","result":"bogus"}"#.to_string(),
            )),
            ExpectedComm::Send(Message::Text(
                r#"{"id":0,"jsonrpc":"2.0","result":"sub-1"}"#.to_string(),
            )),
        ]])
        .await;
        let client = WsRelayClient::new(&format!("ws://{addr}"), None).unwrap();
        client.connect().await.unwrap();

        let res = client
            .call(RelayMethod::Subscribe, vec![json!("quote")])
            .await
            .unwrap();

        assert_eq!(res, json!("sub-1"));
        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_server_error_rejects_call() {
        let (addr, server) = mock_relay_ws(vec![vec![
            ExpectedComm::Receive(
                100,
                Message::Text(
                    r#"{"id":0,"jsonrpc":"2.0","method":"subscribe","params":["quote"]}"#
                        .to_string(),
                ),
            ),
            ExpectedComm::Send(Message::Text(
                r#"{"id":0,"jsonrpc":"2.0","error":{"code":-32000,"message":"nope"}}"#.to_string(),
            )),
        ]])
        .await;
        let client = WsRelayClient::new(&format!("ws://{addr}"), None).unwrap();
        client.connect().await.unwrap();

        let res = client
            .call(RelayMethod::Subscribe, vec![json!("quote")])
            .await;

        assert!(matches!(res, Err(RelayError::Server(_))));
        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_call_times_out_without_response() {
        let (addr, server) = mock_relay_ws(vec![vec![ExpectedComm::Receive(
            100,
            Message::Text(
                r#"{"id":0,"jsonrpc":"2.0","method":"subscribe","params":["quote"]}"#.to_string(),
            ),
        )]])
        .await;
        let client = WsRelayClient::new(&format!("ws://{addr}"), None)
            .unwrap()
            .with_call_timeout(Duration::from_millis(50));
        client.connect().await.unwrap();

        let res = client
            .call(RelayMethod::Subscribe, vec![json!("quote")])
            .await;

        assert!(matches!(res, Err(RelayError::RequestTimeout)));
        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_registered_kind_subscribed_and_event_routed() {
        let (addr, server) = mock_relay_ws(vec![vec![
            ExpectedComm::Receive(
                100,
                Message::Text(
                    r#"{"id":0,"jsonrpc":"2.0","method":"subscribe","params":["quote"]}"#
                        .to_string(),
                ),
            ),
            ExpectedComm::Send(Message::Text(
                r#"{"id":0,"jsonrpc":"2.0","result":"sub-1"}"#.to_string(),
            )),
            // An event for an unknown subscription id is dropped...
            ExpectedComm::Send(Message::Text(event_text("sub-unknown", json!({})))),
            // ...while the known one reaches the registered handler.
            ExpectedComm::Send(Message::Text(event_text("sub-1", quote_request_data()))),
        ]])
        .await;
        let mut client = WsRelayClient::new(&format!("ws://{addr}"), None).unwrap();
        let mut quote_rx = client.register(EventKind::Quote);
        client.connect().await.unwrap();

        let data = timeout(Duration::from_secs(1), quote_rx.recv())
            .await
            .expect("no event routed")
            .expect("channel closed");

        let quote: QuoteRequest = serde_json::from_value(data).unwrap();
        assert_eq!(quote.quote_id, "q-1");
        // Only the known subscription's event came through.
        assert!(quote_rx.try_recv().is_err());

        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_garbage_messages_do_not_close_the_connection() {
        let (addr, server) = mock_relay_ws(vec![vec![
            ExpectedComm::Receive(
                100,
                Message::Text(
                    r#"{"id":0,"jsonrpc":"2.0","method":"subscribe","params":["quote"]}"#
                        .to_string(),
                ),
            ),
            // Invalid JSON and an unrecognized shape must both be dropped
            // while the connection stays up for the real response.
            ExpectedComm::Send(Message::Text("not json at all".to_string())),
            ExpectedComm::Send(Message::Text(
                r#"{"jsonrpc":"2.0","method":"shutdown","params":{}}"#.to_string(),
            )),
            ExpectedComm::Send(Message::Text(
                r#"{"id":0,"jsonrpc":"2.0","result":"sub-1"}"#.to_string(),
            )),
        ]])
        .await;
        let client = WsRelayClient::new(&format!("ws://{addr}"), None).unwrap();
        client.connect().await.unwrap();

        let res = client
            .call(RelayMethod::Subscribe, vec![json!("quote")])
            .await
            .unwrap();

        assert_eq!(res, json!("sub-1"));
        assert!(client.is_connected().await);
        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_failed_send_rejects_call_and_clears_pending() {
        use tokio::io::AsyncWriteExt;
        use tokio_tungstenite::tungstenite::protocol::Role;

        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (_stream, _) = server.accept().await.unwrap();
            sleep(Duration::from_millis(200)).await;
        });

        // A sink whose write half is already shut down makes the transport
        // write fail deterministically.
        let mut tcp = TcpStream::connect(addr).await.unwrap();
        tcp.shutdown().await.unwrap();
        let ws =
            WebSocketStream::from_raw_socket(MaybeTlsStream::Plain(tcp), Role::Client, None).await;
        let (sink, _stream) = ws.split();

        let client = WsRelayClient::new(&format!("ws://{addr}"), None).unwrap();
        {
            let mut guard = client.inner.lock().await;
            *guard = Some(Inner::new(sink));
        }

        let res = client
            .call(RelayMethod::Subscribe, vec![json!("quote")])
            .await;

        assert!(matches!(res, Err(RelayError::SendFailed(_))));
        // The failed call must not leak its pending entry.
        let guard = client.inner.lock().await;
        assert!(guard.as_ref().unwrap().pending.is_empty());
        drop(guard);
        peer.await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_reconnects_and_resubscribes() {
        let (addr, server) = mock_relay_ws(vec![
            vec![
                ExpectedComm::Receive(
                    100,
                    Message::Text(
                        r#"{"id":0,"jsonrpc":"2.0","method":"subscribe","params":["quote"]}"#
                            .to_string(),
                    ),
                ),
                ExpectedComm::Send(Message::Text(
                    r#"{"id":0,"jsonrpc":"2.0","result":"sub-1"}"#.to_string(),
                )),
            ],
            // The server closes the connection; the client must reconnect and
            // subscribe again with a fresh request id.
            vec![
                ExpectedComm::Receive(
                    5000,
                    Message::Text(
                        r#"{"id":1,"jsonrpc":"2.0","method":"subscribe","params":["quote"]}"#
                            .to_string(),
                    ),
                ),
                ExpectedComm::Send(Message::Text(
                    r#"{"id":1,"jsonrpc":"2.0","result":"sub-2"}"#.to_string(),
                )),
                ExpectedComm::Send(Message::Text(event_text("sub-2", quote_request_data()))),
            ],
        ])
        .await;
        let mut client = WsRelayClient::new(&format!("ws://{addr}"), None)
            .unwrap()
            .with_retry_cooldown(Duration::from_millis(50));
        let mut quote_rx = client.register(EventKind::Quote);
        client.connect().await.unwrap();

        // Arrives over the second connection only.
        let data = timeout(Duration::from_secs(5), quote_rx.recv())
            .await
            .expect("no event routed after reconnect")
            .expect("channel closed");

        let quote: QuoteRequest = serde_json::from_value(data).unwrap();
        assert_eq!(quote.quote_id, "q-1");

        client.close().await.unwrap();
        server.await.unwrap();
    }
}
