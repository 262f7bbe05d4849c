//! Session manager: call correlation, registries, and inbound dispatch.
//!
//! The [`SessionClient`] brokers all traffic with the network-service
//! process:
//!
//! 1. Outbound calls get a unique correlation id and go through an unbounded
//!    channel to the transport writer task.
//! 2. Calls that expect a reply park a oneshot sender keyed by that id.
//!    Connect calls park a pending-connect entry instead: their reply carries
//!    a new handle, and the connection must be registered inside dispatch,
//!    before any later frame is processed, or a notification sent right
//!    behind the reply would miss it.
//! 3. The dispatch loop receives inbound frames, correlates replies by id,
//!    and routes notifications to the request or WebSocket registry entry
//!    named by the handle in their payload.
//!
//! The registry lookup is the single choke point guarding against malformed
//! or stale notifications from the remote process: an absent entry degrades
//! to a log line, never a panic, because the remote side's ordering relative
//! to local registration and removal is not race-free under cancellation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex as ParkingLotMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::{mpsc, oneshot};

use requestd_protocol::{
    CacheLevel, CasePolicy, ConnectionId, EnsureConnection, HeaderMap, HeadersAvailable,
    ProxyConfig, RequestId, SetCertificate, StartRequest, StopRequest, WebSocketConnect, methods,
    payloads,
};

use crate::alloc::IdAllocator;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::transport::{Transport, TransportParts, TransportReceiver};
use crate::websocket::WebSocketConnection;

/// Outbound call frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Correlation id, unique per session.
    pub id: u32,
    /// Method name ([`methods`]).
    pub method: String,
    /// Call payload.
    pub params: Value,
}

/// Inbound reply frame, correlated to a [`Call`] by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// Correlation id of the originating call.
    pub id: u32,
    /// Success result (mutually exclusive with error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error result (mutually exclusive with result).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Error details carried by a failed reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error message.
    pub message: String,
    /// Error type name, if the service classified it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Inbound notification frame; the handle lives in `params`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Notification method name ([`methods`]).
    pub method: String,
    /// Notification payload.
    pub params: Value,
}

/// Discriminated union of inbound frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Reply frame (has `id`, no `method`).
    Reply(Reply),
    /// Notification frame (has `method`, no `id`).
    Notification(Notification),
    /// Unknown frame shape (forward-compatible catch-all).
    Unknown(Value),
}

/// Pending reply callbacks keyed by correlation id.
type CallbackMap = Arc<TokioMutex<HashMap<u32, oneshot::Sender<Result<Value>>>>>;

/// Connect calls awaiting their reply, keyed by correlation id. Resolved
/// inside dispatch so the connection is registered before later frames run.
type PendingConnectMap =
    ParkingLotMutex<HashMap<u32, oneshot::Sender<Result<Arc<WebSocketConnection>>>>>;

/// RAII guard ensuring callback cleanup when a call future is dropped.
struct CancelGuard {
    id: u32,
    callbacks: CallbackMap,
    completed: bool,
}

impl CancelGuard {
    fn new(id: u32, callbacks: CallbackMap) -> Self {
        Self {
            id,
            callbacks,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let id = self.id;
        let callbacks = Arc::clone(&self.callbacks);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if callbacks.lock().await.remove(&id).is_some() {
                    tracing::debug!(id, "CancelGuard: removed orphaned callback");
                }
            });
        }
    }
}

/// RAII guard removing an orphaned pending connect when the caller is
/// dropped before the reply arrives.
struct ConnectGuard<'a> {
    id: u32,
    session: &'a SessionClient,
    completed: bool,
}

impl ConnectGuard<'_> {
    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if self.session.pending_connects.lock().remove(&self.id).is_some() {
            tracing::debug!(id = self.id, "ConnectGuard: removed orphaned pending connect");
        }
    }
}

/// Future resolving to a call's reply, with automatic cancellation cleanup.
struct ReplyFuture {
    rx: oneshot::Receiver<Result<Value>>,
    guard: CancelGuard,
}

impl Future for ReplyFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.guard.complete();
                Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Client-side session manager for the network service.
pub struct SessionClient {
    /// Sequential call correlation id counter.
    last_call_id: AtomicU32,
    /// Pending reply callbacks keyed by correlation id.
    callbacks: CallbackMap,
    /// Connect calls whose reply registers a new connection.
    pending_connects: PendingConnectMap,
    /// Channel feeding the transport writer task.
    outbound_tx: mpsc::UnboundedSender<Value>,
    /// Transport sender (taken by `run()` to start the writer task).
    transport_sender: TokioMutex<Option<Box<dyn Transport>>>,
    /// Transport reader (taken by `run()` to start the reader task).
    transport_receiver: TokioMutex<Option<Box<dyn TransportReceiver>>>,
    /// Decoded inbound frames (taken by `run()`).
    message_rx: TokioMutex<Option<mpsc::UnboundedReceiver<Value>>>,
    /// Outbound frame receiver (taken by `run()` to start the writer task).
    outbound_rx: TokioMutex<Option<mpsc::UnboundedReceiver<Value>>>,
    /// Request handle allocator; connection handles come from the service.
    request_ids: IdAllocator,
    /// Registry of outstanding requests.
    requests: ParkingLotMutex<HashMap<RequestId, Arc<Request>>>,
    /// Registry of WebSocket connections.
    websockets: ParkingLotMutex<HashMap<ConnectionId, Arc<WebSocketConnection>>>,
}

impl SessionClient {
    /// Creates a session over the given transport.
    pub fn new(parts: TransportParts) -> Self {
        let TransportParts {
            sender,
            receiver,
            message_rx,
        } = parts;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            last_call_id: AtomicU32::new(0),
            callbacks: Arc::new(TokioMutex::new(HashMap::new())),
            pending_connects: ParkingLotMutex::new(HashMap::new()),
            outbound_tx,
            transport_sender: TokioMutex::new(Some(sender)),
            transport_receiver: TokioMutex::new(Some(receiver)),
            message_rx: TokioMutex::new(Some(message_rx)),
            outbound_rx: TokioMutex::new(Some(outbound_rx)),
            request_ids: IdAllocator::new(),
            requests: ParkingLotMutex::new(HashMap::new()),
            websockets: ParkingLotMutex::new(HashMap::new()),
        }
    }

    /// Runs the dispatch loop until the transport closes.
    pub async fn run(self: &Arc<Self>) {
        let mut transport_receiver = self
            .transport_receiver
            .lock()
            .await
            .take()
            .expect("run() can only be called once - transport receiver already taken");

        let mut transport_sender = self
            .transport_sender
            .lock()
            .await
            .take()
            .expect("run() can only be called once - transport sender already taken");

        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .expect("run() can only be called once - outbound receiver already taken");

        let reader_handle = tokio::spawn(async move {
            if let Err(e) = transport_receiver.run().await {
                tracing::error!("Transport read error: {}", e);
            }
        });

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = transport_sender.send(message).await {
                    tracing::error!("Transport write error: {}", e);
                    break;
                }
            }
        });

        let mut message_rx = self
            .message_rx
            .lock()
            .await
            .take()
            .expect("run() can only be called once - message receiver already taken");

        while let Some(frame) = message_rx.recv().await {
            match serde_json::from_value::<Message>(frame) {
                Ok(message) => {
                    if let Err(e) = self.dispatch(message).await {
                        tracing::error!("Error dispatching message: {}", e);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to parse message: {}", e);
                }
            }
        }

        let _ = reader_handle.await;
        let _ = writer_handle.await;
    }

    /// Queues an outbound call without waiting for a reply.
    fn queue_call(&self, method: &str, params: Value) -> Result<u32> {
        let id = self.last_call_id.fetch_add(1, Ordering::SeqCst);
        let call = Call {
            id,
            method: method.to_string(),
            params,
        };
        let frame = serde_json::to_value(&call)?;
        tracing::debug!(id, method, "Queueing call");
        if self.outbound_tx.send(frame).is_err() {
            tracing::error!("Failed to queue call: outbound channel closed");
            return Err(Error::ChannelClosed);
        }
        Ok(id)
    }

    /// Sends a call and awaits its reply.
    async fn call_with_reply(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.last_call_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.callbacks.lock().await.insert(id, tx);
        let guard = CancelGuard::new(id, Arc::clone(&self.callbacks));

        let call = Call {
            id,
            method: method.to_string(),
            params,
        };
        let frame = serde_json::to_value(&call)?;
        tracing::debug!(id, method, "Sending call, awaiting reply");

        if self.outbound_tx.send(frame).is_err() {
            tracing::error!("Failed to queue call: outbound channel closed");
            return Err(Error::ChannelClosed);
        }

        ReplyFuture { rx, guard }.await
    }

    /// Asks the service to warm its connection cache for `url`.
    pub fn ensure_connection(&self, url: &str, cache_level: CacheLevel) -> Result<()> {
        let params = serde_json::to_value(EnsureConnection {
            url: url.to_string(),
            cache_level,
        })?;
        self.queue_call(methods::ENSURE_CONNECTION, params)?;
        Ok(())
    }

    /// Starts an HTTP-like exchange.
    ///
    /// The wire payload (a deep copy of `headers` and `body`) is fully built
    /// before the transport is touched, so the caller's buffers may be freed
    /// as soon as this returns and a failure here has no transport side
    /// effect. The returned [`Request`] is registered before the call is
    /// queued, so notifications racing ahead of this return still resolve.
    pub fn start_request<C: CasePolicy>(
        self: &Arc<Self>,
        method: &str,
        url: &str,
        headers: &HeaderMap<C>,
        body: &[u8],
        proxy: ProxyConfig,
    ) -> Result<Arc<Request>> {
        let id = RequestId(self.request_ids.next());
        let params = serde_json::to_value(StartRequest {
            id,
            method: method.to_string(),
            url: url.to_string(),
            headers: headers.clone(),
            body: body.to_vec(),
            proxy,
        })?;

        let request = Request::new(id, Arc::downgrade(self));
        self.requests.lock().insert(id, Arc::clone(&request));

        if let Err(e) = self.queue_call(methods::START_REQUEST, params) {
            self.requests.lock().remove(&id);
            return Err(e);
        }
        Ok(request)
    }

    /// Requests best-effort cancellation of `request`.
    ///
    /// Returns `Ok(false)` without contacting the service when the handle is
    /// not registered (already finished). The registry entry is only removed
    /// by the finish notification, never by stopping, so a stopped request
    /// may still observe a later finish with `success == false`.
    pub async fn stop_request(&self, request: &Request) -> Result<bool> {
        if !self.requests.lock().contains_key(&request.id()) {
            return Ok(false);
        }
        let params = serde_json::to_value(StopRequest { id: request.id() })?;
        let reply = self.call_with_reply(methods::STOP_REQUEST, params).await?;
        serde_json::from_value(reply).map_err(Into::into)
    }

    /// Supplies a client certificate/key pair for `request`.
    ///
    /// Same registration guard as [`stop_request`](Self::stop_request).
    pub async fn set_certificate(
        &self,
        request: &Request,
        certificate: &str,
        key: &str,
    ) -> Result<bool> {
        if !self.requests.lock().contains_key(&request.id()) {
            return Ok(false);
        }
        let params = serde_json::to_value(SetCertificate {
            id: request.id(),
            certificate: certificate.to_string(),
            key: key.to_string(),
        })?;
        let reply = self.call_with_reply(methods::SET_CERTIFICATE, params).await?;
        serde_json::from_value(reply).map_err(Into::into)
    }

    /// Opens a WebSocket session.
    ///
    /// The connection id is assigned by the service and returned in the
    /// call's reply; a negative id is a refusal and registers nothing.
    ///
    /// The dispatch loop registers the connection the moment the reply is
    /// processed, not when this future resumes, so notifications the service
    /// sends immediately after its reply already find the registry entry.
    pub async fn websocket_connect<C: CasePolicy>(
        self: &Arc<Self>,
        url: &str,
        origin: &str,
        protocols: &[String],
        extensions: &[String],
        headers: &HeaderMap<C>,
    ) -> Result<Arc<WebSocketConnection>> {
        let params = serde_json::to_value(WebSocketConnect {
            url: url.to_string(),
            origin: origin.to_string(),
            protocols: protocols.to_vec(),
            extensions: extensions.to_vec(),
            headers: headers.clone(),
        })?;

        let id = self.last_call_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_connects.lock().insert(id, tx);
        let mut guard = ConnectGuard {
            id,
            session: self.as_ref(),
            completed: false,
        };

        let call = Call {
            id,
            method: methods::WEBSOCKET_CONNECT.to_string(),
            params,
        };
        let frame = serde_json::to_value(&call)?;
        tracing::debug!(id, "Sending websocket connect, awaiting reply");

        if self.outbound_tx.send(frame).is_err() {
            tracing::error!("Failed to queue call: outbound channel closed");
            return Err(Error::ChannelClosed);
        }

        let result = rx.await.map_err(|_| Error::ChannelClosed)?;
        guard.complete();
        result
    }

    /// Turns a connect reply into a registered connection (or an error).
    ///
    /// Runs on the dispatch side, synchronously, so the registry entry
    /// exists before any frame behind the reply is processed.
    fn resolve_connect(self: &Arc<Self>, reply: Reply) -> Result<Arc<WebSocketConnection>> {
        if let Some(error) = reply.error {
            return Err(parse_reply_error(error));
        }
        let id: ConnectionId = serde_json::from_value(reply.result.unwrap_or(Value::Null))?;
        if id.0 < 0 {
            return Err(Error::ConnectRefused(id.0));
        }

        let connection = WebSocketConnection::new(id, Arc::downgrade(self));
        self.websockets.lock().insert(id, Arc::clone(&connection));
        Ok(connection)
    }

    /// Looks up a registered request by handle.
    pub fn request(&self, id: RequestId) -> Option<Arc<Request>> {
        self.requests.lock().get(&id).cloned()
    }

    /// Looks up a registered WebSocket connection by handle.
    pub fn websocket(&self, id: ConnectionId) -> Option<Arc<WebSocketConnection>> {
        self.websockets.lock().get(&id).cloned()
    }

    /// Dispatches one inbound message.
    async fn dispatch(self: &Arc<Self>, message: Message) -> Result<()> {
        match message {
            Message::Reply(reply) => {
                let pending_connect = self.pending_connects.lock().remove(&reply.id);
                if let Some(pending) = pending_connect {
                    let _ = pending.send(self.resolve_connect(reply));
                    return Ok(());
                }

                let callback = self
                    .callbacks
                    .lock()
                    .await
                    .remove(&reply.id)
                    .ok_or_else(|| {
                        Error::ProtocolError(format!(
                            "Cannot find call to respond: id={}",
                            reply.id
                        ))
                    })?;

                let result = if let Some(error) = reply.error {
                    Err(parse_reply_error(error))
                } else {
                    Ok(reply.result.unwrap_or(Value::Null))
                };

                let _ = callback.send(result);
                Ok(())
            }
            Message::Notification(notification) => self.dispatch_notification(notification),
            Message::Unknown(value) => {
                tracing::debug!(
                    "Unknown message shape (forward-compatible, ignored): {}",
                    serde_json::to_string(&value)
                        .unwrap_or_else(|_| "<serialization failed>".to_string())
                );
                Ok(())
            }
        }
    }

    /// Routes a notification to its registry entry.
    ///
    /// Every arm tolerates an absent entry: `request_started` and
    /// `headers_available` log a warning, the rest drop at debug level.
    /// `request_finished` is the only notification that mutates registry
    /// membership.
    fn dispatch_notification(&self, notification: Notification) -> Result<()> {
        match notification.method.as_str() {
            methods::REQUEST_STARTED => {
                let p: payloads::RequestStarted = serde_json::from_value(notification.params)?;
                // Take ownership immediately so the descriptor cannot leak,
                // even when the handle is unknown (it is closed on drop).
                // SAFETY: the IPC layer transferred this descriptor to us;
                // it is open, owned by this process, and owned nowhere else.
                let fd = unsafe { p.fd.into_owned() };
                match self.request(p.id) {
                    Some(request) => request.did_start(fd),
                    None => tracing::warn!(id = %p.id, "Response for unknown request, dropped"),
                }
            }
            methods::REQUEST_PROGRESS => {
                let p: payloads::RequestProgress = serde_json::from_value(notification.params)?;
                match self.request(p.id) {
                    Some(request) => request.did_progress(p.total_size, p.downloaded_size),
                    None => tracing::debug!(id = %p.id, "Progress for unknown request, ignored"),
                }
            }
            methods::HEADERS_AVAILABLE => {
                let p: payloads::HeadersAvailable = serde_json::from_value(notification.params)?;
                let HeadersAvailable {
                    id,
                    headers,
                    status_code,
                } = p;
                match self.request(id) {
                    Some(request) => request.did_receive_headers(headers, status_code),
                    None => tracing::warn!(id = %id, "Headers for unknown request, dropped"),
                }
            }
            methods::CERTIFICATE_REQUESTED => {
                let p: payloads::CertificateRequested = serde_json::from_value(notification.params)?;
                match self.request(p.id) {
                    Some(request) => request.did_request_certificates(),
                    None => {
                        tracing::debug!(id = %p.id, "Certificate request for unknown request, ignored");
                    }
                }
            }
            methods::REQUEST_FINISHED => {
                let p: payloads::RequestFinished = serde_json::from_value(notification.params)?;
                // The one notification that retires a handle.
                let removed = self.requests.lock().remove(&p.id);
                match removed {
                    Some(request) => request.did_finish(p.success, p.total_size),
                    None => tracing::debug!(id = %p.id, "Finish for unknown request, ignored"),
                }
            }
            methods::WEBSOCKET_CONNECTED => {
                let p: payloads::WebSocketConnected = serde_json::from_value(notification.params)?;
                match self.websocket(p.id) {
                    Some(connection) => connection.did_open(),
                    None => tracing::debug!(id = %p.id, "Connected for unknown websocket, ignored"),
                }
            }
            methods::WEBSOCKET_RECEIVED => {
                let p: payloads::WebSocketReceived = serde_json::from_value(notification.params)?;
                match self.websocket(p.id) {
                    Some(connection) => connection.did_receive(p.is_text, p.data),
                    None => tracing::debug!(id = %p.id, "Message for unknown websocket, ignored"),
                }
            }
            methods::WEBSOCKET_ERRORED => {
                let p: payloads::WebSocketErrored = serde_json::from_value(notification.params)?;
                match self.websocket(p.id) {
                    Some(connection) => connection.did_error(p.code),
                    None => tracing::debug!(id = %p.id, "Error for unknown websocket, ignored"),
                }
            }
            methods::WEBSOCKET_CLOSED => {
                let p: payloads::WebSocketClosed = serde_json::from_value(notification.params)?;
                match self.websocket(p.id) {
                    Some(connection) => connection.did_close(p.code, p.reason, p.clean),
                    None => tracing::debug!(id = %p.id, "Close for unknown websocket, ignored"),
                }
            }
            methods::WEBSOCKET_CERTIFICATE_REQUESTED => {
                let p: payloads::WebSocketCertificateRequested =
                    serde_json::from_value(notification.params)?;
                match self.websocket(p.id) {
                    Some(connection) => connection.did_request_certificates(),
                    None => {
                        tracing::debug!(id = %p.id, "Certificate request for unknown websocket, ignored");
                    }
                }
            }
            other => {
                tracing::debug!(method = other, "Unknown notification method, ignored");
            }
        }
        Ok(())
    }
}

/// Converts a reply's [`ErrorPayload`] into [`Error::Remote`].
fn parse_reply_error(error: ErrorPayload) -> Error {
    Error::Remote {
        name: error.name.unwrap_or_else(|| "Error".to_string()),
        message: error.message,
    }
}
