//! WebSocket connection entity.
//!
//! State machine: `Connecting -> Open -> (Closed | Errored)`, with
//! `Connecting -> Errored` for connect refusals. `Closed` and `Errored` are
//! terminal - notifications arriving afterwards come from an untrusted remote
//! process and are dropped defensively, never asserted on.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use requestd_protocol::ConnectionId;

use crate::error::{Error, Result};
use crate::events::{EventBus, EventStream, EventWaiter};
use crate::session::SessionClient;

/// Lifecycle state of a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connect call issued, handshake not yet confirmed.
    Connecting,
    /// Handshake completed; messages flow.
    Open,
    /// Closed by either side; terminal.
    Closed,
    /// Failed; terminal.
    Errored,
}

impl ConnectionState {
    /// Returns true for states no notification may leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

/// Notification delivered to the connection's owner.
#[derive(Debug, Clone)]
pub enum WebSocketEvent {
    /// The handshake completed.
    Opened,
    /// A message arrived, in transport delivery order.
    Message {
        /// Text frame (true) or binary frame (false).
        is_text: bool,
        /// Message payload.
        data: Vec<u8>,
    },
    /// The connection failed.
    Errored {
        /// Error code reported by the service.
        code: i32,
    },
    /// The connection closed.
    Closed {
        /// Close status code.
        code: u16,
        /// Close reason string.
        reason: String,
        /// Whether the close handshake completed cleanly.
        clean: bool,
    },
    /// The peer asked for a client certificate.
    CertificateRequested,
}

/// One WebSocket session brokered through the session manager.
pub struct WebSocketConnection {
    id: ConnectionId,
    session: Weak<SessionClient>,
    state: Mutex<ConnectionState>,
    events: EventBus<WebSocketEvent>,
}

impl WebSocketConnection {
    pub(crate) fn new(id: ConnectionId, session: Weak<SessionClient>) -> Arc<Self> {
        Arc::new(Self {
            id,
            session,
            state: Mutex::new(ConnectionState::Connecting),
            events: EventBus::default(),
        })
    }

    /// The connection's handle.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The owning session, if it is still alive.
    pub fn session(&self) -> Option<Arc<SessionClient>> {
        self.session.upgrade()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Subscribes to this connection's notifications.
    pub fn subscribe(&self) -> EventStream<WebSocketEvent> {
        EventStream::new(self.events.subscribe())
    }

    /// Waits for the handshake to complete.
    pub async fn wait_for_open(&self, timeout: Duration) -> Result<()> {
        let rx = self
            .events
            .register_waiter(|e| matches!(e, WebSocketEvent::Opened));
        match self.state() {
            ConnectionState::Open => return Ok(()),
            ConnectionState::Connecting => {}
            state => {
                return Err(Error::ProtocolError(format!(
                    "WebSocket will never open from state {state:?}"
                )));
            }
        }
        EventWaiter::new(rx, timeout).wait().await.map(|_| ())
    }

    pub(crate) fn did_open(&self) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Connecting {
                tracing::debug!(id = %self.id, state = ?*state, "Connected notification ignored");
                return;
            }
            *state = ConnectionState::Open;
        }
        self.events.emit(WebSocketEvent::Opened);
    }

    pub(crate) fn did_receive(&self, is_text: bool, data: Vec<u8>) {
        if self.state().is_terminal() {
            tracing::debug!(id = %self.id, "Message for terminal connection, ignored");
            return;
        }
        self.events.emit(WebSocketEvent::Message { is_text, data });
    }

    pub(crate) fn did_error(&self, code: i32) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                tracing::debug!(id = %self.id, "Error for terminal connection, ignored");
                return;
            }
            *state = ConnectionState::Errored;
        }
        self.events.emit(WebSocketEvent::Errored { code });
    }

    pub(crate) fn did_close(&self, code: u16, reason: String, clean: bool) {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                tracing::debug!(id = %self.id, "Close for terminal connection, ignored");
                return;
            }
            *state = ConnectionState::Closed;
        }
        self.events.emit(WebSocketEvent::Closed {
            code,
            reason,
            clean,
        });
    }

    pub(crate) fn did_request_certificates(&self) {
        if self.state().is_terminal() {
            tracing::debug!(id = %self.id, "Certificate request for terminal connection, ignored");
            return;
        }
        self.events.emit(WebSocketEvent::CertificateRequested);
    }
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection() -> Arc<WebSocketConnection> {
        WebSocketConnection::new(ConnectionId(3), Weak::new())
    }

    #[tokio::test]
    async fn opens_from_connecting() {
        let connection = test_connection();
        assert_eq!(connection.state(), ConnectionState::Connecting);

        connection.did_open();
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn connecting_may_error_without_opening() {
        let connection = test_connection();
        connection.did_error(-1);
        assert_eq!(connection.state(), ConnectionState::Errored);

        // Terminal: a late handshake confirmation must not reopen it.
        connection.did_open();
        assert_eq!(connection.state(), ConnectionState::Errored);
    }

    #[tokio::test]
    async fn closed_is_terminal() {
        let connection = test_connection();
        connection.did_open();
        connection.did_close(1000, "bye".to_string(), true);
        assert_eq!(connection.state(), ConnectionState::Closed);

        let mut events = connection.subscribe();
        connection.did_receive(true, b"late".to_vec());
        connection.did_error(5);
        connection.did_close(1001, "again".to_string(), false);
        connection.did_request_certificates();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn messages_delivered_in_order() {
        let connection = test_connection();
        let mut events = connection.subscribe();
        connection.did_open();

        connection.did_receive(true, b"first".to_vec());
        connection.did_receive(false, vec![1, 2, 3]);

        assert!(matches!(events.recv().await, Some(WebSocketEvent::Opened)));
        match events.recv().await {
            Some(WebSocketEvent::Message { is_text, data }) => {
                assert!(is_text);
                assert_eq!(data, b"first");
            }
            other => panic!("Expected text message, got {other:?}"),
        }
        match events.recv().await {
            Some(WebSocketEvent::Message { is_text, data }) => {
                assert!(!is_text);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("Expected binary message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_open_fails_on_terminal_state() {
        let connection = test_connection();
        connection.did_error(2);

        let result = connection.wait_for_open(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::ProtocolError(_))));
    }

    #[tokio::test]
    async fn wait_for_open_sees_past_open() {
        let connection = test_connection();
        connection.did_open();
        connection
            .wait_for_open(Duration::from_millis(10))
            .await
            .unwrap();
    }
}
