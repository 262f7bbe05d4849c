//! Request entity: one outstanding or completed exchange with the service.
//!
//! A `Request` is created and registered by [`SessionClient::start_request`]
//! before the service has even seen the call, so notifications racing ahead
//! of the local return path still resolve. It stays alive as long as the
//! application holds its `Arc`; finishing only flags terminal state.
//!
//! All mutation happens through `pub(crate)` `did_*` methods reachable only
//! from the session's dispatch - the owning application observes state
//! through accessors and the event stream.
//!
//! [`SessionClient::start_request`]: crate::session::SessionClient::start_request

use std::os::fd::OwnedFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use requestd_protocol::{HeaderMap, RequestId};

use crate::error::{Error, Result};
use crate::events::{EventBus, EventStream, EventWaiter};
use crate::session::SessionClient;

/// Download progress snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Total size if the service knows it.
    pub total_size: Option<u64>,
    /// Bytes downloaded so far; non-decreasing.
    pub downloaded_size: u64,
}

/// Terminal result of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Whether the exchange succeeded.
    pub success: bool,
    /// Total bytes transferred.
    pub total_size: u64,
}

/// Notification delivered to the request's owner.
#[derive(Debug, Clone)]
pub enum RequestEvent {
    /// The response descriptor is attached and can be taken.
    Started,
    /// Response headers (and optional status) are available.
    HeadersAvailable,
    /// Progress snapshot updated.
    Progress(Progress),
    /// The peer asked for a client certificate.
    CertificateRequested,
    /// The request reached its terminal state.
    Finished(RequestOutcome),
}

#[derive(Default)]
struct RequestState {
    response_fd: Option<OwnedFd>,
    headers: Option<HeaderMap>,
    status_code: Option<u32>,
    progress: Progress,
    outcome: Option<RequestOutcome>,
}

/// One HTTP-like exchange brokered through the session.
pub struct Request {
    id: RequestId,
    session: Weak<SessionClient>,
    state: Mutex<RequestState>,
    events: EventBus<RequestEvent>,
}

impl Request {
    pub(crate) fn new(id: RequestId, session: Weak<SessionClient>) -> Arc<Self> {
        Arc::new(Self {
            id,
            session,
            state: Mutex::new(RequestState::default()),
            events: EventBus::default(),
        })
    }

    /// The request's handle.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The owning session, if it is still alive.
    pub fn session(&self) -> Option<Arc<SessionClient>> {
        self.session.upgrade()
    }

    /// Takes ownership of the response descriptor.
    ///
    /// Returns `None` until the service delivers it, and on every call after
    /// the first successful take - the descriptor is released exactly once.
    pub fn take_response_fd(&self) -> Option<OwnedFd> {
        self.state.lock().response_fd.take()
    }

    /// Snapshot of the response headers, once available.
    pub fn headers(&self) -> Option<HeaderMap> {
        self.state.lock().headers.clone()
    }

    /// HTTP-like status code, if the service reported one.
    pub fn status_code(&self) -> Option<u32> {
        self.state.lock().status_code
    }

    /// Most recent progress snapshot.
    pub fn progress(&self) -> Progress {
        self.state.lock().progress
    }

    /// Terminal outcome, once finished.
    pub fn outcome(&self) -> Option<RequestOutcome> {
        self.state.lock().outcome
    }

    /// Returns true once the finish notification has been processed.
    pub fn is_finished(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// Subscribes to this request's notifications.
    pub fn subscribe(&self) -> EventStream<RequestEvent> {
        EventStream::new(self.events.subscribe())
    }

    /// Waits for the request to finish.
    pub async fn wait_for_finish(&self, timeout: Duration) -> Result<RequestOutcome> {
        let rx = self
            .events
            .register_waiter(|e| matches!(e, RequestEvent::Finished(_)));
        // Check after registering so a finish racing in between is not lost.
        if let Some(outcome) = self.outcome() {
            return Ok(outcome);
        }
        match EventWaiter::new(rx, timeout).wait().await? {
            RequestEvent::Finished(outcome) => Ok(outcome),
            other => Err(Error::ProtocolError(format!(
                "Unexpected event while waiting for finish: {other:?}"
            ))),
        }
    }

    /// Asks the service to cancel this request; best-effort.
    ///
    /// Returns `Ok(false)` without contacting the service when the handle is
    /// no longer registered (or the session is gone). A stopped request may
    /// still receive a later finish notification with `success == false`.
    pub async fn stop(&self) -> Result<bool> {
        match self.session.upgrade() {
            Some(session) => session.stop_request(self).await,
            None => Ok(false),
        }
    }

    /// Supplies a client certificate/key pair for this request.
    pub async fn set_certificate(&self, certificate: &str, key: &str) -> Result<bool> {
        match self.session.upgrade() {
            Some(session) => session.set_certificate(self, certificate, key).await,
            None => Ok(false),
        }
    }

    pub(crate) fn did_start(&self, fd: OwnedFd) {
        {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                tracing::debug!(id = %self.id, "Started notification after finish, ignored");
                return;
            }
            if state.response_fd.is_some() {
                tracing::warn!(id = %self.id, "Duplicate response descriptor, ignored");
                return;
            }
            state.response_fd = Some(fd);
        }
        self.events.emit(RequestEvent::Started);
    }

    pub(crate) fn did_progress(&self, total_size: Option<u64>, downloaded_size: u64) {
        let snapshot = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                tracing::debug!(id = %self.id, "Progress after finish, ignored");
                return;
            }
            if downloaded_size < state.progress.downloaded_size {
                tracing::debug!(
                    id = %self.id,
                    downloaded_size,
                    last = state.progress.downloaded_size,
                    "Regressing progress notification, ignored"
                );
                return;
            }
            state.progress = Progress {
                total_size,
                downloaded_size,
            };
            state.progress
        };
        self.events.emit(RequestEvent::Progress(snapshot));
    }

    pub(crate) fn did_receive_headers(&self, headers: HeaderMap, status_code: Option<u32>) {
        {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                tracing::debug!(id = %self.id, "Headers after finish, ignored");
                return;
            }
            if state.headers.is_some() {
                tracing::warn!(id = %self.id, "Duplicate headers notification, ignored");
                return;
            }
            state.headers = Some(headers);
            state.status_code = status_code;
        }
        self.events.emit(RequestEvent::HeadersAvailable);
    }

    pub(crate) fn did_request_certificates(&self) {
        if self.state.lock().outcome.is_some() {
            tracing::debug!(id = %self.id, "Certificate request after finish, ignored");
            return;
        }
        self.events.emit(RequestEvent::CertificateRequested);
    }

    pub(crate) fn did_finish(&self, success: bool, total_size: u64) {
        let outcome = RequestOutcome {
            success,
            total_size,
        };
        {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                tracing::debug!(id = %self.id, "Duplicate finish notification, ignored");
                return;
            }
            state.outcome = Some(outcome);
        }
        self.events.emit(RequestEvent::Finished(outcome));
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("has_response_fd", &state.response_fd.is_some())
            .field("progress", &state.progress)
            .field("outcome", &state.outcome)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::os::fd::IntoRawFd as _;
    use std::os::fd::{FromRawFd as _, OwnedFd};

    use super::*;

    fn test_request() -> Arc<Request> {
        Request::new(RequestId(0), Weak::new())
    }

    fn test_fd() -> OwnedFd {
        let raw = File::open("/dev/null").unwrap().into_raw_fd();
        unsafe { OwnedFd::from_raw_fd(raw) }
    }

    #[tokio::test]
    async fn response_fd_taken_exactly_once() {
        let request = test_request();
        assert!(request.take_response_fd().is_none());

        request.did_start(test_fd());
        assert!(request.take_response_fd().is_some());
        assert!(request.take_response_fd().is_none());
    }

    #[tokio::test]
    async fn duplicate_start_keeps_first_descriptor() {
        let request = test_request();
        request.did_start(test_fd());
        request.did_start(test_fd());

        let mut events = request.subscribe();
        assert!(request.take_response_fd().is_some());
        assert!(request.take_response_fd().is_none());
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let request = test_request();
        request.did_progress(Some(100), 10);
        request.did_progress(Some(100), 50);
        // Stale delivery must not roll the snapshot back.
        request.did_progress(Some(100), 20);

        assert_eq!(request.progress().downloaded_size, 50);
    }

    #[tokio::test]
    async fn headers_arrive_at_most_once() {
        let request = test_request();
        let first: HeaderMap = [("content-type", "text/html")].into_iter().collect();
        let second: HeaderMap = [("content-type", "text/plain")].into_iter().collect();

        request.did_receive_headers(first, Some(200));
        request.did_receive_headers(second, Some(500));

        assert_eq!(request.headers().unwrap().get("content-type"), Some("text/html"));
        assert_eq!(request.status_code(), Some(200));
    }

    #[tokio::test]
    async fn finish_is_terminal() {
        let request = test_request();
        let mut events = request.subscribe();

        request.did_finish(true, 1024);
        assert_eq!(
            request.outcome(),
            Some(RequestOutcome {
                success: true,
                total_size: 1024
            })
        );

        // Everything after finish is ignored.
        request.did_progress(None, 4096);
        request.did_finish(false, 0);
        request.did_request_certificates();

        assert_eq!(request.progress().downloaded_size, 0);
        assert!(request.outcome().unwrap().success);

        assert!(matches!(
            events.try_recv(),
            Some(RequestEvent::Finished(_))
        ));
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn finish_without_headers_is_accepted() {
        let request = test_request();
        request.did_finish(true, 0);
        assert!(request.headers().is_none());
        assert!(request.is_finished());
    }

    #[tokio::test]
    async fn wait_for_finish_sees_past_completion() {
        let request = test_request();
        request.did_finish(false, 10);

        let outcome = request
            .wait_for_finish(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.total_size, 10);
    }

    #[tokio::test]
    async fn stop_without_session_is_a_no_op() {
        let request = test_request();
        assert!(!request.stop().await.unwrap());
        assert!(!request.set_certificate("cert", "key").await.unwrap());
    }
}
