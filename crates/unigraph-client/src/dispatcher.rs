//! Query dispatcher: correlation of one-shot requests with their responses.
//!
//! Every one-shot request gets a fresh [`RequestId`] and a pending entry
//! holding a oneshot sender. The first response with that id resolves the
//! entry and removes it; later responses with the same id are dropped.
//! Requests wait for the link to be ready (connected and resubscribed)
//! before they are queued, and fail with `RequestTimeout` past the
//! configured bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use unigraph_core::protocol::{ClientMessage, RemoteError, RemoteErrorKind, RequestEvent};
use unigraph_core::types::RequestId;

use crate::client::ClientError;

type Reply = Result<serde_json::Value, ClientError>;

/// Readiness of the channel for one-shot traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Ready,
    Disconnected,
    /// Reconnected; stale live queries are being re-issued.
    Resubscribing,
    /// The transport's event stream ended.
    Closed,
}

/// A frame waiting for the writer.
///
/// Subscribe frames carry the epoch of the slot they were queued for, so a
/// late send outcome from an earlier epoch can be told apart.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub message: ClientMessage,
    pub epoch: u64,
}

pub(crate) struct Dispatcher {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    link: watch::Sender<LinkState>,
    timeout: Duration,
}

/// Removes the pending entry if the request future is dropped before a
/// response arrives (timeout or caller cancellation).
struct PendingGuard<'a> {
    dispatcher: &'a Dispatcher,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.take_pending(self.id);
    }
}

impl Dispatcher {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<Outbound>, timeout: Duration) -> Self {
        let (link, _) = watch::channel(LinkState::Ready);
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            link,
            timeout,
        }
    }

    /// Queue a frame for the writer.
    pub(crate) fn enqueue(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.enqueue_tagged(message, 0)
    }

    /// Queue a subscribe frame issued under `epoch`.
    pub(crate) fn enqueue_tagged(&self, message: ClientMessage, epoch: u64) -> Result<(), ClientError> {
        self.outbound
            .send(Outbound { message, epoch })
            .map_err(|_| ClientError::Closed)
    }

    pub(crate) fn link(&self) -> LinkState {
        *self.link.borrow()
    }

    pub(crate) fn set_link(&self, state: LinkState) {
        self.link.send_replace(state);
    }

    /// Send a one-shot request and wait for its response.
    pub(crate) async fn request(&self, event: RequestEvent) -> Reply {
        let name = event.name();
        match tokio::time::timeout(self.timeout, self.request_inner(event)).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::warn!(event = name, timeout_ms = self.timeout.as_millis() as u64, "Request timed out");
                Err(ClientError::RequestTimeout {
                    event: name,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn request_inner(&self, event: RequestEvent) -> Reply {
        self.wait_ready().await?;

        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        let _guard = PendingGuard {
            dispatcher: self,
            id,
        };

        tracing::debug!(request_id = %id, event = event.name(), "Sending request");
        self.enqueue(ClientMessage::Request { id, event })?;

        rx.await.map_err(|_| ClientError::Closed)?
    }

    async fn wait_ready(&self) -> Result<(), ClientError> {
        let mut rx = self.link.subscribe();
        let state = *rx
            .wait_for(|s| matches!(s, LinkState::Ready | LinkState::Closed))
            .await
            .map_err(|_| ClientError::Closed)?;
        match state {
            LinkState::Closed => Err(ClientError::Closed),
            _ => Ok(()),
        }
    }

    fn take_pending(&self, id: RequestId) -> Option<oneshot::Sender<Reply>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    /// Route a response to its waiting caller.
    pub(crate) fn resolve(
        &self,
        id: RequestId,
        success: bool,
        result: Option<serde_json::Value>,
        error: Option<RemoteError>,
    ) {
        let Some(tx) = self.take_pending(id) else {
            tracing::debug!(request_id = %id, "Response for unknown or settled request");
            return;
        };
        let reply = if success {
            Ok(result.unwrap_or(serde_json::Value::Null))
        } else {
            Err(match error {
                Some(RemoteError {
                    kind: RemoteErrorKind::UnknownEntity,
                    message,
                }) => ClientError::UnknownEntity(message),
                Some(RemoteError { kind, message }) => ClientError::Remote { kind, message },
                None => ClientError::Remote {
                    kind: RemoteErrorKind::Internal,
                    message: "request failed without details".into(),
                },
            })
        };
        // The caller may have given up already.
        let _ = tx.send(reply);
    }

    /// Fail one pending request, e.g. when its frame could not be sent.
    pub(crate) fn fail(&self, id: RequestId, error: ClientError) {
        if let Some(tx) = self.take_pending(id) {
            let _ = tx.send(Err(error));
        }
    }

    /// Fail every pending request.
    pub(crate) fn fail_all(&self, make_error: impl Fn() -> ClientError) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_error()));
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn dispatcher(timeout: Duration) -> (Arc<Dispatcher>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Dispatcher::new(tx, timeout)), rx)
    }

    fn request_id(queued: &Outbound) -> RequestId {
        match &queued.message {
            ClientMessage::Request { id, .. } => *id,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_resolves_and_clears_pending() {
        let (d, mut out) = dispatcher(Duration::from_secs(5));
        let task = {
            let d = d.clone();
            tokio::spawn(async move {
                d.request(RequestEvent::Query { query: "q".into() }).await
            })
        };

        let id = request_id(&out.recv().await.unwrap());
        d.resolve(id, true, Some(json!([1])), None);
        assert_eq!(task.await.unwrap().unwrap(), json!([1]));
        assert_eq!(d.pending_len(), 0);

        // Re-delivery of the same id is ignored.
        d.resolve(id, true, Some(json!([2])), None);
    }

    #[tokio::test]
    async fn unknown_entity_maps_to_its_own_error() {
        let (d, mut out) = dispatcher(Duration::from_secs(5));
        let task = {
            let d = d.clone();
            tokio::spawn(async move {
                d.request(RequestEvent::Query { query: "q".into() }).await
            })
        };
        let id = request_id(&out.recv().await.unwrap());
        d.resolve(
            id,
            false,
            None,
            Some(RemoteError {
                kind: RemoteErrorKind::UnknownEntity,
                message: "0x99".into(),
            }),
        );
        assert!(matches!(task.await.unwrap(), Err(ClientError::UnknownEntity(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (d, _out) = dispatcher(Duration::from_millis(100));
        let err = d
            .request(RequestEvent::Query { query: "q".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RequestTimeout { event: "query", .. }));
        assert_eq!(d.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_wait_for_ready_link() {
        let (d, mut out) = dispatcher(Duration::from_secs(5));
        d.set_link(LinkState::Disconnected);
        let task = {
            let d = d.clone();
            tokio::spawn(async move {
                d.request(RequestEvent::Query { query: "q".into() }).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(out.try_recv().is_err());

        d.set_link(LinkState::Ready);
        let id = request_id(&out.recv().await.unwrap());
        d.resolve(id, true, None, None);
        assert_eq!(task.await.unwrap().unwrap(), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn closed_link_fails_fast() {
        let (d, _out) = dispatcher(Duration::from_secs(5));
        d.set_link(LinkState::Closed);
        let err = d
            .request(RequestEvent::Query { query: "q".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Closed));
    }
}
