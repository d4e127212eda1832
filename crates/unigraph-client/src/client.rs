//! Client context: the one object every component receives by reference.
//!
//! Holds the schema catalog, the dispatcher, the subscription registry and
//! the identifier map, plus the two background tasks that drive the
//! transport: a writer that sends queued frames in order, and an event
//! loop that routes inbound frames and reacts to connection changes.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use unigraph_core::codec::CodecError;
use unigraph_core::protocol::{ClientMessage, RemoteErrorKind, ServerMessage};
use unigraph_core::schema::CatalogError;
use unigraph_core::{ClientConfig, SchemaCatalog, SubscriptionId};

use crate::dispatcher::{Dispatcher, LinkState, Outbound};
use crate::mutations::IdentifierMap;
use crate::subscriptions::{DeliveryError, SubscriptionRegistry, SubscriptionState};
use crate::transport::{Transport, TransportError, TransportEvent};

/// Errors surfaced to callers of one-shot operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Malformed entity: {0}")]
    MalformedEntity(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Request {event} timed out after {timeout_ms}ms")]
    RequestTimeout {
        event: &'static str,
        timeout_ms: u64,
    },

    #[error("Store rejected request ({kind:?}): {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("Client is disconnected")]
    Disconnected,

    #[error("Client is closed")]
    Closed,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(CodecError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl From<CodecError> for ClientError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::MalformedEntity { .. } => ClientError::MalformedEntity(e.to_string()),
            other => ClientError::Codec(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub(crate) struct ClientInner {
    pub(crate) catalog: Arc<SchemaCatalog>,
    pub(crate) config: ClientConfig,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) identifiers: IdentifierMap,
}

/// Handle to a Unigraph store. Cheap to clone; clones share one context.
#[derive(Clone)]
pub struct UnigraphClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl UnigraphClient {
    /// Build a client over `transport`, whose inbound traffic arrives on
    /// `events`. The transport is assumed connected.
    ///
    /// Spawns the writer and event-loop tasks, so this must be called from
    /// within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        catalog: Arc<SchemaCatalog>,
        config: ClientConfig,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            dispatcher: Dispatcher::new(outbound_tx, config.request_timeout()),
            subscriptions: SubscriptionRegistry::new(catalog.clone()),
            identifiers: IdentifierMap::default(),
            catalog,
            config,
        });

        tokio::spawn(write_loop(
            Arc::downgrade(&inner),
            transport,
            outbound_rx,
        ));
        tokio::spawn(event_loop(Arc::downgrade(&inner), events));

        tracing::info!(
            request_timeout_ms = inner.config.request_timeout_ms,
            schemas = inner.catalog.len(),
            "Unigraph client started"
        );
        Self { inner }
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.inner.catalog
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.dispatcher.link()
    }

    /// Lifecycle state of a subscription; `None` if the id was never seen.
    pub fn subscription_state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.inner.subscriptions.state(id)
    }

    /// Number of live (not cancelled) subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Callback failures across all subscriptions.
    pub fn delivery_error_count(&self) -> u64 {
        self.inner.subscriptions.delivery_error_count()
    }

    pub fn last_delivery_error(&self, id: SubscriptionId) -> Option<DeliveryError> {
        self.inner.subscriptions.last_delivery_error(id)
    }

    /// Entities skipped from pushed batches, plus values inside delivered
    /// entities that were kept raw because they could not be decoded.
    pub fn malformed_entity_count(&self) -> u64 {
        self.inner.subscriptions.malformed_count()
    }
}

impl ClientInner {
    fn handle_frame(&self, frame: &str) {
        let message: ServerMessage = match serde_json::from_str(frame) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable frame");
                return;
            }
        };

        match message {
            ServerMessage::Response {
                id,
                success,
                result,
                error,
            } => self.dispatcher.resolve(id, success, result, error),
            ServerMessage::Subscription { id, result } => {
                self.subscriptions.deliver(id, &result);
            }
            ServerMessage::SubscriptionError { id, message } => {
                tracing::warn!(subscription_id = %id, error = %message, "Store rejected subscription");
            }
        }
    }

    fn on_disconnected(&self) {
        self.dispatcher.set_link(LinkState::Disconnected);
        let stale = self.subscriptions.mark_all_stale();
        tracing::info!(stale_subscriptions = stale, "Transport disconnected");
    }

    fn on_connected(&self) {
        self.dispatcher.set_link(LinkState::Resubscribing);
        let resend = self.subscriptions.take_stale();
        let count = resend.len();
        for r in resend {
            let frame = ClientMessage::Subscribe {
                id: r.id,
                query: r.query,
                show_hidden: r.show_hidden,
            };
            if self.dispatcher.enqueue_tagged(frame, r.epoch).is_err() {
                self.subscriptions.mark_send_failed(r.id, r.epoch);
            }
        }
        // Frames queued after this point go out behind the resubscriptions.
        self.dispatcher.set_link(LinkState::Ready);
        tracing::info!(resubscribed = count, "Transport connected");
    }

    fn on_closed(&self) {
        self.dispatcher.set_link(LinkState::Closed);
        self.dispatcher.fail_all(|| ClientError::Closed);
        self.subscriptions.mark_all_stale();
        tracing::info!("Transport closed");
    }
}

async fn write_loop(
    inner: Weak<ClientInner>,
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(Outbound { message, epoch }) = outbound.recv().await {
        let sent = match serde_json::to_string(&message) {
            Ok(frame) => transport.send(frame).await.map_err(|e| match e {
                TransportError::Disconnected => ClientError::Disconnected,
                other => ClientError::Transport(other),
            }),
            Err(e) => Err(ClientError::from(e)),
        };

        let Some(inner) = inner.upgrade() else { break };
        match (message, sent) {
            (ClientMessage::Subscribe { id, .. }, Ok(())) => {
                inner.subscriptions.mark_sent(id, epoch)
            }
            (ClientMessage::Subscribe { id, .. }, Err(e)) => {
                tracing::warn!(subscription_id = %id, epoch, error = %e, "Subscribe frame not sent");
                inner.subscriptions.mark_send_failed(id, epoch);
            }
            (ClientMessage::Request { id, .. }, Err(e)) => inner.dispatcher.fail(id, e),
            (ClientMessage::Unsubscribe { id }, Err(e)) => {
                tracing::debug!(subscription_id = %id, error = %e, "Unsubscribe frame not sent");
            }
            _ => {}
        }
    }
    tracing::debug!("Writer stopped");
}

async fn event_loop(inner: Weak<ClientInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        match event {
            TransportEvent::Frame(frame) => inner.handle_frame(&frame),
            TransportEvent::Disconnected => inner.on_disconnected(),
            TransportEvent::Connected => inner.on_connected(),
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.on_closed();
    }
}
