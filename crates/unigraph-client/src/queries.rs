//! Live queries and one-shot reads.
//!
//! Registration never waits: the subscribe frame is queued and results
//! arrive on the callback as the store pushes them. One-shot calls go
//! through the dispatcher and are bounded by the request timeout.

use std::sync::Arc;

use tokio::sync::mpsc;

use unigraph_core::protocol::{ClientMessage, RequestEvent};
use unigraph_core::schema::InstalledPackage;
use unigraph_core::{PackageDescriptor, SubscriptionId, Uid, UnigraphObject};

use crate::client::{ClientError, Result, UnigraphClient};
use crate::dispatcher::LinkState;
use crate::subscriptions::{Callback, SubscribeOptions};

/// Selection used when a type subscription does not bring its own.
const DEFAULT_BODY: &str = "@recurse { uid unigraph.id _hide expand(_userpredicate_) }";

/// Query selecting every object of type `unigraph_id`.
pub fn type_query(unigraph_id: &str, show_hidden: bool, query_as: Option<&str>) -> String {
    let filter = if show_hidden {
        ""
    } else {
        " @filter(NOT eq(_hide, true))"
    };
    let body = query_as.unwrap_or(DEFAULT_BODY);
    format!(
        "var(func: eq(<unigraph.id>, \"{unigraph_id}\")) {{ <~type> {{ objects as uid }} }}\n\
         result(func: uid(objects)){filter} {body}"
    )
}

fn uid_query(uid: &Uid) -> String {
    format!("result(func: uid({uid})) {DEFAULT_BODY}")
}

/// Channel-backed subscription. Dropping it unsubscribes.
pub struct SubscriptionStream {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Vec<UnigraphObject>>,
    client: UnigraphClient,
}

impl SubscriptionStream {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next batch, in push order. `None` once the subscription is cancelled.
    pub async fn next(&mut self) -> Option<Vec<UnigraphObject>> {
        self.rx.recv().await
    }

    pub fn cancel(self) {}
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.client.unsubscribe(self.id);
    }
}

impl UnigraphClient {
    /// Start (or replace) the live query `id`.
    pub fn subscribe_to_query<F>(
        &self,
        query: impl Into<String>,
        callback: F,
        id: SubscriptionId,
        show_hidden: bool,
    ) where
        F: Fn(Vec<UnigraphObject>) + Send + Sync + 'static,
    {
        self.subscribe_with(query.into(), Arc::new(callback), id, show_hidden);
    }

    /// Live query over every object of type `unigraph_id`.
    pub fn subscribe_to_type<F>(
        &self,
        unigraph_id: &str,
        callback: F,
        id: SubscriptionId,
        options: SubscribeOptions,
    ) where
        F: Fn(Vec<UnigraphObject>) + Send + Sync + 'static,
    {
        let show_hidden = options.show_hidden.unwrap_or(self.inner.config.show_hidden);
        let query = type_query(unigraph_id, show_hidden, options.query_as.as_deref());
        self.subscribe_with(query, Arc::new(callback), id, show_hidden);
    }

    /// Live query delivered through a channel instead of a callback.
    pub fn subscribe_stream(
        &self,
        query: impl Into<String>,
        id: SubscriptionId,
        show_hidden: bool,
    ) -> SubscriptionStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: Callback = Arc::new(move |batch: Vec<UnigraphObject>| {
            // The receiver is gone only while the stream is being dropped.
            let _ = tx.send(batch);
        });
        self.subscribe_with(query.into(), callback, id, show_hidden);
        SubscriptionStream {
            id,
            rx,
            client: self.clone(),
        }
    }

    fn subscribe_with(&self, query: String, callback: Callback, id: SubscriptionId, show_hidden: bool) {
        let connected = matches!(
            self.inner.dispatcher.link(),
            LinkState::Ready | LinkState::Resubscribing
        );
        let epoch = self
            .inner
            .subscriptions
            .register(id, query.clone(), show_hidden, callback, connected);

        if let Some(epoch) = epoch {
            let frame = ClientMessage::Subscribe {
                id,
                query,
                show_hidden,
            };
            if self.inner.dispatcher.enqueue_tagged(frame, epoch).is_err() {
                self.inner.subscriptions.mark_send_failed(id, epoch);
            }
        }
        tracing::debug!(subscription_id = %id, show_hidden, queued = epoch.is_some(), "Subscribed");
    }

    /// Stop the live query `id`. Unknown or already cancelled ids are ignored.
    ///
    /// Once this returns the callback is not invoked again.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if !self.inner.subscriptions.unsubscribe(id) {
            return;
        }
        if self.inner.dispatcher.link() == LinkState::Ready {
            // Best effort; the store drops the query with the connection anyway.
            let _ = self.inner.dispatcher.enqueue(ClientMessage::Unsubscribe { id });
        }
    }

    /// Run `query` once.
    ///
    /// Entities that fail to decode are skipped and malformed fields inside
    /// an entity are kept raw; hidden entities are dropped unless the client
    /// is configured to show them.
    pub async fn query(&self, query: impl Into<String>) -> Result<Vec<UnigraphObject>> {
        let result = self
            .inner
            .dispatcher
            .request(RequestEvent::Query {
                query: query.into(),
            })
            .await?;
        let serde_json::Value::Array(list) = result else {
            return Err(ClientError::InvalidResponse(
                "query result must be a list".into(),
            ));
        };
        let show_hidden = self.inner.config.show_hidden;
        Ok(self
            .wrap_all(&list, show_hidden)
            .into_iter()
            .filter(|o| show_hidden || !o.is_hidden())
            .collect())
    }

    /// Fetch one object by uid, hidden or not.
    pub async fn get_object(&self, uid: &Uid) -> Result<UnigraphObject> {
        let target = self.resolve_uid(uid);
        if target.is_placeholder() {
            return Err(ClientError::UnknownEntity(target.to_string()));
        }
        let result = self
            .inner
            .dispatcher
            .request(RequestEvent::Query {
                query: uid_query(&target),
            })
            .await?;
        let first = match result {
            serde_json::Value::Array(mut list) if !list.is_empty() => list.swap_remove(0),
            serde_json::Value::Array(_) | serde_json::Value::Null => {
                return Err(ClientError::UnknownEntity(target.to_string()))
            }
            other => other,
        };
        let entity = self.inner.catalog.decode_contained(&first)?.entity;
        Ok(UnigraphObject::new(entity, self.inner.catalog.clone())
            .with_show_hidden(self.inner.config.show_hidden))
    }

    fn wrap_all(&self, list: &[serde_json::Value], show_hidden: bool) -> Vec<UnigraphObject> {
        list.iter()
            .filter_map(|wire| match self.inner.catalog.decode_contained(wire) {
                Ok(decoded) => Some(
                    UnigraphObject::new(decoded.entity, self.inner.catalog.clone())
                        .with_show_hidden(show_hidden),
                ),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed entity in query result");
                    None
                }
            })
            .collect()
    }

    /// Invoke a server-side executable and return its raw result.
    pub async fn run_executable(
        &self,
        executable_id: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        tracing::debug!(executable = %executable_id, "Running executable");
        self.inner
            .dispatcher
            .request(RequestEvent::RunExecutable {
                executable_id: executable_id.to_string(),
                params,
            })
            .await
    }

    /// Install the package `name` once per client.
    ///
    /// Concurrent calls share one installation. On success the package's
    /// schemas are registered in the local catalog.
    pub async fn ensure_package(
        &self,
        name: &str,
        descriptor: &PackageDescriptor,
    ) -> Result<InstalledPackage> {
        let dispatcher = &self.inner.dispatcher;
        let installed = self
            .inner
            .catalog
            .ensure_package(name, descriptor, |package| async move {
                dispatcher
                    .request(RequestEvent::EnsurePackage { package })
                    .await
                    .map(|_| ())
            })
            .await?;
        Ok(installed)
    }
}
