//! Wire protocol between the client and the graph store.
//!
//! Frames are JSON text. Requests carry either a subscription id (live
//! queries) or a client-generated request id (one-shot calls); the two
//! live in separate namespaces.

use serde::{Deserialize, Serialize};

use crate::schema::PackageDescriptor;
use crate::types::{RequestId, SubscriptionId};

/// A frame sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start or replace a live query.
    Subscribe {
        id: SubscriptionId,
        query: String,
        show_hidden: bool,
    },
    /// Stop a live query.
    Unsubscribe { id: SubscriptionId },
    /// A one-shot call expecting exactly one response.
    Request {
        id: RequestId,
        #[serde(flatten)]
        event: RequestEvent,
    },
}

/// Body of a one-shot request, tagged by event name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RequestEvent {
    /// Read the current results of a query once.
    Query { query: String },
    /// Create a new object tree. Nodes carry placeholder uids.
    CreateObject {
        object: serde_json::Value,
        schema: String,
    },
    /// Patch an existing object.
    UpdateObject {
        uid: String,
        patch: serde_json::Value,
        merge: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<SubscriptionId>,
        /// Suppress the store's default change notification.
        event_only: bool,
    },
    /// Invoke a named server-side procedure.
    RunExecutable {
        executable_id: String,
        params: serde_json::Value,
    },
    /// Install a package's schemas and default data.
    EnsurePackage { package: PackageDescriptor },
}

impl RequestEvent {
    /// Event name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::CreateObject { .. } => "create_object",
            Self::UpdateObject { .. } => "update_object",
            Self::RunExecutable { .. } => "run_executable",
            Self::EnsurePackage { .. } => "ensure_package",
        }
    }
}

/// A frame pushed by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a one-shot request.
    Response {
        id: RequestId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
    /// A batch of results for a live query. Entities are kept in wire form
    /// so one malformed entity cannot spoil the frame.
    Subscription {
        id: SubscriptionId,
        result: Vec<serde_json::Value>,
    },
    /// The store could not run a live query.
    SubscriptionError { id: SubscriptionId, message: String },
}

/// Error reported by the store for a one-shot request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    UnknownEntity,
    MalformedRequest,
    Internal,
}

/// Acknowledgment of a create: placeholder → store-assigned uid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CreateAck {
    pub uids: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_is_flat_and_tagged() {
        let msg = ClientMessage::Request {
            id: RequestId(7),
            event: RequestEvent::RunExecutable {
                executable_id: "$/executable/add-reddit-account".into(),
                params: json!({}),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "request",
                "id": 7,
                "event": "run_executable",
                "executable_id": "$/executable/add-reddit-account",
                "params": {}
            })
        );
        let back: ClientMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn server_messages_parse() {
        let push: ServerMessage = serde_json::from_value(json!({
            "type": "subscription",
            "id": 42,
            "result": [{"uid": "0x1", "_value.%": "x"}]
        }))
        .unwrap();
        assert!(matches!(push, ServerMessage::Subscription { id: SubscriptionId(42), .. }));

        let failed: ServerMessage = serde_json::from_value(json!({
            "type": "response",
            "id": 3,
            "success": false,
            "error": {"kind": "unknown_entity", "message": "no node 0x99"}
        }))
        .unwrap();
        let ServerMessage::Response { error: Some(err), .. } = failed else {
            panic!("expected failed response");
        };
        assert_eq!(err.kind, RemoteErrorKind::UnknownEntity);
    }
}
