//! Decoded change event record.
//!
//! Change streams are generic over the decoded event type; this module
//! provides the record most callers want. Applications with bespoke
//! pipelines deserialize into their own types instead.

use bson::{Document, Timestamp};
use serde::{Deserialize, Serialize};

/// Kind of modification a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    DropDatabase,
    Invalidate,
    /// An operation type this driver version does not know about.
    #[serde(other)]
    Unknown,
}

/// The namespace a change event originated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNamespace {
    /// Database name.
    pub db: String,
    /// Collection name; absent for database-level events.
    pub coll: Option<String>,
}

/// A single decoded change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeStreamEvent {
    /// The event's resume token.
    #[serde(rename = "_id")]
    pub id: Document,
    /// What happened.
    pub operation_type: OperationType,
    /// Where it happened; absent for deployment-level events.
    pub ns: Option<EventNamespace>,
    /// The `_id` of the affected document.
    pub document_key: Option<Document>,
    /// The affected document, per the stream's full-document mode.
    pub full_document: Option<Document>,
    /// Cluster time the event was observed at.
    pub cluster_time: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn test_decodes_insert_event() {
        let raw = bson::to_vec(&doc! {
            "_id": { "_data": "8263" },
            "operationType": "insert",
            "ns": { "db": "shop", "coll": "orders" },
            "documentKey": { "_id": 7 },
            "fullDocument": { "_id": 7, "total": 42 },
            "clusterTime": Timestamp { time: 100, increment: 3 },
        })
        .unwrap();

        let event: ChangeStreamEvent = bson::from_slice(&raw).unwrap();

        assert_eq!(event.id, doc! { "_data": "8263" });
        assert_eq!(event.operation_type, OperationType::Insert);
        let ns = event.ns.unwrap();
        assert_eq!(ns.db, "shop");
        assert_eq!(ns.coll.as_deref(), Some("orders"));
        assert_eq!(event.document_key, Some(doc! { "_id": 7 }));
        assert_eq!(
            event.cluster_time,
            Some(Timestamp {
                time: 100,
                increment: 3
            })
        );
    }

    #[test]
    fn test_optional_fields_may_be_absent() {
        let raw = bson::to_vec(&doc! {
            "_id": { "_data": "8264" },
            "operationType": "invalidate",
        })
        .unwrap();

        let event: ChangeStreamEvent = bson::from_slice(&raw).unwrap();

        assert_eq!(event.operation_type, OperationType::Invalidate);
        assert!(event.ns.is_none());
        assert!(event.full_document.is_none());
    }

    #[test]
    fn test_unknown_operation_type_is_tolerated() {
        let raw = bson::to_vec(&doc! {
            "_id": { "_data": "8265" },
            "operationType": "modify",
        })
        .unwrap();

        let event: ChangeStreamEvent = bson::from_slice(&raw).unwrap();
        assert_eq!(event.operation_type, OperationType::Unknown);
    }
}
