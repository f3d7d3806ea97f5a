//! Stream target levels.

/// What a change stream watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    /// A single collection.
    Collection {
        /// Database holding the collection.
        database: String,
        /// Collection name.
        collection: String,
    },
    /// Every collection in one database.
    Database {
        /// Database name.
        database: String,
    },
    /// The whole deployment.
    Deployment,
}

impl StreamTarget {
    /// Database the aggregate command runs against.
    ///
    /// Deployment streams aggregate against the admin database.
    pub fn database(&self) -> &str {
        match self {
            StreamTarget::Collection { database, .. } | StreamTarget::Database { database } => {
                database
            }
            StreamTarget::Deployment => "admin",
        }
    }

    /// Target collection, when the stream watches one.
    pub fn collection(&self) -> Option<&str> {
        match self {
            StreamTarget::Collection { collection, .. } => Some(collection),
            StreamTarget::Database { .. } | StreamTarget::Deployment => None,
        }
    }

    /// Whether the `$changeStream` stage must request deployment-wide
    /// events.
    pub fn all_changes_for_cluster(&self) -> bool {
        matches!(self, StreamTarget::Deployment)
    }
}
