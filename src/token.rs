//! Resume token handling.
//!
//! A resume token is an opaque server-issued position marker. The driver
//! never interprets it; it is cached byte-exact and forwarded unchanged into
//! resumed commands.

use std::fmt;

use bson::{Document, RawDocument, RawDocumentBuf};
use parking_lot::Mutex;

use crate::error::Result;

/// Opaque change-stream position marker.
#[derive(Clone)]
pub struct ResumeToken {
    bytes: RawDocumentBuf,
}

impl ResumeToken {
    /// Captures a token from a raw document, preserving its bytes.
    pub fn from_raw(document: &RawDocument) -> Self {
        Self {
            bytes: document.to_raw_document_buf(),
        }
    }

    /// Builds a token from a parsed document.
    pub fn from_document(document: &Document) -> Result<Self> {
        let bytes = RawDocumentBuf::from_bytes(bson::to_vec(document)?)?;
        Ok(Self { bytes })
    }

    /// The token's raw document form.
    pub fn as_raw(&self) -> &RawDocument {
        &self.bytes
    }

    /// The token's exact wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_bytes()
    }

    /// Parses the token into a document, for embedding in a command.
    pub fn to_document(&self) -> Result<Document> {
        Ok(bson::from_slice(self.bytes.as_bytes())?)
    }
}

impl PartialEq for ResumeToken {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ResumeToken {}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResumeToken").field(&self.bytes).finish()
    }
}

/// Holds the most recent logical stream position known to the client.
///
/// Written only by the resumable cursor on successful batch completion;
/// read by the resume path. A token, once advanced, is never rolled back.
#[derive(Debug, Default)]
pub struct ResumeTokenStore {
    current: Mutex<Option<ResumeToken>>,
}

impl ResumeTokenStore {
    /// Creates a store seeded with the stream's starting position, if any.
    pub fn new(initial: Option<ResumeToken>) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// The current position, if one has been observed.
    pub fn get(&self) -> Option<ResumeToken> {
        self.current.lock().clone()
    }

    /// Applies the position carried by a completed batch.
    ///
    /// The post-batch token takes precedence over the last event's `_id`;
    /// with neither present the position is unchanged.
    pub fn apply_batch(&self, post_batch: Option<ResumeToken>, last_id: Option<ResumeToken>) {
        if let Some(token) = post_batch.or(last_id) {
            *self.current.lock() = Some(token);
        }
    }
}
