//! Read binding and connection source collaborator seams.
//!
//! A binding is a reference-counted handle to an acquired read scope: a
//! selected server plus its session context. The cursor core never opens
//! connections itself; it borrows them through these traits.

use async_trait::async_trait;

use crate::error::Result;

/// Capabilities of a selected server, observed at connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerDescription {
    /// Wire version advertised by the server.
    pub max_wire_version: i32,
}

impl ServerDescription {
    /// Describes a server advertising the given wire version.
    pub fn new(max_wire_version: i32) -> Self {
        Self { max_wire_version }
    }
}

/// Reference-counted handle to an acquired read scope.
///
/// `retain`/`release` pairs must balance; the last release returns the
/// underlying server resources to the pool.
#[async_trait]
pub trait ReadBinding: Send + Sync {
    /// Takes an additional reference to the read scope.
    fn retain(&self);

    /// Drops one reference to the read scope.
    fn release(&self);

    /// Acquires a connection source for a single command exchange.
    async fn read_connection_source(&self) -> Result<Box<dyn ConnectionSource>>;
}

/// A checked-out connection to one server.
pub trait ConnectionSource: Send {
    /// Description of the server this source is connected to.
    fn server_description(&self) -> ServerDescription;

    /// Returns the connection to its pool.
    fn release(self: Box<Self>);
}
