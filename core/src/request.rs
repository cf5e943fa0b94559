//! Requests: the values handed to the dispatcher.
//!
//! A request is either a **command** (exactly one intended receiver), an **event**
//! (zero or more receivers) or a **document** (a data carrier, routed like an event).
//! The dispatcher does not inspect payload fields; it only needs a stable identity
//! and the discriminator.
//!
//! # Example
//!
//! ```
//! use courier_core::request::{Request, RequestId, RequestKind};
//!
//! #[derive(Debug, Clone)]
//! struct ReserveStock {
//!     id: RequestId,
//!     sku: String,
//!     quantity: u32,
//! }
//!
//! impl Request for ReserveStock {
//!     fn id(&self) -> RequestId {
//!         self.id
//!     }
//!
//!     fn kind(&self) -> RequestKind {
//!         RequestKind::Command
//!     }
//! }
//!
//! let command = ReserveStock { id: RequestId::new(), sku: "A-1".into(), quantity: 2 };
//! assert_eq!(command.kind(), RequestKind::Command);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of request this is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Targeted at exactly one handler.
    Command,
    /// Broadcast to zero or more handlers.
    Event,
    /// A data carrier, routed like an event.
    Document,
}

impl RequestKind {
    /// Stable lowercase name, used in logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Event => "event",
            Self::Document => "document",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value that can be dispatched.
///
/// Requests must be `Send + Sync + 'static` so that a single instance can be shared
/// read-only across concurrently running publish pipelines.
pub trait Request: Send + Sync + 'static {
    /// The request's stable identifier.
    fn id(&self) -> RequestId;

    /// Command, event or document.
    fn kind(&self) -> RequestKind;

    /// Name of the request type, used for registry lookups in logs and for
    /// producer fallback routing.
    ///
    /// Defaults to the Rust type name. Override it when the name must stay stable
    /// across refactors (it is written into message headers).
    fn request_type(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
