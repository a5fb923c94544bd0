//! Transport seam for network-protocol backends.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::Result;

/// A connection to a job broker that accepts fully shaped job payloads.
///
/// The transport is resolved once when the client is built and handed to the
/// adapter that needs it.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Submit one job payload to the broker.
    async fn push(&self, job: &serde_json::Value) -> Result<()>;
}

/// A cloneable, type-erased transport handle.
pub type DynTransport = Arc<dyn Transport>;
