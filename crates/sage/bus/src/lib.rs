//! Typed message bus for fleet-wide governance traffic.
//!
//! The governance services only publish; they never consume their own
//! topics. Delivery is at-least-once: subscribers deduplicate by entity
//! id where it matters. The bus carries five fixed topics ([`Topic`])
//! with tagged payloads ([`BusMessage`]).
//!
//! [`InMemoryBus`] backs tests, demos and single-process deployments.
//! [`RetryingPublisher`] wraps any bus so that transient broker failures
//! are retried in the background instead of failing the governance
//! operation whose decision is already durable in the store.

#![deny(unsafe_code)]

pub mod memory;
pub mod message;
pub mod retry;

use async_trait::async_trait;
use sage_types::BusResult;

pub use memory::{BusStats, InMemoryBus};
pub use message::{BusMessage, Topic};
pub use retry::RetryingPublisher;

/// Trait for governance message transports.
#[async_trait]
pub trait GovernanceBus: Send + Sync {
    /// Publishes one message on its topic.
    async fn publish(&self, message: BusMessage) -> BusResult<()>;
}
