//! TokenVault broker.
//!
//! A small HTTP service bound to the loopback interface. Local backends push
//! the bearer token they just issued (`POST /store`), API clients pull it back
//! by project name (`GET /fetch/{project}`). Only the latest token of each
//! project is kept.
//!
//! The embedding host drives the service through [`BrokerService`] and
//! observes it through a [`NotificationHub`] subscription.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

mod error;
mod http_server;
pub mod lifecycle;
pub mod settings;

pub use error::BrokerError;
pub use lifecycle::{BrokerOptions, BrokerService, ServiceState, ServiceStatus, StopOutcome};
pub use tokenvault_store as store;

pub const DEFAULT_EVENT_BUFFER: usize = 128;

/// Notifications emitted by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// A token was committed to the store.
    #[serde(rename_all = "camelCase")]
    TokenReceived {
        project_name: String,
        received_at: DateTime<Utc>,
    },
    /// The service changed lifecycle state.
    #[serde(rename_all = "camelCase")]
    StatusChanged { is_running: bool, message: String },
}

impl BrokerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BrokerEvent::TokenReceived { .. } => "token_received",
            BrokerEvent::StatusChanged { .. } => "status_changed",
        }
    }
}

/// Fan-out of [`BrokerEvent`]s to any number of subscribers.
///
/// Publishing never blocks and never fails the producer. A subscriber that
/// falls more than `buffer` events behind loses the oldest ones.
#[derive(Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<BrokerEvent>,
}

impl NotificationHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: BrokerEvent) {
        if let Err(err) = self.sender.send(event) {
            tracing::debug!("no subscribers for {} notification", err.0.name());
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}
