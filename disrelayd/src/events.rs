//! The internal event bus.
//!
//! Producers (mDNS browser, relay server, relay client) never touch shared
//! state directly. They hand an [`Event`] to an [`EventSender`], which queues
//! it on the state thread. The state thread applies it and then republishes
//! it to every observer subscribed through [`EventChannel`].

use chrono::{DateTime, Utc};
use shared::codec::PduFrame;
use shared::types::{RelayStatus, Service, ServiceKey};
use tokio::sync::{broadcast, mpsc};
use crate::relay::client::ConnectionHandle;
use crate::state::StateCommand;

/// Everything that can change observable state.
#[derive(Debug, Clone)]
pub enum Event {
    Resolved(Service),
    Removed(ServiceKey),
    MessageReceived(InboundMessage),
    StatusChanged(RelayStatus),
    SubscriptionOpened {
        key: ServiceKey,
        connection: ConnectionHandle,
    },
    SubscriptionClosed {
        key: ServiceKey,
        connection_id: u64,
    },
    Failure(Failure),
}

/// One frame received from the subscribed publisher.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub source: ServiceKey,
    pub received_at: DateTime<Utc>,
    pub frame: PduFrame,
}

impl InboundMessage {
    pub fn new(source: ServiceKey, frame: PduFrame) -> Self {
        Self {
            source,
            received_at: Utc::now(),
            frame,
        }
    }

    pub fn summary(&self) -> String {
        self.frame.summary()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    BindFailed,
    RegistrationFailed,
    ConnectFailed,
    DecodeError,
    SessionWriteFailed,
}

/// A reported, non-fatal failure.
#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Producer half of the bus. Cheap to clone; every clone feeds the same
/// state thread.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<StateCommand>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::Sender<StateCommand>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: Event) {
        if self.tx.send(StateCommand::Apply(event)).await.is_err() {
            tracing::debug!("State thread gone, dropping event");
        }
    }
}

/// Observer half of the bus.
#[derive(Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<Event>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// No observers is not an error.
    pub(crate) fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// Logs every notification. Stands in for a UI message pane.
pub async fn log_observer(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(Event::Resolved(service)) => {
                tracing::info!(
                    "Discovered {} at {}:{}",
                    service.key(),
                    service.address.as_deref().unwrap_or("?"),
                    service.port
                );
            }
            Ok(Event::Removed(key)) => {
                tracing::info!("Service removed: {}", key);
            }
            Ok(Event::MessageReceived(message)) => {
                tracing::info!("[{}] {}", message.source, message.summary());
            }
            Ok(Event::StatusChanged(status)) => {
                tracing::info!(
                    "Relay port {} with {} session(s)",
                    status.listen_port,
                    status.active_sessions
                );
            }
            Ok(Event::SubscriptionOpened { key, connection }) => {
                tracing::info!("Subscribed to {} via {}", key, connection.remote());
            }
            Ok(Event::SubscriptionClosed { key, .. }) => {
                tracing::info!("Unsubscribed from {}", key);
            }
            Ok(Event::Failure(failure)) => {
                tracing::warn!("{:?}: {}", failure.kind, failure.detail);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Log observer lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
