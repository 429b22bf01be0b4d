use std::collections::VecDeque;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use shared::types::{RelayStatus, ServiceKey, ServiceView};
use crate::directory::{Directory, DirectoryEntry};
use crate::error::RelayError;
use crate::events::{Event, EventChannel, EventSender, InboundMessage};

const UNAVAILABLE: RelayError = RelayError::Unavailable("state thread");

/// Commands sent to the state thread
pub enum StateCommand {
    Apply(Event),
    Select(ServiceKey, oneshot::Sender<Result<DirectoryEntry, RelayError>>),
    Selected(oneshot::Sender<Result<DirectoryEntry, RelayError>>),
    Entry(ServiceKey, oneshot::Sender<Option<DirectoryEntry>>),
    Snapshot(oneshot::Sender<Vec<ServiceView>>),
    Status(oneshot::Sender<RelayStatus>),
    Messages(oneshot::Sender<Vec<InboundMessage>>),
    Shutdown,
}

/// Everything observers can see. Owned by one thread; all writes arrive as
/// [`StateCommand::Apply`].
struct ObservableState {
    directory: Directory,
    status: RelayStatus,
    messages: VecDeque<InboundMessage>,
    message_log_capacity: usize,
}

impl ObservableState {
    fn new(message_log_capacity: usize) -> Self {
        Self {
            directory: Directory::new(),
            status: RelayStatus::stopped(),
            messages: VecDeque::with_capacity(message_log_capacity),
            message_log_capacity,
        }
    }

    /// Apply an event. Returns false if it changed nothing and should not be
    /// republished.
    fn apply(&mut self, event: &Event) -> bool {
        match event {
            Event::Resolved(service) => {
                let inserted = self.directory.on_resolved(service.clone());
                if inserted {
                    tracing::debug!("Directory holds {} service(s)", self.directory.len());
                } else {
                    tracing::debug!("Ignoring duplicate resolve for {}", service.key());
                }
                inserted
            }
            Event::Removed(key) => match self.directory.on_removed(key) {
                Some(entry) => {
                    if let Some(connection) = entry.connection() {
                        tracing::info!("Closing subscription to removed service {}", key);
                        connection.close();
                    }
                    true
                }
                None => {
                    tracing::debug!("Removal for unknown service {}", key);
                    false
                }
            },
            Event::MessageReceived(message) => {
                if self.message_log_capacity > 0 {
                    if self.messages.len() == self.message_log_capacity {
                        self.messages.pop_front();
                    }
                    self.messages.push_back(message.clone());
                }
                true
            }
            Event::StatusChanged(status) => {
                self.status = status.clone();
                true
            }
            Event::SubscriptionOpened { key, connection } => {
                match self.directory.attach(key, connection.clone()) {
                    Ok(()) => true,
                    Err(orphan) => {
                        tracing::warn!("No unsubscribed entry for {}, closing connection", key);
                        orphan.close();
                        false
                    }
                }
            }
            Event::SubscriptionClosed { key, connection_id } => {
                self.directory.detach(key, *connection_id)
            }
            Event::Failure(_) => true,
        }
    }
}

/// Handle to the state thread
#[derive(Clone)]
pub struct StateHandle {
    tx: mpsc::Sender<StateCommand>,
}

impl StateHandle {
    /// Spawn the state thread. Applied events are republished on `observers`.
    pub fn spawn(message_log_capacity: usize, observers: EventChannel) -> Self {
        let (tx, mut rx) = mpsc::channel::<StateCommand>(256);

        thread::spawn(move || {
            let mut state = ObservableState::new(message_log_capacity);

            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StateCommand::Apply(event) => {
                        if state.apply(&event) {
                            observers.publish(event);
                        }
                    }
                    StateCommand::Select(key, reply) => {
                        let result = state.directory.select(&key).cloned();
                        let _ = reply.send(result);
                    }
                    StateCommand::Selected(reply) => {
                        let result = state.directory.selected().cloned();
                        let _ = reply.send(result);
                    }
                    StateCommand::Entry(key, reply) => {
                        let _ = reply.send(state.directory.get(&key).cloned());
                    }
                    StateCommand::Snapshot(reply) => {
                        let _ = reply.send(state.directory.snapshot());
                    }
                    StateCommand::Status(reply) => {
                        let _ = reply.send(state.status.clone());
                    }
                    StateCommand::Messages(reply) => {
                        let _ = reply.send(state.messages.iter().cloned().collect());
                    }
                    StateCommand::Shutdown => {
                        tracing::info!("State thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Producer handle for components that emit events
    pub fn events(&self) -> EventSender {
        EventSender::new(self.tx.clone())
    }

    /// Select a service for subscribe/unsubscribe
    pub async fn select(&self, key: ServiceKey) -> Result<DirectoryEntry, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(StateCommand::Select(key, reply)).await?;
        rx.await.map_err(|_| UNAVAILABLE)?
    }

    /// The selected entry, or `NoSelection`
    pub async fn selected(&self) -> Result<DirectoryEntry, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(StateCommand::Selected(reply)).await?;
        rx.await.map_err(|_| UNAVAILABLE)?
    }

    pub async fn entry(&self, key: ServiceKey) -> Result<Option<DirectoryEntry>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(StateCommand::Entry(key, reply)).await?;
        rx.await.map_err(|_| UNAVAILABLE)
    }

    pub async fn snapshot(&self) -> Result<Vec<ServiceView>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(StateCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| UNAVAILABLE)
    }

    pub async fn status(&self) -> Result<RelayStatus, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(StateCommand::Status(reply)).await?;
        rx.await.map_err(|_| UNAVAILABLE)
    }

    /// Recent message notifications, oldest first
    pub async fn messages(&self) -> Result<Vec<InboundMessage>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(StateCommand::Messages(reply)).await?;
        rx.await.map_err(|_| UNAVAILABLE)
    }

    /// Shutdown the state thread
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        self.send(StateCommand::Shutdown).await
    }

    async fn send(&self, cmd: StateCommand) -> Result<(), RelayError> {
        self.tx.send(cmd).await.map_err(|_| UNAVAILABLE)
    }
}
