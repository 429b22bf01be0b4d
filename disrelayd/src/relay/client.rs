//! The subscribing side: one outbound connection to a chosen publisher.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use shared::codec::PduCodec;
use shared::types::{ServiceKey, SubscriptionState};
use crate::directory::DirectoryEntry;
use crate::error::RelayError;
use crate::events::{Event, EventSender, Failure, FailureKind, InboundMessage};
use crate::state::StateHandle;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to an open subscription connection.
///
/// Closing it is the only way a subscription ends locally; the connection
/// task then runs the same teardown it runs when the publisher hangs up.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    remote: SocketAddr,
    close: CancellationToken,
    closed: CancellationToken,
}

impl ConnectionHandle {
    fn new(remote: SocketAddr, close: CancellationToken) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            close,
            closed: CancellationToken::new(),
        }
    }

    /// A handle with no connection task behind it
    #[cfg(test)]
    pub fn detached(remote: SocketAddr) -> Self {
        Self::new(remote, CancellationToken::new())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn close(&self) {
        self.close.cancel();
    }

    #[cfg(test)]
    pub fn is_close_requested(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once teardown has been handed to the state thread
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Subscribes to at most one publisher at a time.
#[derive(Clone)]
pub struct RelayClient {
    state: StateHandle,
    events: EventSender,
    /// Capacity-1 lease; the permit lives inside the connection task
    lease: Arc<Semaphore>,
    root: CancellationToken,
}

impl RelayClient {
    pub fn new(state: StateHandle) -> Self {
        let events = state.events();
        Self {
            state,
            events,
            lease: Arc::new(Semaphore::new(1)),
            root: CancellationToken::new(),
        }
    }

    pub async fn subscribe_selected(&self) -> Result<ConnectionHandle, RelayError> {
        let entry = self.state.selected().await?;
        self.connect(entry).await
    }

    pub async fn subscribe(&self, key: &ServiceKey) -> Result<ConnectionHandle, RelayError> {
        let entry = self
            .state
            .entry(key.clone())
            .await?
            .ok_or_else(|| RelayError::UnknownService(key.clone()))?;
        self.connect(entry).await
    }

    pub async fn unsubscribe_selected(&self) -> Result<(), RelayError> {
        let entry = self.state.selected().await?;
        self.disconnect(entry).await;
        Ok(())
    }

    /// No-op if the service is not subscribed
    pub async fn unsubscribe(&self, key: &ServiceKey) -> Result<(), RelayError> {
        let entry = self
            .state
            .entry(key.clone())
            .await?
            .ok_or_else(|| RelayError::UnknownService(key.clone()))?;
        self.disconnect(entry).await;
        Ok(())
    }

    /// Close the open subscription, if any. Used at shutdown: anything
    /// subscribed afterwards closes immediately.
    pub fn close_all(&self) {
        self.root.cancel();
    }

    async fn connect(&self, entry: DirectoryEntry) -> Result<ConnectionHandle, RelayError> {
        let key = entry.key();
        if entry.state() == SubscriptionState::Subscribed {
            return Err(RelayError::AlreadySubscribed(key));
        }
        let permit = self
            .lease
            .clone()
            .try_acquire_owned()
            .map_err(|_| RelayError::AlreadySubscribed(key.clone()))?;

        let port = entry.service.port;
        let stream = match &entry.service.address {
            Some(address) => TcpStream::connect((address.as_str(), port))
                .await
                .map_err(|source| RelayError::ConnectFailed {
                    addr: format!("{}:{}", address, port),
                    source,
                }),
            None => Err(RelayError::ConnectFailed {
                addr: format!("{}:{}", entry.service.host_name, port),
                source: io::Error::new(io::ErrorKind::AddrNotAvailable, "service has no address"),
            }),
        }
        .and_then(|stream| {
            let remote = stream.peer_addr().map_err(|source| RelayError::ConnectFailed {
                addr: format!("{}:{}", entry.service.host_name, port),
                source,
            })?;
            Ok((stream, remote))
        });

        let (stream, remote) = match stream {
            Ok(connected) => connected,
            Err(e) => {
                tracing::warn!("Subscribe to {} failed: {}", key, e);
                self.events
                    .emit(Event::Failure(Failure::new(FailureKind::ConnectFailed, e.to_string())))
                    .await;
                return Err(e);
            }
        };

        tracing::info!("Connected to {} at {}", key, remote);
        let connection = ConnectionHandle::new(remote, self.root.child_token());
        self.events
            .emit(Event::SubscriptionOpened {
                key: key.clone(),
                connection: connection.clone(),
            })
            .await;

        tokio::spawn(run_subscription(
            key,
            stream,
            connection.clone(),
            self.events.clone(),
            permit,
        ));

        Ok(connection)
    }

    async fn disconnect(&self, entry: DirectoryEntry) {
        let Some(connection) = entry.connection() else {
            tracing::debug!("{} is not subscribed", entry.key());
            return;
        };
        tracing::info!("Disconnecting from {}", entry.key());
        connection.close();
        connection.closed().await;
    }
}

async fn run_subscription(
    key: ServiceKey,
    stream: TcpStream,
    connection: ConnectionHandle,
    events: EventSender,
    permit: OwnedSemaphorePermit,
) {
    let mut frames = FramedRead::new(stream, PduCodec::new());

    loop {
        tokio::select! {
            _ = connection.close.cancelled() => {
                tracing::debug!("Closing subscription to {}", key);
                break;
            }
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    // One bad frame does not end the subscription
                    if let Err(e) = &frame.decoded {
                        tracing::warn!("Undecodable frame from {}: {}", key, e);
                        events
                            .emit(Event::Failure(Failure::new(
                                FailureKind::DecodeError,
                                format!("{}: {}", key, e),
                            )))
                            .await;
                    }
                    events.emit(Event::MessageReceived(InboundMessage::new(key.clone(), frame))).await;
                }
                Some(Err(e)) => {
                    tracing::warn!("Read from {} failed: {}", key, e);
                    break;
                }
                None => {
                    tracing::info!("{} closed the connection", connection.remote);
                    break;
                }
            }
        }
    }

    drop(frames);
    events
        .emit(Event::SubscriptionClosed {
            key,
            connection_id: connection.id,
        })
        .await;
    drop(permit);
    connection.closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;
    use shared::pdu::EntityStatePdu;
    use shared::types::Service;
    use crate::config::RelayConfig;
    use crate::events::EventChannel;
    use crate::relay::server::RelayServer;
    use crate::relay::testing::{wait_for_status, RecordingAdvertiser};

    fn service(name: &str, port: u16) -> Service {
        Service {
            service_name: name.to_string(),
            host_name: "localhost.".to_string(),
            address: Some("127.0.0.1".to_string()),
            service_type: "_dis._tcp.local.".to_string(),
            port,
        }
    }

    struct Harness {
        state: StateHandle,
        client: RelayClient,
        observer: broadcast::Receiver<Event>,
    }

    impl Harness {
        fn new() -> Self {
            let channel = EventChannel::new(256);
            let observer = channel.subscribe();
            let state = StateHandle::spawn(16, channel);
            let client = RelayClient::new(state.clone());
            Self { state, client, observer }
        }

        async fn resolve(&self, service: Service) -> ServiceKey {
            let key = service.key();
            self.state.events().emit(Event::Resolved(service)).await;
            key
        }

        async fn subscription_state(&self, key: &ServiceKey) -> SubscriptionState {
            self.state.entry(key.clone()).await.unwrap().unwrap().state()
        }

        async fn next_message(&mut self) -> InboundMessage {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if let Event::MessageReceived(message) = self.observer.recv().await.unwrap() {
                        break message;
                    }
                }
            })
            .await
            .expect("no message received")
        }
    }

    #[tokio::test]
    async fn test_end_to_end_through_relay_server() {
        let mut harness = Harness::new();
        let config = RelayConfig {
            bind_address: "127.0.0.1".to_string(),
            ..RelayConfig::default()
        };
        let server = RelayServer::spawn(
            config,
            Arc::new(RecordingAdvertiser::default()),
            harness.state.events(),
        );

        let port = server.start().await.unwrap();
        assert_eq!(server.broadcast(Bytes::from_static(b"")).await.unwrap(), 0);

        let key = harness.resolve(service("ESPDU-PRODUCER", port)).await;
        harness.client.subscribe(&key).await.unwrap();
        assert_eq!(harness.subscription_state(&key).await, SubscriptionState::Subscribed);
        wait_for_status(&harness.state, |s| s.active_sessions == 1).await;

        let pdu = EntityStatePdu::sample(5);
        let payload = pdu.marshal().unwrap();
        assert_eq!(server.broadcast(payload.clone()).await.unwrap(), 1);

        let message = harness.next_message().await;
        assert_eq!(message.source, key);
        assert_eq!(message.frame.bytes, payload);
        assert_eq!(message.frame.decoded.as_ref().unwrap(), &pdu);
        assert_eq!(message.summary(), pdu.summary());

        // Exactly one notification for one broadcast
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.state.messages().await.unwrap().len(), 1);

        harness.client.unsubscribe(&key).await.unwrap();
        assert_eq!(harness.subscription_state(&key).await, SubscriptionState::Unsubscribed);
        wait_for_status(&harness.state, |s| s.active_sessions == 0).await;
    }

    #[tokio::test]
    async fn test_unreachable_publisher_reports_connect_failed() {
        let harness = Harness::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let key = harness.resolve(service("gone", port)).await;
        let result = harness.client.subscribe(&key).await;

        assert!(matches!(result, Err(RelayError::ConnectFailed { .. })));
        assert_eq!(harness.subscription_state(&key).await, SubscriptionState::Unsubscribed);
        assert!(harness.state.entry(key).await.unwrap().unwrap().connection().is_none());
    }

    #[tokio::test]
    async fn test_service_without_address_cannot_subscribe() {
        let harness = Harness::new();
        let mut no_address = service("ghost", 9000);
        no_address.address = None;
        let key = harness.resolve(no_address).await;

        assert!(matches!(
            harness.client.subscribe(&key).await,
            Err(RelayError::ConnectFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_subscribe_then_unsubscribe_resets_even_if_peer_closes() {
        let harness = Harness::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Publisher that hangs up immediately
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let key = harness.resolve(service("flaky", port)).await;
        let connection = harness.client.subscribe(&key).await.unwrap();
        harness.client.unsubscribe(&key).await.unwrap();
        connection.closed().await;

        let entry = harness.state.entry(key.clone()).await.unwrap().unwrap();
        assert_eq!(entry.state(), SubscriptionState::Unsubscribed);
        assert!(entry.connection().is_none());

        // Second unsubscribe is a no-op
        harness.client.unsubscribe(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_only_one_subscription_at_a_time() {
        let harness = Harness::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _accepted = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let first = harness.resolve(service("first", port)).await;
        let second = harness.resolve(service("second", port)).await;

        harness.client.subscribe(&first).await.unwrap();
        assert!(matches!(
            harness.client.subscribe(&first).await,
            Err(RelayError::AlreadySubscribed(_))
        ));
        assert!(matches!(
            harness.client.subscribe(&second).await,
            Err(RelayError::AlreadySubscribed(_))
        ));
        assert_eq!(harness.subscription_state(&second).await, SubscriptionState::Unsubscribed);

        // Releasing the lease lets the next one through
        harness.client.unsubscribe(&first).await.unwrap();
        harness.client.subscribe(&second).await.unwrap();
        assert_eq!(harness.subscription_state(&second).await, SubscriptionState::Subscribed);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let mut harness = Harness::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut bad = EntityStatePdu::sample(1).marshal().unwrap().to_vec();
        bad[2] = 99;
        let good = EntityStatePdu::sample(2).marshal().unwrap();
        let publisher = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&bad).await.unwrap();
            stream.write_all(&good).await.unwrap();
            // Hold the connection open until the test is done with it
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let key = harness.resolve(service("noisy", port)).await;
        harness.client.subscribe(&key).await.unwrap();

        let first = harness.next_message().await;
        assert!(!first.frame.is_decoded());
        assert_eq!(first.summary(), "Unable to decode PDU");

        let second = harness.next_message().await;
        assert_eq!(second.frame.decoded.unwrap().timestamp, 2);
        assert_eq!(harness.subscription_state(&key).await, SubscriptionState::Subscribed);

        publisher.abort();
    }

    #[tokio::test]
    async fn test_remote_close_resets_subscription() {
        let harness = Harness::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (hang_up, wait_for_hang_up) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = wait_for_hang_up.await;
            drop(stream);
        });

        let key = harness.resolve(service("leaving", port)).await;
        let connection = harness.client.subscribe(&key).await.unwrap();
        assert_eq!(harness.subscription_state(&key).await, SubscriptionState::Subscribed);

        hang_up.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), connection.closed())
            .await
            .unwrap();

        assert_eq!(harness.subscription_state(&key).await, SubscriptionState::Unsubscribed);
        assert!(!connection.is_close_requested());
    }
}
