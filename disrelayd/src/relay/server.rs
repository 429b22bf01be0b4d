//! The publishing side: accepts subscriber connections and fans encoded PDUs
//! out to all of them.
//!
//! All server state lives in one task. [`RelayServer`] is a cheap handle that
//! talks to it over a command channel, so there is exactly one listener per
//! handle family no matter how many callers hold a clone.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use shared::types::RelayStatus;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::events::{Event, EventSender, Failure, FailureKind};
use crate::mdns::advertise::{Advertise, AdvertiseWorker, Advertised, Registration};

/// Frames queued per session; a session that falls this far behind is closed
const SESSION_QUEUE_DEPTH: usize = 1024;
/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum ServerCommand {
    Start(oneshot::Sender<Result<u16, RelayError>>),
    Stop(oneshot::Sender<()>),
    Broadcast(Bytes, oneshot::Sender<Result<usize, RelayError>>),
    SessionClosed {
        id: u64,
        end: SessionEnd,
    },
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
enum SessionEnd {
    Local,
    PeerClosed,
    Stalled,
    WriteFailed(io::Error),
    ReadFailed(io::Error),
}

/// One accepted subscriber. The socket itself is owned by the session task.
struct ServerSession {
    remote: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

enum Phase {
    Stopped,
    Listening { listener: TcpListener, port: u16 },
}

/// Handle to the relay server task
#[derive(Clone)]
pub struct RelayServer {
    tx: mpsc::Sender<ServerCommand>,
}

impl RelayServer {
    pub fn spawn(config: RelayConfig, advertiser: Arc<dyn Advertise>, events: EventSender) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (advertiser, advertised) = AdvertiseWorker::spawn(advertiser);
        let actor = ServerActor {
            config,
            advertiser,
            events,
            tx: tx.clone(),
            phase: Phase::Stopped,
            sessions: HashMap::new(),
            next_session_id: 0,
            generation: 0,
            registration: None,
        };
        tokio::spawn(actor.run(rx, advertised));
        Self { tx }
    }

    /// Bind an ephemeral port and start accepting subscribers. Returns the
    /// bound port. Advertisement happens in the background afterwards.
    pub async fn start(&self) -> Result<u16, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::Start(reply)).await?;
        rx.await.map_err(|_| unavailable())?
    }

    /// Withdraw the advertisement and close every session. No-op when stopped.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::Stop(reply)).await?;
        rx.await.map_err(|_| unavailable())
    }

    /// Queue `payload` on every open session. Returns how many sessions it
    /// was handed to.
    pub async fn broadcast(&self, payload: Bytes) -> Result<usize, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::Broadcast(payload, reply)).await?;
        rx.await.map_err(|_| unavailable())?
    }

    /// Stop and end the server task
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::Shutdown(reply)).await?;
        rx.await.map_err(|_| unavailable())
    }

    async fn send(&self, cmd: ServerCommand) -> Result<(), RelayError> {
        self.tx.send(cmd).await.map_err(|_| unavailable())
    }
}

fn unavailable() -> RelayError {
    RelayError::Unavailable("relay server")
}

struct ServerActor {
    config: RelayConfig,
    advertiser: AdvertiseWorker,
    events: EventSender,
    tx: mpsc::Sender<ServerCommand>,
    phase: Phase,
    sessions: HashMap<u64, ServerSession>,
    next_session_id: u64,
    /// Bumped on every start so a late advertisement from an earlier run is recognised
    generation: u64,
    registration: Option<Registration>,
}

enum Step {
    Command(Option<ServerCommand>),
    Advertised(Advertised),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
}

impl ServerActor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ServerCommand>,
        mut advertised: mpsc::UnboundedReceiver<Advertised>,
    ) {
        loop {
            let step = tokio::select! {
                cmd = rx.recv() => Step::Command(cmd),
                Some(done) = advertised.recv() => Step::Advertised(done),
                accepted = accept_next(&self.phase) => Step::Accepted(accepted),
            };

            match step {
                Step::Command(Some(cmd)) => {
                    if !self.handle(cmd).await {
                        break;
                    }
                }
                Step::Command(None) => {
                    self.stop().await;
                    break;
                }
                Step::Advertised(done) => self.on_advertised(done).await,
                Step::Accepted(Ok((stream, remote))) => self.open_session(stream, remote).await,
                Step::Accepted(Err(e)) => {
                    tracing::warn!("Failed to accept subscriber: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        tracing::info!("Relay server task finished");
    }

    /// Returns false once the task should end
    async fn handle(&mut self, cmd: ServerCommand) -> bool {
        match cmd {
            ServerCommand::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            ServerCommand::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(());
            }
            ServerCommand::Broadcast(payload, reply) => {
                let result = self.broadcast(payload).await;
                let _ = reply.send(result);
            }
            ServerCommand::SessionClosed { id, end } => {
                self.close_session(id, end).await;
            }
            ServerCommand::Shutdown(reply) => {
                self.stop().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn start(&mut self) -> Result<u16, RelayError> {
        if matches!(self.phase, Phase::Listening { .. }) {
            return Err(RelayError::AlreadyListening);
        }

        self.events.emit(Event::StatusChanged(RelayStatus::starting())).await;

        let addr = format!("{}:0", self.config.bind_address);
        let bound = match TcpListener::bind((self.config.bind_address.as_str(), 0)).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local.port())),
            Err(e) => Err(e),
        };
        let (listener, port) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                tracing::error!("Failed to bind relay listener on {}: {}", addr, source);
                self.events.emit(Event::StatusChanged(RelayStatus::stopped())).await;
                self.events
                    .emit(Event::Failure(Failure::new(
                        FailureKind::BindFailed,
                        format!("{}: {}", addr, source),
                    )))
                    .await;
                return Err(RelayError::BindFailed { addr, source });
            }
        };

        tracing::info!("Relay listening on port {}", port);
        self.phase = Phase::Listening { listener, port };
        self.generation += 1;
        self.publish_status().await;

        self.advertiser
            .advertise(self.generation, port, self.config.service_name.clone());

        Ok(port)
    }

    async fn on_advertised(&mut self, done: Advertised) {
        let current = done.generation == self.generation && matches!(self.phase, Phase::Listening { .. });
        if !current {
            // The worker already withdrew it when the run that asked for it stopped
            tracing::debug!("Ignoring advertisement result from run {}", done.generation);
            return;
        }

        match done.result {
            Ok(registration) => {
                self.registration = Some(registration);
                self.publish_status().await;
            }
            // Server stays up for direct connections
            Err(e) => {
                tracing::warn!("Relay is listening but not advertised: {}", e);
                self.events
                    .emit(Event::Failure(Failure::new(FailureKind::RegistrationFailed, e.to_string())))
                    .await;
            }
        }
    }

    async fn stop(&mut self) {
        if matches!(self.phase, Phase::Stopped) {
            return;
        }

        self.registration = None;
        self.advertiser.withdraw().await;

        self.phase = Phase::Stopped;
        for (_, session) in self.sessions.drain() {
            session.cancel.cancel();
        }

        tracing::info!("Relay stopped");
        self.publish_status().await;
    }

    async fn broadcast(&mut self, payload: Bytes) -> Result<usize, RelayError> {
        if !matches!(self.phase, Phase::Listening { .. }) {
            return Err(RelayError::NotListening);
        }

        tracing::debug!("Broadcasting {} bytes to {} session(s)", payload.len(), self.sessions.len());

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, session) in &self.sessions {
            match session.outbound.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                // Gaps in the stream are worse than losing the subscriber
                Err(mpsc::error::TrySendError::Full(_)) => dead.push((*id, SessionEnd::Stalled)),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    let error = io::Error::new(io::ErrorKind::BrokenPipe, "session closed before write");
                    dead.push((*id, SessionEnd::WriteFailed(error)));
                }
            }
        }

        for (id, end) in dead {
            self.close_session(id, end).await;
        }

        Ok(delivered)
    }

    async fn open_session(&mut self, stream: TcpStream, remote: SocketAddr) {
        if matches!(self.phase, Phase::Stopped) {
            return;
        }

        let id = self.next_session_id;
        self.next_session_id += 1;

        let (outbound, queue) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        tokio::spawn(run_session(id, stream, remote, queue, cancel.clone(), self.tx.clone()));

        tracing::info!("Subscriber connected from {}", remote);
        self.sessions.insert(id, ServerSession { remote, outbound, cancel });
        self.publish_status().await;
    }

    async fn close_session(&mut self, id: u64, end: SessionEnd) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        session.cancel.cancel();

        match end {
            SessionEnd::Local | SessionEnd::PeerClosed => {
                tracing::info!("Subscriber {} disconnected", session.remote);
            }
            SessionEnd::ReadFailed(e) => {
                tracing::warn!("Subscriber {} dropped: {}", session.remote, e);
            }
            SessionEnd::Stalled => {
                tracing::warn!("Subscriber {} stopped reading, closing session", session.remote);
                self.events
                    .emit(Event::Failure(Failure::new(
                        FailureKind::SessionWriteFailed,
                        format!("{}: {} frames queued", session.remote, SESSION_QUEUE_DEPTH),
                    )))
                    .await;
            }
            SessionEnd::WriteFailed(e) => {
                tracing::warn!("Write to subscriber {} failed: {}", session.remote, e);
                self.events
                    .emit(Event::Failure(Failure::new(
                        FailureKind::SessionWriteFailed,
                        format!("{}: {}", session.remote, e),
                    )))
                    .await;
            }
        }

        self.publish_status().await;
    }

    async fn publish_status(&self) {
        let status = match &self.phase {
            Phase::Stopped => RelayStatus::stopped(),
            Phase::Listening { port, .. } => RelayStatus::listening(
                *port,
                self.sessions.len(),
                self.registration.as_ref().map(|r| r.instance_name.clone()),
            ),
        };
        self.events.emit(Event::StatusChanged(status)).await;
    }
}

/// Pending forever while stopped so the select loop only waits on commands
async fn accept_next(phase: &Phase) -> io::Result<(TcpStream, SocketAddr)> {
    match phase {
        Phase::Listening { listener, .. } => listener.accept().await,
        Phase::Stopped => std::future::pending().await,
    }
}

async fn run_session(
    id: u64,
    stream: TcpStream,
    remote: SocketAddr,
    mut queue: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    server: mpsc::Sender<ServerCommand>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut scratch = [0u8; 512];

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break SessionEnd::Local,
            payload = queue.recv() => match payload {
                Some(payload) => {
                    if let Err(e) = writer.write_all(&payload).await {
                        break SessionEnd::WriteFailed(e);
                    }
                }
                None => break SessionEnd::Local,
            },
            read = reader.read(&mut scratch) => match read {
                Ok(0) => break SessionEnd::PeerClosed,
                // Subscribers are read-only
                Ok(n) => tracing::debug!("Ignoring {} bytes from subscriber {}", n, remote),
                Err(e) => break SessionEnd::ReadFailed(e),
            },
        }
    };

    let _ = writer.shutdown().await;
    let _ = server.send(ServerCommand::SessionClosed { id, end }).await;
}
