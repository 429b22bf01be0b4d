use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use mdns_sd::{ServiceDaemon, ServiceInfo, UnregisterStatus};
use tokio::sync::{mpsc, oneshot};
use anyhow::{Context, Result};
use crate::config::DiscoveryConfig;
use crate::error::RelayError;

const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(1);

/// A completed advertisement, needed to withdraw it later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub instance_name: String,
    pub fullname: String,
}

/// Publishes the relay endpoint on the network.
///
/// Both calls may block on network I/O; callers go through [`AdvertiseWorker`].
pub trait Advertise: Send + Sync + 'static {
    fn advertise(&self, port: u16, name: &str) -> Result<Registration, RelayError>;

    /// Safe to call with `None` or with a registration that already expired.
    fn withdraw(&self, registration: Option<&Registration>);
}

enum WorkerCommand {
    Advertise {
        generation: u64,
        port: u16,
        name: String,
    },
    Withdraw(oneshot::Sender<()>),
}

/// Outcome of one queued advertisement.
#[derive(Debug)]
pub struct Advertised {
    pub generation: u64,
    pub result: Result<Registration, RelayError>,
}

/// Runs every advertise and withdraw on one thread, in the order they were
/// queued. The thread owns the live registration, so a withdraw always
/// removes whatever the previous advertise put on the network and never
/// one queued after it.
pub struct AdvertiseWorker {
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl AdvertiseWorker {
    pub fn spawn(advertiser: Arc<dyn Advertise>) -> (Self, mpsc::UnboundedReceiver<Advertised>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        thread::spawn(move || {
            let mut live: Option<Registration> = None;

            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    WorkerCommand::Advertise { generation, port, name } => {
                        let result = advertiser.advertise(port, &name);
                        if let Ok(registration) = &result {
                            live = Some(registration.clone());
                        }
                        let _ = done_tx.send(Advertised { generation, result });
                    }
                    WorkerCommand::Withdraw(reply) => {
                        advertiser.withdraw(live.take().as_ref());
                        let _ = reply.send(());
                    }
                }
            }

            advertiser.withdraw(live.take().as_ref());
            tracing::debug!("Advertise worker finished");
        });

        (Self { tx }, done_rx)
    }

    /// Queue an advertisement. The result arrives on the receiver returned by `spawn`.
    pub fn advertise(&self, generation: u64, port: u16, name: String) {
        if self.tx.send(WorkerCommand::Advertise { generation, port, name }).is_err() {
            tracing::error!("Advertise worker is gone, port {} not advertised", port);
        }
    }

    /// Withdraw the live registration, waiting for any advertise queued before it.
    pub async fn withdraw(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(WorkerCommand::Withdraw(reply)).is_err() {
            tracing::error!("Advertise worker is gone");
            return;
        }
        let _ = rx.await;
    }
}

pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    service_type: String,
    host_name: String,
    txt: HashMap<String, String>,
}

impl MdnsAdvertiser {
    pub fn new(daemon: ServiceDaemon, config: &DiscoveryConfig) -> Result<Self> {
        let hostname = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();

        Ok(Self {
            daemon,
            service_type: config.service_type.clone(),
            host_name: format!("{}.local.", hostname),
            txt: txt_properties(&config.attribute),
        })
    }
}

impl Advertise for MdnsAdvertiser {
    fn advertise(&self, port: u16, name: &str) -> Result<Registration, RelayError> {
        let service_info = ServiceInfo::new(
            &self.service_type,
            name,
            &self.host_name,
            "",
            port,
            self.txt.clone(),
        )
        .map_err(|e| RelayError::RegistrationFailed(format!("invalid service info: {}", e)))?
        .enable_addr_auto();

        let fullname = service_info.get_fullname().to_string();
        self.daemon
            .register(service_info)
            .map_err(|e| RelayError::RegistrationFailed(e.to_string()))?;

        tracing::info!(
            "Registered {} as {} on port {}",
            self.service_type,
            name,
            port
        );

        Ok(Registration {
            instance_name: name.to_string(),
            fullname,
        })
    }

    fn withdraw(&self, registration: Option<&Registration>) {
        let Some(registration) = registration else {
            return;
        };

        let receiver = match self.daemon.unregister(&registration.fullname) {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::error!("Failed to unregister {}: {}", registration.fullname, e);
                return;
            }
        };

        match receiver.recv_timeout(UNREGISTER_TIMEOUT) {
            Ok(UnregisterStatus::OK) => {
                tracing::info!("Unregistered {}", registration.fullname);
            }
            Ok(UnregisterStatus::NotFound) => {
                tracing::debug!("{} was not registered", registration.fullname);
            }
            Err(e) => {
                tracing::warn!("No unregister confirmation for {}: {}", registration.fullname, e);
            }
        }
    }
}

/// Turn the free-text attribute into TXT properties. A bare word becomes a
/// key with an empty value.
fn txt_properties(attribute: &str) -> HashMap<String, String> {
    attribute
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
