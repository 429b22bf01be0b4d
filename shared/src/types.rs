use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Identity of a discovered publisher.
///
/// Directory deduplication and removal matching use this pair only; the
/// address is deliberately not part of it because a removal event may no
/// longer carry one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Hostname, e.g. "sim-01.local."
    pub host_name: String,

    /// Publisher-assigned instance name, e.g. "ESPDU-PRODUCER"
    pub service_name: String,
}

impl ServiceKey {
    pub fn new(host_name: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            service_name: service_name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service_name, self.host_name)
    }
}

/// A publisher discovered over mDNS (or our own advertisement).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Instance name assigned by the publisher
    pub service_name: String,

    /// Hostname the record resolved to
    pub host_name: String,

    /// Reachable address; absent when the resolver no longer knows one
    pub address: Option<String>,

    /// Service type, e.g. "_dis._tcp.local."
    pub service_type: String,

    /// Relay port
    pub port: u16,
}

impl Service {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.host_name, &self.service_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribed,
}

/// Read-only view of a directory entry handed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceView {
    #[serde(flatten)]
    pub service: Service,
    pub subscription_state: SubscriptionState,
    pub discovered_at: DateTime<Utc>,
}

/// Observer-visible state of the local relay server.
///
/// `listen_port` is 0 while stopped, -1 while binding and the bound port once
/// listening. A stopped server never reports active sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub listen_port: i32,
    pub active_sessions: usize,
    pub advertised_name: Option<String>,
}

impl RelayStatus {
    pub const STOPPED: i32 = 0;
    pub const STARTING: i32 = -1;

    pub fn stopped() -> Self {
        Self {
            listen_port: Self::STOPPED,
            active_sessions: 0,
            advertised_name: None,
        }
    }

    pub fn starting() -> Self {
        Self {
            listen_port: Self::STARTING,
            ..Self::stopped()
        }
    }

    pub fn listening(port: u16, active_sessions: usize, advertised_name: Option<String>) -> Self {
        Self {
            listen_port: i32::from(port),
            active_sessions,
            advertised_name,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listen_port > 0
    }
}

impl Default for RelayStatus {
    fn default() -> Self {
        Self::stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ignores_address_and_type() {
        let a = Service {
            service_name: "A".to_string(),
            host_name: "h1".to_string(),
            address: Some("10.0.0.1".to_string()),
            service_type: "t".to_string(),
            port: 9000,
        };
        let b = Service {
            address: None,
            service_type: "other".to_string(),
            port: 1,
            ..a.clone()
        };

        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().to_string(), "A@h1");
    }

    #[test]
    fn test_status_constructors() {
        assert_eq!(RelayStatus::default().listen_port, 0);
        assert_eq!(RelayStatus::default().active_sessions, 0);
        assert_eq!(RelayStatus::starting().listen_port, -1);
        assert!(!RelayStatus::starting().is_listening());
        assert!(RelayStatus::listening(4000, 2, None).is_listening());
    }
}
