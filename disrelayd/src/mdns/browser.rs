use std::collections::HashMap;
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use anyhow::{Context, Result};
use shared::types::{Service, ServiceKey};
use crate::events::{Event, EventSender};

/// Browse for relays of `service_type` and feed resolve/remove events to the
/// state thread until cancelled.
pub async fn run_browser(
    daemon: ServiceDaemon,
    service_type: String,
    events: EventSender,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Browsing for {}", service_type);

    let receiver = daemon
        .browse(&service_type)
        .with_context(|| format!("Failed to browse {}", service_type))?;

    let mut names = ResolvedNames::default();

    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let (service, replaced) = names.on_resolved(&info);
                        if let Some(stale) = replaced {
                            tracing::debug!("{} now resolves as {}", stale, service.key());
                            events.emit(Event::Removed(stale)).await;
                        }
                        tracing::debug!("Resolved service: {}", service.key());
                        events.emit(Event::Resolved(service)).await;
                    }
                    Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                        match names.on_removed(&fullname) {
                            Some(key) => {
                                tracing::debug!("Service removed: {}", fullname);
                                events.emit(Event::Removed(key)).await;
                            }
                            None => {
                                tracing::debug!("Removal for never-resolved {}", fullname);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("mDNS browse channel closed: {}", e);
                        break;
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                if let Err(e) = daemon.stop_browse(&service_type) {
                    tracing::debug!("Failed to stop browse: {}", e);
                }
                break;
            }
        }
    }

    Ok(())
}

/// Removal events only carry the full name, so remember which key each
/// resolved full name maps to.
#[derive(Debug, Default)]
struct ResolvedNames {
    keys: HashMap<String, ServiceKey>,
}

impl ResolvedNames {
    /// Returns the service plus the key this full name used to resolve to,
    /// if that differs (e.g. the host changed).
    fn on_resolved(&mut self, info: &ServiceInfo) -> (Service, Option<ServiceKey>) {
        let service = service_from_info(info);
        let replaced = self
            .keys
            .insert(info.get_fullname().to_string(), service.key())
            .filter(|previous| *previous != service.key());
        (service, replaced)
    }

    fn on_removed(&mut self, fullname: &str) -> Option<ServiceKey> {
        self.keys.remove(fullname)
    }
}

/// Convert an mdns-sd ServiceInfo to our Service
fn service_from_info(info: &ServiceInfo) -> Service {
    let service_type = info.get_type().to_string();

    Service {
        service_name: instance_name(info.get_fullname(), &service_type),
        host_name: info.get_hostname().to_string(),
        address: preferred_address(info.get_addresses().iter().copied()).map(|ip| ip.to_string()),
        service_type,
        port: info.get_port(),
    }
}

/// IPv4 first, otherwise whatever the resolver found
fn preferred_address(addresses: impl Iterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut fallback = None;
    for address in addresses {
        if address.is_ipv4() {
            return Some(address);
        }
        fallback.get_or_insert(address);
    }
    fallback
}

/// "ESPDU-PRODUCER._dis._tcp.local." -> "ESPDU-PRODUCER"
fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use shared::protocol::DIS_SERVICE_TYPE;

    #[test]
    fn test_instance_name() {
        assert_eq!(
            instance_name("ESPDU-PRODUCER._dis._tcp.local.", DIS_SERVICE_TYPE),
            "ESPDU-PRODUCER"
        );
        assert_eq!(instance_name("odd-name", DIS_SERVICE_TYPE), "odd-name");
    }

    #[test]
    fn test_preferred_address() {
        let v6 = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));
        let v4 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        assert_eq!(preferred_address([v6, v4].into_iter()), Some(v4));
        assert_eq!(preferred_address([v6].into_iter()), Some(v6));
        assert_eq!(preferred_address(std::iter::empty()), None);
    }

    fn info(instance: &str, host: &str, ip: &str) -> ServiceInfo {
        ServiceInfo::new(
            DIS_SERVICE_TYPE,
            instance,
            host,
            ip,
            9000,
            HashMap::<String, String>::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_service_from_info() {
        let info = info("ESPDU-PRODUCER", "sim-01.local.", "10.0.0.1");

        let service = service_from_info(&info);
        assert_eq!(service.service_name, "ESPDU-PRODUCER");
        assert_eq!(service.host_name, "sim-01.local.");
        assert_eq!(service.address.as_deref(), Some("10.0.0.1"));
        assert_eq!(service.service_type, DIS_SERVICE_TYPE);
        assert_eq!(service.port, 9000);
    }

    #[test]
    fn test_removal_maps_back_to_resolved_key() {
        let mut names = ResolvedNames::default();
        let (service, replaced) = names.on_resolved(&info("A", "sim-01.local.", "10.0.0.1"));
        assert!(replaced.is_none());

        assert_eq!(
            names.on_removed("A._dis._tcp.local."),
            Some(ServiceKey::new("sim-01.local.", "A"))
        );
        assert_eq!(service.key(), ServiceKey::new("sim-01.local.", "A"));

        // Already consumed
        assert_eq!(names.on_removed("A._dis._tcp.local."), None);
    }

    #[test]
    fn test_removal_of_unknown_name() {
        let mut names = ResolvedNames::default();
        names.on_resolved(&info("A", "sim-01.local.", "10.0.0.1"));

        assert_eq!(names.on_removed("B._dis._tcp.local."), None);
    }

    #[test]
    fn test_re_resolve_replaces_key() {
        let mut names = ResolvedNames::default();
        names.on_resolved(&info("A", "sim-01.local.", "10.0.0.1"));

        // Same host again is not a replacement
        let (_, replaced) = names.on_resolved(&info("A", "sim-01.local.", "10.0.0.2"));
        assert!(replaced.is_none());

        let (service, replaced) = names.on_resolved(&info("A", "sim-02.local.", "10.0.0.3"));
        assert_eq!(replaced, Some(ServiceKey::new("sim-01.local.", "A")));
        assert_eq!(service.host_name, "sim-02.local.");

        assert_eq!(
            names.on_removed("A._dis._tcp.local."),
            Some(ServiceKey::new("sim-02.local.", "A"))
        );
    }
}
