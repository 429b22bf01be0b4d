use chrono::{DateTime, Utc};
use shared::types::{Service, ServiceKey, ServiceView, SubscriptionState};
use crate::error::RelayError;
use crate::relay::client::ConnectionHandle;

/// Subscription state of an entry. The connection lives inside the
/// `Subscribed` variant so an entry can never hold one while unsubscribed.
#[derive(Debug, Clone, Default)]
pub enum Subscription {
    #[default]
    Unsubscribed,
    Subscribed(ConnectionHandle),
}

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub service: Service,
    pub subscription: Subscription,
    pub discovered_at: DateTime<Utc>,
}

impl DirectoryEntry {
    fn new(service: Service) -> Self {
        Self {
            service,
            subscription: Subscription::Unsubscribed,
            discovered_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ServiceKey {
        self.service.key()
    }

    pub fn state(&self) -> SubscriptionState {
        match self.subscription {
            Subscription::Unsubscribed => SubscriptionState::Unsubscribed,
            Subscription::Subscribed(_) => SubscriptionState::Subscribed,
        }
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        match &self.subscription {
            Subscription::Subscribed(connection) => Some(connection),
            Subscription::Unsubscribed => None,
        }
    }

    pub fn view(&self) -> ServiceView {
        ServiceView {
            service: self.service.clone(),
            subscription_state: self.state(),
            discovered_at: self.discovered_at,
        }
    }

    fn matches(&self, key: &ServiceKey) -> bool {
        self.service.host_name == key.host_name && self.service.service_name == key.service_name
    }
}

/// Discovered publishers, in discovery order, plus the current selection.
///
/// Only the state thread holds one of these.
#[derive(Debug, Default)]
pub struct Directory {
    entries: Vec<DirectoryEntry>,
    selected: Option<ServiceKey>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly resolved service. Returns false if its key is already present.
    pub fn on_resolved(&mut self, service: Service) -> bool {
        let key = service.key();
        if self.entries.iter().any(|entry| entry.matches(&key)) {
            return false;
        }
        self.entries.push(DirectoryEntry::new(service));
        true
    }

    /// Remove the first entry matching `key`, if any. The caller owns the
    /// returned entry and must close its connection.
    pub fn on_removed(&mut self, key: &ServiceKey) -> Option<DirectoryEntry> {
        let index = self.entries.iter().position(|entry| entry.matches(key))?;
        if self.selected.as_ref() == Some(key) {
            self.selected = None;
        }
        Some(self.entries.remove(index))
    }

    pub fn select(&mut self, key: &ServiceKey) -> Result<&DirectoryEntry, RelayError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.matches(key))
            .ok_or_else(|| RelayError::UnknownService(key.clone()))?;
        self.selected = Some(key.clone());
        Ok(entry)
    }

    pub fn selected(&self) -> Result<&DirectoryEntry, RelayError> {
        self.selected
            .as_ref()
            .and_then(|key| self.get(key))
            .ok_or(RelayError::NoSelection)
    }

    pub fn get(&self, key: &ServiceKey) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|entry| entry.matches(key))
    }

    /// Record an opened connection. Hands the connection back if the entry is
    /// gone or already holds one.
    pub fn attach(&mut self, key: &ServiceKey, connection: ConnectionHandle) -> Result<(), ConnectionHandle> {
        match self.entries.iter_mut().find(|entry| entry.matches(key)) {
            Some(entry) if matches!(entry.subscription, Subscription::Unsubscribed) => {
                entry.subscription = Subscription::Subscribed(connection);
                Ok(())
            }
            _ => Err(connection),
        }
    }

    /// Reset an entry to `Unsubscribed` if it still holds `connection_id`.
    pub fn detach(&mut self, key: &ServiceKey, connection_id: u64) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.matches(key)) else {
            return false;
        };
        match &entry.subscription {
            Subscription::Subscribed(connection) if connection.id() == connection_id => {
                entry.subscription = Subscription::Unsubscribed;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<ServiceView> {
        self.entries.iter().map(DirectoryEntry::view).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
