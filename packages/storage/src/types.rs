// ABOUTME: Entity types owned by the store: containers, networks and images
// ABOUTME: Container lifecycle phase plus helpers for env parsing and port bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{Result, StorageError};

/// Name of the network every new container joins unless told otherwise.
pub const DEFAULT_NETWORK: &str = "bridge";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContainerPhase {
    Created,
    Running,
    Stopped,
    Deleted,
}

impl ContainerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "deleted" => Ok(Self::Deleted),
            _ => Err(StorageError::InvalidPhase(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Container-side port numbers declared by the client.
    pub exposed_ports: BTreeSet<u16>,
    pub labels: BTreeMap<String, String>,
    pub binds: Vec<String>,
    /// Ids of the networks this container belongs to.
    pub networks: BTreeSet<String>,
    /// Externally reachable port -> declared container port.
    pub mapped_ports: BTreeMap<u16, u16>,
    pub phase: ContainerPhase,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Container {
    /// A fresh, unsaved container for `image`. The store assigns the id.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            image: image.into(),
            command: Vec::new(),
            env: BTreeMap::new(),
            exposed_ports: BTreeSet::new(),
            labels: BTreeMap::new(),
            binds: Vec::new(),
            networks: BTreeSet::new(),
            mapped_ports: BTreeMap::new(),
            phase: ContainerPhase::Created,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
        }
    }

    /// Parse `KEY=VALUE` entries into the env mapping. Entries without `=`
    /// become keys with an empty value.
    pub fn parse_env<I, S>(entries: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        entries
            .into_iter()
            .filter_map(|entry| {
                let entry = entry.as_ref();
                if entry.is_empty() {
                    return None;
                }
                match entry.split_once('=') {
                    Some((key, value)) => Some((key.to_string(), value.to_string())),
                    None => Some((entry.to_string(), String::new())),
                }
            })
            .collect()
    }

    /// The env mapping rendered back as `KEY=VALUE` entries.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    pub fn connect_network(&mut self, network_id: impl Into<String>) {
        self.networks.insert(network_id.into());
    }

    pub fn disconnect_network(&mut self, network_id: &str) {
        self.networks.remove(network_id);
    }

    /// Record that a termination signal was sent.
    pub fn signal_stop(&mut self) {
        if matches!(self.phase, ContainerPhase::Created | ContainerPhase::Running) {
            self.phase = ContainerPhase::Stopped;
            self.stopped_at = Some(Utc::now());
        }
    }

    /// Record a successful start along with newly allocated port mappings.
    /// Existing mappings are never replaced.
    pub fn mark_running(&mut self, allocated: &BTreeMap<u16, u16>) {
        for (external, internal) in allocated {
            if !self.mapped_ports.values().any(|p| p == internal) {
                self.mapped_ports.insert(*external, *internal);
            }
        }
        self.phase = ContainerPhase::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Exposed ports that do not have an external mapping yet.
    pub fn unmapped_ports(&self) -> Vec<u16> {
        let mapped: BTreeSet<u16> = self.mapped_ports.values().copied().collect();
        self.exposed_ports
            .iter()
            .filter(|p| !mapped.contains(p))
            .copied()
            .collect()
    }

    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(12);
        &self.id[..end]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub members: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Network {
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_NETWORK
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    pub id: String,
    /// Image reference as given by the client, e.g. `alpine:3.20`.
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_phase_round_trip_strings() {
        for phase in [
            ContainerPhase::Created,
            ContainerPhase::Running,
            ContainerPhase::Stopped,
            ContainerPhase::Deleted,
        ] {
            assert_eq!(ContainerPhase::from_str(phase.as_str()).unwrap(), phase);
        }
        assert!(matches!(
            ContainerPhase::from_str("paused"),
            Err(StorageError::InvalidPhase(_))
        ));
    }

    #[test]
    fn test_parse_env() {
        let env = Container::parse_env(["FOO=bar", "EMPTY=", "FLAG", "", "URL=a=b"]);
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(env.get("EMPTY").map(String::as_str), Some(""));
        assert_eq!(env.get("FLAG").map(String::as_str), Some(""));
        assert_eq!(env.get("URL").map(String::as_str), Some("a=b"));
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn test_signal_stop_only_from_live_phases() {
        let mut container = Container::new("alpine");
        container.signal_stop();
        assert_eq!(container.phase, ContainerPhase::Stopped);
        assert!(container.stopped_at.is_some());

        container.phase = ContainerPhase::Deleted;
        container.signal_stop();
        assert_eq!(container.phase, ContainerPhase::Deleted);
    }

    #[test]
    fn test_mark_running_keeps_existing_mappings() {
        let mut container = Container::new("nginx");
        container.exposed_ports = BTreeSet::from([80, 443]);
        container.mark_running(&BTreeMap::from([(30080, 80)]));
        assert_eq!(container.unmapped_ports(), vec![443]);

        // A second allocation for port 80 must not displace the first one.
        container.mark_running(&BTreeMap::from([(31000, 80), (30443, 443)]));
        assert_eq!(
            container.mapped_ports,
            BTreeMap::from([(30080, 80), (30443, 443)])
        );
        assert!(container.unmapped_ports().is_empty());
        assert_eq!(container.phase, ContainerPhase::Running);
    }
}
