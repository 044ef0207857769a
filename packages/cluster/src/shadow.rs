// ABOUTME: Process-local shadow of the pod behind each container
// ABOUTME: Tracks NoResource -> Pending -> Ready -> Terminating -> Gone from observations and commands

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::client::PodObservation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    NoResource,
    Pending,
    Ready,
    Terminating,
    Gone,
}

impl ShadowState {
    /// Next state after observing the pod, or observing that it is absent.
    pub fn observe(self, pod: Option<&PodObservation>) -> Self {
        match (self, pod) {
            // Once deletion was requested, absence means the delete finished.
            (Self::Terminating | Self::Gone, None) => Self::Gone,
            (_, None) => Self::NoResource,
            (_, Some(pod)) if pod.terminating => Self::Terminating,
            (_, Some(pod)) if pod.is_ready() => Self::Ready,
            (_, Some(pod)) if pod.phase.is_terminal() => Self::Gone,
            (Self::Terminating, Some(_)) => Self::Terminating,
            (_, Some(_)) => Self::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShadowEntry {
    pub pod_name: String,
    pub state: ShadowState,
    pub last_seen: Option<PodObservation>,
    pub updated_at: DateTime<Utc>,
}

/// Best-effort view of cluster state keyed by container id. Losing it only
/// costs a re-query.
#[derive(Debug, Default)]
pub struct ShadowTable {
    entries: Mutex<HashMap<String, ShadowEntry>>,
}

impl ShadowTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, container_id: &str, pod_name: &str, f: F) -> ShadowState
    where
        F: FnOnce(&mut ShadowEntry),
    {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = entries
            .entry(container_id.to_string())
            .or_insert_with(|| ShadowEntry {
                pod_name: pod_name.to_string(),
                state: ShadowState::NoResource,
                last_seen: None,
                updated_at: Utc::now(),
            });
        let before = entry.state;
        f(entry);
        entry.updated_at = Utc::now();
        if before != entry.state {
            debug!(
                "Pod {} for container {}: {:?} -> {:?}",
                entry.pod_name, container_id, before, entry.state
            );
        }
        entry.state
    }

    pub fn observe(
        &self,
        container_id: &str,
        pod_name: &str,
        pod: Option<&PodObservation>,
    ) -> ShadowState {
        self.update(container_id, pod_name, |entry| {
            entry.state = entry.state.observe(pod);
            entry.last_seen = pod.cloned();
        })
    }

    /// A create was submitted for the pod.
    pub fn created(&self, container_id: &str, pod_name: &str) -> ShadowState {
        self.update(container_id, pod_name, |entry| {
            if matches!(entry.state, ShadowState::NoResource | ShadowState::Gone) {
                entry.state = ShadowState::Pending;
            }
        })
    }

    /// A delete was requested for the pod.
    pub fn terminating(&self, container_id: &str, pod_name: &str) -> ShadowState {
        self.update(container_id, pod_name, |entry| {
            entry.state = ShadowState::Terminating;
        })
    }

    pub fn get(&self, container_id: &str) -> Option<ShadowEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(container_id)
            .cloned()
    }

    pub fn forget(&self, container_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(container_id);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PodPhase;

    fn pod(phase: PodPhase, ready: bool) -> PodObservation {
        let mut pod = PodObservation::new("kubedock-1", phase);
        pod.ready = ready;
        pod
    }

    #[test]
    fn test_happy_path() {
        let table = ShadowTable::new();
        assert_eq!(table.created("c1", "kubedock-1"), ShadowState::Pending);
        assert_eq!(
            table.observe("c1", "kubedock-1", Some(&pod(PodPhase::Pending, false))),
            ShadowState::Pending
        );
        assert_eq!(
            table.observe("c1", "kubedock-1", Some(&pod(PodPhase::Running, true))),
            ShadowState::Ready
        );
        assert_eq!(table.terminating("c1", "kubedock-1"), ShadowState::Terminating);
        assert_eq!(table.observe("c1", "kubedock-1", None), ShadowState::Gone);
    }

    #[test]
    fn test_absence_before_delete_is_no_resource() {
        let table = ShadowTable::new();
        assert_eq!(table.observe("c1", "kubedock-1", None), ShadowState::NoResource);
    }

    #[test]
    fn test_terminating_sticks_while_pod_lingers() {
        let state = ShadowState::Terminating.observe(Some(&pod(PodPhase::Running, false)));
        assert_eq!(state, ShadowState::Terminating);
    }

    #[test]
    fn test_terminal_phase_is_gone() {
        let state = ShadowState::Ready.observe(Some(&pod(PodPhase::Succeeded, false)));
        assert_eq!(state, ShadowState::Gone);
    }

    #[test]
    fn test_forget() {
        let table = ShadowTable::new();
        table.created("c1", "kubedock-1");
        assert_eq!(table.len(), 1);
        table.forget("c1");
        assert!(table.is_empty());
        assert!(table.get("c1").is_none());
    }
}
