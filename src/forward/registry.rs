use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::ForwardError;
use crate::target::TargetKind;

const SESSION_ID_PREFIX: &str = "pf-";

/// Point-in-time view of a port-forward session, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortForwardSession {
    pub id: String,
    pub namespace: String,
    pub target_type: TargetKind,
    /// Pod or service name as the caller gave it.
    pub target: String,
    /// The pod traffic actually goes to.
    pub pod_name: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub pod_port: u16,
    /// Currently bridged local connections.
    pub connections: usize,
}

/// What `start` decided, before an ID is assigned.
#[derive(Debug, Clone)]
pub(crate) struct SessionSpec {
    pub namespace: String,
    pub target_type: TargetKind,
    pub target: String,
    pub pod_name: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub pod_port: u16,
}

/// Handles to the tasks that make up a running session.
pub(crate) struct SessionControl {
    /// Stops the accept loop and aborts tunnel negotiations.
    pub cancel: CancellationToken,
    /// Force-closes bridged connections once the drain grace runs out.
    pub kill: CancellationToken,
    pub tracker: TaskTracker,
    pub accept: Option<JoinHandle<()>>,
    pub connections: Arc<AtomicUsize>,
}

/// Everything `stop` needs, taken out of the registry under the lock.
pub(crate) struct StopHandle {
    pub cancel: CancellationToken,
    pub kill: CancellationToken,
    pub tracker: TaskTracker,
    pub accept: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Active,
    Stopping,
}

struct SessionEntry {
    spec: SessionSpec,
    state: SessionState,
    control: SessionControl,
}

impl SessionEntry {
    fn snapshot(&self, seq: u64) -> PortForwardSession {
        PortForwardSession {
            id: format_session_id(seq),
            namespace: self.spec.namespace.clone(),
            target_type: self.spec.target_type,
            target: self.spec.target.clone(),
            pod_name: self.spec.pod_name.clone(),
            local_port: self.spec.local_port,
            remote_port: self.spec.remote_port,
            pod_port: self.spec.pod_port,
            connections: self.control.connections.load(Ordering::Acquire),
        }
    }
}

struct RegistryInner {
    sessions: BTreeMap<u64, SessionEntry>,
    next_seq: u64,
    max_sessions: usize,
}

/// Thread-safe map of session ID to session state.
///
/// The lock is only held for map operations, never across I/O. Sessions in
/// the `Stopping` state keep their entry (so their local port stays claimed)
/// but are hidden from [`list`](Self::list) and cannot be stopped twice.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new() -> Self {
        Self::with_max_sessions(Self::DEFAULT_MAX_SESSIONS)
    }

    pub fn with_max_sessions(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: BTreeMap::new(),
                next_seq: 1,
                max_sessions,
            })),
        }
    }

    /// Whether another session fits under the cap.
    pub fn has_capacity(&self) -> bool {
        let inner = self.inner.read();
        inner.sessions.len() < inner.max_sessions
    }

    /// ID of the session currently owning `local_port`, if any.
    pub fn port_owner(&self, local_port: u16) -> Option<String> {
        let inner = self.inner.read();
        inner
            .sessions
            .iter()
            .find(|(_, e)| e.spec.local_port == local_port)
            .map(|(seq, _)| format_session_id(*seq))
    }

    /// Assign the next ID and register a session whose tasks are started by
    /// `start`, all under the write lock so the session becomes visible
    /// exactly when its tasks exist.
    ///
    /// `start` is not called when the registry is full.
    pub(crate) fn insert_with<F>(
        &self,
        spec: SessionSpec,
        start: F,
    ) -> Result<PortForwardSession, ForwardError>
    where
        F: FnOnce(&str) -> SessionControl,
    {
        let mut inner = self.inner.write();
        if inner.sessions.len() >= inner.max_sessions {
            return Err(ForwardError::MaxSessionsReached);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let id = format_session_id(seq);
        let control = start(&id);
        let entry = SessionEntry {
            spec,
            state: SessionState::Active,
            control,
        };
        let snapshot = entry.snapshot(seq);
        inner.sessions.insert(seq, entry);
        Ok(snapshot)
    }

    /// Move an active session to `Stopping` and hand back its task handles.
    pub(crate) fn begin_stop(&self, id: &str) -> Result<StopHandle, ForwardError> {
        let not_found = || ForwardError::SessionNotFound(id.to_string());
        let seq = parse_session_id(id).ok_or_else(not_found)?;

        let mut inner = self.inner.write();
        let entry = inner.sessions.get_mut(&seq).ok_or_else(not_found)?;
        if entry.state != SessionState::Active {
            return Err(not_found());
        }
        entry.state = SessionState::Stopping;
        Ok(StopHandle {
            cancel: entry.control.cancel.clone(),
            kill: entry.control.kill.clone(),
            tracker: entry.control.tracker.clone(),
            accept: entry.control.accept.take(),
        })
    }

    /// Drop a session's entry. Returns false if it was already gone.
    pub(crate) fn remove(&self, id: &str) -> bool {
        let Some(seq) = parse_session_id(id) else {
            return false;
        };
        self.inner.write().sessions.remove(&seq).is_some()
    }

    /// Snapshot of active sessions, ascending by ID.
    pub fn list(&self) -> Vec<PortForwardSession> {
        let inner = self.inner.read();
        inner
            .sessions
            .iter()
            .filter(|(_, e)| e.state == SessionState::Active)
            .map(|(seq, e)| e.snapshot(*seq))
            .collect()
    }

    /// Number of registered sessions, including ones still stopping.
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn format_session_id(seq: u64) -> String {
    format!("{SESSION_ID_PREFIX}{seq}")
}

fn parse_session_id(id: &str) -> Option<u64> {
    let digits = id.strip_prefix(SESSION_ID_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// RAII guard that decrements a session's connection count on drop.
pub(crate) struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(local_port: u16) -> SessionSpec {
        SessionSpec {
            namespace: "default".into(),
            target_type: TargetKind::Pod,
            target: "nginx".into(),
            pod_name: "nginx".into(),
            local_port,
            remote_port: 80,
            pod_port: 80,
        }
    }

    fn idle_control() -> SessionControl {
        SessionControl {
            cancel: CancellationToken::new(),
            kill: CancellationToken::new(),
            tracker: TaskTracker::new(),
            accept: None,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn ids_are_sequential_and_never_reused() {
        let registry = SessionRegistry::new();
        let a = registry.insert_with(spec(8080), |_| idle_control()).unwrap();
        let b = registry.insert_with(spec(8081), |_| idle_control()).unwrap();
        assert_eq!(a.id, "pf-1");
        assert_eq!(b.id, "pf-2");

        registry.begin_stop("pf-2").unwrap();
        assert!(registry.remove("pf-2"));
        let c = registry.insert_with(spec(8081), |_| idle_control()).unwrap();
        assert_eq!(c.id, "pf-3");
    }

    #[test]
    fn start_closure_sees_assigned_id() {
        let registry = SessionRegistry::new();
        let mut seen = String::new();
        registry
            .insert_with(spec(8080), |id| {
                seen = id.to_string();
                idle_control()
            })
            .unwrap();
        assert_eq!(seen, "pf-1");
    }

    #[test]
    fn list_is_sorted_numerically_and_hides_stopping() {
        let registry = SessionRegistry::new();
        for port in 0..11 {
            registry.insert_with(spec(9000 + port), |_| idle_control()).unwrap();
        }
        registry.begin_stop("pf-3").unwrap();

        let ids: Vec<String> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 10);
        assert_eq!(ids[0], "pf-1");
        assert_eq!(ids[1], "pf-2");
        assert_eq!(ids[2], "pf-4");
        assert_eq!(ids[9], "pf-11");
        // Still registered while stopping.
        assert_eq!(registry.len(), 11);
    }

    #[test]
    fn begin_stop_twice_is_not_found() {
        let registry = SessionRegistry::new();
        registry.insert_with(spec(8080), |_| idle_control()).unwrap();
        assert!(registry.begin_stop("pf-1").is_ok());
        assert!(matches!(
            registry.begin_stop("pf-1"),
            Err(ForwardError::SessionNotFound(id)) if id == "pf-1"
        ));
    }

    #[test]
    fn begin_stop_unknown_ids() {
        let registry = SessionRegistry::new();
        for id in ["pf-1", "pf-", "pf-x", "1", "", "pf--1"] {
            assert!(
                matches!(registry.begin_stop(id), Err(ForwardError::SessionNotFound(_))),
                "id {id:?}"
            );
        }
    }

    #[test]
    fn port_owner_tracks_stopping_sessions_until_removed() {
        let registry = SessionRegistry::new();
        registry.insert_with(spec(8080), |_| idle_control()).unwrap();
        assert_eq!(registry.port_owner(8080).as_deref(), Some("pf-1"));
        assert_eq!(registry.port_owner(8081), None);

        registry.begin_stop("pf-1").unwrap();
        assert_eq!(registry.port_owner(8080).as_deref(), Some("pf-1"));
        registry.remove("pf-1");
        assert_eq!(registry.port_owner(8080), None);
    }

    #[test]
    fn max_sessions_is_enforced() {
        let registry = SessionRegistry::with_max_sessions(1);
        registry.insert_with(spec(8080), |_| idle_control()).unwrap();
        assert!(!registry.has_capacity());
        let mut called = false;
        let result = registry.insert_with(spec(8081), |_| {
            called = true;
            idle_control()
        });
        assert!(matches!(result, Err(ForwardError::MaxSessionsReached)));
        assert!(!called);
    }

    #[test]
    fn snapshot_reports_live_connections() {
        let registry = SessionRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let shared = counter.clone();
        registry
            .insert_with(spec(8080), move |_| SessionControl {
                connections: shared,
                ..idle_control()
            })
            .unwrap();

        let guard = ConnectionGuard::new(&counter);
        assert_eq!(registry.list()[0].connections, 1);
        drop(guard);
        assert_eq!(registry.list()[0].connections, 0);
    }
}
