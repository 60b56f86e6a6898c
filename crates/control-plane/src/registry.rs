//! Live node links.
//!
//! The registry maps each node id to its one current [`NodeLink`]. A link
//! owns the table of calls still waiting on it, so closing a link is the
//! single place where outstanding calls fail with `NodeDisconnected`.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use chrono::{DateTime, Utc};
use common::api::SessionStatus;
use common::protocol::TunnelFrame;
use metrics::{counter, gauge};
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use uuid::Uuid;

use crate::correlator::{CallError, CallReply};

pub type ReplySlot = oneshot::Sender<Result<CallReply, CallError>>;

/// One generation of a node's duplex channel.
pub struct NodeLink {
    pub node_id: String,
    pub link_id: Uuid,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<TunnelFrame>,
    last_frame: Mutex<Instant>,
    pending: Mutex<PendingTable>,
    closed: watch::Sender<Option<String>>,
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    calls: HashMap<u64, ReplySlot>,
}

impl NodeLink {
    pub fn new(node_id: impl Into<String>, outbound: mpsc::Sender<TunnelFrame>) -> Arc<Self> {
        let (closed, _) = watch::channel(None);
        Arc::new(Self {
            node_id: node_id.into(),
            link_id: Uuid::new_v4(),
            connected_at: Utc::now(),
            outbound,
            last_frame: Mutex::new(Instant::now()),
            pending: Mutex::new(PendingTable::default()),
            closed,
        })
    }

    pub fn outbound(&self) -> &mpsc::Sender<TunnelFrame> {
        &self.outbound
    }

    /// Park a reply slot. Fails once the link is closed so no slot can be
    /// stranded on a dead link.
    pub fn insert_pending(&self, call_id: u64, slot: ReplySlot) -> Result<(), CallError> {
        let mut table = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            return Err(CallError::NodeDisconnected);
        }
        table.calls.insert(call_id, slot);
        Ok(())
    }

    pub fn remove_pending(&self, call_id: u64) -> bool {
        let mut table = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        table.calls.remove(&call_id).is_some()
    }

    /// Route a reply to its waiter. Returns false for unknown or already
    /// resolved call ids.
    pub fn resolve(&self, call_id: u64, reply: CallReply) -> bool {
        let slot = {
            let mut table = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            table.calls.remove(&call_id)
        };
        match slot {
            Some(slot) => slot.send(Ok(reply)).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
            .len()
    }

    /// Close the link and fail every outstanding call. Idempotent; returns
    /// how many calls were failed.
    pub fn close(&self, reason: &str) -> usize {
        let drained: Vec<ReplySlot> = {
            let mut table = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if table.closed {
                return 0;
            }
            table.closed = true;
            table.calls.drain().map(|(_, slot)| slot).collect()
        };
        let failed = drained.len();
        for slot in drained {
            let _ = slot.send(Err(CallError::NodeDisconnected));
        }
        self.closed.send_replace(Some(reason.to_string()));
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Resolves with the close reason once [`NodeLink::close`] runs.
    pub fn subscribe_closed(&self) -> watch::Receiver<Option<String>> {
        self.closed.subscribe()
    }

    pub fn touch(&self) {
        *self.last_frame.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_secs(&self) -> u64 {
        self.last_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
            .as_secs()
    }
}

impl std::fmt::Debug for NodeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLink")
            .field("node_id", &self.node_id)
            .field("link_id", &self.link_id)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct LinkFailure {
    reason: String,
    at: Instant,
}

/// Node that had a registered link when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineNode {
    pub node_id: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<NodeLink>>>>,
    failures: Arc<RwLock<HashMap<String, LinkFailure>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `link` current for its node and hand back the link it replaced.
    /// The caller is expected to close the returned link.
    pub async fn register(&self, link: Arc<NodeLink>) -> Option<Arc<NodeLink>> {
        let mut guard = self.inner.write().await;
        let previous = guard.insert(link.node_id.clone(), link.clone());
        gauge!("fleet_hub_tunnel_sessions").set(guard.len() as f64);
        drop(guard);

        self.failures.write().await.remove(&link.node_id);
        if previous.is_some() {
            counter!("fleet_hub_tunnel_disconnect_total", "reason" => "superseded").increment(1);
        }
        previous
    }

    /// Remove `link` if it is still the current one for its node. A stale
    /// link is ignored so it cannot evict a newer connection.
    pub async fn unregister(&self, link: &NodeLink, reason: &str) -> bool {
        let mut guard = self.inner.write().await;
        let is_current = guard
            .get(&link.node_id)
            .is_some_and(|current| current.link_id == link.link_id);
        if !is_current {
            return false;
        }
        guard.remove(&link.node_id);
        gauge!("fleet_hub_tunnel_sessions").set(guard.len() as f64);
        drop(guard);

        counter!("fleet_hub_tunnel_disconnect_total", "reason" => reason.to_string()).increment(1);
        self.failures.write().await.insert(
            link.node_id.clone(),
            LinkFailure {
                reason: reason.to_string(),
                at: Instant::now(),
            },
        );
        true
    }

    pub async fn lookup(&self, node_id: &str) -> Option<Arc<NodeLink>> {
        self.inner.read().await.get(node_id).cloned()
    }

    pub async fn is_online(&self, node_id: &str) -> bool {
        self.inner.read().await.contains_key(node_id)
    }

    pub async fn list_online(&self) -> BTreeSet<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn online_snapshot(&self) -> Vec<OnlineNode> {
        let guard = self.inner.read().await;
        let mut nodes: Vec<OnlineNode> = guard
            .values()
            .map(|link| OnlineNode {
                node_id: link.node_id.clone(),
                connected_at: link.connected_at,
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Refresh liveness of the current link. Frames from a superseded link
    /// are ignored.
    pub async fn touch(&self, node_id: &str, link_id: Uuid) -> bool {
        let guard = self.inner.read().await;
        match guard.get(node_id) {
            Some(link) if link.link_id == link_id => {
                link.touch();
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn status_snapshot(&self) -> Vec<SessionStatus> {
        let guard = self.inner.read().await;
        let failures = self.failures.read().await;
        let mut statuses: Vec<SessionStatus> = guard
            .values()
            .map(|link| SessionStatus {
                node_id: link.node_id.clone(),
                status: "connected".to_string(),
                connected_at: Some(link.connected_at),
                last_heartbeat_secs: Some(link.idle_secs()),
                pending_calls: Some(link.pending_count()),
                last_error: None,
                last_event_secs: None,
            })
            .collect();
        statuses.extend(
            failures
                .iter()
                .filter(|(node_id, _)| !guard.contains_key(*node_id))
                .map(|(node_id, failure)| SessionStatus {
                    node_id: node_id.clone(),
                    status: "disconnected".to_string(),
                    connected_at: None,
                    last_heartbeat_secs: None,
                    pending_calls: None,
                    last_error: Some(failure.reason.clone()),
                    last_event_secs: Some(failure.at.elapsed().as_secs()),
                }),
        );
        statuses.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        statuses
    }

    /// Drop and close every link, used on shutdown.
    pub async fn close_all(&self, reason: &str) -> usize {
        let links: Vec<Arc<NodeLink>> = {
            let mut guard = self.inner.write().await;
            let links = guard.drain().map(|(_, link)| link).collect();
            gauge!("fleet_hub_tunnel_sessions").set(0.0);
            links
        };
        for link in &links {
            link.close(reason);
        }
        links.len()
    }
}
