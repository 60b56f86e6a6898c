use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use common::protocol::{CallPayload, TunnelFrame};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::{
    sync::oneshot,
    time::{Instant, timeout_at},
};
use tracing::debug;

use crate::registry::{ConnectionRegistry, NodeLink};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Transport-level outcome of a call that produced no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("node is offline")]
    NodeOffline,
    #[error("node did not reply before the deadline")]
    TimedOut,
    #[error("node disconnected before replying")]
    NodeDisconnected,
}

impl CallError {
    pub fn code(&self) -> &'static str {
        match self {
            CallError::NodeOffline => "node_offline",
            CallError::TimedOut => "timed_out",
            CallError::NodeDisconnected => "node_disconnected",
        }
    }
}

/// Reply sent by the node. `success == false` is an application error, not
/// a transport failure.
#[derive(Debug, Clone, PartialEq)]
pub struct CallReply {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
}

/// Sends calls down node links and matches replies by call id.
#[derive(Clone)]
pub struct CallCorrelator {
    registry: ConnectionRegistry,
}

impl CallCorrelator {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Hand a call to the node's current link. The returned handle is
    /// already registered for its reply.
    pub async fn start_call(
        &self,
        node_id: &str,
        payload: CallPayload,
        deadline: Instant,
    ) -> Result<PendingCall, CallError> {
        let started = Instant::now();
        let Some(link) = self.registry.lookup(node_id).await else {
            record_outcome(Err(CallError::NodeOffline), started);
            return Err(CallError::NodeOffline);
        };

        let call_id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        // Registered before sending so an immediate reply finds its slot.
        if let Err(err) = link.insert_pending(call_id, tx) {
            record_outcome(Err(err), started);
            return Err(err);
        }
        let mut pending = PendingCall {
            link,
            call_id,
            rx,
            deadline,
            started,
            settled: false,
        };

        let frame = TunnelFrame::Call { call_id, payload };
        let sent = timeout_at(deadline, pending.link.outbound().send(frame)).await;
        let err = match sent {
            Ok(Ok(())) => {
                debug!(node_id, call_id, "call sent");
                return Ok(pending);
            }
            Ok(Err(_)) => CallError::NodeDisconnected,
            Err(_) => CallError::TimedOut,
        };
        pending.settle(Err(err));
        Err(err)
    }

    /// Send a call and wait for its single resolution.
    pub async fn dispatch(
        &self,
        node_id: &str,
        payload: CallPayload,
        timeout: Duration,
    ) -> Result<CallReply, CallError> {
        let deadline = Instant::now() + timeout;
        self.start_call(node_id, payload, deadline)
            .await?
            .wait()
            .await
    }
}

/// A call in flight. Dropping it before [`PendingCall::wait`] completes
/// withdraws the call; a later reply is then treated as unknown.
pub struct PendingCall {
    link: Arc<NodeLink>,
    call_id: u64,
    rx: oneshot::Receiver<Result<CallReply, CallError>>,
    deadline: Instant,
    started: Instant,
    settled: bool,
}

impl PendingCall {
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Block until the reply, the deadline or the link closing, whichever
    /// comes first.
    pub async fn wait(mut self) -> Result<CallReply, CallError> {
        let result = match timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::NodeDisconnected),
            Err(_) if self.link.remove_pending(self.call_id) => Err(CallError::TimedOut),
            // The slot was claimed by a reply or a close racing the deadline;
            // its value is already on the way.
            Err(_) => (&mut self.rx)
                .await
                .unwrap_or(Err(CallError::NodeDisconnected)),
        };
        self.settle(result.clone());
        result
    }

    fn settle(&mut self, result: Result<CallReply, CallError>) {
        self.settled = true;
        self.link.remove_pending(self.call_id);
        record_outcome(result.map(|_| ()), self.started);
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.settled && self.link.remove_pending(self.call_id) {
            counter!("fleet_hub_calls_total", "result" => "cancelled").increment(1);
        }
    }
}

fn record_outcome(result: Result<(), CallError>, started: Instant) {
    let label = match result {
        Ok(()) => "replied",
        Err(err) => err.code(),
    };
    counter!("fleet_hub_calls_total", "result" => label).increment(1);
    histogram!("fleet_hub_call_duration_seconds", "result" => label)
        .record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn payload(action: &str, data: Value) -> CallPayload {
        CallPayload {
            action: action.to_string(),
            data,
            task_id: None,
        }
    }

    async fn connect(
        registry: &ConnectionRegistry,
        node_id: &str,
    ) -> (Arc<NodeLink>, mpsc::Receiver<TunnelFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let link = NodeLink::new(node_id, tx);
        registry.register(link.clone()).await;
        (link, rx)
    }

    fn spawn_echo(link: Arc<NodeLink>, mut rx: mpsc::Receiver<TunnelFrame>) {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let TunnelFrame::Call { call_id, payload } = frame {
                    link.resolve(
                        call_id,
                        CallReply {
                            success: true,
                            data: payload.data,
                            error: None,
                        },
                    );
                }
            }
        });
    }

    #[tokio::test]
    async fn offline_node_fails_immediately() {
        let correlator = CallCorrelator::new(ConnectionRegistry::new());
        let err = correlator
            .dispatch("ghost", payload("ping", Value::Null), Duration::from_secs(1))
            .await
            .expect_err("offline");
        assert_eq!(err, CallError::NodeOffline);
    }

    #[tokio::test]
    async fn echo_round_trip_returns_payload() {
        let registry = ConnectionRegistry::new();
        let (link, rx) = connect(&registry, "node-a").await;
        spawn_echo(link.clone(), rx);
        let correlator = CallCorrelator::new(registry);

        let data = json!({"path": "/var/log", "depth": 2});
        let reply = correlator
            .dispatch("node-a", payload("list", data.clone()), Duration::from_secs(1))
            .await
            .expect("reply");
        assert!(reply.success);
        assert_eq!(reply.data, data);
        assert_eq!(link.pending_count(), 0);
    }

    #[tokio::test]
    async fn replies_match_by_call_id_not_order() {
        let registry = ConnectionRegistry::new();
        let (link, mut rx) = connect(&registry, "node-a").await;
        let correlator = CallCorrelator::new(registry);
        let deadline = Instant::now() + Duration::from_secs(5);

        let first = correlator
            .start_call("node-a", payload("one", json!(1)), deadline)
            .await
            .expect("first");
        let second = correlator
            .start_call("node-a", payload("two", json!(2)), deadline)
            .await
            .expect("second");
        assert_ne!(first.call_id(), second.call_id());

        let mut ids = Vec::new();
        for _ in 0..2 {
            if let Some(TunnelFrame::Call { call_id, payload }) = rx.recv().await {
                ids.push((call_id, payload.data));
            }
        }
        for (call_id, data) in ids.into_iter().rev() {
            assert!(link.resolve(
                call_id,
                CallReply {
                    success: true,
                    data,
                    error: None
                }
            ));
        }

        assert_eq!(first.wait().await.expect("first").data, json!(1));
        assert_eq!(second.wait().await.expect("second").data, json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_node_times_out_and_late_reply_is_dropped() {
        let registry = ConnectionRegistry::new();
        let (link, mut rx) = connect(&registry, "node-a").await;
        let correlator = CallCorrelator::new(registry);

        let started = Instant::now();
        let err = correlator
            .dispatch("node-a", payload("hang", Value::Null), Duration::from_millis(50))
            .await
            .expect_err("timeout");
        assert_eq!(err, CallError::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(100));
        assert_eq!(link.pending_count(), 0);

        let Some(TunnelFrame::Call { call_id, .. }) = rx.recv().await else {
            panic!("expected call frame");
        };
        assert!(!link.resolve(
            call_id,
            CallReply {
                success: true,
                data: Value::Null,
                error: None
            }
        ));
    }

    #[tokio::test]
    async fn supersede_fails_outstanding_calls() {
        let registry = ConnectionRegistry::new();
        let (_old, _rx_old) = connect(&registry, "node-a").await;
        let correlator = CallCorrelator::new(registry.clone());
        let deadline = Instant::now() + Duration::from_secs(30);

        let mut calls = Vec::new();
        for i in 0..10 {
            calls.push(
                correlator
                    .start_call("node-a", payload("slow", json!(i)), deadline)
                    .await
                    .expect("start"),
            );
        }

        let (tx, _rx_new) = mpsc::channel(16);
        let previous = registry
            .register(NodeLink::new("node-a", tx))
            .await
            .expect("previous link");
        assert_eq!(previous.close("superseded"), 10);

        for call in calls {
            assert_eq!(call.wait().await, Err(CallError::NodeDisconnected));
        }
    }

    #[tokio::test]
    async fn dropping_handle_withdraws_call() {
        let registry = ConnectionRegistry::new();
        let (link, _rx) = connect(&registry, "node-a").await;
        let correlator = CallCorrelator::new(registry);

        let pending = correlator
            .start_call(
                "node-a",
                payload("noop", Value::Null),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .expect("start");
        assert_eq!(link.pending_count(), 1);
        drop(pending);
        assert_eq!(link.pending_count(), 0);
    }
}
