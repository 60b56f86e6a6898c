//! Node-facing h2 endpoint.
//!
//! Each node opens one HTTP/2 CONNECT stream and exchanges length-prefixed
//! [`TunnelFrame`]s over it. The stream task owns the socket side of a
//! [`NodeLink`]: it writes whatever the correlator queues on the link and
//! routes replies, completions, heartbeats and bind requests coming back.

use std::{net::SocketAddr, sync::Arc, time::Instant as StdInstant};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use common::protocol::{
    Decoded, FrameError, NODE_ID_HEADER, NODE_SECRET_HEADER, TunnelFrame, encode_frame,
    is_valid_node_id, try_decode_frame,
};
use h2::{RecvStream, SendStream, server};
use http::{Method, Request, Response, StatusCode};
use metrics::{counter, histogram};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};

use crate::{
    app_state::AppState,
    correlator::CallReply,
    persistence::{NodeHello, NodeStatus, nodes as node_store},
    registry::NodeLink,
    services::{
        nodes::{BindOutcome, bind_from_link},
        tasks::{CompletionOutcome, complete_async_job},
    },
    tokens::secrets_match,
};

pub async fn bind_listener(state: &AppState) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", state.tunnel.host, state.tunnel.port)
        .parse()
        .context("parse tunnel listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("bind tunnel listener")?;
    info!(addr = %listener.local_addr()?, "starting tunnel listener");
    Ok(listener)
}

pub fn spawn_listener(state: AppState, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    error!(?err, "accept failed for tunnel listener");
                    continue;
                }
            };

            let state = state.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, state).await {
                    debug!(%peer, error = ?err, "tunnel connection ended with error");
                }
            });
        }
    })
}

pub async fn serve(state: AppState) -> anyhow::Result<JoinHandle<()>> {
    let listener = bind_listener(&state).await?;
    Ok(spawn_listener(state, listener))
}

async fn handle_connection(stream: TcpStream, state: AppState) -> anyhow::Result<()> {
    let mut h2 = server::handshake(stream).await?;

    while let Some(result) = h2.accept().await {
        let (request, mut respond) = result?;
        let start = StdInstant::now();

        let node_id = match authorize_connect(&state, &request) {
            Ok(node_id) => node_id,
            Err(rejection) => {
                record_connect_metrics(rejection.result, start);
                let response = Response::builder().status(rejection.status).body(())?;
                if let Err(err) = respond.send_response(response, true) {
                    debug!(?err, "failed to send tunnel rejection");
                }
                continue;
            }
        };

        let send_stream =
            respond.send_response(Response::builder().status(StatusCode::OK).body(())?, false)?;
        let recv_stream = request.into_body();
        record_connect_metrics("accepted", start);

        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = drive_stream(&state, &node_id, send_stream, recv_stream).await {
                warn!(%node_id, error = ?err, "tunnel stream failed");
            }
        });
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rejection {
    status: StatusCode,
    result: &'static str,
}

impl Rejection {
    fn new(status: StatusCode, result: &'static str) -> Self {
        Self { status, result }
    }
}

/// Check the CONNECT request and return the node id it claims.
fn authorize_connect<B>(state: &AppState, request: &Request<B>) -> Result<String, Rejection> {
    if request.method() != Method::CONNECT {
        return Err(Rejection::new(StatusCode::METHOD_NOT_ALLOWED, "bad_method"));
    }

    let node_id = request
        .headers()
        .get(NODE_ID_HEADER)
        .ok_or(Rejection::new(StatusCode::BAD_REQUEST, "missing_node_id"))?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|id| is_valid_node_id(id))
        .ok_or(Rejection::new(StatusCode::BAD_REQUEST, "invalid_node_id"))?;

    if let Some(expected) = state.tunnel.shared_secret.as_deref() {
        let presented = request
            .headers()
            .get(NODE_SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !secrets_match(expected, presented.trim()) {
            return Err(Rejection::new(StatusCode::UNAUTHORIZED, "unauthorized"));
        }
    }

    Ok(node_id.to_string())
}

async fn drive_stream(
    state: &AppState,
    node_id: &str,
    mut send_stream: SendStream<Bytes>,
    mut recv_stream: RecvStream,
) -> anyhow::Result<()> {
    let max_frame_bytes = state.tunnel.max_frame_bytes;
    let heartbeat_timeout = state.tunnel.heartbeat_timeout();
    let mut buffer = BytesMut::new();

    let hello = time::timeout(
        heartbeat_timeout,
        read_next_frame(&mut recv_stream, &mut buffer, max_frame_bytes),
    )
    .await
    .context("timed out waiting for client_hello")??;
    let (agent_version, hostname, heartbeat_interval_secs) = match hello {
        Some(Decoded::Frame(TunnelFrame::ClientHello {
            agent_version,
            hostname,
            heartbeat_interval_secs,
        })) => (agent_version, hostname, heartbeat_interval_secs),
        Some(Decoded::Frame(other)) => {
            anyhow::bail!("unexpected frame during handshake: {}", other.kind())
        }
        Some(Decoded::Malformed(err)) => anyhow::bail!("malformed client_hello: {err}"),
        None => anyhow::bail!("stream closed before client_hello"),
    };
    if heartbeat_interval_secs >= state.tunnel.heartbeat_timeout_secs {
        warn!(
            node_id,
            heartbeat_interval_secs,
            heartbeat_timeout_secs = state.tunnel.heartbeat_timeout_secs,
            "node heartbeat interval exceeds hub timeout"
        );
    }

    node_store::upsert_on_connect(
        &state.db,
        &NodeHello {
            id: node_id.to_string(),
            hostname,
            agent_version: agent_version.clone(),
        },
        Utc::now(),
    )
    .await
    .context("record node handshake")?;

    let (outbound_tx, outbound_rx) = mpsc::channel(state.tunnel.outbound_queue);
    let link = NodeLink::new(node_id, outbound_tx);
    send_frame(
        &mut send_stream,
        &TunnelFrame::ServerHello {
            link_id: link.link_id,
            heartbeat_timeout_secs: state.tunnel.heartbeat_timeout_secs,
        },
    )?;

    if let Some(previous) = state.registry.register(link.clone()).await {
        let failed = previous.close("superseded");
        info!(node_id, old_link = %previous.link_id, failed_calls = failed, "superseded previous link");
    }
    info!(node_id, link_id = %link.link_id, %agent_version, "node connected");

    let reason = match pump_frames(
        state,
        &link,
        &mut send_stream,
        &mut recv_stream,
        &mut buffer,
        outbound_rx,
    )
    .await
    {
        Ok(reason) => reason,
        Err(err) => {
            let reason = classify_stream_error(&err);
            warn!(node_id, link_id = %link.link_id, reason, error = ?err, "tunnel stream error");
            reason.to_string()
        }
    };

    if state.registry.unregister(&link, &reason).await
        && let Err(err) =
            node_store::update_node_status(&state.db, node_id, NodeStatus::Offline, Utc::now())
                .await
    {
        warn!(node_id, ?err, "failed to mark node offline");
    }
    let failed = link.close(&reason);
    if let Err(err) = send_stream.send_data(Bytes::new(), true) {
        debug!(node_id, ?err, "tunnel stream already closed");
    }
    info!(node_id, link_id = %link.link_id, %reason, failed_calls = failed, "node disconnected");
    Ok(())
}

/// Run the link until it ends and return why it ended.
async fn pump_frames(
    state: &AppState,
    link: &Arc<NodeLink>,
    send_stream: &mut SendStream<Bytes>,
    recv_stream: &mut RecvStream,
    buffer: &mut BytesMut,
    mut outbound_rx: mpsc::Receiver<TunnelFrame>,
) -> anyhow::Result<String> {
    let max_frame_bytes = state.tunnel.max_frame_bytes;
    let heartbeat_timeout = state.tunnel.heartbeat_timeout();
    let heartbeat_timer = time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_timer);

    let mut closed = link.subscribe_closed();
    if let Some(reason) = closed.borrow_and_update().clone() {
        return Ok(reason);
    }

    loop {
        tokio::select! {
            _ = &mut heartbeat_timer => {
                return Ok("heartbeat_timeout".to_string());
            }
            changed = closed.changed() => {
                let reason = match changed {
                    Ok(()) => closed.borrow().clone(),
                    Err(_) => None,
                };
                return Ok(reason.unwrap_or_else(|| "closed".to_string()));
            }
            decoded = read_next_frame(recv_stream, buffer, max_frame_bytes) => {
                match decoded? {
                    None => return Ok("eos".to_string()),
                    Some(Decoded::Malformed(err)) => {
                        counter!("fleet_hub_tunnel_malformed_frames_total").increment(1);
                        warn!(node_id = %link.node_id, error = %err, "skipping malformed tunnel frame");
                    }
                    Some(Decoded::Frame(frame)) => {
                        if !state.registry.touch(&link.node_id, link.link_id).await {
                            return Ok("superseded".to_string());
                        }
                        heartbeat_timer.as_mut().reset(time::Instant::now() + heartbeat_timeout);
                        counter!("fleet_hub_tunnel_frames_total", "kind" => frame.kind()).increment(1);
                        if let Some(response) = handle_frame(state, link, frame).await {
                            send_frame(send_stream, &response)?;
                        }
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(frame) = outbound else {
                    return Ok("closed".to_string());
                };
                send_frame(send_stream, &frame)?;
            }
        }
    }
}

/// Act on one inbound frame; the returned frame is written back directly.
async fn handle_frame(state: &AppState, link: &NodeLink, frame: TunnelFrame) -> Option<TunnelFrame> {
    let node_id = link.node_id.as_str();
    match frame {
        TunnelFrame::Reply {
            call_id,
            success,
            data,
            error,
        } => {
            let reply = CallReply {
                success,
                data,
                error,
            };
            if !link.resolve(call_id, reply) {
                counter!("fleet_hub_tunnel_unknown_replies_total").increment(1);
                warn!(node_id, call_id, "reply for unknown or expired call");
            }
            None
        }
        TunnelFrame::Completion {
            task_id,
            success,
            result,
            error,
        } => {
            match complete_async_job(state, node_id, task_id, success, result, error).await {
                Ok(CompletionOutcome::Applied) => {
                    info!(node_id, task_id, success, "job completed");
                }
                Ok(outcome) => {
                    warn!(node_id, task_id, ?outcome, "ignored job completion");
                }
                Err(err) => {
                    error!(node_id, task_id, ?err, "failed to record job completion");
                }
            }
            None
        }
        TunnelFrame::Heartbeat { sent_at } => {
            record_heartbeat_latency(&sent_at);
            if let Err(err) = node_store::touch_last_seen(&state.db, node_id, Utc::now()).await {
                warn!(node_id, ?err, "failed to record heartbeat");
            }
            Some(TunnelFrame::HeartbeatAck {
                received_at: Utc::now().to_rfc3339(),
            })
        }
        TunnelFrame::Bind { token } => {
            let response = match bind_from_link(state, node_id, &token).await {
                Ok(BindOutcome::Bound { user_id }) => TunnelFrame::BindResult {
                    success: true,
                    user_id: Some(user_id),
                    error: None,
                },
                Ok(BindOutcome::Rejected(reason)) => {
                    warn!(node_id, reason, "bind rejected");
                    TunnelFrame::BindResult {
                        success: false,
                        user_id: None,
                        error: Some(reason.to_string()),
                    }
                }
                Err(err) => {
                    error!(node_id, ?err, "bind failed");
                    TunnelFrame::BindResult {
                        success: false,
                        user_id: None,
                        error: Some("bind failed".to_string()),
                    }
                }
            };
            Some(response)
        }
        other => {
            warn!(node_id, kind = other.kind(), "unexpected tunnel frame");
            None
        }
    }
}

fn classify_stream_error(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<FrameError>() {
        Some(FrameError::TooLarge { .. }) => "frame_too_large",
        Some(FrameError::Encode(_)) => "encode_error",
        None => "stream_error",
    }
}

fn send_frame(send_stream: &mut SendStream<Bytes>, frame: &TunnelFrame) -> anyhow::Result<()> {
    let bytes = encode_frame(frame)?;
    send_stream
        .send_data(bytes, false)
        .context("send tunnel frame")?;
    Ok(())
}

async fn read_next_frame(
    recv: &mut RecvStream,
    buffer: &mut BytesMut,
    max_frame_bytes: usize,
) -> anyhow::Result<Option<Decoded>> {
    loop {
        if let Some(decoded) = try_decode_frame(buffer, max_frame_bytes)? {
            return Ok(Some(decoded));
        }

        match recv.data().await {
            Some(Ok(chunk)) => {
                recv.flow_control().release_capacity(chunk.len())?;
                buffer.extend_from_slice(&chunk);
            }
            Some(Err(err)) => return Err(err.into()),
            None if buffer.is_empty() => return Ok(None),
            None => anyhow::bail!("stream ended mid-frame"),
        }
    }
}

fn record_connect_metrics(result: &'static str, start: StdInstant) {
    counter!("fleet_hub_tunnel_connect_total", "result" => result).increment(1);
    histogram!("fleet_hub_tunnel_connect_duration_seconds", "result" => result)
        .record(start.elapsed().as_secs_f64());
}

fn record_heartbeat_latency(sent_at: &str) {
    match DateTime::parse_from_rfc3339(sent_at) {
        Ok(sent) => {
            let latency_secs = (Utc::now() - sent.with_timezone(&Utc))
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            histogram!("fleet_hub_tunnel_heartbeat_rtt_seconds").record(latency_secs);
            counter!("fleet_hub_tunnel_heartbeat_total", "result" => "ok").increment(1);
        }
        Err(_) => {
            counter!("fleet_hub_tunnel_heartbeat_total", "result" => "parse_error").increment(1);
        }
    }
}
