//! Read and write pumps for one agent transport.
//!
//! Both pumps are generic over any `Sink`/`Stream` of WebSocket messages so
//! they run unchanged over a real axum socket or an in-memory channel pair.
//! Either pump ending cancels the connection token, which stops the other.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{AgentConnection, ControlHandler};
use crate::protocol::{AgentMessage, Inbound, TunnelFrame};

/// Most frames coalesced into a single flush.
const MAX_BATCH: usize = 64;

/// Drain the outbound queue onto the wire and keep the connection alive.
///
/// Queued frames are fed in FIFO order and flushed together; on every tick a
/// ping is written. Exits on cancellation (sending a close frame first), on a
/// write error, or when a write exceeds `write_timeout`.
pub(crate) async fn write_pump<S>(
    conn: Arc<AgentConnection>,
    mut sink: S,
    mut rx: mpsc::Receiver<String>,
    ping_interval: Duration,
    write_timeout: Duration,
) where
    S: Sink<Message> + Send + Unpin + 'static,
    S::Error: Display + Send + 'static,
{
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let result = tokio::select! {
            biased;
            () = conn.cancel.cancelled() => {
                let closing = close_gracefully(&mut sink, &mut rx);
                if let Ok(Err(e)) = timeout(write_timeout, closing).await {
                    debug!(agent_id = %conn.agent_id, error = %e, "Close frame not delivered");
                }
                break;
            }
            frame = rx.recv() => {
                let Some(first) = frame else { break };
                timeout(write_timeout, write_batch(&mut sink, &mut rx, first)).await
            }
            _ = ticker.tick() => {
                timeout(write_timeout, sink.send(Message::Ping(Bytes::new()))).await
            }
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(agent_id = %conn.agent_id, error = %e, "Agent write failed");
                break;
            }
            Err(_) => {
                warn!(agent_id = %conn.agent_id, "Agent write timed out");
                break;
            }
        }
    }

    conn.cancel.cancel();
    debug!(agent_id = %conn.agent_id, "Write pump stopped");
}

async fn write_batch<S>(
    sink: &mut S,
    rx: &mut mpsc::Receiver<String>,
    first: String,
) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    sink.feed(Message::Text(first.into())).await?;
    for _ in 1..MAX_BATCH {
        match rx.try_recv() {
            Ok(next) => sink.feed(Message::Text(next.into())).await?,
            Err(_) => break,
        }
    }
    sink.flush().await
}

/// Flush whatever is still queued (e.g. a shutdown notice), then close.
async fn close_gracefully<S>(
    sink: &mut S,
    rx: &mut mpsc::Receiver<String>,
) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    while let Ok(text) = rx.try_recv() {
        sink.feed(Message::Text(text.into())).await?;
    }
    sink.send(Message::Close(Some(CloseFrame {
        code: 1000,
        reason: "connection closed".into(),
    })))
    .await
}

/// Read frames until the transport fails or goes silent for `read_timeout`.
///
/// Control frames are handed to `handler` inline; tunnel frames are pushed
/// onto `inbound` without blocking and dropped when it is full. Frames that
/// do not decode are logged and skipped.
pub(crate) async fn read_pump<R, E>(
    conn: Arc<AgentConnection>,
    mut stream: R,
    inbound: mpsc::Sender<TunnelFrame>,
    handler: Arc<dyn ControlHandler>,
    read_timeout: Duration,
) where
    R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
{
    loop {
        let next = tokio::select! {
            biased;
            () = conn.cancel.cancelled() => break,
            next = timeout(read_timeout, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                warn!(agent_id = %conn.agent_id, "Agent read deadline exceeded");
                break;
            }
            Ok(None) => {
                info!(agent_id = %conn.agent_id, "Agent closed transport");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(agent_id = %conn.agent_id, error = %e, "Agent read failed");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let decoded = match &msg {
            Message::Text(text) => AgentMessage::decode(text.as_str()),
            Message::Binary(data) => serde_json::from_slice(data),
            Message::Close(_) => {
                info!(agent_id = %conn.agent_id, "Agent sent close");
                break;
            }
            // Pings and pongs only refresh the deadline.
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let envelope = match decoded {
            Ok(env) => env,
            Err(e) => {
                warn!(agent_id = %conn.agent_id, error = %e, "Dropping malformed agent frame");
                continue;
            }
        };

        match envelope.classify() {
            Inbound::Control(frame) => handler.on_control(&conn.agent_id, frame).await,
            Inbound::Tunnel(frame) => match inbound.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    conn.count_dropped_inbound();
                    warn!(
                        agent_id = %conn.agent_id,
                        session_id = %frame.session_id(),
                        "Inbound tunnel queue full, dropping frame"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(agent_id = %conn.agent_id, "Tunnel loop gone, dropping frame");
                }
            },
        }
    }

    conn.cancel.cancel();
    debug!(agent_id = %conn.agent_id, "Read pump stopped");
}

#[cfg(test)]
mod tests {
    use super::super::tests::{connect_mock, test_hub, RecordingHandler};
    use super::*;
    use crate::protocol::{ControlFrame, HubMessage, ShutdownPayload};
    use serde_json::Value;

    #[tokio::test]
    async fn test_control_frames_reach_handler_in_order() {
        let (hub, _) = test_hub().await;
        let handler = Arc::new(RecordingHandler::default());
        let (_reg, agent) = connect_mock(&hub, "a1", handler.clone()).await;

        agent
            .send_text(r#"{"type":"heartbeat","payload":{"status":"online","activeSessions":1}}"#)
            .await;
        agent.send_text("garbage").await;
        agent
            .send_text(r#"{"type":"ack","payload":{"commandId":"c1"}}"#)
            .await;

        for _ in 0..50 {
            if handler.frames.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let frames = handler.frames.lock().await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0].1, ControlFrame::Heartbeat(_)));
        assert!(matches!(&frames[1].1, ControlFrame::Ack(a) if a.command_id == "c1"));
        assert_eq!(frames[1].0, "a1");
    }

    #[tokio::test]
    async fn test_tunnel_frames_go_to_inbound_queue() {
        let (hub, _) = test_hub().await;
        let (mut reg, agent) =
            connect_mock(&hub, "a1", Arc::new(RecordingHandler::default())).await;

        agent
            .send_text(r#"{"type":"vnc_data","payload":{"sessionId":"s1","data":"AAEC"}}"#)
            .await;
        let frame = reg.inbound.recv().await.unwrap();
        let TunnelFrame::Data(data) = frame else {
            panic!("expected data frame");
        };
        assert_eq!(data.decode_data().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_outbound_fifo() {
        let (hub, _) = test_hub().await;
        let (_reg, mut agent) =
            connect_mock(&hub, "a1", Arc::new(RecordingHandler::default())).await;

        for i in 0..5 {
            let msg = HubMessage::Shutdown(ShutdownPayload {
                reason: Some(format!("r{i}")),
            });
            hub.send("a1", &msg).await.unwrap();
        }
        for i in 0..5 {
            let text = agent.next_text().await.unwrap();
            let value: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["payload"]["reason"], format!("r{i}"));
        }
    }

    #[tokio::test]
    async fn test_transport_end_unregisters() {
        let (hub, _) = test_hub().await;
        let (reg, agent) = connect_mock(&hub, "a1", Arc::new(RecordingHandler::default())).await;
        drop(agent);
        reg.connection.stopped().await;
        assert!(!hub.is_connected("a1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_unregisters() {
        let (hub, _) = test_hub().await;
        let (reg, _agent) =
            connect_mock(&hub, "a1", Arc::new(RecordingHandler::default())).await;
        // Paused clock auto-advances past the read deadline once idle.
        reg.connection.stopped().await;
        assert!(!hub.is_connected("a1").await);
    }
}
