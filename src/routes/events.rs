//! Server-Sent Events (SSE) endpoint.
//!
//! `GET /events`: push stream of hub lifecycle events:
//!
//! | Event                 | Fields                             |
//! |-----------------------|------------------------------------|
//! | `agent.connected`     | `agent_id`, `platform`             |
//! | `agent.disconnected`  | `agent_id`, `reason`               |
//! | `command.completed`   | `command_id`, `agent_id`, `action` |
//! | `command.failed`      | `command_id`, `agent_id`, `error`  |
//! | `tunnel.opened`       | `session_id`, `agent_id`           |
//! | `tunnel.closed`       | `session_id`, `agent_id`, `reason` |

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream::Stream;
use tokio::sync::broadcast::error::RecvError;

use crate::auth::Principal;
use crate::AppState;

/// Maximum concurrent SSE connections before rejecting with 429.
const MAX_SSE_CONNECTIONS: u32 = 64;

/// `GET /events`: SSE event stream.
pub async fn event_stream(
    _principal: Principal,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let current = state.sse_connections.load(Ordering::Relaxed);
    if current >= MAX_SSE_CONNECTIONS {
        return Err((StatusCode::TOO_MANY_REQUESTS, "Too many SSE connections"));
    }
    state.sse_connections.fetch_add(1, Ordering::Relaxed);

    let rx = state.events.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(value) => {
                let event_type = value["type"].as_str().unwrap_or("message").to_string();
                let event = Event::default().event(event_type).data(value.to_string());
                Some((Ok(event), rx))
            }
            Err(RecvError::Lagged(n)) => {
                let event = Event::default()
                    .event("error")
                    .data(format!(r#"{{"code":"LAGGED","missed":{n}}}"#));
                Some((Ok(event), rx))
            }
            Err(RecvError::Closed) => None,
        }
    });

    let stream = DropCounterStream {
        inner: Box::pin(stream),
        counter: state.sse_connections.clone(),
        decremented: false,
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(15))))
}

/// Releases the SSE connection slot when the stream ends or is dropped.
struct DropCounterStream<S> {
    inner: Pin<Box<S>>,
    counter: Arc<AtomicU32>,
    decremented: bool,
}

impl<S> DropCounterStream<S> {
    fn release(&mut self) {
        if !self.decremented {
            self.counter.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for DropCounterStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let result = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(None) = &result {
            self.release();
        }
        result
    }
}

impl<S> Drop for DropCounterStream<S> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_counter_released_once() {
        let counter = Arc::new(AtomicU32::new(1));
        let mut stream = DropCounterStream {
            inner: Box::pin(futures::stream::empty::<Result<Event, Infallible>>()),
            counter: counter.clone(),
            decremented: false,
        };
        assert!(stream.next().await.is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        drop(stream);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
