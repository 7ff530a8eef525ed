//! SSE plumbing.
//!
//! Every streaming endpoint emits frames of the form `data: <json>\n\n` with
//! no `event:` field, plus `:keepalive` comments on idle streams. Streams
//! hold one slot of the shared SSE budget for their whole lifetime; the slot
//! releases when the client disconnects or the stream ends.

use std::convert::Infallible;

use {
    axum::response::sse::{Event, KeepAlive, Sse},
    futures::{Stream, StreamExt},
    serde::Serialize,
    tokio::sync::{OwnedSemaphorePermit, TryAcquireError},
    tokio_util::sync::CancellationToken,
};

use warden_protocol::{SSE_KEEPALIVE_TEXT, error_codes};

use crate::{error::ApiError, state::AppState};

const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// Serialize one event into a `data:` frame.
fn frame<T: Serialize>(event: &T) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        // Serialization of our own event enums cannot fail; emit a terminal
        // error frame rather than poisoning the stream if it somehow does.
        Err(e) => Event::default().data(format!(
            "{{\"type\":\"error\",\"message\":\"serialization failed: {e}\"}}"
        )),
    }
}

/// Reserve an SSE slot or fail with the typed stream-limit error.
pub fn acquire_slot(state: &AppState) -> Result<OwnedSemaphorePermit, ApiError> {
    match state.sse_slots.clone().try_acquire_owned() {
        Ok(permit) => Ok(permit),
        Err(TryAcquireError::NoPermits) => Err(ApiError::new(
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            error_codes::STREAM_LIMIT,
            format!(
                "too many concurrent streams (limit {})",
                state.cfg.limits.max_sse_streams
            ),
        )),
        Err(TryAcquireError::Closed) => Err(ApiError::internal("sse semaphore closed")),
    }
}

/// Wrap an event stream into an SSE response.
///
/// The permit and the optional cancellation guard ride inside the stream:
/// when the client disconnects, axum drops the stream, the guard cancels its
/// token (killing whatever producer is attached), and the slot frees.
pub fn respond<S, T>(
    permit: OwnedSemaphorePermit,
    cancel_on_drop: Option<CancellationToken>,
    events: S,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + Send,
{
    let stream = async_stream::stream! {
        let _permit = permit;
        let _guard = cancel_on_drop.map(|t| t.drop_guard());
        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            yield Ok::<_, Infallible>(frame(&event));
        }
    };
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text(SSE_KEEPALIVE_TEXT),
    )
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use warden_protocol::StreamEvent;

    #[test]
    fn frames_are_single_json_objects() {
        let event = StreamEvent::Stdout {
            data: "x".into(),
            offset: 1,
        };
        let framed = format!("{:?}", frame(&event));
        assert!(framed.contains("stdout"), "got: {framed}");
    }
}
