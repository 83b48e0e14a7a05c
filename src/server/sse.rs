//! Server-Sent-Events transport for generation streams

use axum::{
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;
use tracing::debug;

use crate::core::models::{EventKind, StreamEvent};
use crate::fanout::Subscription;

/// Event name used for fan-out messages on `/events`
pub const SUBSCRIPTION_EVENT: &str = "generation";

/// SSE event for an orchestrator event, named after its kind
pub fn event_frame(event: &StreamEvent) -> Result<Event, axum::Error> {
    let mut frame = Event::default();
    if let Some(id) = &event.id {
        frame = frame.id(id);
    }
    frame.event(event.kind.to_string()).json_data(event)
}

fn event_stream<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Event, axum::Error>> + Send + 'static,
{
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// Stream orchestrator events to the client
///
/// The response ends when the channel closes or after an `error` event.
/// `guard` lives as long as the body: when the client disconnects the body is
/// dropped and the guarded token is cancelled.
pub fn stream_response(rx: mpsc::Receiver<StreamEvent>, guard: DropGuard) -> Response {
    let events = futures::stream::unfold((rx, guard, false), |(mut rx, guard, done)| async move {
        if done {
            return None;
        }
        let Some(event) = rx.recv().await else {
            debug!("Event channel closed, ending SSE response");
            return None;
        };
        let finished = event.kind == EventKind::Error;
        Some((event_frame(&event), (rx, guard, finished)))
    });

    event_stream(events)
}

/// Stream fan-out messages to the client until it disconnects
pub fn subscription_response(subscription: Subscription) -> Response {
    let events = futures::stream::unfold(subscription, |mut subscription| async move {
        let message = subscription.next().await?;
        let frame = Event::default().event(SUBSCRIPTION_EVENT).data(message.payload);
        Some((Ok(frame), subscription))
    });

    event_stream(events)
}
