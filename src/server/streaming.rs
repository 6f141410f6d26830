//! SSE (Server-Sent Events) stream of transfer lifecycle events.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::stream::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::queue::TransferEvent;

/// Convert a transfer event subscription into an SSE stream.
///
/// A subscriber that falls behind loses the events it missed; the stream
/// carries on with the next one. The stream ends when the channel closes or
/// `shutdown` fires.
pub fn events_to_sse_stream(
    rx: broadcast::Receiver<TransferEvent>,
    shutdown: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let events = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default()
                .event(event.kind())
                .id(event.id().to_string())
                .data(data)))
        }
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "Event subscriber lagged, dropping missed events");
            None
        }
    });
    futures::StreamExt::take_until(events, shutdown.cancelled_owned())
}
