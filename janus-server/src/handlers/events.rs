use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;

use janus_core::EventBus;

use crate::AppState;

/// Deregisters the subscriber when the SSE connection goes away.
struct Unsubscribe {
    bus: Arc<EventBus>,
    id: u64,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

/// `GET /api/events` - relay the core event bus as server-sent events.
///
/// Each bus event becomes one `event:`/`data:` frame; a comment keepalive
/// goes out every 15 seconds of idle time.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (id, mut rx) = state.bus.subscribe();
    let bus = Arc::clone(&state.bus);
    tracing::debug!(subscriber = id, "event stream connected");

    let stream = async_stream::stream! {
        let _guard = Unsubscribe { bus, id };
        while let Some(event) = rx.recv().await {
            yield Ok(Event::default().event(event.event_type).data(event.payload));
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
