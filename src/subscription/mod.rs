//! Real-time subscription service: the `/stream` WebSocket upgrade and
//! per-connection session loop.

mod handler;
mod protocol;
mod session;

pub use handler::{run_session, DEFAULT_HEARTBEAT};
pub use protocol::{ClientMessage, PriceUpdateData, ServerMessage};
pub use session::SessionTable;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use tokio::time::Duration;

use crate::auth::ApiIdentity;
use crate::broker::Broker;

#[derive(Clone)]
pub struct SubscriptionState {
    pub broker: Arc<dyn Broker>,
    pub sessions: Arc<SessionTable>,
    pub heartbeat_interval: Duration,
}

/// Upgrades to a WebSocket. Authentication happens the same way as the
/// HTTP read plane (`auth_guard::require_authenticated` runs ahead of this
/// handler), so by the time this runs `identity` is already a valid key.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<SubscriptionState>,
    Extension(identity): Extension<ApiIdentity>,
) -> Response {
    ws.on_upgrade(move |socket| {
        run_session(
            socket,
            state.broker,
            state.sessions,
            state.heartbeat_interval,
            identity.key,
        )
    })
    .into_response()
}
