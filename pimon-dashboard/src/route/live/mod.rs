use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use tracing::{Instrument, debug_span};

use crate::AppState;

mod socket;

pub async fn live_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| {
        socket::handle_socket(socket, state).instrument(debug_span!("live_ws"))
    })
}
