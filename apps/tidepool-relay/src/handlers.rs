use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use tidepool_proto::{PeerId, RoomLogs, SignalingMessage, WireSignal};

pub type SharedRooms = Arc<RoomLogs>;

const MAX_ROOM_LEN: usize = 128;

#[derive(Debug, Deserialize)]
pub struct SignalQuery {
    #[serde(default)]
    pub after: u64,
    /// Without a recipient only broadcasts are returned.
    #[serde(default)]
    pub recipient: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AppendResponse {
    pub id: u64,
}

pub async fn health_check() -> &'static str {
    "ok"
}

fn validate_room(room: &str) -> Result<(), Response> {
    if room.is_empty() || room.len() > MAX_ROOM_LEN {
        return Err(bad_request(format!(
            "room name must be 1..={MAX_ROOM_LEN} bytes"
        )));
    }
    Ok(())
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

pub async fn list_signals(
    Path(room): Path<String>,
    Query(query): Query<SignalQuery>,
    State(rooms): State<SharedRooms>,
) -> Response {
    if let Err(rejection) = validate_room(&room) {
        return rejection;
    }
    let recipient = PeerId::new(query.recipient.unwrap_or_default());
    let batch: Vec<WireSignal> = rooms
        .room(&room)
        .since(query.after, &recipient)
        .into_iter()
        .map(WireSignal::from)
        .collect();
    debug!(room = %room, after = query.after, count = batch.len(), "served signals");
    Json(batch).into_response()
}

pub async fn append_signal(
    Path(room): Path<String>,
    State(rooms): State<SharedRooms>,
    Json(message): Json<SignalingMessage>,
) -> Response {
    if let Err(rejection) = validate_room(&room) {
        return rejection;
    }
    if message.from.as_str().is_empty() {
        warn!(room = %room, kind = %message.kind(), "rejected signal without sender");
        return bad_request("signal is missing `from`".into());
    }
    let kind = message.kind();
    let from = message.from.clone();
    let id = rooms.room(&room).append(message);
    debug!(room = %room, id, kind = %kind, from = %from, "appended signal");
    (StatusCode::CREATED, Json(AppendResponse { id })).into_response()
}
