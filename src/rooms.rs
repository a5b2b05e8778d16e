mod msg;
mod presence;
mod registry;
mod ws;

use std::sync::Arc;

use axum::{debug_handler, extract::{Path, State}, routing::get, Json, Router};

use crate::{
    db::{Member, RoomMessage, RoomSummary},
    gateway::Gateway,
    AppResult, AppState,
};

pub use msg::{DirectSent, MessageRouter};
pub use presence::{Audience, Envelope, PresenceNotifier};
pub use registry::{normalize_room_name, JoinPolicy, Joined, RoomRegistry};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::room_ws))
        .route("/rooms", get(list_rooms))
        .route("/rooms/{name}/messages", get(room_messages))
        .route("/rooms/{name}/users", get(room_users))
}

#[debug_handler(state = AppState)]
async fn list_rooms(State(gateway): State<Arc<Gateway>>) -> AppResult<Json<Vec<RoomSummary>>> {
    Ok(Json(gateway.registry.list_rooms().await?))
}

#[debug_handler(state = AppState)]
async fn room_messages(
    Path(name): Path<String>,
    State(gateway): State<Arc<Gateway>>,
) -> AppResult<Json<Vec<RoomMessage>>> {
    Ok(Json(gateway.router.room_history(&name).await?))
}

#[debug_handler(state = AppState)]
async fn room_users(
    Path(name): Path<String>,
    State(gateway): State<Arc<Gateway>>,
) -> AppResult<Json<Vec<Member>>> {
    let room = gateway.registry.find_room(&name).await?;
    Ok(Json(PresenceNotifier::membership_view(&room)))
}
