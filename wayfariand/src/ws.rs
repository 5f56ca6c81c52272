//! The long-lived bidirectional transport (§4.3, §6.2).
//!
//! Shaped like `transport::ws::handle_ws` in the terminal-mux reference:
//! authenticate once on upgrade, split the socket, and run a `select!`
//! loop bridging an outbound channel to the socket write half and the
//! socket read half to message handling. Room membership is per-room
//! forwarder tasks rather than one static bridge, since a connection here
//! joins and leaves rooms dynamically over its lifetime instead of
//! subscribing once at creation.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tracing::{debug, warn};
use wayfarian_core::eventbus::rooms;
use wayfarian_core::{new_id, AuthContext, RideEventType};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match state.token_verifier.verify(&query.token).await {
        Ok(auth) => ws.on_upgrade(move |socket| handle_connection(socket, state, auth)),
        Err(_) => axum::http::Response::builder()
            .status(401)
            .body(axum::body::Body::from("unauthorized"))
            .unwrap_or_default()
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "group-journey:join")]
    Join {
        #[serde(rename = "journeyId")]
        journey_id: String,
    },
    #[serde(rename = "group-journey:leave")]
    Leave {
        #[serde(rename = "journeyId")]
        journey_id: String,
    },
    #[serde(rename = "group-journey:post-event")]
    PostEvent {
        #[serde(rename = "journeyId")]
        journey_id: String,
        #[serde(rename = "type")]
        event_type: RideEventType,
        message: Option<String>,
        latitude: Option<f64>,
        longitude: Option<f64>,
        #[serde(rename = "mediaRef")]
        media_ref: Option<String>,
        data: Option<serde_json::Value>,
    },
}

/// Rooms a single journey join fans into: the group-wide room and the
/// journey-specific room, tracked together so `leave` drops both.
struct JourneyRooms {
    group: JoinHandle<()>,
    journey: JoinHandle<()>,
}

async fn handle_connection(socket: WebSocket, state: AppState, auth: AuthContext) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut joined_journeys: HashMap<String, JourneyRooms> = HashMap::new();
    let user_room_task = spawn_forwarder(state.bus.clone(), rooms::user(&auth.user_id), outbound_tx.clone());

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, &auth, &text, &mut joined_journeys, &outbound_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    user_room_task.abort();
    for rooms in joined_journeys.into_values() {
        rooms.group.abort();
        rooms.journey.abort();
    }
}

async fn handle_client_message(
    state: &AppState,
    auth: &AuthContext,
    text: &str,
    joined_journeys: &mut HashMap<String, JourneyRooms>,
    outbound_tx: &mpsc::UnboundedSender<String>,
) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    let Ok(message) = parsed else {
        debug!(raw = text, "ignoring unrecognized socket message");
        return;
    };

    match message {
        ClientMessage::Join { journey_id } => {
            if joined_journeys.contains_key(&journey_id) {
                return;
            }
            let request_id = new_id();
            let Ok(journey) = state.store.get_group_journey(&journey_id).await else {
                return;
            };
            let Some(journey) = journey else { return };
            let Ok(Some(_member)) = state.store.get_group_member(&journey.group_id, &auth.user_id).await
            else {
                let _ = request_id;
                return;
            };

            let group = spawn_forwarder(state.bus.clone(), rooms::group(&journey.group_id), outbound_tx.clone());
            let journey_task = spawn_forwarder(state.bus.clone(), rooms::group_journey(&journey_id), outbound_tx.clone());
            joined_journeys.insert(journey_id, JourneyRooms { group, journey: journey_task });
        }
        ClientMessage::Leave { journey_id } => {
            if let Some(rooms) = joined_journeys.remove(&journey_id) {
                rooms.group.abort();
                rooms.journey.abort();
            }
        }
        ClientMessage::PostEvent {
            journey_id,
            event_type,
            message,
            latitude,
            longitude,
            media_ref,
            data,
        } => {
            let request_id = new_id();
            if let Err(err) = state
                .lifecycle
                .post_ride_event(auth, &request_id, &journey_id, event_type, message, latitude, longitude, media_ref, data)
                .await
            {
                warn!(request_id, kind = ?err.kind, "socket post-event rejected");
            }
        }
    }
}

fn spawn_forwarder(
    bus: Arc<wayfarian_core::EventBus>,
    room: String,
    outbound_tx: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let rx = bus.join(&room).await;
        let mut stream = BroadcastStream::new(rx);
        while let Some(item) = stream.next().await {
            match item {
                Ok(text) => {
                    if outbound_tx.send(text).is_err() {
                        break;
                    }
                }
                Err(_lagged) => continue,
            }
        }
    })
}
