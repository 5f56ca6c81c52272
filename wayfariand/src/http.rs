//! The HTTP surface (§6.1): one handler per route, each validating shape,
//! extracting the bearer token, delegating to `Lifecycle` or
//! `LocationPipeline`, and mapping the result to JSON the way the
//! teacher's `db::*`/`demarch_*` handlers wrap `PgPool` calls.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wayfarian_core::{CoordinatorError, ErrorKind, RideEventType, new_id};

use crate::AppState;

pub struct ApiError(pub CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorKind,
    message: String,
    #[serde(rename = "requestId")]
    request_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.0.kind,
            message: self.0.message,
            request_id: self.0.request_id,
        };
        (status, Json(body)).into_response()
    }
}

async fn authenticate(state: &AppState, headers: &HeaderMap, request_id: &str) -> Result<wayfarian_core::AuthContext, ApiError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError(CoordinatorError::not_authorized(request_id, "missing bearer token")))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError(CoordinatorError::not_authorized(request_id, "malformed authorization header")))?;
    state
        .token_verifier
        .verify(token)
        .await
        .map_err(|_| ApiError(CoordinatorError::not_authorized(request_id, "invalid or expired token")))
}

async fn enforce_rate_limit(state: &AppState, request_id: &str, user_id: &str) -> Result<(), ApiError> {
    if state.http_rate_limiter.allow(user_id).await {
        Ok(())
    } else {
        Err(ApiError(CoordinatorError::unavailable(
            request_id,
            "rate limit exceeded, retry later",
        )))
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "wayfariand",
    })
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    store_connected: bool,
    cache_disabled: bool,
}

pub async fn readyz(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ready",
        store_connected: state.store.is_connected().await,
        cache_disabled: state.config.cache.disabled,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartGroupJourneyBody {
    pub group_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub end_latitude: f64,
    pub end_longitude: f64,
}

pub async fn start_group_journey(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StartGroupJourneyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;
    enforce_rate_limit(&state, &request_id, &auth.user_id).await?;
    let view = state
        .lifecycle
        .start_group_journey(
            &auth,
            &request_id,
            &body.group_id,
            body.title,
            body.description,
            body.end_latitude,
            body.end_longitude,
        )
        .await?;
    Ok(Json(serde_json::to_value(view).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMyInstanceBody {
    pub start_latitude: f64,
    pub start_longitude: f64,
    pub start_address: Option<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn start_my_instance(
    State(state): State<AppState>,
    Path(journey_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StartMyInstanceBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;
    enforce_rate_limit(&state, &request_id, &auth.user_id).await?;
    let _ = body.start_address;
    let instance = state
        .lifecycle
        .start_my_instance(
            &auth,
            &request_id,
            &journey_id,
            body.start_latitude,
            body.start_longitude,
            body.force,
        )
        .await?;
    Ok(Json(serde_json::to_value(instance).unwrap_or_default()))
}

pub async fn get_group_journey(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;
    let view = state.lifecycle.get_group_journey(&auth, &request_id, &id).await?;
    Ok(Json(serde_json::to_value(view).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdateBody {
    pub latitude: f64,
    pub longitude: f64,
    pub distance_delta_km: f64,
    pub speed_kmh: f64,
    pub route_point: Option<crate::location::RoutePointInput>,
}

/// Per-instance throttle (§4.3, §6.1): frames arriving inside the minimum
/// spacing window are dropped silently and never advance statistics — the
/// caller still gets a 200 with the instance's unchanged last-known totals.
pub async fn update_instance_location(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<LocationUpdateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;

    if !state.location_throttle.allow(&id).await {
        let instance = state
            .store
            .get_instance(&id)
            .await
            .map_err(|_| ApiError(CoordinatorError::server_error(&request_id, "get_instance")))?
            .ok_or_else(|| ApiError(CoordinatorError::not_found(&request_id, "instance")))?;
        if instance.user_id != auth.user_id {
            return Err(ApiError(CoordinatorError::not_your_instance(&request_id)));
        }
        return Ok(Json(serde_json::json!({
            "instanceId": instance.id,
            "totalDistanceKm": instance.total_distance_km,
            "totalTimeSecs": instance.total_time_secs,
            "avgSpeedKmh": instance.avg_speed_kmh,
            "topSpeedKmh": instance.top_speed_kmh,
            "clamped": false,
            "throttled": true,
        })));
    }

    let response = state
        .location
        .update_location(
            &auth,
            &request_id,
            &id,
            crate::location::LocationUpdateRequest {
                latitude: body.latitude,
                longitude: body.longitude,
                distance_delta_km: body.distance_delta_km,
                speed_kmh: body.speed_kmh,
                route_point: body.route_point,
            },
        )
        .await?;
    Ok(Json(serde_json::to_value(response).unwrap_or_default()))
}

pub async fn pause_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;
    let instance = state.lifecycle.pause_instance(&auth, &request_id, &id).await?;
    Ok(Json(serde_json::to_value(instance).unwrap_or_default()))
}

pub async fn resume_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;
    let instance = state.lifecycle.resume_instance(&auth, &request_id, &id).await?;
    Ok(Json(serde_json::to_value(instance).unwrap_or_default()))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CompleteInstanceBody {
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
}

pub async fn complete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<CompleteInstanceBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let instance = state
        .lifecycle
        .complete_instance(&auth, &request_id, &id, body.end_latitude, body.end_longitude)
        .await?;
    Ok(Json(serde_json::to_value(instance).unwrap_or_default()))
}

pub async fn get_my_instance(
    State(state): State<AppState>,
    Path(journey_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;
    let instance = state
        .lifecycle
        .get_my_instance(&auth, &request_id, &journey_id)
        .await?;
    Ok(Json(serde_json::to_value(instance).unwrap_or_default()))
}

pub async fn get_active_for_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;
    let journey = state
        .lifecycle
        .get_active_for_group(&auth, &request_id, &group_id)
        .await?;
    Ok(Json(serde_json::to_value(journey).unwrap_or_default()))
}

pub async fn get_group_journey_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;
    let summary = state
        .lifecycle
        .get_group_journey_summary(&auth, &request_id, &id)
        .await?;
    Ok(Json(serde_json::to_value(summary).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub since: Option<String>,
    pub limit: Option<i64>,
}

pub async fn get_ride_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;
    let since: Option<DateTime<Utc>> = query
        .since
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let events = state
        .lifecycle
        .get_ride_events(&auth, &request_id, &id, since, limit)
        .await?;
    Ok(Json(serde_json::to_value(events).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRideEventBody {
    #[serde(rename = "type")]
    pub event_type: RideEventType,
    pub message: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub media_ref: Option<String>,
    pub data: Option<serde_json::Value>,
}

pub async fn post_ride_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PostRideEventBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request_id = new_id();
    let auth = authenticate(&state, &headers, &request_id).await?;
    let event = state
        .lifecycle
        .post_ride_event(
            &auth,
            &request_id,
            &id,
            body.event_type,
            body.message,
            body.latitude,
            body.longitude,
            body.media_ref,
            body.data,
        )
        .await?;
    Ok(Json(serde_json::to_value(event).unwrap_or_default()))
}
