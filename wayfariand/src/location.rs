//! Validates, clamps, persists, and fans out a single location update
//! (§4.4). The six numbered steps in the spec are reflected directly in
//! the numbered comments below; step 6 (persistence) and step 7 (fan-out)
//! are best-effort relative to 1-5 — if persistence fails the already
//! computed in-memory totals are still returned to the caller per the
//! "steps 1-5 still apply" rule, but the response and broadcast only ever
//! reflect what was actually written through.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use wayfarian_core::cache::keys;
use wayfarian_core::eventbus::rooms;
use wayfarian_core::{
    AuthContext, Cache, CoordinatorConfig, CoordinatorError, EventBus, InstanceStatus,
    JourneyInstance, RoutePoint, StoreBackend, is_valid_coordinate,
};

const MAX_DISTANCE_DELTA_KM: f64 = 10.0;
const MAX_SPEED_KMH: f64 = 250.0;
const DEFAULT_ELAPSED_SECS: f64 = 60.0;

pub struct LocationPipeline {
    pub store: Arc<dyn StoreBackend>,
    pub cache: Arc<Cache>,
    pub bus: Arc<EventBus>,
    pub config: Arc<CoordinatorConfig>,
}

#[derive(Debug, Deserialize)]
pub struct LocationUpdateRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub distance_delta_km: f64,
    pub speed_kmh: f64,
    pub route_point: Option<RoutePointInput>,
}

#[derive(Debug, Deserialize)]
pub struct RoutePointInput {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: Option<f64>,
    pub heading: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct LocationUpdateResponse {
    pub instance_id: String,
    pub total_distance_km: f64,
    pub total_time_secs: i64,
    pub avg_speed_kmh: f64,
    pub top_speed_kmh: f64,
    pub clamped: bool,
}

impl LocationPipeline {
    pub async fn update_location(
        &self,
        auth: &AuthContext,
        request_id: &str,
        instance_id: &str,
        req: LocationUpdateRequest,
    ) -> Result<LocationUpdateResponse, CoordinatorError> {
        if !is_valid_coordinate(req.latitude, req.longitude) {
            return Err(CoordinatorError::invalid_input(
                request_id,
                "latitude/longitude out of range",
            ));
        }

        let instance = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(|e| {
                warn!(request_id, err = %e, "get_instance failed");
                CoordinatorError::server_error(request_id, "get_instance")
            })?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "instance"))?;

        if instance.user_id != auth.user_id {
            return Err(CoordinatorError::not_your_instance(request_id));
        }
        if instance.status != InstanceStatus::Active {
            return Err(CoordinatorError::not_active(request_id));
        }

        let now = Utc::now();

        // 1. Per-update distance cap.
        let mut delta_km = req.distance_delta_km.clamp(0.0, MAX_DISTANCE_DELTA_KM);
        let mut clamped = delta_km != req.distance_delta_km;

        // 2. Rate-consistency cap: sustained speed implied by this delta
        // over the elapsed time since the last accepted update may not
        // exceed 250 km/h.
        let elapsed_secs = (now - instance.last_location_update)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let elapsed_secs = if elapsed_secs > 0.0 {
            elapsed_secs
        } else {
            DEFAULT_ELAPSED_SECS
        };
        let max_delta_for_elapsed = elapsed_secs / 3600.0 * MAX_SPEED_KMH;
        if delta_km / elapsed_secs * 3600.0 > MAX_SPEED_KMH {
            warn!(
                request_id,
                instance_id,
                delta_km,
                elapsed_secs,
                "location update implied speed exceeds sustained cap, clamping"
            );
            delta_km = max_delta_for_elapsed;
            clamped = true;
        }

        // 3. Speed clamp and top-speed tracking.
        let speed_kmh = req.speed_kmh.clamp(0.0, MAX_SPEED_KMH);
        if req.speed_kmh != speed_kmh {
            clamped = true;
        }
        let top_speed_kmh = instance.top_speed_kmh.max(speed_kmh);

        // 4. Cumulative totals.
        let total_distance_km = instance.total_distance_km + delta_km;
        let total_time_secs = (now - instance.start_time).num_seconds().max(0);
        let avg_speed_kmh = if total_time_secs > 0 {
            (total_distance_km / total_time_secs as f64 * 3600.0).min(MAX_SPEED_KMH)
        } else {
            0.0
        };

        // 5. Route point (ordered, no dedup).
        let mut route_points = instance.route_points.clone();
        if let Some(ref point) = req.route_point {
            if !is_valid_coordinate(point.latitude, point.longitude) {
                return Err(CoordinatorError::invalid_input(
                    request_id,
                    "route point latitude/longitude out of range",
                ));
            }
            route_points.push(RoutePoint {
                latitude: point.latitude,
                longitude: point.longitude,
                timestamp: now,
                speed_kmh: point.speed_kmh.or(Some(speed_kmh)),
                heading: point.heading,
            });
        }

        // 6. Persistence. A failure here is surfaced to the caller, but the
        // computed totals above are never partially written — the store
        // update is a single statement.
        self.store
            .update_instance_location(
                instance_id,
                req.latitude,
                req.longitude,
                now,
                total_distance_km,
                total_time_secs,
                avg_speed_kmh,
                top_speed_kmh,
                &route_points,
            )
            .await
            .map_err(|e| {
                warn!(request_id, err = %e, "update_instance_location failed");
                CoordinatorError::server_error(request_id, "update_instance_location")
            })?;

        let mut updated = instance;
        updated.current_latitude = req.latitude;
        updated.current_longitude = req.longitude;
        updated.last_location_update = now;
        updated.total_distance_km = total_distance_km;
        updated.total_time_secs = total_time_secs;
        updated.avg_speed_kmh = avg_speed_kmh;
        updated.top_speed_kmh = top_speed_kmh;
        updated.route_points = route_points;

        self.cache
            .set(
                &keys::instance(instance_id),
                &updated,
                Duration::from_secs(self.config.cache.instance_ttl_secs),
            )
            .await;
        self.cache
            .set(
                &keys::user_instance(&auth.user_id, &updated.group_journey_id),
                &Some(updated.clone()),
                Duration::from_secs(self.config.cache.instance_ttl_secs),
            )
            .await;
        self.cache
            .del_pattern(&keys::group_journey_full_pattern(&updated.group_journey_id))
            .await;

        // 7. Fan-out (best-effort; never fails the request).
        self.bus
            .emit(
                &rooms::group_journey(&updated.group_journey_id),
                serde_json::json!({
                    "event": "member:location-updated",
                    "timestamp": now,
                    "snapshot": {
                        "id": updated.id,
                        "userId": updated.user_id,
                        "displayName": auth.display_name,
                        "currentLatitude": updated.current_latitude,
                        "currentLongitude": updated.current_longitude,
                        "speedKmh": speed_kmh,
                        "totalDistanceKm": updated.total_distance_km,
                        "totalTimeSecs": updated.total_time_secs,
                        "topSpeedKmh": updated.top_speed_kmh,
                        "status": updated.status,
                        "lastLocationUpdate": updated.last_location_update,
                    },
                })
                .to_string(),
            )
            .await;

        Ok(LocationUpdateResponse {
            instance_id: updated.id,
            total_distance_km: updated.total_distance_km,
            total_time_secs: updated.total_time_secs,
            avg_speed_kmh: updated.avg_speed_kmh,
            top_speed_kmh: updated.top_speed_kmh,
            clamped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfarian_core::test_support::MemoryStore;

    fn pipeline_with(instance: JourneyInstance) -> (LocationPipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.seed_user(wayfarian_core::User {
            id: instance.user_id.clone(),
            display_name: "Rider".to_string(),
            photo_ref: None,
            total_distance_km: 0.0,
            total_time_secs: 0,
            top_speed_kmh: 0.0,
            total_trips: 0,
        });
        store.seed_instance(instance);
        let pipeline = LocationPipeline {
            store: store.clone(),
            cache: Arc::new(Cache::new(true)),
            bus: Arc::new(EventBus::new()),
            config: Arc::new(CoordinatorConfig::default()),
        };
        (pipeline, store)
    }

    fn auth_for(instance: &JourneyInstance) -> AuthContext {
        AuthContext {
            user_id: instance.user_id.clone(),
            display_name: "Rider".to_string(),
        }
    }

    fn base_instance() -> JourneyInstance {
        let now = Utc::now();
        JourneyInstance {
            id: "instance-1".into(),
            group_journey_id: "journey-1".into(),
            user_id: "user-1".into(),
            status: InstanceStatus::Active,
            start_time: now - chrono::Duration::seconds(60),
            end_time: None,
            current_latitude: 37.0,
            current_longitude: -122.0,
            last_location_update: now - chrono::Duration::seconds(2),
            total_distance_km: 1.0,
            total_time_secs: 58,
            avg_speed_kmh: 62.0,
            top_speed_kmh: 70.0,
            route_points: vec![],
        }
    }

    #[test]
    fn per_update_distance_cap_clamps() {
        let delta = 50.0_f64.clamp(0.0, MAX_DISTANCE_DELTA_KM);
        assert_eq!(delta, MAX_DISTANCE_DELTA_KM);
    }

    #[test]
    fn rate_consistency_cap_formula() {
        // 50 km in 1 second implies far more than 250 km/h; the clamp
        // formula caps it to elapsed/3600 * 250.
        let elapsed_secs = 1.0_f64;
        let max_delta = elapsed_secs / 3600.0 * MAX_SPEED_KMH;
        assert!((max_delta - 0.069_444).abs() < 1e-3);
    }

    #[test]
    fn instance_fixture_is_active() {
        assert_eq!(base_instance().status, InstanceStatus::Active);
    }

    // P3: totals only ever grow, never regress, across a run of updates.
    #[tokio::test]
    async fn totals_accumulate_monotonically() {
        let instance = base_instance();
        let auth = auth_for(&instance);
        let (pipeline, _store) = pipeline_with(instance.clone());

        let first = pipeline
            .update_location(
                &auth,
                "req-1",
                &instance.id,
                LocationUpdateRequest {
                    latitude: 37.01,
                    longitude: -122.01,
                    distance_delta_km: 0.05,
                    speed_kmh: 40.0,
                    route_point: None,
                },
            )
            .await
            .unwrap();
        let second = pipeline
            .update_location(
                &auth,
                "req-2",
                &instance.id,
                LocationUpdateRequest {
                    latitude: 37.02,
                    longitude: -122.02,
                    distance_delta_km: 0.03,
                    speed_kmh: 45.0,
                    route_point: None,
                },
            )
            .await
            .unwrap();

        assert!(second.total_distance_km > first.total_distance_km);
        assert!(second.total_time_secs >= first.total_time_secs);
        assert!(!first.clamped);
        assert!(!second.clamped);
    }

    // P4: an implausible single-frame jump is clamped, not rejected outright.
    #[tokio::test]
    async fn implausible_distance_delta_is_clamped() {
        let instance = base_instance();
        let auth = auth_for(&instance);
        let (pipeline, _store) = pipeline_with(instance.clone());

        let response = pipeline
            .update_location(
                &auth,
                "req-1",
                &instance.id,
                LocationUpdateRequest {
                    latitude: 38.0,
                    longitude: -123.0,
                    distance_delta_km: 500.0,
                    speed_kmh: 60.0,
                    route_point: None,
                },
            )
            .await
            .unwrap();

        assert!(response.clamped);
        assert!(response.total_distance_km <= instance.total_distance_km + MAX_DISTANCE_DELTA_KM);
    }

    // A paused instance rejects location updates.
    #[tokio::test]
    async fn paused_instance_rejects_location_update() {
        let mut instance = base_instance();
        instance.status = InstanceStatus::Paused;
        let auth = auth_for(&instance);
        let (pipeline, _store) = pipeline_with(instance.clone());

        let err = pipeline
            .update_location(
                &auth,
                "req-1",
                &instance.id,
                LocationUpdateRequest {
                    latitude: 37.01,
                    longitude: -122.01,
                    distance_delta_km: 1.0,
                    speed_kmh: 30.0,
                    route_point: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, wayfarian_core::ErrorKind::NotActive);
    }

    // A route point is appended in order alongside the running totals.
    #[tokio::test]
    async fn route_point_is_appended() {
        let instance = base_instance();
        let auth = auth_for(&instance);
        let (pipeline, store) = pipeline_with(instance.clone());

        pipeline
            .update_location(
                &auth,
                "req-1",
                &instance.id,
                LocationUpdateRequest {
                    latitude: 37.01,
                    longitude: -122.01,
                    distance_delta_km: 1.0,
                    speed_kmh: 30.0,
                    route_point: Some(RoutePointInput {
                        latitude: 37.01,
                        longitude: -122.01,
                        speed_kmh: Some(30.0),
                        heading: None,
                    }),
                },
            )
            .await
            .unwrap();

        let stored = store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.route_points.len(), 1);
    }
}
