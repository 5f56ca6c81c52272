//! Enforces the GroupJourney/JourneyInstance state machines (§4.5).
//!
//! Each method here is a complete coordinator operation: authorize, guard
//! invariants, write through the store, update the cache, fan out over the
//! event bus, and return a response DTO or a `CoordinatorError`. Internal
//! collaborator calls (store, cache) use `anyhow::Result` and are converted
//! at the edge with `CoordinatorError::server_error`, the way the teacher's
//! request handlers wrap `PgPool` failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use wayfarian_core::cache::keys;
use wayfarian_core::eventbus::rooms;
use wayfarian_core::{
    AchievementEvaluator, AuthContext, Cache, CoordinatorConfig, CoordinatorError,
    CreateInstanceOutcome, CreateJourneyOutcome, ErrorKind, EventBus, GroupJourney, GroupMember,
    InstanceStatus, JourneyInstance, JourneyStatus, MemberRole, Notifier, NotificationKind,
    NotificationPayload, RideEvent, RideEventType, RoutePoint, SoloJourneyGuard, StoreBackend,
    is_valid_coordinate, new_id,
};

pub struct Lifecycle {
    pub store: Arc<dyn StoreBackend>,
    pub cache: Arc<Cache>,
    pub bus: Arc<EventBus>,
    pub notifier: Arc<dyn Notifier>,
    pub solo_guard: Arc<dyn SoloJourneyGuard>,
    pub achievements: Arc<dyn AchievementEvaluator>,
    pub config: Arc<CoordinatorConfig>,
}

#[derive(Debug, Serialize)]
pub struct MemberView {
    pub user_id: String,
    pub display_name: String,
    pub photo_ref: Option<String>,
    pub role: MemberRole,
}

#[derive(Debug, Serialize)]
pub struct GroupJourneyView {
    #[serde(flatten)]
    pub journey: GroupJourney,
    pub members: Vec<MemberView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupJourneyFullView {
    #[serde(flatten)]
    pub journey: GroupJourney,
    pub instances: Vec<JourneyInstance>,
}

#[derive(Debug, Serialize)]
pub struct JourneySummaryView {
    pub journey_id: String,
    pub total_distance_km: f64,
    pub total_time_secs: i64,
    pub top_speed_kmh: f64,
    pub photo_count: i64,
    pub member_count: i64,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub ended_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct LocationSnapshot {
    pub id: String,
    pub user_id: String,
    pub display_name: String,
    pub photo_ref: Option<String>,
    pub current_latitude: f64,
    pub current_longitude: f64,
    pub speed_kmh: f64,
    pub total_distance_km: f64,
    pub total_time_secs: i64,
    pub top_speed_kmh: f64,
    pub status: InstanceStatus,
    pub last_location_update: chrono::DateTime<Utc>,
}

fn server_error(request_id: &str, operation: &str, err: anyhow::Error) -> CoordinatorError {
    warn!(request_id, operation, err = %err, "collaborator call failed");
    CoordinatorError::server_error(request_id, operation)
}

impl Lifecycle {
    async fn require_member(
        &self,
        group_id: &str,
        user_id: &str,
        request_id: &str,
    ) -> Result<GroupMember, CoordinatorError> {
        let member = self
            .store
            .get_group_member(group_id, user_id)
            .await
            .map_err(|e| server_error(request_id, "get_group_member", e))?;
        member.ok_or_else(|| CoordinatorError::not_a_member(request_id))
    }

    async fn members_with_users(
        &self,
        group_id: &str,
        request_id: &str,
    ) -> Result<Vec<MemberView>, CoordinatorError> {
        let (_group, members) = self
            .store
            .get_group_with_members(group_id)
            .await
            .map_err(|e| server_error(request_id, "get_group_with_members", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "group"))?;
        Ok(members
            .into_iter()
            .map(|(m, u)| MemberView {
                user_id: m.user_id,
                display_name: u.display_name,
                photo_ref: u.photo_ref,
                role: m.role,
            })
            .collect())
    }

    pub async fn start_group_journey(
        &self,
        auth: &AuthContext,
        request_id: &str,
        group_id: &str,
        title: Option<String>,
        description: Option<String>,
        end_latitude: f64,
        end_longitude: f64,
    ) -> Result<GroupJourneyView, CoordinatorError> {
        if !is_valid_coordinate(end_latitude, end_longitude) {
            return Err(CoordinatorError::invalid_input(
                request_id,
                "endLatitude/endLongitude out of range",
            ));
        }

        let (group, members) = self
            .store
            .get_group_with_members(group_id)
            .await
            .map_err(|e| server_error(request_id, "get_group_with_members", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "group"))?;

        let caller = members
            .iter()
            .find(|(m, _)| m.user_id == auth.user_id)
            .map(|(m, _)| m.role)
            .ok_or_else(|| CoordinatorError::not_a_member(request_id))?;
        if !matches!(caller, MemberRole::Creator | MemberRole::Admin) {
            return Err(CoordinatorError::not_authorized(
                request_id,
                "only the group's creator or an admin can start a journey",
            ));
        }

        if self
            .store
            .get_active_group_journey(group_id)
            .await
            .map_err(|e| server_error(request_id, "get_active_group_journey", e))?
            .is_some()
        {
            return Err(CoordinatorError::conflict(
                request_id,
                "an active journey already exists for this group",
            ));
        }

        let journey = GroupJourney {
            id: new_id(),
            group_id: group_id.to_string(),
            creator_id: auth.user_id.clone(),
            title: title.unwrap_or_else(|| "Group ride".to_string()),
            description,
            end_latitude,
            end_longitude,
            status: JourneyStatus::Active,
            started_at: Utc::now(),
            completed_at: None,
        };

        match self
            .store
            .create_group_journey(&journey)
            .await
            .map_err(|e| server_error(request_id, "create_group_journey", e))?
        {
            CreateJourneyOutcome::Created => {}
            CreateJourneyOutcome::AlreadyActive => {
                return Err(CoordinatorError::conflict(
                    request_id,
                    "an active journey already exists for this group",
                ));
            }
        }

        self.cache
            .set(
                &keys::group_active_journey(group_id),
                &journey,
                Duration::from_secs(self.config.cache.active_journey_ttl_secs),
            )
            .await;

        let member_views: Vec<MemberView> = members
            .iter()
            .map(|(m, u)| MemberView {
                user_id: m.user_id.clone(),
                display_name: u.display_name.clone(),
                photo_ref: u.photo_ref.clone(),
                role: m.role,
            })
            .collect();

        for (member, _user) in &members {
            self.bus
                .emit(
                    &rooms::user(&member.user_id),
                    serde_json::json!({
                        "event": "group-journey:started",
                        "journeyId": journey.id,
                        "groupId": group.id,
                        "groupName": group.name,
                        "title": journey.title,
                        "description": journey.description,
                        "creatorId": journey.creator_id,
                        "endLatitude": journey.end_latitude,
                        "endLongitude": journey.end_longitude,
                        "timestamp": Utc::now(),
                    })
                    .to_string(),
                )
                .await;

            if member.user_id != auth.user_id {
                self.notifier
                    .notify(NotificationPayload {
                        kind: NotificationKind::JourneyStarted,
                        group_id: group.id.clone(),
                        group_journey_id: journey.id.clone(),
                        user_id: Some(member.user_id.clone()),
                        message: format!("{} started a group ride", auth.display_name),
                    })
                    .await;
            }
        }

        info!(journey_id = %journey.id, group_id, "group journey started");

        Ok(GroupJourneyView {
            journey,
            members: member_views,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn start_my_instance(
        &self,
        auth: &AuthContext,
        request_id: &str,
        journey_id: &str,
        start_latitude: f64,
        start_longitude: f64,
        force: bool,
    ) -> Result<JourneyInstance, CoordinatorError> {
        if !is_valid_coordinate(start_latitude, start_longitude) {
            return Err(CoordinatorError::invalid_input(
                request_id,
                "startLatitude/startLongitude out of range",
            ));
        }

        let journey = self
            .store
            .get_group_journey(journey_id)
            .await
            .map_err(|e| server_error(request_id, "get_group_journey", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "group journey"))?;
        if journey.status != JourneyStatus::Active {
            return Err(CoordinatorError::new(
                ErrorKind::NotActive,
                "group journey is not active",
                request_id,
            ));
        }

        self.require_member(&journey.group_id, &auth.user_id, request_id)
            .await?;

        if self
            .solo_guard
            .has_active_solo_journey(&auth.user_id)
            .await
            .map_err(|e| server_error(request_id, "has_active_solo_journey", e))?
        {
            if !force {
                return Err(CoordinatorError::conflict(
                    request_id,
                    "an active solo journey is already in progress",
                ));
            }
            self.solo_guard
                .complete_active_solo_journey(&auth.user_id)
                .await
                .map_err(|e| server_error(request_id, "complete_active_solo_journey", e))?;
        }

        let has_other_nonterminal = self
            .store
            .get_other_nonterminal_instance(&auth.user_id, journey_id)
            .await
            .map_err(|e| server_error(request_id, "get_other_nonterminal_instance", e))?
            .is_some();
        if has_other_nonterminal {
            return Err(CoordinatorError::conflict(
                request_id,
                "caller already has a non-terminal instance on another journey",
            ));
        }

        let now = Utc::now();
        let start_point = RoutePoint {
            latitude: start_latitude,
            longitude: start_longitude,
            timestamp: now,
            speed_kmh: None,
            heading: None,
        };

        let existing = self
            .store
            .get_instance_by_journey_user(journey_id, &auth.user_id)
            .await
            .map_err(|e| server_error(request_id, "get_instance_by_journey_user", e))?;

        let instance = match existing {
            Some(existing) if existing.status == InstanceStatus::Active => {
                return Err(CoordinatorError::already_started(request_id));
            }
            Some(existing) => {
                self.store
                    .reactivate_instance(
                        &existing.id,
                        start_latitude,
                        start_longitude,
                        now,
                        &[existing.route_points.clone(), vec![start_point]].concat(),
                    )
                    .await
                    .map_err(|e| server_error(request_id, "reactivate_instance", e))?;
                self.store
                    .get_instance(&existing.id)
                    .await
                    .map_err(|e| server_error(request_id, "get_instance", e))?
                    .ok_or_else(|| CoordinatorError::not_found(request_id, "instance"))?
            }
            None => {
                let instance = JourneyInstance {
                    id: new_id(),
                    group_journey_id: journey_id.to_string(),
                    user_id: auth.user_id.clone(),
                    status: InstanceStatus::Active,
                    start_time: now,
                    end_time: None,
                    current_latitude: start_latitude,
                    current_longitude: start_longitude,
                    last_location_update: now,
                    total_distance_km: 0.0,
                    total_time_secs: 0,
                    avg_speed_kmh: 0.0,
                    top_speed_kmh: 0.0,
                    route_points: vec![start_point],
                };
                match self
                    .store
                    .create_instance(&instance)
                    .await
                    .map_err(|e| server_error(request_id, "create_instance", e))?
                {
                    CreateInstanceOutcome::Created => instance,
                    CreateInstanceOutcome::AlreadyOwnedByAnotherNonTerminal => self
                        .store
                        .get_instance_by_journey_user(journey_id, &auth.user_id)
                        .await
                        .map_err(|e| server_error(request_id, "get_instance_by_journey_user", e))?
                        .ok_or_else(|| CoordinatorError::not_found(request_id, "instance"))?,
                }
            }
        };

        self.store
            .upsert_group_member(&GroupMember {
                group_id: journey.group_id.clone(),
                user_id: auth.user_id.clone(),
                role: MemberRole::Member,
                last_latitude: Some(start_latitude),
                last_longitude: Some(start_longitude),
                last_seen: Some(now),
                is_location_shared: true,
            })
            .await
            .map_err(|e| server_error(request_id, "upsert_group_member", e))?;

        self.cache
            .set(
                &keys::instance(&instance.id),
                &instance,
                Duration::from_secs(self.config.cache.instance_ttl_secs),
            )
            .await;
        self.cache
            .set(
                &keys::user_instance(&auth.user_id, journey_id),
                &Some(instance.clone()),
                Duration::from_secs(self.config.cache.instance_ttl_secs),
            )
            .await;
        self.cache
            .del_pattern(&keys::group_journey_full_pattern(journey_id))
            .await;

        self.bus
            .emit(
                &rooms::group(&journey.group_id),
                serde_json::json!({
                    "event": "member:started-instance",
                    "journeyId": journey_id,
                    "instanceId": instance.id,
                    "userId": auth.user_id,
                    "user": {"displayName": auth.display_name},
                    "startLatitude": start_latitude,
                    "startLongitude": start_longitude,
                    "timestamp": now,
                })
                .to_string(),
            )
            .await;

        self.bus
            .emit(
                &rooms::group_journey(journey_id),
                serde_json::json!({
                    "event": "member:location-updated",
                    "timestamp": now,
                    "snapshot": self.location_snapshot(&instance, &auth.display_name, None),
                })
                .to_string(),
            )
            .await;

        let event = RideEvent {
            id: new_id(),
            group_journey_id: journey_id.to_string(),
            instance_id: Some(instance.id.clone()),
            user_id: auth.user_id.clone(),
            event_type: RideEventType::MemberStarted,
            message: None,
            latitude: Some(start_latitude),
            longitude: Some(start_longitude),
            media_ref: None,
            data: None,
            created_at: now,
        };
        self.store
            .create_ride_event(&event)
            .await
            .map_err(|e| server_error(request_id, "create_ride_event", e))?;
        self.bus
            .emit(
                &rooms::group_journey(journey_id),
                serde_json::json!({"event": "group-journey:event", "rideEvent": event}).to_string(),
            )
            .await;

        Ok(instance)
    }

    fn location_snapshot(
        &self,
        instance: &JourneyInstance,
        display_name: &str,
        photo_ref: Option<String>,
    ) -> LocationSnapshot {
        LocationSnapshot {
            id: instance.id.clone(),
            user_id: instance.user_id.clone(),
            display_name: display_name.to_string(),
            photo_ref,
            current_latitude: instance.current_latitude,
            current_longitude: instance.current_longitude,
            speed_kmh: instance
                .route_points
                .last()
                .and_then(|p| p.speed_kmh)
                .unwrap_or(0.0),
            total_distance_km: instance.total_distance_km,
            total_time_secs: instance.total_time_secs,
            top_speed_kmh: instance.top_speed_kmh,
            status: instance.status,
            last_location_update: instance.last_location_update,
        }
    }

    pub async fn pause_instance(
        &self,
        auth: &AuthContext,
        request_id: &str,
        instance_id: &str,
    ) -> Result<JourneyInstance, CoordinatorError> {
        self.transition_instance(
            auth,
            request_id,
            instance_id,
            &[InstanceStatus::Active],
            InstanceStatus::Paused,
            "member:journey-paused",
        )
        .await
    }

    pub async fn resume_instance(
        &self,
        auth: &AuthContext,
        request_id: &str,
        instance_id: &str,
    ) -> Result<JourneyInstance, CoordinatorError> {
        self.transition_instance(
            auth,
            request_id,
            instance_id,
            &[InstanceStatus::Paused],
            InstanceStatus::Active,
            "member:journey-resumed",
        )
        .await
    }

    async fn transition_instance(
        &self,
        auth: &AuthContext,
        request_id: &str,
        instance_id: &str,
        from: &[InstanceStatus],
        to: InstanceStatus,
        event_name: &str,
    ) -> Result<JourneyInstance, CoordinatorError> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(|e| server_error(request_id, "get_instance", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "instance"))?;
        if instance.user_id != auth.user_id {
            return Err(CoordinatorError::not_your_instance(request_id));
        }
        if !from.contains(&instance.status) {
            return Err(CoordinatorError::invalid_transition(
                request_id,
                format!("instance is not in a state that allows this transition (current: {:?})", instance.status),
            ));
        }

        let applied = self
            .store
            .transition_instance_status(instance_id, from, to)
            .await
            .map_err(|e| server_error(request_id, "transition_instance_status", e))?;
        if !applied {
            return Err(CoordinatorError::invalid_transition(
                request_id,
                "instance state changed concurrently",
            ));
        }

        self.cache.del(&keys::instance(instance_id)).await;
        self.cache
            .del(&keys::user_instance(&auth.user_id, &instance.group_journey_id))
            .await;
        self.cache
            .del_pattern(&keys::group_journey_full_pattern(&instance.group_journey_id))
            .await;

        self.bus
            .emit(
                &rooms::group_journey(&instance.group_journey_id),
                serde_json::json!({
                    "event": event_name,
                    "instanceId": instance_id,
                    "userId": auth.user_id,
                    "status": to,
                    "timestamp": Utc::now(),
                })
                .to_string(),
            )
            .await;

        let mut instance = instance;
        instance.status = to;
        Ok(instance)
    }

    pub async fn complete_instance(
        &self,
        auth: &AuthContext,
        request_id: &str,
        instance_id: &str,
        end_latitude: Option<f64>,
        end_longitude: Option<f64>,
    ) -> Result<JourneyInstance, CoordinatorError> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(|e| server_error(request_id, "get_instance", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "instance"))?;
        if instance.user_id != auth.user_id {
            return Err(CoordinatorError::not_your_instance(request_id));
        }
        if instance.status == InstanceStatus::Completed {
            return Ok(instance);
        }

        let now = Utc::now();
        let total_time_secs = (now - instance.start_time).num_seconds().max(0);
        let avg_speed_kmh = if total_time_secs > 0 {
            (instance.total_distance_km / total_time_secs as f64 * 3600.0).min(250.0)
        } else {
            0.0
        };

        let changed = self
            .store
            .complete_instance(
                instance_id,
                now,
                end_latitude,
                end_longitude,
                instance.total_distance_km,
                total_time_secs,
                avg_speed_kmh,
                instance.top_speed_kmh,
            )
            .await
            .map_err(|e| server_error(request_id, "complete_instance", e))?;

        let instance = self
            .store
            .get_instance(instance_id)
            .await
            .map_err(|e| server_error(request_id, "get_instance", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "instance"))?;

        if !changed {
            return Ok(instance);
        }

        self.store
            .increment_user_stats(
                &auth.user_id,
                instance.total_distance_km,
                instance.total_time_secs,
                instance.top_speed_kmh,
            )
            .await
            .map_err(|e| server_error(request_id, "increment_user_stats", e))?;

        self.cache.del(&keys::instance(instance_id)).await;
        self.cache
            .del(&keys::user_instance(&auth.user_id, &instance.group_journey_id))
            .await;
        self.cache
            .del_pattern(&keys::group_journey_full_pattern(&instance.group_journey_id))
            .await;

        self.bus
            .emit(
                &rooms::group_journey(&instance.group_journey_id),
                serde_json::json!({
                    "event": "member:journey-completed",
                    "instanceId": instance.id,
                    "userId": auth.user_id,
                    "displayName": auth.display_name,
                    "totalDistance": instance.total_distance_km,
                    "duration": instance.total_time_secs,
                    "status": instance.status,
                    "timestamp": now,
                })
                .to_string(),
            )
            .await;

        let journey = self
            .store
            .get_group_journey(&instance.group_journey_id)
            .await
            .map_err(|e| server_error(request_id, "get_group_journey", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "group journey"))?;

        let group = self
            .store
            .get_group(&journey.group_id)
            .await
            .map_err(|e| server_error(request_id, "get_group", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "group"))?;
        self.store
            .create_journey_history_record(&wayfarian_core::JourneyHistoryRecord {
                id: new_id(),
                user_id: auth.user_id.clone(),
                group_journey_id: instance.group_journey_id.clone(),
                instance_id: instance.id.clone(),
                title: group.name.clone(),
                total_distance_km: instance.total_distance_km,
                total_time_secs: instance.total_time_secs,
                top_speed_kmh: instance.top_speed_kmh,
                started_at: instance.start_time,
                ended_at: instance.end_time.unwrap_or(now),
            })
            .await
            .map_err(|e| server_error(request_id, "create_journey_history_record", e))?;

        let event = RideEvent {
            id: new_id(),
            group_journey_id: instance.group_journey_id.clone(),
            instance_id: Some(instance.id.clone()),
            user_id: auth.user_id.clone(),
            event_type: RideEventType::MemberCompleted,
            message: None,
            latitude: end_latitude,
            longitude: end_longitude,
            media_ref: None,
            data: None,
            created_at: now,
        };
        self.store
            .create_ride_event(&event)
            .await
            .map_err(|e| server_error(request_id, "create_ride_event", e))?;
        self.bus
            .emit(
                &rooms::group(&journey.group_id),
                serde_json::json!({"event": "group-journey:event", "rideEvent": event}).to_string(),
            )
            .await;

        match self
            .achievements
            .evaluate(&auth.user_id, instance.total_distance_km, instance.top_speed_kmh)
            .await
        {
            Ok(Some(unlocked)) => {
                self.bus
                    .emit(
                        &rooms::user(&auth.user_id),
                        serde_json::json!({
                            "event": "achievement:unlocked",
                            "name": unlocked.name,
                            "description": unlocked.description,
                            "timestamp": now,
                        })
                        .to_string(),
                    )
                    .await;
            }
            Ok(None) => {}
            Err(err) => warn!(err = %err, "achievement evaluation failed"),
        }

        let remaining = self
            .store
            .count_nonterminal_instances_excluding(&instance.group_journey_id, &instance.id)
            .await
            .map_err(|e| server_error(request_id, "count_nonterminal_instances_excluding", e))?;
        if remaining == 0 {
            self.finish_group_journey(&instance.group_journey_id, request_id)
                .await?;
        }

        Ok(instance)
    }

    async fn finish_group_journey(
        &self,
        journey_id: &str,
        request_id: &str,
    ) -> Result<(), CoordinatorError> {
        let journey = self
            .store
            .get_group_journey(journey_id)
            .await
            .map_err(|e| server_error(request_id, "get_group_journey", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "group journey"))?;

        self.store
            .complete_group_journey(journey_id, Utc::now())
            .await
            .map_err(|e| server_error(request_id, "complete_group_journey", e))?;

        self.cache.del(&keys::group_journey(journey_id)).await;
        self.cache
            .del_pattern(&keys::group_journey_full_pattern(journey_id))
            .await;
        self.cache
            .del(&keys::group_active_journey(&journey.group_id))
            .await;

        self.bus
            .emit(
                &rooms::group_journey(journey_id),
                serde_json::json!({"event": "group-journey:completed", "journeyId": journey_id, "groupId": journey.group_id}).to_string(),
            )
            .await;
        self.bus
            .emit(
                &rooms::group(&journey.group_id),
                serde_json::json!({"event": "group-journey:completed", "journeyId": journey_id, "groupId": journey.group_id}).to_string(),
            )
            .await;

        self.store
            .set_group_active(&journey.group_id, false)
            .await
            .map_err(|e| server_error(request_id, "set_group_active", e))?;
        self.cache.del(&keys::group(&journey.group_id)).await;

        self.bus
            .emit(
                &rooms::group(&journey.group_id),
                serde_json::json!({"event": "group:archived", "groupId": journey.group_id}).to_string(),
            )
            .await;

        info!(journey_id, group_id = %journey.group_id, "group journey auto-closed");
        Ok(())
    }

    pub async fn get_group_journey(
        &self,
        auth: &AuthContext,
        request_id: &str,
        journey_id: &str,
    ) -> Result<GroupJourneyFullView, CoordinatorError> {
        if let Some(cached) = self
            .cache
            .get::<GroupJourneyFullView>(&keys::group_journey_full(journey_id))
            .await
        {
            self.require_member(&cached.journey.group_id, &auth.user_id, request_id)
                .await?;
            return Ok(cached);
        }

        let journey = match self.cache.get::<GroupJourney>(&keys::group_journey(journey_id)).await {
            Some(journey) => journey,
            None => {
                let journey = self
                    .store
                    .get_group_journey(journey_id)
                    .await
                    .map_err(|e| server_error(request_id, "get_group_journey", e))?
                    .ok_or_else(|| CoordinatorError::not_found(request_id, "group journey"))?;
                self.cache
                    .set(
                        &keys::group_journey(journey_id),
                        &journey,
                        Duration::from_secs(self.config.cache.journey_header_ttl_secs),
                    )
                    .await;
                journey
            }
        };
        self.require_member(&journey.group_id, &auth.user_id, request_id)
            .await?;

        let instances = self
            .store
            .get_instances_for_journey(journey_id)
            .await
            .map_err(|e| server_error(request_id, "get_instances_for_journey", e))?;
        let view = GroupJourneyFullView { journey, instances };
        self.cache
            .set(
                &keys::group_journey_full(journey_id),
                &view,
                Duration::from_secs(self.config.cache.journey_full_ttl_secs),
            )
            .await;
        Ok(view)
    }

    pub async fn get_my_instance(
        &self,
        auth: &AuthContext,
        request_id: &str,
        journey_id: &str,
    ) -> Result<Option<JourneyInstance>, CoordinatorError> {
        let journey = self
            .store
            .get_group_journey(journey_id)
            .await
            .map_err(|e| server_error(request_id, "get_group_journey", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "group journey"))?;
        self.require_member(&journey.group_id, &auth.user_id, request_id)
            .await?;

        let cache_key = keys::user_instance(&auth.user_id, journey_id);
        if let Some(cached) = self.cache.get::<Option<JourneyInstance>>(&cache_key).await {
            return Ok(cached);
        }

        let instance = self
            .store
            .get_instance_by_journey_user(journey_id, &auth.user_id)
            .await
            .map_err(|e| server_error(request_id, "get_instance_by_journey_user", e))?;
        self.cache
            .set(
                &cache_key,
                &instance,
                Duration::from_secs(self.config.cache.instance_ttl_secs),
            )
            .await;
        Ok(instance)
    }

    pub async fn get_active_for_group(
        &self,
        auth: &AuthContext,
        request_id: &str,
        group_id: &str,
    ) -> Result<Option<GroupJourney>, CoordinatorError> {
        self.require_member(group_id, &auth.user_id, request_id)
            .await?;
        if let Some(cached) = self
            .cache
            .get::<GroupJourney>(&keys::group_active_journey(group_id))
            .await
        {
            return Ok(Some(cached));
        }
        let journey = self
            .store
            .get_active_group_journey(group_id)
            .await
            .map_err(|e| server_error(request_id, "get_active_group_journey", e))?;
        if let Some(ref journey) = journey {
            self.cache
                .set(
                    &keys::group_active_journey(group_id),
                    journey,
                    Duration::from_secs(self.config.cache.active_journey_ttl_secs),
                )
                .await;
        }
        Ok(journey)
    }

    pub async fn get_group_journey_summary(
        &self,
        auth: &AuthContext,
        request_id: &str,
        journey_id: &str,
    ) -> Result<JourneySummaryView, CoordinatorError> {
        let journey = self
            .store
            .get_group_journey(journey_id)
            .await
            .map_err(|e| server_error(request_id, "get_group_journey", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "group journey"))?;
        self.require_member(&journey.group_id, &auth.user_id, request_id)
            .await?;

        let summary = self
            .store
            .get_journey_summary(journey_id)
            .await
            .map_err(|e| server_error(request_id, "get_journey_summary", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "group journey summary"))?;

        Ok(JourneySummaryView {
            journey_id: summary.journey_id,
            total_distance_km: summary.total_distance_km,
            total_time_secs: summary.total_time_secs,
            top_speed_kmh: summary.top_speed_kmh,
            photo_count: summary.photo_count,
            member_count: summary.member_count,
            started_at: summary.started_at,
            ended_at: summary.ended_at,
        })
    }

    pub async fn post_ride_event(
        &self,
        auth: &AuthContext,
        request_id: &str,
        journey_id: &str,
        event_type: RideEventType,
        message: Option<String>,
        latitude: Option<f64>,
        longitude: Option<f64>,
        media_ref: Option<String>,
        data: Option<serde_json::Value>,
    ) -> Result<RideEvent, CoordinatorError> {
        let journey = self
            .store
            .get_group_journey(journey_id)
            .await
            .map_err(|e| server_error(request_id, "get_group_journey", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "group journey"))?;
        self.require_member(&journey.group_id, &auth.user_id, request_id)
            .await?;

        if let (Some(lat), Some(lng)) = (latitude, longitude) {
            if !is_valid_coordinate(lat, lng) {
                return Err(CoordinatorError::invalid_input(
                    request_id,
                    "latitude/longitude out of range",
                ));
            }
        }

        let event = RideEvent {
            id: new_id(),
            group_journey_id: journey_id.to_string(),
            instance_id: None,
            user_id: auth.user_id.clone(),
            event_type,
            message,
            latitude,
            longitude,
            media_ref,
            data,
            created_at: Utc::now(),
        };
        self.store
            .create_ride_event(&event)
            .await
            .map_err(|e| server_error(request_id, "create_ride_event", e))?;
        self.cache
            .del_pattern(&keys::group_journey_full_pattern(journey_id))
            .await;
        self.bus
            .emit(
                &rooms::group_journey(journey_id),
                serde_json::json!({"event": "group-journey:event", "rideEvent": event}).to_string(),
            )
            .await;

        Ok(event)
    }

    pub async fn get_ride_events(
        &self,
        auth: &AuthContext,
        request_id: &str,
        journey_id: &str,
        since: Option<chrono::DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<RideEvent>, CoordinatorError> {
        let journey = self
            .store
            .get_group_journey(journey_id)
            .await
            .map_err(|e| server_error(request_id, "get_group_journey", e))?
            .ok_or_else(|| CoordinatorError::not_found(request_id, "group journey"))?;
        self.require_member(&journey.group_id, &auth.user_id, request_id)
            .await?;
        self.store
            .get_ride_events(journey_id, since, limit)
            .await
            .map_err(|e| server_error(request_id, "get_ride_events", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfarian_core::{
        ErrorKind, Group, MemberRole, NoopAchievementEvaluator, NoopNotifier,
        NoopSoloJourneyGuard,
    };
    use wayfarian_core::test_support::MemoryStore;

    fn fixture() -> (Lifecycle, String, AuthContext, AuthContext) {
        let store = Arc::new(MemoryStore::new());
        let creator = AuthContext {
            user_id: "creator".to_string(),
            display_name: "Creator".to_string(),
        };
        let member = AuthContext {
            user_id: "member".to_string(),
            display_name: "Member".to_string(),
        };
        let group_id = new_id();

        store.seed_user(wayfarian_core::User {
            id: creator.user_id.clone(),
            display_name: creator.display_name.clone(),
            photo_ref: None,
            total_distance_km: 0.0,
            total_time_secs: 0,
            top_speed_kmh: 0.0,
            total_trips: 0,
        });
        store.seed_user(wayfarian_core::User {
            id: member.user_id.clone(),
            display_name: member.display_name.clone(),
            photo_ref: None,
            total_distance_km: 0.0,
            total_time_secs: 0,
            top_speed_kmh: 0.0,
            total_trips: 0,
        });
        store.seed_group(Group {
            id: group_id.clone(),
            name: "Weekend crew".to_string(),
            creator_id: creator.user_id.clone(),
            is_active: true,
        });
        store.seed_member(GroupMember {
            group_id: group_id.clone(),
            user_id: creator.user_id.clone(),
            role: MemberRole::Creator,
            last_latitude: None,
            last_longitude: None,
            last_seen: None,
            is_location_shared: false,
        });
        store.seed_member(GroupMember {
            group_id: group_id.clone(),
            user_id: member.user_id.clone(),
            role: MemberRole::Member,
            last_latitude: None,
            last_longitude: None,
            last_seen: None,
            is_location_shared: false,
        });

        let lifecycle = Lifecycle {
            store,
            cache: Arc::new(Cache::new(true)),
            bus: Arc::new(EventBus::new()),
            notifier: Arc::new(NoopNotifier),
            solo_guard: Arc::new(NoopSoloJourneyGuard),
            achievements: Arc::new(NoopAchievementEvaluator),
            config: Arc::new(CoordinatorConfig::default()),
        };

        (lifecycle, group_id, creator, member)
    }

    // P1: at most one ACTIVE group journey per group.
    #[tokio::test]
    async fn only_one_active_journey_per_group() {
        let (lifecycle, group_id, creator, _member) = fixture();
        let first = lifecycle
            .start_group_journey(&creator, "req-1", &group_id, None, None, 10.0, 10.0)
            .await
            .unwrap();
        assert_eq!(first.journey.status, JourneyStatus::Active);

        let second = lifecycle
            .start_group_journey(&creator, "req-2", &group_id, None, None, 20.0, 20.0)
            .await;
        let err = second.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    // P2: at most one non-terminal instance per journey/user.
    #[tokio::test]
    async fn only_one_active_instance_per_user() {
        let (lifecycle, group_id, creator, _member) = fixture();
        let view = lifecycle
            .start_group_journey(&creator, "req-1", &group_id, None, None, 10.0, 10.0)
            .await
            .unwrap();
        let journey_id = view.journey.id.clone();

        lifecycle
            .start_my_instance(&creator, "req-2", &journey_id, 1.0, 1.0, false)
            .await
            .unwrap();

        let err = lifecycle
            .start_my_instance(&creator, "req-3", &journey_id, 1.0, 1.0, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyStarted);
    }

    // P5: completing the last non-terminal instance auto-closes the journey
    // and archives the group.
    #[tokio::test]
    async fn completing_last_instance_cascades_to_journey_and_group() {
        let (lifecycle, group_id, creator, member) = fixture();
        let view = lifecycle
            .start_group_journey(&creator, "req-1", &group_id, None, None, 10.0, 10.0)
            .await
            .unwrap();
        let journey_id = view.journey.id.clone();

        let creator_instance = lifecycle
            .start_my_instance(&creator, "req-2", &journey_id, 1.0, 1.0, false)
            .await
            .unwrap();
        let member_instance = lifecycle
            .start_my_instance(&member, "req-3", &journey_id, 1.0, 1.0, false)
            .await
            .unwrap();

        lifecycle
            .complete_instance(&creator, "req-4", &creator_instance.id, None, None)
            .await
            .unwrap();

        let journey = lifecycle.store.get_group_journey(&journey_id).await.unwrap().unwrap();
        assert_eq!(journey.status, JourneyStatus::Active);
        let group = lifecycle.store.get_group(&group_id).await.unwrap().unwrap();
        assert!(group.is_active);

        lifecycle
            .complete_instance(&member, "req-5", &member_instance.id, None, None)
            .await
            .unwrap();

        let journey = lifecycle.store.get_group_journey(&journey_id).await.unwrap().unwrap();
        assert_eq!(journey.status, JourneyStatus::Completed);
        let group = lifecycle.store.get_group(&group_id).await.unwrap().unwrap();
        assert!(!group.is_active);
    }

    // P6: completing an already-completed instance is idempotent.
    #[tokio::test]
    async fn complete_instance_is_idempotent() {
        let (lifecycle, group_id, creator, _member) = fixture();
        let view = lifecycle
            .start_group_journey(&creator, "req-1", &group_id, None, None, 10.0, 10.0)
            .await
            .unwrap();
        let journey_id = view.journey.id.clone();
        let instance = lifecycle
            .start_my_instance(&creator, "req-2", &journey_id, 1.0, 1.0, false)
            .await
            .unwrap();

        let first = lifecycle
            .complete_instance(&creator, "req-3", &instance.id, Some(2.0), Some(2.0))
            .await
            .unwrap();
        let second = lifecycle
            .complete_instance(&creator, "req-4", &instance.id, Some(9.0), Some(9.0))
            .await
            .unwrap();

        assert_eq!(first.status, InstanceStatus::Completed);
        assert_eq!(second.status, InstanceStatus::Completed);
        assert_eq!(first.current_latitude, second.current_latitude);

        let user = lifecycle.store.get_user(&creator.user_id).await.unwrap().unwrap();
        assert_eq!(user.total_trips, 1);
    }

    // S: pause then resume a journey instance, verifying the state machine's
    // ACTIVE <-> PAUSED edges and that an invalid edge (resuming an ACTIVE
    // instance) is rejected.
    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let (lifecycle, group_id, creator, _member) = fixture();
        let view = lifecycle
            .start_group_journey(&creator, "req-1", &group_id, None, None, 10.0, 10.0)
            .await
            .unwrap();
        let journey_id = view.journey.id.clone();
        let instance = lifecycle
            .start_my_instance(&creator, "req-2", &journey_id, 1.0, 1.0, false)
            .await
            .unwrap();

        let paused = lifecycle
            .pause_instance(&creator, "req-3", &instance.id)
            .await
            .unwrap();
        assert_eq!(paused.status, InstanceStatus::Paused);

        let resumed = lifecycle
            .resume_instance(&creator, "req-4", &instance.id)
            .await
            .unwrap();
        assert_eq!(resumed.status, InstanceStatus::Active);

        // Resuming an already-ACTIVE instance is not a valid edge.
        let err = lifecycle
            .resume_instance(&creator, "req-5", &instance.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTransition);
    }

    // Only the group's creator or an admin may start a group journey.
    #[tokio::test]
    async fn plain_member_cannot_start_journey() {
        let (lifecycle, group_id, _creator, member) = fixture();
        let err = lifecycle
            .start_group_journey(&member, "req-1", &group_id, None, None, 10.0, 10.0)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotAuthorized);
    }

    // A completed instance produces exactly one journey_history record, not
    // one per retried complete call.
    #[tokio::test]
    async fn completion_writes_a_single_history_record() {
        let store = Arc::new(MemoryStore::new());
        let creator = AuthContext {
            user_id: "creator".to_string(),
            display_name: "Creator".to_string(),
        };
        let group_id = new_id();
        store.seed_user(wayfarian_core::User {
            id: creator.user_id.clone(),
            display_name: creator.display_name.clone(),
            photo_ref: None,
            total_distance_km: 0.0,
            total_time_secs: 0,
            top_speed_kmh: 0.0,
            total_trips: 0,
        });
        store.seed_group(Group {
            id: group_id.clone(),
            name: "Weekend crew".to_string(),
            creator_id: creator.user_id.clone(),
            is_active: true,
        });
        store.seed_member(GroupMember {
            group_id: group_id.clone(),
            user_id: creator.user_id.clone(),
            role: MemberRole::Creator,
            last_latitude: None,
            last_longitude: None,
            last_seen: None,
            is_location_shared: false,
        });
        let lifecycle = Lifecycle {
            store: store.clone(),
            cache: Arc::new(Cache::new(true)),
            bus: Arc::new(EventBus::new()),
            notifier: Arc::new(NoopNotifier),
            solo_guard: Arc::new(NoopSoloJourneyGuard),
            achievements: Arc::new(NoopAchievementEvaluator),
            config: Arc::new(CoordinatorConfig::default()),
        };

        let view = lifecycle
            .start_group_journey(&creator, "req-1", &group_id, None, None, 10.0, 10.0)
            .await
            .unwrap();
        let journey_id = view.journey.id.clone();
        let instance = lifecycle
            .start_my_instance(&creator, "req-2", &journey_id, 1.0, 1.0, false)
            .await
            .unwrap();

        lifecycle
            .complete_instance(&creator, "req-3", &instance.id, None, None)
            .await
            .unwrap();
        lifecycle
            .complete_instance(&creator, "req-4", &instance.id, None, None)
            .await
            .unwrap();

        assert_eq!(store.history_record_count_for_instance(&instance.id), 1);
    }
}
