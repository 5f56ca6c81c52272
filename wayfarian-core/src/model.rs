//! Domain types for the group journey coordinator.
//!
//! Mirrors the entities in the data model: users, groups, memberships,
//! group journeys, per-user journey instances, and timeline events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemberRole {
    Creator,
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JourneyStatus {
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideEventType {
    Message,
    Photo,
    Checkpoint,
    Status,
    Emergency,
    Custom,
    MemberStarted,
    MemberCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub photo_ref: Option<String>,
    pub total_distance_km: f64,
    pub total_time_secs: i64,
    pub top_speed_kmh: f64,
    pub total_trips: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub creator_id: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: String,
    pub user_id: String,
    pub role: MemberRole,
    pub last_latitude: Option<f64>,
    pub last_longitude: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_location_shared: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupJourney {
    pub id: String,
    pub group_id: String,
    pub creator_id: String,
    pub title: String,
    pub description: Option<String>,
    pub end_latitude: f64,
    pub end_longitude: f64,
    pub status: JourneyStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutePoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub speed_kmh: Option<f64>,
    pub heading: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyInstance {
    pub id: String,
    pub group_journey_id: String,
    pub user_id: String,
    pub status: InstanceStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub current_latitude: f64,
    pub current_longitude: f64,
    pub last_location_update: DateTime<Utc>,
    pub total_distance_km: f64,
    pub total_time_secs: i64,
    pub avg_speed_kmh: f64,
    pub top_speed_kmh: f64,
    pub route_points: Vec<RoutePoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideEvent {
    pub id: String,
    pub group_journey_id: String,
    pub instance_id: Option<String>,
    pub user_id: String,
    #[serde(rename = "type")]
    pub event_type: RideEventType,
    pub message: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub media_ref: Option<String>,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// An immutable per-user summary of a completed `JourneyInstance`, titled
/// with the owning group's name, written once on completion to feed the
/// user's personal journey history (§4.5 `completeInstance`). Distinct from
/// `JourneyInstance` itself: the instance is owned by the group journey and
/// still mutable up to that point, this record is the durable, never-updated
/// receipt of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyHistoryRecord {
    pub id: String,
    pub user_id: String,
    pub group_journey_id: String,
    pub instance_id: String,
    pub title: String,
    pub total_distance_km: f64,
    pub total_time_secs: i64,
    pub top_speed_kmh: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Generate an opaque id. IDs are UUIDv4, lowercase hyphenated text, the
/// form every id-bearing entity in §3 uses.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Active.is_terminal());
        assert!(!InstanceStatus::Paused.is_terminal());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn coordinate_bounds() {
        assert!(is_valid_coordinate(37.7749, -122.4194));
        assert!(is_valid_coordinate(90.0, 180.0));
        assert!(is_valid_coordinate(-90.0, -180.0));
        assert!(!is_valid_coordinate(90.1, 0.0));
        assert!(!is_valid_coordinate(0.0, 180.1));
    }
}
