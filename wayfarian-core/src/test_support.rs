//! In-process `StoreBackend` double, the way `aura-cli`'s demo mode and
//! `groblegark-coop`'s CLI tests stand up an in-memory backend instead of a
//! live dependency. `MemoryStore` replicates the invariants `store.rs`
//! encodes as SQL (one active journey per group, one non-terminal instance
//! per journey/user, idempotent completion) with `std::sync::Mutex`-guarded
//! maps, so the coordinator's state machine is exercisable in a plain
//! `#[tokio::test]` with no Postgres instance running.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    Group, GroupJourney, GroupMember, InstanceStatus, JourneyHistoryRecord, JourneyInstance,
    JourneyStatus, RideEvent, RoutePoint, User,
};
use crate::store::{CreateInstanceOutcome, CreateJourneyOutcome, JourneySummary};
use crate::store_backend::StoreBackend;

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, User>,
    groups: HashMap<String, Group>,
    members: HashMap<(String, String), GroupMember>,
    journeys: HashMap<String, GroupJourney>,
    instances: HashMap<String, JourneyInstance>,
    history: HashMap<String, JourneyHistoryRecord>,
    ride_events: Vec<RideEvent>,
}

/// A fully in-memory stand-in for `Store`, seeded directly by tests via
/// [`MemoryStore::seed_user`]/[`MemoryStore::seed_group`]/etc.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn seed_user(&self, user: User) {
        self.state.lock().unwrap().users.insert(user.id.clone(), user);
    }

    pub fn seed_group(&self, group: Group) {
        self.state
            .lock()
            .unwrap()
            .groups
            .insert(group.id.clone(), group);
    }

    pub fn seed_member(&self, member: GroupMember) {
        self.state
            .lock()
            .unwrap()
            .members
            .insert((member.group_id.clone(), member.user_id.clone()), member);
    }

    pub fn seed_instance(&self, instance: JourneyInstance) {
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(instance.id.clone(), instance);
    }

    /// Number of journey history records written for a given instance; a
    /// sound idempotent `completeInstance` never drives this past 1.
    pub fn history_record_count_for_instance(&self, instance_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .history
            .values()
            .filter(|r| r.instance_id == instance_id)
            .count()
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        Ok(self.state.lock().unwrap().users.get(id).cloned())
    }

    async fn increment_user_stats(
        &self,
        user_id: &str,
        distance_km: f64,
        time_secs: i64,
        top_speed_kmh: f64,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(user) = state.users.get_mut(user_id) {
            user.total_distance_km += distance_km;
            user.total_time_secs += time_secs;
            user.top_speed_kmh = user.top_speed_kmh.max(top_speed_kmh);
            user.total_trips += 1;
        }
        Ok(())
    }

    async fn get_group(&self, id: &str) -> anyhow::Result<Option<Group>> {
        Ok(self.state.lock().unwrap().groups.get(id).cloned())
    }

    async fn set_group_active(&self, id: &str, active: bool) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(group) = state.groups.get_mut(id) {
            group.is_active = active;
        }
        Ok(())
    }

    async fn get_group_with_members(
        &self,
        id: &str,
    ) -> anyhow::Result<Option<(Group, Vec<(GroupMember, User)>)>> {
        let state = self.state.lock().unwrap();
        let Some(group) = state.groups.get(id).cloned() else {
            return Ok(None);
        };
        let members = state
            .members
            .values()
            .filter(|m| m.group_id == id)
            .filter_map(|m| state.users.get(&m.user_id).map(|u| (m.clone(), u.clone())))
            .collect();
        Ok(Some((group, members)))
    }

    async fn get_group_member(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<GroupMember>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .members
            .get(&(group_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn upsert_group_member(&self, member: &GroupMember) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .members
            .insert((member.group_id.clone(), member.user_id.clone()), member.clone());
        Ok(())
    }

    async fn create_group_journey(
        &self,
        journey: &GroupJourney,
    ) -> anyhow::Result<CreateJourneyOutcome> {
        let mut state = self.state.lock().unwrap();
        let already_active = state
            .journeys
            .values()
            .any(|j| j.group_id == journey.group_id && j.status == JourneyStatus::Active);
        if already_active {
            return Ok(CreateJourneyOutcome::AlreadyActive);
        }
        state.journeys.insert(journey.id.clone(), journey.clone());
        Ok(CreateJourneyOutcome::Created)
    }

    async fn get_group_journey(&self, id: &str) -> anyhow::Result<Option<GroupJourney>> {
        Ok(self.state.lock().unwrap().journeys.get(id).cloned())
    }

    async fn get_active_group_journey(
        &self,
        group_id: &str,
    ) -> anyhow::Result<Option<GroupJourney>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .journeys
            .values()
            .find(|j| j.group_id == group_id && j.status == JourneyStatus::Active)
            .cloned())
    }

    async fn complete_group_journey(
        &self,
        id: &str,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(journey) = state.journeys.get_mut(id) {
            if journey.status == JourneyStatus::Active {
                journey.status = JourneyStatus::Completed;
                journey.completed_at = Some(completed_at);
            }
        }
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> anyhow::Result<Option<JourneyInstance>> {
        Ok(self.state.lock().unwrap().instances.get(id).cloned())
    }

    async fn get_instance_by_journey_user(
        &self,
        journey_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<JourneyInstance>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .find(|i| i.group_journey_id == journey_id && i.user_id == user_id)
            .cloned())
    }

    async fn get_instances_for_journey(
        &self,
        journey_id: &str,
    ) -> anyhow::Result<Vec<JourneyInstance>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|i| i.group_journey_id == journey_id)
            .cloned()
            .collect())
    }

    async fn get_other_nonterminal_instance(
        &self,
        user_id: &str,
        excluding_journey_id: &str,
    ) -> anyhow::Result<Option<JourneyInstance>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .find(|i| {
                i.user_id == user_id
                    && i.group_journey_id != excluding_journey_id
                    && !i.status.is_terminal()
            })
            .cloned())
    }

    async fn count_nonterminal_instances_excluding(
        &self,
        journey_id: &str,
        excluding_instance_id: &str,
    ) -> anyhow::Result<i64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|i| {
                i.group_journey_id == journey_id
                    && i.id != excluding_instance_id
                    && !i.status.is_terminal()
            })
            .count() as i64)
    }

    async fn create_instance(
        &self,
        instance: &JourneyInstance,
    ) -> anyhow::Result<CreateInstanceOutcome> {
        let mut state = self.state.lock().unwrap();
        let owned = state
            .instances
            .values()
            .any(|i| i.group_journey_id == instance.group_journey_id && i.user_id == instance.user_id);
        if owned {
            return Ok(CreateInstanceOutcome::AlreadyOwnedByAnotherNonTerminal);
        }
        state
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(CreateInstanceOutcome::Created)
    }

    async fn reactivate_instance(
        &self,
        id: &str,
        latitude: f64,
        longitude: f64,
        now: DateTime<Utc>,
        route_points: &[RoutePoint],
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(instance) = state.instances.get_mut(id) {
            instance.status = InstanceStatus::Active;
            instance.current_latitude = latitude;
            instance.current_longitude = longitude;
            instance.last_location_update = now;
            instance.route_points = route_points.to_vec();
            instance.end_time = None;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_instance_location(
        &self,
        id: &str,
        latitude: f64,
        longitude: f64,
        last_update: DateTime<Utc>,
        total_distance_km: f64,
        total_time_secs: i64,
        avg_speed_kmh: f64,
        top_speed_kmh: f64,
        route_points: &[RoutePoint],
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(instance) = state.instances.get_mut(id) {
            instance.current_latitude = latitude;
            instance.current_longitude = longitude;
            instance.last_location_update = last_update;
            instance.total_distance_km = total_distance_km;
            instance.total_time_secs = total_time_secs;
            instance.avg_speed_kmh = avg_speed_kmh;
            instance.top_speed_kmh = top_speed_kmh;
            instance.route_points = route_points.to_vec();
        }
        Ok(())
    }

    async fn transition_instance_status(
        &self,
        id: &str,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(instance) = state.instances.get_mut(id) {
            if from.contains(&instance.status) {
                instance.status = to;
                return Ok(true);
            }
        }
        Ok(false)
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_instance(
        &self,
        id: &str,
        end_time: DateTime<Utc>,
        end_latitude: Option<f64>,
        end_longitude: Option<f64>,
        total_distance_km: f64,
        total_time_secs: i64,
        avg_speed_kmh: f64,
        top_speed_kmh: f64,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(instance) = state.instances.get_mut(id) {
            if instance.status != InstanceStatus::Completed {
                instance.status = InstanceStatus::Completed;
                instance.end_time = Some(end_time);
                if let Some(lat) = end_latitude {
                    instance.current_latitude = lat;
                }
                if let Some(lon) = end_longitude {
                    instance.current_longitude = lon;
                }
                instance.total_distance_km = total_distance_km;
                instance.total_time_secs = total_time_secs;
                instance.avg_speed_kmh = avg_speed_kmh;
                instance.top_speed_kmh = top_speed_kmh;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn create_journey_history_record(
        &self,
        record: &JourneyHistoryRecord,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .history
            .entry(record.instance_id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn create_ride_event(&self, event: &RideEvent) -> anyhow::Result<()> {
        self.state.lock().unwrap().ride_events.push(event.clone());
        Ok(())
    }

    async fn get_ride_events(
        &self,
        journey_id: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> anyhow::Result<Vec<RideEvent>> {
        let state = self.state.lock().unwrap();
        let mut events: Vec<RideEvent> = state
            .ride_events
            .iter()
            .filter(|e| e.group_journey_id == journey_id)
            .filter(|e| since.is_none_or(|since| e.created_at > since))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn get_journey_summary(
        &self,
        journey_id: &str,
    ) -> anyhow::Result<Option<JourneySummary>> {
        let state = self.state.lock().unwrap();
        let instances: Vec<&JourneyInstance> = state
            .instances
            .values()
            .filter(|i| i.group_journey_id == journey_id)
            .collect();
        if instances.is_empty() {
            return Ok(None);
        }
        let total_distance_km = instances.iter().map(|i| i.total_distance_km).sum();
        let total_time_secs = instances.iter().map(|i| i.total_time_secs).sum();
        let top_speed_kmh = instances
            .iter()
            .map(|i| i.top_speed_kmh)
            .fold(0.0_f64, f64::max);
        let started_at = instances.iter().map(|i| i.start_time).min();
        let ended_at = instances.iter().filter_map(|i| i.end_time).max();
        let photo_count = state
            .ride_events
            .iter()
            .filter(|e| {
                e.group_journey_id == journey_id
                    && matches!(e.event_type, crate::model::RideEventType::Photo)
            })
            .count() as i64;
        Ok(Some(JourneySummary {
            journey_id: journey_id.to_string(),
            total_distance_km,
            total_time_secs,
            top_speed_kmh,
            photo_count,
            started_at,
            ended_at,
            member_count: instances.len() as i64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::new_id;

    fn sample_user(id: &str) -> User {
        User {
            id: id.to_string(),
            display_name: id.to_string(),
            photo_ref: None,
            total_distance_km: 0.0,
            total_time_secs: 0,
            top_speed_kmh: 0.0,
            total_trips: 0,
        }
    }

    fn sample_journey(group_id: &str) -> GroupJourney {
        GroupJourney {
            id: new_id(),
            group_id: group_id.to_string(),
            creator_id: "creator".to_string(),
            title: "Evening ride".to_string(),
            description: None,
            end_latitude: 1.0,
            end_longitude: 1.0,
            status: JourneyStatus::Active,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn at_most_one_active_journey_per_group() {
        let store = MemoryStore::new();
        let first = sample_journey("g1");
        let second = sample_journey("g1");
        assert_eq!(
            store.create_group_journey(&first).await.unwrap(),
            CreateJourneyOutcome::Created
        );
        assert_eq!(
            store.create_group_journey(&second).await.unwrap(),
            CreateJourneyOutcome::AlreadyActive
        );
    }

    #[tokio::test]
    async fn increment_user_stats_accumulates() {
        let store = MemoryStore::new();
        store.seed_user(sample_user("u1"));
        store
            .increment_user_stats("u1", 5.0, 600, 40.0)
            .await
            .unwrap();
        store
            .increment_user_stats("u1", 3.0, 300, 55.0)
            .await
            .unwrap();
        let user = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.total_distance_km, 8.0);
        assert_eq!(user.total_time_secs, 900);
        assert_eq!(user.top_speed_kmh, 55.0);
        assert_eq!(user.total_trips, 2);
    }

    #[tokio::test]
    async fn complete_instance_is_idempotent() {
        let store = MemoryStore::new();
        let instance = JourneyInstance {
            id: new_id(),
            group_journey_id: new_id(),
            user_id: "u1".to_string(),
            status: InstanceStatus::Active,
            start_time: Utc::now(),
            end_time: None,
            current_latitude: 1.0,
            current_longitude: 1.0,
            last_location_update: Utc::now(),
            total_distance_km: 0.0,
            total_time_secs: 0,
            avg_speed_kmh: 0.0,
            top_speed_kmh: 0.0,
            route_points: Vec::new(),
        };
        store.create_instance(&instance).await.unwrap();
        let now = Utc::now();
        let first = store
            .complete_instance(&instance.id, now, Some(2.0), Some(2.0), 10.0, 600, 60.0, 80.0)
            .await
            .unwrap();
        let second = store
            .complete_instance(&instance.id, now, Some(9.0), Some(9.0), 99.0, 6000, 60.0, 80.0)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        let stored = store.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.total_distance_km, 10.0);
    }
}
