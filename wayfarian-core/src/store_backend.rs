//! Abstracts the store operations `Lifecycle`/`LocationPipeline` depend on
//! behind a trait, the way `aura-cli`'s TUI swaps a real backend for a demo
//! `MockStore` behind a shared interface. `Store` (tokio-postgres) is the
//! production implementation; `test_support::MemoryStore` is an in-process
//! double so the coordinator's business logic — the invariants in §5/§8 —
//! is exercisable without a live Postgres instance.
//!
//! Connection lifecycle (`connect`, `is_connected`) stays on `Store` directly
//! since only `main`/`readyz` need it; everything the coordinator itself
//! calls is mirrored here.

use async_trait::async_trait;

use crate::model::{
    GroupJourney, GroupMember, InstanceStatus, JourneyHistoryRecord, JourneyInstance,
    RideEvent, RoutePoint, User,
};
use crate::store::{CreateInstanceOutcome, CreateJourneyOutcome, JourneySummary, Store};

#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>>;

    async fn increment_user_stats(
        &self,
        user_id: &str,
        distance_km: f64,
        time_secs: i64,
        top_speed_kmh: f64,
    ) -> anyhow::Result<()>;

    async fn get_group(&self, id: &str) -> anyhow::Result<Option<crate::model::Group>>;

    async fn set_group_active(&self, id: &str, active: bool) -> anyhow::Result<()>;

    async fn get_group_with_members(
        &self,
        id: &str,
    ) -> anyhow::Result<Option<(crate::model::Group, Vec<(GroupMember, User)>)>>;

    async fn get_group_member(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<GroupMember>>;

    async fn upsert_group_member(&self, member: &GroupMember) -> anyhow::Result<()>;

    async fn create_group_journey(
        &self,
        journey: &GroupJourney,
    ) -> anyhow::Result<CreateJourneyOutcome>;

    async fn get_group_journey(&self, id: &str) -> anyhow::Result<Option<GroupJourney>>;

    async fn get_active_group_journey(
        &self,
        group_id: &str,
    ) -> anyhow::Result<Option<GroupJourney>>;

    async fn complete_group_journey(
        &self,
        id: &str,
        completed_at: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<()>;

    async fn get_instance(&self, id: &str) -> anyhow::Result<Option<JourneyInstance>>;

    async fn get_instance_by_journey_user(
        &self,
        journey_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<JourneyInstance>>;

    async fn get_instances_for_journey(
        &self,
        journey_id: &str,
    ) -> anyhow::Result<Vec<JourneyInstance>>;

    async fn get_other_nonterminal_instance(
        &self,
        user_id: &str,
        excluding_journey_id: &str,
    ) -> anyhow::Result<Option<JourneyInstance>>;

    async fn count_nonterminal_instances_excluding(
        &self,
        journey_id: &str,
        excluding_instance_id: &str,
    ) -> anyhow::Result<i64>;

    async fn create_instance(
        &self,
        instance: &JourneyInstance,
    ) -> anyhow::Result<CreateInstanceOutcome>;

    async fn reactivate_instance(
        &self,
        id: &str,
        latitude: f64,
        longitude: f64,
        now: chrono::DateTime<chrono::Utc>,
        route_points: &[RoutePoint],
    ) -> anyhow::Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn update_instance_location(
        &self,
        id: &str,
        latitude: f64,
        longitude: f64,
        last_update: chrono::DateTime<chrono::Utc>,
        total_distance_km: f64,
        total_time_secs: i64,
        avg_speed_kmh: f64,
        top_speed_kmh: f64,
        route_points: &[RoutePoint],
    ) -> anyhow::Result<()>;

    async fn transition_instance_status(
        &self,
        id: &str,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> anyhow::Result<bool>;

    #[allow(clippy::too_many_arguments)]
    async fn complete_instance(
        &self,
        id: &str,
        end_time: chrono::DateTime<chrono::Utc>,
        end_latitude: Option<f64>,
        end_longitude: Option<f64>,
        total_distance_km: f64,
        total_time_secs: i64,
        avg_speed_kmh: f64,
        top_speed_kmh: f64,
    ) -> anyhow::Result<bool>;

    async fn create_journey_history_record(
        &self,
        record: &JourneyHistoryRecord,
    ) -> anyhow::Result<()>;

    async fn create_ride_event(&self, event: &RideEvent) -> anyhow::Result<()>;

    async fn get_ride_events(
        &self,
        journey_id: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
        limit: i64,
    ) -> anyhow::Result<Vec<RideEvent>>;

    async fn get_journey_summary(
        &self,
        journey_id: &str,
    ) -> anyhow::Result<Option<JourneySummary>>;
}

#[async_trait]
impl StoreBackend for Store {
    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        Store::get_user(self, id).await
    }

    async fn increment_user_stats(
        &self,
        user_id: &str,
        distance_km: f64,
        time_secs: i64,
        top_speed_kmh: f64,
    ) -> anyhow::Result<()> {
        Store::increment_user_stats(self, user_id, distance_km, time_secs, top_speed_kmh).await
    }

    async fn get_group(&self, id: &str) -> anyhow::Result<Option<crate::model::Group>> {
        Store::get_group(self, id).await
    }

    async fn set_group_active(&self, id: &str, active: bool) -> anyhow::Result<()> {
        Store::set_group_active(self, id, active).await
    }

    async fn get_group_with_members(
        &self,
        id: &str,
    ) -> anyhow::Result<Option<(crate::model::Group, Vec<(GroupMember, User)>)>> {
        Store::get_group_with_members(self, id).await
    }

    async fn get_group_member(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<GroupMember>> {
        Store::get_group_member(self, group_id, user_id).await
    }

    async fn upsert_group_member(&self, member: &GroupMember) -> anyhow::Result<()> {
        Store::upsert_group_member(self, member).await
    }

    async fn create_group_journey(
        &self,
        journey: &GroupJourney,
    ) -> anyhow::Result<CreateJourneyOutcome> {
        Store::create_group_journey(self, journey).await
    }

    async fn get_group_journey(&self, id: &str) -> anyhow::Result<Option<GroupJourney>> {
        Store::get_group_journey(self, id).await
    }

    async fn get_active_group_journey(
        &self,
        group_id: &str,
    ) -> anyhow::Result<Option<GroupJourney>> {
        Store::get_active_group_journey(self, group_id).await
    }

    async fn complete_group_journey(
        &self,
        id: &str,
        completed_at: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<()> {
        Store::complete_group_journey(self, id, completed_at).await
    }

    async fn get_instance(&self, id: &str) -> anyhow::Result<Option<JourneyInstance>> {
        Store::get_instance(self, id).await
    }

    async fn get_instance_by_journey_user(
        &self,
        journey_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<JourneyInstance>> {
        Store::get_instance_by_journey_user(self, journey_id, user_id).await
    }

    async fn get_instances_for_journey(
        &self,
        journey_id: &str,
    ) -> anyhow::Result<Vec<JourneyInstance>> {
        Store::get_instances_for_journey(self, journey_id).await
    }

    async fn get_other_nonterminal_instance(
        &self,
        user_id: &str,
        excluding_journey_id: &str,
    ) -> anyhow::Result<Option<JourneyInstance>> {
        Store::get_other_nonterminal_instance(self, user_id, excluding_journey_id).await
    }

    async fn count_nonterminal_instances_excluding(
        &self,
        journey_id: &str,
        excluding_instance_id: &str,
    ) -> anyhow::Result<i64> {
        Store::count_nonterminal_instances_excluding(self, journey_id, excluding_instance_id).await
    }

    async fn create_instance(
        &self,
        instance: &JourneyInstance,
    ) -> anyhow::Result<CreateInstanceOutcome> {
        Store::create_instance(self, instance).await
    }

    async fn reactivate_instance(
        &self,
        id: &str,
        latitude: f64,
        longitude: f64,
        now: chrono::DateTime<chrono::Utc>,
        route_points: &[RoutePoint],
    ) -> anyhow::Result<()> {
        Store::reactivate_instance(self, id, latitude, longitude, now, route_points).await
    }

    async fn update_instance_location(
        &self,
        id: &str,
        latitude: f64,
        longitude: f64,
        last_update: chrono::DateTime<chrono::Utc>,
        total_distance_km: f64,
        total_time_secs: i64,
        avg_speed_kmh: f64,
        top_speed_kmh: f64,
        route_points: &[RoutePoint],
    ) -> anyhow::Result<()> {
        Store::update_instance_location(
            self,
            id,
            latitude,
            longitude,
            last_update,
            total_distance_km,
            total_time_secs,
            avg_speed_kmh,
            top_speed_kmh,
            route_points,
        )
        .await
    }

    async fn transition_instance_status(
        &self,
        id: &str,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> anyhow::Result<bool> {
        Store::transition_instance_status(self, id, from, to).await
    }

    async fn complete_instance(
        &self,
        id: &str,
        end_time: chrono::DateTime<chrono::Utc>,
        end_latitude: Option<f64>,
        end_longitude: Option<f64>,
        total_distance_km: f64,
        total_time_secs: i64,
        avg_speed_kmh: f64,
        top_speed_kmh: f64,
    ) -> anyhow::Result<bool> {
        Store::complete_instance(
            self,
            id,
            end_time,
            end_latitude,
            end_longitude,
            total_distance_km,
            total_time_secs,
            avg_speed_kmh,
            top_speed_kmh,
        )
        .await
    }

    async fn create_journey_history_record(
        &self,
        record: &JourneyHistoryRecord,
    ) -> anyhow::Result<()> {
        Store::create_journey_history_record(self, record).await
    }

    async fn create_ride_event(&self, event: &RideEvent) -> anyhow::Result<()> {
        Store::create_ride_event(self, event).await
    }

    async fn get_ride_events(
        &self,
        journey_id: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
        limit: i64,
    ) -> anyhow::Result<Vec<RideEvent>> {
        Store::get_ride_events(self, journey_id, since, limit).await
    }

    async fn get_journey_summary(
        &self,
        journey_id: &str,
    ) -> anyhow::Result<Option<JourneySummary>> {
        Store::get_journey_summary(self, journey_id).await
    }
}
