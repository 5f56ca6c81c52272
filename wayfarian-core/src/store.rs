//! Transactional access to the relational model.
//!
//! Shaped like the teacher's `PgPool`: a single reconnecting
//! `tokio_postgres::Client` behind `Arc<RwLock<Option<Client>>>`, a
//! `with_client` helper taking a boxed closure, and `ensure_schema` issuing
//! one `batch_execute` of `CREATE TABLE IF NOT EXISTS` statements on
//! connect. Timestamps round-trip through `std::time::SystemTime` — the
//! type `tokio_postgres` maps `timestamptz` to without an extra `chrono`
//! feature — converted at the boundary with `chrono`'s built-in `From`
//! impls (the teacher instead hand-rolls ISO-8601 formatting because it
//! has no other use for `chrono`; this crate already depends on it for the
//! domain model, so the built-in conversions are the more natural fit).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_postgres::types::Json;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info};

use crate::model::{
    GroupJourney, GroupMember, InstanceStatus, JourneyHistoryRecord, JourneyInstance,
    JourneyStatus, MemberRole, RideEvent, RideEventType, RoutePoint, User,
};

fn to_systime(dt: DateTime<Utc>) -> SystemTime {
    SystemTime::from(dt)
}

fn from_systime(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateJourneyOutcome {
    Created,
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateInstanceOutcome {
    Created,
    AlreadyOwnedByAnotherNonTerminal,
}

#[derive(Debug, Clone)]
pub struct JourneySummary {
    pub journey_id: String,
    pub total_distance_km: f64,
    pub total_time_secs: i64,
    pub top_speed_kmh: f64,
    pub photo_count: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub member_count: i64,
}

#[derive(Clone)]
pub struct Store {
    dsn: String,
    client: Arc<RwLock<Option<Client>>>,
}

impl Store {
    pub fn new(dsn: String) -> Self {
        Self {
            dsn,
            client: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn connect(&self) -> anyhow::Result<()> {
        let client = connect_postgres(&self.dsn).await?;
        ensure_schema(&client).await?;
        *self.client.write().await = Some(client);
        info!("store connected and schema ensured");
        Ok(())
    }

    /// Cheap connectivity probe for `/readyz`; never attempts to reconnect.
    pub async fn is_connected(&self) -> bool {
        self.client.read().await.is_some()
    }

    async fn get(&self) -> anyhow::Result<RwLockReadGuard<'_, Option<Client>>> {
        {
            let guard = self.client.read().await;
            if guard.is_some() {
                return Ok(guard);
            }
        }
        self.connect().await?;
        let guard = self.client.read().await;
        if guard.is_some() {
            Ok(guard)
        } else {
            Err(anyhow!("failed to establish store connection"))
        }
    }

    async fn with_client<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: for<'c> FnOnce(
            &'c Client,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'c>>,
    {
        let guard = self.get().await?;
        let client = guard.as_ref().unwrap();
        f(client).await
    }

    // -----------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------

    pub async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        self.with_client(|client| {
            let id = id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt("SELECT * FROM users WHERE id = $1", &[&id])
                    .await
                    .context("get_user")?;
                Ok(row.map(|r| row_to_user(&r)))
            })
        })
        .await
    }

    /// Atomic, monotonic increment of the user's aggregate counters.
    pub async fn increment_user_stats(
        &self,
        user_id: &str,
        distance_km: f64,
        time_secs: i64,
        top_speed_kmh: f64,
    ) -> anyhow::Result<()> {
        self.with_client(|client| {
            let user_id = user_id.to_string();
            Box::pin(async move {
                client
                    .execute(
                        "UPDATE users SET \
                           total_distance_km = total_distance_km + $2, \
                           total_time_secs = total_time_secs + $3, \
                           top_speed_kmh = GREATEST(top_speed_kmh, $4), \
                           total_trips = total_trips + 1 \
                         WHERE id = $1",
                        &[&user_id, &distance_km, &time_secs, &top_speed_kmh],
                    )
                    .await
                    .context("increment_user_stats")?;
                Ok(())
            })
        })
        .await
    }

    // -----------------------------------------------------------------
    // Groups and members
    // -----------------------------------------------------------------

    pub async fn get_group(&self, id: &str) -> anyhow::Result<Option<crate::model::Group>> {
        self.with_client(|client| {
            let id = id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt("SELECT * FROM groups WHERE id = $1", &[&id])
                    .await
                    .context("get_group")?;
                Ok(row.map(|r| row_to_group(&r)))
            })
        })
        .await
    }

    pub async fn set_group_active(&self, id: &str, active: bool) -> anyhow::Result<()> {
        self.with_client(|client| {
            let id = id.to_string();
            Box::pin(async move {
                client
                    .execute(
                        "UPDATE groups SET is_active = $2 WHERE id = $1",
                        &[&id, &active],
                    )
                    .await
                    .context("set_group_active")?;
                Ok(())
            })
        })
        .await
    }

    /// Read a group with its members and the owning users, eagerly.
    pub async fn get_group_with_members(
        &self,
        id: &str,
    ) -> anyhow::Result<Option<(crate::model::Group, Vec<(GroupMember, User)>)>> {
        let Some(group) = self.get_group(id).await? else {
            return Ok(None);
        };
        let members = self
            .with_client(|client| {
                let id = id.to_string();
                Box::pin(async move {
                    let rows = client
                        .query(
                            "SELECT m.*, u.display_name, u.photo_ref, u.total_distance_km, \
                                    u.total_time_secs, u.top_speed_kmh, u.total_trips \
                             FROM group_members m JOIN users u ON u.id = m.user_id \
                             WHERE m.group_id = $1",
                            &[&id],
                        )
                        .await
                        .context("get_group_with_members")?;
                    Ok(rows
                        .iter()
                        .map(|r| (row_to_member(r), row_to_user_joined(r)))
                        .collect::<Vec<_>>())
                })
            })
            .await?;
        Ok(Some((group, members)))
    }

    pub async fn get_group_member(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<GroupMember>> {
        self.with_client(|client| {
            let group_id = group_id.to_string();
            let user_id = user_id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt(
                        "SELECT * FROM group_members WHERE group_id = $1 AND user_id = $2",
                        &[&group_id, &user_id],
                    )
                    .await
                    .context("get_group_member")?;
                Ok(row.map(|r| row_to_member(&r)))
            })
        })
        .await
    }

    pub async fn upsert_group_member(&self, member: &GroupMember) -> anyhow::Result<()> {
        self.with_client(|client| {
            let member = member.clone();
            Box::pin(async move {
                let role = role_to_str(member.role);
                let last_seen = member.last_seen.map(to_systime);
                client
                    .execute(
                        "INSERT INTO group_members \
                           (group_id, user_id, role, last_latitude, last_longitude, last_seen, is_location_shared) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7) \
                         ON CONFLICT (group_id, user_id) DO UPDATE SET \
                           last_latitude = EXCLUDED.last_latitude, \
                           last_longitude = EXCLUDED.last_longitude, \
                           last_seen = EXCLUDED.last_seen, \
                           is_location_shared = EXCLUDED.is_location_shared",
                        &[
                            &member.group_id,
                            &member.user_id,
                            &role,
                            &member.last_latitude,
                            &member.last_longitude,
                            &last_seen,
                            &member.is_location_shared,
                        ],
                    )
                    .await
                    .context("upsert_group_member")?;
                Ok(())
            })
        })
        .await
    }

    // -----------------------------------------------------------------
    // Group journeys
    // -----------------------------------------------------------------

    /// Conditional create: relies on the partial unique index
    /// `(group_id) WHERE status = 'ACTIVE'` to enforce at-most-one-active
    /// per group even under concurrent callers (§5).
    pub async fn create_group_journey(
        &self,
        journey: &GroupJourney,
    ) -> anyhow::Result<CreateJourneyOutcome> {
        self.with_client(|client| {
            let journey = journey.clone();
            Box::pin(async move {
                let status = journey_status_to_str(journey.status);
                let started_at = to_systime(journey.started_at);
                let result = client
                    .execute(
                        "INSERT INTO group_journeys \
                           (id, group_id, creator_id, title, description, end_latitude, \
                            end_longitude, status, started_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                         ON CONFLICT (group_id) WHERE status = 'ACTIVE' DO NOTHING",
                        &[
                            &journey.id,
                            &journey.group_id,
                            &journey.creator_id,
                            &journey.title,
                            &journey.description,
                            &journey.end_latitude,
                            &journey.end_longitude,
                            &status,
                            &started_at,
                        ],
                    )
                    .await
                    .context("create_group_journey")?;
                Ok(if result == 1 {
                    CreateJourneyOutcome::Created
                } else {
                    CreateJourneyOutcome::AlreadyActive
                })
            })
        })
        .await
    }

    pub async fn get_group_journey(&self, id: &str) -> anyhow::Result<Option<GroupJourney>> {
        self.with_client(|client| {
            let id = id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt("SELECT * FROM group_journeys WHERE id = $1", &[&id])
                    .await
                    .context("get_group_journey")?;
                Ok(row.map(|r| row_to_journey(&r)))
            })
        })
        .await
    }

    pub async fn get_active_group_journey(
        &self,
        group_id: &str,
    ) -> anyhow::Result<Option<GroupJourney>> {
        self.with_client(|client| {
            let group_id = group_id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt(
                        "SELECT * FROM group_journeys WHERE group_id = $1 AND status = 'ACTIVE'",
                        &[&group_id],
                    )
                    .await
                    .context("get_active_group_journey")?;
                Ok(row.map(|r| row_to_journey(&r)))
            })
        })
        .await
    }

    /// Idempotent: only transitions rows still in ACTIVE.
    pub async fn complete_group_journey(
        &self,
        id: &str,
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.with_client(|client| {
            let id = id.to_string();
            let completed_at = to_systime(completed_at);
            Box::pin(async move {
                client
                    .execute(
                        "UPDATE group_journeys SET status = 'COMPLETED', completed_at = $2 \
                         WHERE id = $1 AND status = 'ACTIVE'",
                        &[&id, &completed_at],
                    )
                    .await
                    .context("complete_group_journey")?;
                Ok(())
            })
        })
        .await
    }

    // -----------------------------------------------------------------
    // Journey instances
    // -----------------------------------------------------------------

    pub async fn get_instance(&self, id: &str) -> anyhow::Result<Option<JourneyInstance>> {
        self.with_client(|client| {
            let id = id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt("SELECT * FROM journey_instances WHERE id = $1", &[&id])
                    .await
                    .context("get_instance")?;
                Ok(row.map(|r| row_to_instance(&r)))
            })
        })
        .await
    }

    pub async fn get_instance_by_journey_user(
        &self,
        journey_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<JourneyInstance>> {
        self.with_client(|client| {
            let journey_id = journey_id.to_string();
            let user_id = user_id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt(
                        "SELECT * FROM journey_instances WHERE group_journey_id = $1 AND user_id = $2",
                        &[&journey_id, &user_id],
                    )
                    .await
                    .context("get_instance_by_journey_user")?;
                Ok(row.map(|r| row_to_instance(&r)))
            })
        })
        .await
    }

    pub async fn get_instances_for_journey(
        &self,
        journey_id: &str,
    ) -> anyhow::Result<Vec<JourneyInstance>> {
        self.with_client(|client| {
            let journey_id = journey_id.to_string();
            Box::pin(async move {
                let rows = client
                    .query(
                        "SELECT * FROM journey_instances WHERE group_journey_id = $1",
                        &[&journey_id],
                    )
                    .await
                    .context("get_instances_for_journey")?;
                Ok(rows.iter().map(row_to_instance).collect())
            })
        })
        .await
    }

    /// Any other non-terminal instance this user holds, across journeys.
    /// Backs the per-user at-most-one-non-terminal-instance invariant (§3).
    pub async fn get_other_nonterminal_instance(
        &self,
        user_id: &str,
        excluding_journey_id: &str,
    ) -> anyhow::Result<Option<JourneyInstance>> {
        self.with_client(|client| {
            let user_id = user_id.to_string();
            let excluding_journey_id = excluding_journey_id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt(
                        "SELECT * FROM journey_instances \
                         WHERE user_id = $1 AND group_journey_id != $2 \
                           AND status IN ('ACTIVE', 'PAUSED') \
                         LIMIT 1",
                        &[&user_id, &excluding_journey_id],
                    )
                    .await
                    .context("get_other_nonterminal_instance")?;
                Ok(row.map(|r| row_to_instance(&r)))
            })
        })
        .await
    }

    pub async fn count_nonterminal_instances_excluding(
        &self,
        journey_id: &str,
        excluding_instance_id: &str,
    ) -> anyhow::Result<i64> {
        self.with_client(|client| {
            let journey_id = journey_id.to_string();
            let excluding_instance_id = excluding_instance_id.to_string();
            Box::pin(async move {
                let row = client
                    .query_one(
                        "SELECT COUNT(*) AS n FROM journey_instances \
                         WHERE group_journey_id = $1 AND id != $2 \
                           AND status IN ('ACTIVE', 'PAUSED')",
                        &[&journey_id, &excluding_instance_id],
                    )
                    .await
                    .context("count_nonterminal_instances_excluding")?;
                Ok(row.get::<_, i64>("n"))
            })
        })
        .await
    }

    pub async fn create_instance(
        &self,
        instance: &JourneyInstance,
    ) -> anyhow::Result<CreateInstanceOutcome> {
        self.with_client(|client| {
            let instance = instance.clone();
            Box::pin(async move {
                let status = instance_status_to_str(instance.status);
                let start_time = to_systime(instance.start_time);
                let last_update = to_systime(instance.last_location_update);
                let route_points = Json(instance.route_points.clone());
                let result = client
                    .execute(
                        "INSERT INTO journey_instances \
                           (id, group_journey_id, user_id, status, start_time, \
                            current_latitude, current_longitude, last_location_update, \
                            total_distance_km, total_time_secs, avg_speed_kmh, top_speed_kmh, \
                            route_points) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                         ON CONFLICT (group_journey_id, user_id) DO NOTHING",
                        &[
                            &instance.id,
                            &instance.group_journey_id,
                            &instance.user_id,
                            &status,
                            &start_time,
                            &instance.current_latitude,
                            &instance.current_longitude,
                            &last_update,
                            &instance.total_distance_km,
                            &instance.total_time_secs,
                            &instance.avg_speed_kmh,
                            &instance.top_speed_kmh,
                            &route_points,
                        ],
                    )
                    .await
                    .context("create_instance")?;
                Ok(if result == 1 {
                    CreateInstanceOutcome::Created
                } else {
                    CreateInstanceOutcome::AlreadyOwnedByAnotherNonTerminal
                })
            })
        })
        .await
    }

    /// Reactivate a terminal/paused instance in place: reset status,
    /// current position, and append the restart point to the route.
    pub async fn reactivate_instance(
        &self,
        id: &str,
        latitude: f64,
        longitude: f64,
        now: DateTime<Utc>,
        route_points: &[RoutePoint],
    ) -> anyhow::Result<()> {
        self.with_client(|client| {
            let id = id.to_string();
            let now_sys = to_systime(now);
            let route_points = Json(route_points.to_vec());
            Box::pin(async move {
                client
                    .execute(
                        "UPDATE journey_instances SET \
                           status = 'ACTIVE', current_latitude = $2, current_longitude = $3, \
                           last_location_update = $4, route_points = $5, end_time = NULL \
                         WHERE id = $1",
                        &[&id, &latitude, &longitude, &now_sys, &route_points],
                    )
                    .await
                    .context("reactivate_instance")?;
                Ok(())
            })
        })
        .await
    }

    /// Write-through the full statistics update performed by the
    /// location-ingest pipeline (§4.4 step 6).
    #[allow(clippy::too_many_arguments)]
    pub async fn update_instance_location(
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
        self.with_client(|client| {
            let id = id.to_string();
            let last_update = to_systime(last_update);
            let route_points = Json(route_points.to_vec());
            Box::pin(async move {
                client
                    .execute(
                        "UPDATE journey_instances SET \
                           current_latitude = $2, current_longitude = $3, \
                           last_location_update = $4, total_distance_km = $5, \
                           total_time_secs = $6, avg_speed_kmh = $7, top_speed_kmh = $8, \
                           route_points = $9 \
                         WHERE id = $1",
                        &[
                            &id,
                            &latitude,
                            &longitude,
                            &last_update,
                            &total_distance_km,
                            &total_time_secs,
                            &avg_speed_kmh,
                            &top_speed_kmh,
                            &route_points,
                        ],
                    )
                    .await
                    .context("update_instance_location")?;
                Ok(())
            })
        })
        .await
    }

    /// Idempotent transition, gated by `WHERE status IN (...)` the way the
    /// store contract requires (§4.2).
    pub async fn transition_instance_status(
        &self,
        id: &str,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> anyhow::Result<bool> {
        self.with_client(|client| {
            let id = id.to_string();
            let to_str = instance_status_to_str(to);
            let from_strs: Vec<&'static str> =
                from.iter().copied().map(instance_status_to_str).collect();
            Box::pin(async move {
                let result = client
                    .execute(
                        "UPDATE journey_instances SET status = $2 \
                         WHERE id = $1 AND status = ANY($3)",
                        &[&id, &to_str, &from_strs],
                    )
                    .await
                    .context("transition_instance_status")?;
                Ok(result == 1)
            })
        })
        .await
    }

    /// Idempotent completion: only applies finalized totals/coordinates
    /// the first time; a second call is a no-op update of zero rows.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete_instance(
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
        self.with_client(|client| {
            let id = id.to_string();
            let end_time_sys = to_systime(end_time);
            Box::pin(async move {
                let result = client
                    .execute(
                        "UPDATE journey_instances SET \
                           status = 'COMPLETED', end_time = $2, \
                           current_latitude = COALESCE($3, current_latitude), \
                           current_longitude = COALESCE($4, current_longitude), \
                           total_distance_km = $5, total_time_secs = $6, \
                           avg_speed_kmh = $7, top_speed_kmh = $8 \
                         WHERE id = $1 AND status != 'COMPLETED'",
                        &[
                            &id,
                            &end_time_sys,
                            &end_latitude,
                            &end_longitude,
                            &total_distance_km,
                            &total_time_secs,
                            &avg_speed_kmh,
                            &top_speed_kmh,
                        ],
                    )
                    .await
                    .context("complete_instance")?;
                Ok(result == 1)
            })
        })
        .await
    }

    /// Insert the once-per-completion history receipt (§4.5 `completeInstance`).
    /// Callers only invoke this when the instance transition actually
    /// changed a row, so a record is written exactly once per instance.
    pub async fn create_journey_history_record(
        &self,
        record: &JourneyHistoryRecord,
    ) -> anyhow::Result<()> {
        self.with_client(|client| {
            let record = record.clone();
            Box::pin(async move {
                let started_at = to_systime(record.started_at);
                let ended_at = to_systime(record.ended_at);
                client
                    .execute(
                        "INSERT INTO journey_history \
                           (id, user_id, group_journey_id, instance_id, title, \
                            total_distance_km, total_time_secs, top_speed_kmh, \
                            started_at, ended_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                         ON CONFLICT (instance_id) DO NOTHING",
                        &[
                            &record.id,
                            &record.user_id,
                            &record.group_journey_id,
                            &record.instance_id,
                            &record.title,
                            &record.total_distance_km,
                            &record.total_time_secs,
                            &record.top_speed_kmh,
                            &started_at,
                            &ended_at,
                        ],
                    )
                    .await
                    .context("create_journey_history_record")?;
                Ok(())
            })
        })
        .await
    }

    // -----------------------------------------------------------------
    // Ride events (timeline)
    // -----------------------------------------------------------------

    pub async fn create_ride_event(&self, event: &RideEvent) -> anyhow::Result<()> {
        self.with_client(|client| {
            let event = event.clone();
            Box::pin(async move {
                let event_type = ride_event_type_to_str(event.event_type);
                let created_at = to_systime(event.created_at);
                client
                    .execute(
                        "INSERT INTO ride_events \
                           (id, group_journey_id, instance_id, user_id, type, message, \
                            latitude, longitude, media_ref, data, created_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                        &[
                            &event.id,
                            &event.group_journey_id,
                            &event.instance_id,
                            &event.user_id,
                            &event_type,
                            &event.message,
                            &event.latitude,
                            &event.longitude,
                            &event.media_ref,
                            &event.data,
                            &created_at,
                        ],
                    )
                    .await
                    .context("create_ride_event")?;
                Ok(())
            })
        })
        .await
    }

    pub async fn get_ride_events(
        &self,
        journey_id: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> anyhow::Result<Vec<RideEvent>> {
        self.with_client(|client| {
            let journey_id = journey_id.to_string();
            let since = since.map(to_systime);
            Box::pin(async move {
                let rows = match since {
                    Some(since) => {
                        client
                            .query(
                                "SELECT * FROM ride_events \
                                 WHERE group_journey_id = $1 AND created_at > $2 \
                                 ORDER BY created_at ASC LIMIT $3",
                                &[&journey_id, &since, &limit],
                            )
                            .await
                    }
                    None => {
                        client
                            .query(
                                "SELECT * FROM ride_events WHERE group_journey_id = $1 \
                                 ORDER BY created_at ASC LIMIT $2",
                                &[&journey_id, &limit],
                            )
                            .await
                    }
                }
                .context("get_ride_events")?;
                Ok(rows.iter().map(row_to_ride_event).collect())
            })
        })
        .await
    }

    /// Sum totalDistance, sum totalTime, max topSpeed, count photos,
    /// min startTime -> max endTime — the per-journey summary (§4.5).
    pub async fn get_journey_summary(
        &self,
        journey_id: &str,
    ) -> anyhow::Result<Option<JourneySummary>> {
        self.with_client(|client| {
            let journey_id = journey_id.to_string();
            Box::pin(async move {
                let row = client
                    .query_opt(
                        "SELECT \
                           COALESCE(SUM(i.total_distance_km), 0) AS total_distance_km, \
                           COALESCE(SUM(i.total_time_secs), 0) AS total_time_secs, \
                           COALESCE(MAX(i.top_speed_kmh), 0) AS top_speed_kmh, \
                           COUNT(*) AS member_count, \
                           MIN(i.start_time) AS started_at, \
                           MAX(i.end_time) AS ended_at \
                         FROM journey_instances i WHERE i.group_journey_id = $1",
                        &[&journey_id],
                    )
                    .await
                    .context("get_journey_summary")?;
                let Some(row) = row else { return Ok(None) };
                let photo_count: i64 = client
                    .query_one(
                        "SELECT COUNT(*) AS n FROM ride_events \
                         WHERE group_journey_id = $1 AND type = 'PHOTO'",
                        &[&journey_id],
                    )
                    .await
                    .context("get_journey_summary photo_count")?
                    .get("n");
                Ok(Some(JourneySummary {
                    journey_id: journey_id.clone(),
                    total_distance_km: row.get("total_distance_km"),
                    total_time_secs: row.get("total_time_secs"),
                    top_speed_kmh: row.get("top_speed_kmh"),
                    photo_count,
                    started_at: row
                        .get::<_, Option<SystemTime>>("started_at")
                        .map(from_systime),
                    ended_at: row
                        .get::<_, Option<SystemTime>>("ended_at")
                        .map(from_systime),
                    member_count: row.get("member_count"),
                }))
            })
        })
        .await
    }
}

async fn connect_postgres(dsn: &str) -> anyhow::Result<Client> {
    let (client, connection) = tokio_postgres::connect(dsn, NoTls)
        .await
        .context("failed to connect to store")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(err = %err, "store connection error");
        }
    });
    Ok(client)
}

async fn ensure_schema(client: &Client) -> anyhow::Result<()> {
    client
        .batch_execute(
            "\
            CREATE TABLE IF NOT EXISTS users (
              id TEXT PRIMARY KEY,
              display_name TEXT NOT NULL,
              photo_ref TEXT,
              total_distance_km DOUBLE PRECISION NOT NULL DEFAULT 0,
              total_time_secs BIGINT NOT NULL DEFAULT 0,
              top_speed_kmh DOUBLE PRECISION NOT NULL DEFAULT 0,
              total_trips BIGINT NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS groups (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              creator_id TEXT NOT NULL REFERENCES users(id),
              is_active BOOLEAN NOT NULL DEFAULT TRUE
            );

            CREATE TABLE IF NOT EXISTS group_members (
              group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
              user_id TEXT NOT NULL REFERENCES users(id),
              role TEXT NOT NULL,
              last_latitude DOUBLE PRECISION,
              last_longitude DOUBLE PRECISION,
              last_seen TIMESTAMPTZ,
              is_location_shared BOOLEAN NOT NULL DEFAULT FALSE,
              PRIMARY KEY (group_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS group_journeys (
              id TEXT PRIMARY KEY,
              group_id TEXT NOT NULL REFERENCES groups(id),
              creator_id TEXT NOT NULL REFERENCES users(id),
              title TEXT NOT NULL,
              description TEXT,
              end_latitude DOUBLE PRECISION NOT NULL,
              end_longitude DOUBLE PRECISION NOT NULL,
              status TEXT NOT NULL DEFAULT 'ACTIVE',
              started_at TIMESTAMPTZ NOT NULL,
              completed_at TIMESTAMPTZ
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_group_journeys_one_active \
              ON group_journeys (group_id) WHERE status = 'ACTIVE';
            CREATE INDEX IF NOT EXISTS idx_group_journeys_group_status \
              ON group_journeys (group_id, status);

            CREATE TABLE IF NOT EXISTS journey_instances (
              id TEXT PRIMARY KEY,
              group_journey_id TEXT NOT NULL REFERENCES group_journeys(id) ON DELETE CASCADE,
              user_id TEXT NOT NULL REFERENCES users(id),
              status TEXT NOT NULL DEFAULT 'ACTIVE',
              start_time TIMESTAMPTZ NOT NULL,
              end_time TIMESTAMPTZ,
              current_latitude DOUBLE PRECISION NOT NULL,
              current_longitude DOUBLE PRECISION NOT NULL,
              last_location_update TIMESTAMPTZ NOT NULL,
              total_distance_km DOUBLE PRECISION NOT NULL DEFAULT 0,
              total_time_secs BIGINT NOT NULL DEFAULT 0,
              avg_speed_kmh DOUBLE PRECISION NOT NULL DEFAULT 0,
              top_speed_kmh DOUBLE PRECISION NOT NULL DEFAULT 0,
              route_points JSONB NOT NULL DEFAULT '[]'
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_journey_user \
              ON journey_instances (group_journey_id, user_id);
            CREATE INDEX IF NOT EXISTS idx_instances_user_status \
              ON journey_instances (user_id, status);

            CREATE TABLE IF NOT EXISTS ride_events (
              id TEXT PRIMARY KEY,
              group_journey_id TEXT NOT NULL REFERENCES group_journeys(id) ON DELETE CASCADE,
              instance_id TEXT,
              user_id TEXT NOT NULL REFERENCES users(id),
              type TEXT NOT NULL,
              message TEXT,
              latitude DOUBLE PRECISION,
              longitude DOUBLE PRECISION,
              media_ref TEXT,
              data JSONB,
              created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS idx_ride_events_journey_created \
              ON ride_events (group_journey_id, created_at);

            CREATE TABLE IF NOT EXISTS journey_history (
              id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL REFERENCES users(id),
              group_journey_id TEXT NOT NULL REFERENCES group_journeys(id) ON DELETE CASCADE,
              instance_id TEXT NOT NULL,
              title TEXT NOT NULL,
              total_distance_km DOUBLE PRECISION NOT NULL,
              total_time_secs BIGINT NOT NULL,
              top_speed_kmh DOUBLE PRECISION NOT NULL,
              started_at TIMESTAMPTZ NOT NULL,
              ended_at TIMESTAMPTZ NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_journey_history_instance \
              ON journey_history (instance_id);
            CREATE INDEX IF NOT EXISTS idx_journey_history_user \
              ON journey_history (user_id, ended_at);
            ",
        )
        .await
        .context("failed to create store schema")
}

fn role_to_str(role: MemberRole) -> &'static str {
    match role {
        MemberRole::Creator => "CREATOR",
        MemberRole::Admin => "ADMIN",
        MemberRole::Member => "MEMBER",
    }
}

fn role_from_str(s: &str) -> MemberRole {
    match s {
        "CREATOR" => MemberRole::Creator,
        "ADMIN" => MemberRole::Admin,
        _ => MemberRole::Member,
    }
}

fn journey_status_to_str(s: JourneyStatus) -> &'static str {
    match s {
        JourneyStatus::Active => "ACTIVE",
        JourneyStatus::Completed => "COMPLETED",
        JourneyStatus::Cancelled => "CANCELLED",
    }
}

fn journey_status_from_str(s: &str) -> JourneyStatus {
    match s {
        "COMPLETED" => JourneyStatus::Completed,
        "CANCELLED" => JourneyStatus::Cancelled,
        _ => JourneyStatus::Active,
    }
}

fn instance_status_to_str(s: InstanceStatus) -> &'static str {
    match s {
        InstanceStatus::Active => "ACTIVE",
        InstanceStatus::Paused => "PAUSED",
        InstanceStatus::Completed => "COMPLETED",
        InstanceStatus::Cancelled => "CANCELLED",
    }
}

fn instance_status_from_str(s: &str) -> InstanceStatus {
    match s {
        "PAUSED" => InstanceStatus::Paused,
        "COMPLETED" => InstanceStatus::Completed,
        "CANCELLED" => InstanceStatus::Cancelled,
        _ => InstanceStatus::Active,
    }
}

fn ride_event_type_to_str(t: RideEventType) -> &'static str {
    match t {
        RideEventType::Message => "MESSAGE",
        RideEventType::Photo => "PHOTO",
        RideEventType::Checkpoint => "CHECKPOINT",
        RideEventType::Status => "STATUS",
        RideEventType::Emergency => "EMERGENCY",
        RideEventType::Custom => "CUSTOM",
        RideEventType::MemberStarted => "MEMBER_STARTED",
        RideEventType::MemberCompleted => "MEMBER_COMPLETED",
    }
}

fn ride_event_type_from_str(s: &str) -> RideEventType {
    match s {
        "PHOTO" => RideEventType::Photo,
        "CHECKPOINT" => RideEventType::Checkpoint,
        "STATUS" => RideEventType::Status,
        "EMERGENCY" => RideEventType::Emergency,
        "MEMBER_STARTED" => RideEventType::MemberStarted,
        "MEMBER_COMPLETED" => RideEventType::MemberCompleted,
        "CUSTOM" => RideEventType::Custom,
        _ => RideEventType::Message,
    }
}

fn row_to_user(r: &Row) -> User {
    User {
        id: r.get("id"),
        display_name: r.get("display_name"),
        photo_ref: r.get("photo_ref"),
        total_distance_km: r.get("total_distance_km"),
        total_time_secs: r.get("total_time_secs"),
        top_speed_kmh: r.get("top_speed_kmh"),
        total_trips: r.get("total_trips"),
    }
}

/// Variant of `row_to_user` for the member+user join, whose columns aren't
/// prefixed (Postgres exposes the last value for duplicate column names,
/// which is why the join only selects the user columns it needs).
fn row_to_user_joined(r: &Row) -> User {
    User {
        id: r.get("user_id"),
        display_name: r.get("display_name"),
        photo_ref: r.get("photo_ref"),
        total_distance_km: r.get("total_distance_km"),
        total_time_secs: r.get("total_time_secs"),
        top_speed_kmh: r.get("top_speed_kmh"),
        total_trips: r.get("total_trips"),
    }
}

fn row_to_group(r: &Row) -> crate::model::Group {
    crate::model::Group {
        id: r.get("id"),
        name: r.get("name"),
        creator_id: r.get("creator_id"),
        is_active: r.get("is_active"),
    }
}

fn row_to_member(r: &Row) -> GroupMember {
    GroupMember {
        group_id: r.get("group_id"),
        user_id: r.get("user_id"),
        role: role_from_str(r.get("role")),
        last_latitude: r.get("last_latitude"),
        last_longitude: r.get("last_longitude"),
        last_seen: r
            .get::<_, Option<SystemTime>>("last_seen")
            .map(from_systime),
        is_location_shared: r.get("is_location_shared"),
    }
}

fn row_to_journey(r: &Row) -> GroupJourney {
    GroupJourney {
        id: r.get("id"),
        group_id: r.get("group_id"),
        creator_id: r.get("creator_id"),
        title: r.get("title"),
        description: r.get("description"),
        end_latitude: r.get("end_latitude"),
        end_longitude: r.get("end_longitude"),
        status: journey_status_from_str(r.get("status")),
        started_at: from_systime(r.get("started_at")),
        completed_at: r
            .get::<_, Option<SystemTime>>("completed_at")
            .map(from_systime),
    }
}

fn row_to_instance(r: &Row) -> JourneyInstance {
    let Json(route_points): Json<Vec<RoutePoint>> = r.get("route_points");
    JourneyInstance {
        id: r.get("id"),
        group_journey_id: r.get("group_journey_id"),
        user_id: r.get("user_id"),
        status: instance_status_from_str(r.get("status")),
        start_time: from_systime(r.get("start_time")),
        end_time: r.get::<_, Option<SystemTime>>("end_time").map(from_systime),
        current_latitude: r.get("current_latitude"),
        current_longitude: r.get("current_longitude"),
        last_location_update: from_systime(r.get("last_location_update")),
        total_distance_km: r.get("total_distance_km"),
        total_time_secs: r.get("total_time_secs"),
        avg_speed_kmh: r.get("avg_speed_kmh"),
        top_speed_kmh: r.get("top_speed_kmh"),
        route_points,
    }
}

fn row_to_ride_event(r: &Row) -> RideEvent {
    RideEvent {
        id: r.get("id"),
        group_journey_id: r.get("group_journey_id"),
        instance_id: r.get("instance_id"),
        user_id: r.get("user_id"),
        event_type: ride_event_type_from_str(r.get("type")),
        message: r.get("message"),
        latitude: r.get("latitude"),
        longitude: r.get("longitude"),
        media_ref: r.get("media_ref"),
        data: r.get("data"),
        created_at: from_systime(r.get("created_at")),
    }
}

/// Exposed so in-memory test doubles can reuse the same string spelling
/// for roles without re-deriving it from `MemberRole` independently.
pub fn role_label(role: MemberRole) -> &'static str {
    role_to_str(role)
}
