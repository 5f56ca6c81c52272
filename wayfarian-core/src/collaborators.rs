//! External collaborator seams with no first-party implementation.
//!
//! Both traits stand in for systems outside this service's scope (a solo
//! ride tracker and a gamification/achievements service); the coordinator
//! only needs to call out to them, never to implement their behavior.
//! Following the same trait-plus-noop-plus-fake shape as `TokenVerifier`
//! and `Notifier` (§10).

use async_trait::async_trait;

/// Tells the coordinator whether a user is already tracking a solo (non-group)
/// ride, so the "at most one active ride" rule can be enforced across both
/// systems. The coordinator cannot see solo rides directly.
#[async_trait]
pub trait SoloJourneyGuard: Send + Sync {
    async fn has_active_solo_journey(&self, user_id: &str) -> anyhow::Result<bool>;

    /// Called on `startMyInstance(force=true)` when a solo journey is
    /// blocking the request. The coordinator never inspects solo-journey
    /// state directly; it only asks the external system to close it out.
    async fn complete_active_solo_journey(&self, user_id: &str) -> anyhow::Result<()>;
}

pub struct NoopSoloJourneyGuard;

#[async_trait]
impl SoloJourneyGuard for NoopSoloJourneyGuard {
    async fn has_active_solo_journey(&self, _user_id: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn complete_active_solo_journey(&self, _user_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Test double letting scenario tests force a conflict without wiring up a
/// real solo-ride system.
pub struct FakeSoloJourneyGuard {
    pub blocked_user_ids: Vec<String>,
}

#[async_trait]
impl SoloJourneyGuard for FakeSoloJourneyGuard {
    async fn has_active_solo_journey(&self, user_id: &str) -> anyhow::Result<bool> {
        Ok(self.blocked_user_ids.iter().any(|id| id == user_id))
    }

    async fn complete_active_solo_journey(&self, _user_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AchievementUnlocked {
    pub name: String,
    pub description: String,
}

/// Reports a completed instance's final stats to an external achievements
/// service. Fire-and-forget from the coordinator's point of view: a `Some`
/// return is relayed to the user as `achievement:unlocked`; an error is
/// logged and otherwise has no effect on the ride.
#[async_trait]
pub trait AchievementEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        user_id: &str,
        distance_km: f64,
        top_speed_kmh: f64,
    ) -> anyhow::Result<Option<AchievementUnlocked>>;
}

pub struct NoopAchievementEvaluator;

#[async_trait]
impl AchievementEvaluator for NoopAchievementEvaluator {
    async fn evaluate(
        &self,
        _user_id: &str,
        _distance_km: f64,
        _top_speed_kmh: f64,
    ) -> anyhow::Result<Option<AchievementUnlocked>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_guard_never_blocks() {
        let guard = NoopSoloJourneyGuard;
        assert!(!guard.has_active_solo_journey("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn fake_guard_blocks_listed_users() {
        let guard = FakeSoloJourneyGuard {
            blocked_user_ids: vec!["user-1".to_string()],
        };
        assert!(guard.has_active_solo_journey("user-1").await.unwrap());
        assert!(!guard.has_active_solo_journey("user-2").await.unwrap());
    }

    #[tokio::test]
    async fn noop_achievements_never_unlock() {
        let evaluator = NoopAchievementEvaluator;
        assert!(
            evaluator
                .evaluate("user-1", 10.0, 20.0)
                .await
                .unwrap()
                .is_none()
        );
    }
}
