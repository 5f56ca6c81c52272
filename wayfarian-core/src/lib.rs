pub mod auth;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod eventbus;
pub mod model;
pub mod notifier;
pub mod store;
pub mod store_backend;
pub mod test_support;

pub use auth::{AuthContext, HmacTokenVerifier, TokenError, TokenVerifier};
pub use cache::Cache;
pub use collaborators::{
    AchievementEvaluator, AchievementUnlocked, FakeSoloJourneyGuard, NoopAchievementEvaluator,
    NoopSoloJourneyGuard, SoloJourneyGuard,
};
pub use config::{
    AuthConfig, CacheConfig, CoordinatorConfig, NotifierConfig, RateLimitConfig, ServerConfig,
    StorageConfig, load_config,
};
pub use error::{CoordinatorError, ErrorKind};
pub use eventbus::EventBus;
pub use model::{
    Group, GroupJourney, GroupMember, InstanceStatus, JourneyHistoryRecord, JourneyInstance,
    JourneyStatus, MemberRole, RideEvent, RideEventType, RoutePoint, User, is_valid_coordinate,
    new_id,
};
pub use notifier::{HttpNotifier, NoopNotifier, Notifier, NotificationKind, NotificationPayload};
pub use store::{CreateInstanceOutcome, CreateJourneyOutcome, JourneySummary, Store};
pub use store_backend::StoreBackend;
pub use test_support::MemoryStore;
