mod http;
mod lifecycle;
mod location;
mod rate_limit;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use wayfarian_core::{
    load_config, AchievementEvaluator, Cache, CoordinatorConfig, EventBus, HmacTokenVerifier,
    HttpNotifier, NoopAchievementEvaluator, NoopNotifier, NoopSoloJourneyGuard, Notifier,
    SoloJourneyGuard, Store, StoreBackend, TokenVerifier,
};

use crate::lifecycle::Lifecycle;
use crate::location::LocationPipeline;
use crate::rate_limit::{LocationThrottle, RequestRateLimiter};

#[derive(Parser, Debug)]
#[command(name = "wayfariand", version, about = "Group journey coordinator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the wayfariand HTTP/WebSocket service.
    Serve(ServeArgs),
    /// Print effective wayfariand config as JSON.
    PrintConfig(PrintConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "config/wayfarian.toml")]
    config: PathBuf,
    #[arg(long)]
    bind: Option<String>,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, default_value = "config/wayfarian.toml")]
    config: PathBuf,
}

#[derive(Clone)]
pub struct AppState {
    pub started_at: Instant,
    pub config: Arc<CoordinatorConfig>,
    pub store: Arc<Store>,
    pub cache: Arc<Cache>,
    pub bus: Arc<EventBus>,
    pub token_verifier: Arc<dyn TokenVerifier>,
    pub lifecycle: Arc<Lifecycle>,
    pub location: Arc<LocationPipeline>,
    pub http_rate_limiter: Arc<RequestRateLimiter>,
    pub location_throttle: Arc<LocationThrottle>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config/wayfarian.toml"),
        bind: None,
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let cfg = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let bind = config.server.bind.clone();
    let config = Arc::new(config);

    let store = Arc::new(Store::new(
        config
            .storage
            .store_dsn
            .clone()
            .unwrap_or_else(|| "postgresql://localhost/wayfarian".to_string()),
    ));
    match store.connect().await {
        Ok(()) => info!("store connected and schema ensured"),
        Err(err) => warn!(err = %err, "store connection failed at startup, will retry lazily"),
    }

    let cache = Arc::new(Cache::new(config.cache.disabled));
    let bus = Arc::new(EventBus::new());

    let token_verifier: Arc<dyn TokenVerifier> = Arc::new(HmacTokenVerifier::new(
        config.auth.hmac_secret.clone(),
        config.auth.token_max_age_secs,
    ));

    let notifier: Arc<dyn Notifier> = if config.notifier.enabled {
        Arc::new(HttpNotifier::new(config.notifier.webhook_url.clone()))
    } else {
        Arc::new(NoopNotifier)
    };

    let solo_guard: Arc<dyn SoloJourneyGuard> = Arc::new(NoopSoloJourneyGuard);
    let achievements: Arc<dyn AchievementEvaluator> = Arc::new(NoopAchievementEvaluator);
    let store_backend: Arc<dyn StoreBackend> = store.clone();

    let lifecycle = Arc::new(Lifecycle {
        store: store_backend.clone(),
        cache: cache.clone(),
        bus: bus.clone(),
        notifier,
        solo_guard,
        achievements,
        config: config.clone(),
    });

    let location = Arc::new(LocationPipeline {
        store: store_backend,
        cache: cache.clone(),
        bus: bus.clone(),
        config: config.clone(),
    });

    let http_rate_limiter = Arc::new(RequestRateLimiter::new(
        config.rate_limit.journey_requests_per_window,
        Duration::from_secs(config.rate_limit.window_secs),
    ));
    let location_throttle = Arc::new(LocationThrottle::new(Duration::from_millis(
        config.rate_limit.location_throttle_min_ms,
    )));

    let state = AppState {
        started_at: Instant::now(),
        config,
        store,
        cache,
        bus,
        token_verifier,
        lifecycle,
        location,
        http_rate_limiter,
        location_throttle,
    };

    let app = Router::new()
        .route("/healthz", get(http::healthz))
        .route("/readyz", get(http::readyz))
        .route("/group-journey/start", post(http::start_group_journey))
        .route(
            "/group-journey/{journeyId}/start-my-instance",
            post(http::start_my_instance),
        )
        .route("/group-journey/{id}", get(http::get_group_journey))
        .route(
            "/group-journey/instance/{id}/location",
            post(http::update_instance_location),
        )
        .route(
            "/group-journey/instance/{id}/pause",
            post(http::pause_instance),
        )
        .route(
            "/group-journey/instance/{id}/resume",
            post(http::resume_instance),
        )
        .route(
            "/group-journey/instance/{id}/complete",
            post(http::complete_instance),
        )
        .route(
            "/group-journey/{journeyId}/my-instance",
            get(http::get_my_instance),
        )
        .route(
            "/group-journey/active/{groupId}",
            get(http::get_active_for_group),
        )
        .route(
            "/group-journey/{id}/summary",
            get(http::get_group_journey_summary),
        )
        .route(
            "/group-journey/{id}/events",
            get(http::get_ride_events).post(http::post_ride_event),
        )
        .route("/ws", get(ws::ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind listener on {bind}"))?;

    info!(bind = %bind, "wayfariand listening");
    axum::serve(listener, app)
        .await
        .context("server exited unexpectedly")
}
