mod alert_layer;
mod auth;
mod availability;
mod calendar;
mod config;
mod db;
mod desk;
mod error;
mod feedback;
mod handlers;
mod lifecycle;
mod models;
mod notify;
mod reports;
mod session;
mod telegram;
mod tickets;
mod zone;

#[cfg(test)]
mod testkit;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use calendar::{CalendarProvider, GoogleCalendar};
use config::Config;
use desk::CoachDesk;
use feedback::FeedbackFlows;
use lifecycle::{JobSettings, LifecycleJobs};
use notify::{Notifier, TelegramNotifier};
use session::{BookingSessionManager, SessionSettings};
use telegram::TelegramApi;
use tickets::{TelegramTopics, TicketAdmissionGuard, TicketGateway};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub config: Config,
    pub pool: sqlx::SqlitePool,
    pub guard: TicketAdmissionGuard,
    pub sessions: Arc<BookingSessionManager>,
    pub desk: CoachDesk,
    pub feedback: Arc<FeedbackFlows>,
    pub started_at: Instant,
}

const DB_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let telegram = TelegramApi::new(&config.telegram_api_base, &config.bot_token)?;

    // ── Tracing: console + operator alerts for ERROR events ──
    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(alert_layer::OperatorAlertLayer::new(
            telegram.clone(),
            config.operator_chat_id,
        ))
        .init();

    // ── Database ──
    let pool = db::connect(&config.database_url, DB_MAX_CONNECTIONS).await?;
    db::run_migrations(&pool).await?;

    // ── Host connection: jobs only start once the bot answers ──
    let me = telegram.get_me().await?;
    tracing::info!(
        "Host connection established as @{} ({})",
        me.username.as_deref().unwrap_or("?"),
        me.id
    );

    // ── Engine ──
    let calendar: Arc<dyn CalendarProvider> = Arc::new(GoogleCalendar::new(
        &config.calendar_api_base,
        &config.calendar_id,
        &config.calendar_token,
        config.timezone,
    )?);
    if config.calendar_token.is_empty() {
        tracing::warn!("GOOGLE_CALENDAR_TOKEN not set, calendar calls will fail");
    }
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(
        telegram.clone(),
        config.operator_chat_id,
    ));
    let gateway: Arc<dyn TicketGateway> =
        Arc::new(TelegramTopics::new(telegram, config.ticket_chat_id));

    let settings = SessionSettings::from_config(&config);
    let sessions = Arc::new(BookingSessionManager::new(
        pool.clone(),
        calendar.clone(),
        notifier.clone(),
        settings.clone(),
    ));
    let feedback = Arc::new(FeedbackFlows::new(
        pool.clone(),
        notifier.clone(),
        config.feedback_chat_id,
        config.timezone,
    ));

    // ── Background jobs ──
    let cancel = CancellationToken::new();
    let jobs = Arc::new(LifecycleJobs::new(
        pool.clone(),
        notifier.clone(),
        feedback.clone(),
        sessions.clone(),
        gateway.clone(),
        JobSettings::from_config(&config),
    ));
    let job_handles = jobs.spawn(cancel.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState {
        guard: TicketAdmissionGuard::new(gateway),
        desk: CoachDesk::new(pool.clone(), calendar, notifier, settings),
        sessions,
        feedback,
        pool,
        config,
        started_at: Instant::now(),
    });

    let app = handlers::router(state);

    tracing::info!("Coaching desk server starting on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Listening for ctrl-c failed: {}", e);
        }
        tracing::info!("Shutdown requested");
        shutdown.cancel();
    })
    .await?;

    cancel.cancel();
    for handle in job_handles {
        let _ = handle.await;
    }
    tracing::info!("Stopped");
    Ok(())
}
