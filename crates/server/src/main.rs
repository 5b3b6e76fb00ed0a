mod adapters;
mod bootstrap;
mod dispatcher;
mod health;
mod poller;
mod read_model;
mod recorder;
mod session;
mod twiml;
mod webhooks;

#[cfg(test)]
mod testing;

use std::time::Duration;

use anyhow::Result;
use setter_core::config::{AppConfig, LoadOptions};
use setter_core::orchestrator::Orchestrator;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::health::HealthState;
use crate::poller::LeadPoller;
use crate::read_model::ReadModelState;
use crate::recorder::OutcomeRecorder;
use crate::webhooks::{CallbackUrls, WebhookState};

const DISPATCH_CHANNEL_CAPACITY: usize = 1024;
/// Extra time a webhook waits beyond the model's own per-turn timeout.
const REPLY_GRACE_SECS: u64 = 2;

fn init_logging(config: &AppConfig) {
    use setter_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap(config).await?;
    let config = &app.config;

    let recorder = OutcomeRecorder::new(
        app.records.clone(),
        app.dead_letters.clone(),
        config.recorder.clone(),
    );
    let (recorder, recorder_worker) = recorder.spawn();
    let mut outcomes = recorder.subscribe();
    tokio::spawn(async move {
        while let Ok(outcome) = outcomes.recv().await {
            info!(
                event_name = "outcome.published",
                attempt_id = %outcome.attempt_id,
                lead_id = %outcome.lead_id,
                state = outcome.state.as_str(),
                "call outcome available"
            );
        }
    });

    let callbacks = CallbackUrls::new(&config.server.public_base_url);
    let dispatcher = Dispatcher::new(
        Orchestrator::new(app.orchestrator_config.clone()),
        app.collaborators.clone(),
        app.transition_log.clone(),
        recorder,
        callbacks.clone(),
        DISPATCH_CHANNEL_CAPACITY,
    );
    let dispatch = dispatcher.handle();
    let sessions = dispatcher.sessions();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let drain_for = Duration::from_secs(config.server.graceful_shutdown_secs);
    let dispatcher_task = tokio::spawn(dispatcher.run(
        Duration::from_secs(config.dialer.tick_interval_secs),
        shutdown_rx.clone(),
        drain_for,
    ));

    let poller_task = match app.lead_source.clone() {
        Some(source) => {
            let max_age = i64::try_from(config.dialer.lead_max_age_hours)
                .ok()
                .and_then(chrono::Duration::try_hours)
                .unwrap_or(chrono::Duration::MAX);
            let poller = LeadPoller::new(
                source,
                dispatch.clone(),
                Duration::from_secs(config.crm.poll_interval_secs),
                max_age,
            );
            Some(poller.spawn(shutdown_rx.clone()))
        }
        None => {
            warn!(
                event_name = "system.server.crm_disabled",
                correlation_id = "bootstrap",
                "crm polling is disabled, no leads will be fetched"
            );
            None
        }
    };

    let app_router = webhooks::router(WebhookState {
        dispatch: dispatch.clone(),
        sessions,
        callbacks,
        webhook_secret: config.telephony.webhook_secret.clone(),
        reply_timeout: Duration::from_secs(
            config.conversation.turn_timeout_secs.saturating_add(REPLY_GRACE_SECS),
        ),
    })
    .merge(health::router(HealthState { db_pool: app.db_pool.clone(), dispatch: dispatch.clone() }))
    .merge(read_model::router(ReadModelState {
        dispatch: dispatch.clone(),
        transition_log: app.transition_log.clone(),
    }));
    drop(dispatch);

    let address = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        public_base_url = %config.server.public_base_url,
        "setter-server started"
    );

    // The webhooks stay up until the dispatcher has drained live calls.
    let (stop_http, http_stopped) = oneshot::channel::<()>();
    let server = axum::serve(listener, app_router).with_graceful_shutdown(async move {
        let _ = http_stopped.await;
    });
    let server_task = tokio::spawn(async move { server.await });

    wait_for_shutdown().await?;
    info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        drain_secs = drain_for.as_secs(),
        "setter-server stopping"
    );
    let _ = shutdown.send(true);

    if let Some(poller_task) = poller_task {
        let _ = poller_task.await;
    }
    dispatcher_task.await?;
    recorder_worker.await?;
    let _ = stop_http.send(());
    server_task.await??;
    app.db_pool.close().await;

    info!(
        event_name = "system.server.stopped",
        correlation_id = "shutdown",
        "setter-server stopped"
    );
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
