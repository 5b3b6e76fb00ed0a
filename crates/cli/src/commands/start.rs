use crate::commands::{block_on_runtime, load_config, CommandResult};
use setter_db::{connect_with_config, ping};

/// Checks everything the server needs before it can place a call, without
/// placing one.
pub fn run() -> CommandResult {
    let config = match load_config("start") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let orchestrator = match config.orchestrator_config() {
        Ok(orchestrator) => orchestrator,
        Err(error) => {
            return CommandResult::failure(
                "start",
                "config_validation",
                format!("dialer settings are inconsistent: {error}"),
                2,
            );
        }
    };
    let runtime = match block_on_runtime("start") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let database = runtime.block_on(async {
        let pool = connect_with_config(&config.database).await?;
        let probe = ping(&pool).await;
        pool.close().await;
        probe
    });
    if let Err(error) = database {
        return CommandResult::failure(
            "start",
            "db_connectivity",
            format!("database `{}` is unreachable: {error}", config.database.url),
            4,
        );
    }

    let hours = &config.business_hours;
    let crm = if config.crm.enabled { "enabled" } else { "disabled" };
    let scheduling = if config.scheduling.enabled { "enabled" } else { "disabled" };
    CommandResult::success(
        "start",
        format!(
            "preflight passed: {} concurrent calls, business hours {}-{} (UTC{:+} min), \
             crm polling {crm}, scheduling {scheduling}, webhooks at {}",
            orchestrator.max_concurrent_calls,
            hours.start,
            hours.end,
            hours.utc_offset_minutes,
            config.server.public_base_url,
        ),
    )
}
