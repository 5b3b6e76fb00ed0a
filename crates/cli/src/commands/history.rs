use setter_core::audit::{verify_history, TransitionRecord};
use setter_core::domain::call::CallAttemptId;
use setter_db::repositories::{SqlCallRecordRepository, SqlTransitionLogRepository};
use setter_db::{connect_with_config, CallRecordRepository, TransitionLogRepository};

use crate::commands::{block_on_runtime, load_config, CommandResult};

/// Prints one attempt's transition log and checks it is a well-formed
/// history: starts at `queued`, is contiguous, and has one outcome.
pub fn run(attempt_id: &str) -> CommandResult {
    let config = match load_config("history") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match block_on_runtime("history") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let attempt_id = CallAttemptId(attempt_id.trim().to_string());
    let loaded = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let transitions = SqlTransitionLogRepository::new(pool.clone())
            .list_for_attempt(&attempt_id)
            .await
            .map_err(|error| ("persistence", error.to_string(), 5u8))?;
        let record = SqlCallRecordRepository::new(pool.clone())
            .find(&attempt_id)
            .await
            .map_err(|error| ("persistence", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>((transitions, record.is_some()))
    });

    let (transitions, recorded) = match loaded {
        Ok(loaded) => loaded,
        Err((error_class, message, exit_code)) => {
            return CommandResult::failure("history", error_class, message, exit_code);
        }
    };
    if transitions.is_empty() {
        return CommandResult::failure(
            "history",
            "not_found",
            format!("no transitions logged for attempt `{attempt_id}`"),
            6,
        );
    }

    let mut lines = transitions.iter().map(render).collect::<Vec<_>>();
    let finished = transitions.last().is_some_and(|last| last.to_state.is_terminal());
    match verify_history(&transitions, finished) {
        Ok(()) => {
            let verdict = if recorded { "outcome recorded" } else { "no call record yet" };
            lines.push(format!("history valid, {verdict}"));
            CommandResult::success("history", lines.join("\n"))
        }
        Err(violation) => {
            lines.push(format!("history invalid: {violation}"));
            CommandResult::failure("history", "history_violation", lines.join("\n"), 7)
        }
    }
}

fn render(record: &TransitionRecord) -> String {
    let from = record.from_state.map(|state| state.as_str()).unwrap_or("-");
    format!(
        "#{} {} {} -> {} ({})",
        record.sequence,
        record.occurred_at.to_rfc3339(),
        from,
        record.to_state.as_str(),
        record.cause
    )
}
