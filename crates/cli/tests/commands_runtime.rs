use std::env;
use std::sync::{Mutex, OnceLock};

use chrono::{Duration, Utc};
use serde_json::Value;
use setter_cli::commands::{config, history, migrate, start};
use setter_core::audit::TransitionRecord;
use setter_core::domain::call::{CallAttemptId, CallState};
use setter_core::domain::lead::LeadId;
use setter_db::repositories::SqlTransitionLogRepository;
use setter_db::{connect, migrations, TransitionLogRepository};
use tempfile::TempDir;

const TELEPHONY: [(&str, &str); 3] = [
    ("SETTER_TELEPHONY_ACCOUNT_SID", "AC-cli-test"),
    ("SETTER_TELEPHONY_AUTH_TOKEN", "tok-live-0123456789wxyz"),
    ("SETTER_TELEPHONY_FROM_NUMBER", "+15550100000"),
];

fn env_with<'a>(extra: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    let mut vars = TELEPHONY.to_vec();
    vars.extend_from_slice(extra);
    vars
}

#[test]
fn start_returns_success_with_valid_env() {
    with_env(&env_with(&[("SETTER_DATABASE_URL", "sqlite::memory:")]), || {
        let result = start::run();
        assert_eq!(result.exit_code, 0, "expected successful start preflight: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "start");
        assert_eq!(payload["status"], "ok");
        let message = payload["message"].as_str().expect("message");
        assert!(message.contains("2 concurrent calls"), "unexpected message: {message}");
    });
}

#[test]
fn start_returns_config_failure_without_telephony_credentials() {
    with_env(&[("SETTER_DATABASE_URL", "sqlite::memory:")], || {
        let result = start::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "start");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn start_rejects_a_zero_slot_dialer() {
    with_env(
        &env_with(&[
            ("SETTER_DATABASE_URL", "sqlite::memory:"),
            ("SETTER_DIALER_MAX_CONCURRENT_CALLS", "0"),
        ]),
        || {
            let result = start::run();
            assert_eq!(result.exit_code, 2);
            assert_eq!(parse_payload(&result.output)["error_class"], "config_validation");
        },
    );
}

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&env_with(&[("SETTER_DATABASE_URL", "sqlite::memory:")]), || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn config_redacts_secrets_and_reports_sources() {
    with_env(
        &env_with(&[
            ("SETTER_DATABASE_URL", "sqlite::memory:"),
            ("SETTER_LLM_API_KEY", "sk-secret-abcdefghijkl"),
        ]),
        || {
            let output = config::run();

            assert!(output.starts_with("effective config"), "unexpected output: {output}");
            assert!(!output.contains("tok-live-0123456789wxyz"));
            assert!(!output.contains("sk-secret-abcdefghijkl"));
            assert!(output.contains("- telephony.auth_token = ***wxyz"));
            assert!(output.contains(
                "- telephony.account_sid = AC-cli-test (source: env (SETTER_TELEPHONY_ACCOUNT_SID))"
            ));
            assert!(output.contains("- telephony.webhook_secret = <unset> (source: default)"));
        },
    );
}

#[test]
fn history_reports_unknown_attempts() {
    let dir = TempDir::new().expect("tempdir");
    let url = database_url(&dir);
    with_env(&env_with(&[("SETTER_DATABASE_URL", &url)]), || {
        assert_eq!(migrate::run().exit_code, 0);

        let result = history::run("missing-attempt");
        assert_eq!(result.exit_code, 6);
        assert_eq!(parse_payload(&result.output)["error_class"], "not_found");
    });
}

#[test]
fn history_prints_and_verifies_a_finished_attempt() {
    let dir = TempDir::new().expect("tempdir");
    let url = database_url(&dir);
    seed_history(
        &url,
        &[
            (None, CallState::Queued),
            (Some(CallState::Queued), CallState::Dialing),
            (Some(CallState::Dialing), CallState::NoAnswer),
        ],
    );

    with_env(&env_with(&[("SETTER_DATABASE_URL", &url)]), || {
        let result = history::run("attempt-1");
        assert_eq!(result.exit_code, 0, "expected a valid history: {}", result.output);

        let payload = parse_payload(&result.output);
        let message = payload["message"].as_str().expect("message");
        assert!(message.contains("#1 "));
        assert!(message.contains("dialing -> no_answer"));
        assert!(message.ends_with("history valid, no call record yet"));
    });
}

#[test]
fn history_flags_a_gap_in_the_log() {
    let dir = TempDir::new().expect("tempdir");
    let url = database_url(&dir);
    seed_history(
        &url,
        &[(None, CallState::Queued), (Some(CallState::Dialing), CallState::Connected)],
    );

    with_env(&env_with(&[("SETTER_DATABASE_URL", &url)]), || {
        let result = history::run("attempt-1");
        assert_eq!(result.exit_code, 7);
        assert_eq!(parse_payload(&result.output)["error_class"], "history_violation");
    });
}

fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("setter.db").display())
}

/// Appends `attempt-1` transitions one second apart.
fn seed_history(url: &str, steps: &[(Option<CallState>, CallState)]) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime should build");
    runtime.block_on(async {
        let pool = connect(url).await.expect("database should open");
        migrations::run_pending(&pool).await.expect("migrations should apply");
        let log = SqlTransitionLogRepository::new(pool.clone());

        let start = Utc::now() - Duration::minutes(5);
        for (sequence, (from, to)) in (1u32..).zip(steps) {
            let record = TransitionRecord::new(
                LeadId("lead-1".to_string()),
                CallAttemptId("attempt-1".to_string()),
                *from,
                *to,
                "test",
                sequence,
                start + Duration::seconds(i64::from(sequence)),
            );
            log.append(&record).await.expect("transition should append");
        }
        pool.close().await;
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid json")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|error| error.into_inner());

    let keys = [
        "SETTER_DATABASE_URL",
        "SETTER_DATABASE_MAX_CONNECTIONS",
        "SETTER_DATABASE_TIMEOUT_SECS",
        "SETTER_LLM_PROVIDER",
        "SETTER_LLM_API_KEY",
        "SETTER_LLM_BASE_URL",
        "SETTER_LLM_MODEL",
        "SETTER_LLM_TIMEOUT_SECS",
        "SETTER_SERVER_BIND_ADDRESS",
        "SETTER_SERVER_PORT",
        "SETTER_SERVER_PUBLIC_BASE_URL",
        "SETTER_TELEPHONY_ACCOUNT_SID",
        "SETTER_TELEPHONY_AUTH_TOKEN",
        "SETTER_TELEPHONY_FROM_NUMBER",
        "SETTER_TELEPHONY_WEBHOOK_SECRET",
        "SETTER_CRM_ENABLED",
        "SETTER_CRM_API_KEY",
        "SETTER_CRM_LOCATION_ID",
        "SETTER_SCHEDULING_API_KEY",
        "SETTER_DIALER_MAX_CONCURRENT_CALLS",
        "SETTER_DIALER_RETRY_CEILING",
        "SETTER_LOGGING_LEVEL",
        "SETTER_LOGGING_FORMAT",
        "SETTER_LOG_LEVEL",
        "SETTER_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
