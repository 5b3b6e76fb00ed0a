use std::env;
use std::fs;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use setter_core::config::{resolve_config_path, AppConfig, LoadOptions};
use toml::Value;

/// One reported setting: dotted key, rendered value, overriding env var.
struct Setting {
    key: &'static str,
    value: String,
    env_key: Option<&'static str>,
}

fn setting(key: &'static str, value: impl ToString, env_key: Option<&'static str>) -> Setting {
    Setting { key, value: value.to_string(), env_key }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in settings(&config) {
        let source = field_source(
            entry.key,
            entry.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(entry.key, &entry.value, source));
    }

    lines.join("\n")
}

fn settings(config: &AppConfig) -> Vec<Setting> {
    let dialer = &config.dialer;
    vec![
        setting("database.url", &config.database.url, Some("SETTER_DATABASE_URL")),
        setting(
            "database.max_connections",
            config.database.max_connections,
            Some("SETTER_DATABASE_MAX_CONNECTIONS"),
        ),
        setting("llm.provider", format!("{:?}", config.llm.provider), Some("SETTER_LLM_PROVIDER")),
        setting("llm.model", &config.llm.model, Some("SETTER_LLM_MODEL")),
        setting(
            "llm.base_url",
            config.llm.base_url.as_deref().unwrap_or("<unset>"),
            Some("SETTER_LLM_BASE_URL"),
        ),
        setting(
            "llm.api_key",
            redact_optional(config.llm.api_key.as_ref()),
            Some("SETTER_LLM_API_KEY"),
        ),
        setting(
            "server.bind_address",
            &config.server.bind_address,
            Some("SETTER_SERVER_BIND_ADDRESS"),
        ),
        setting("server.port", config.server.port, Some("SETTER_SERVER_PORT")),
        setting(
            "server.public_base_url",
            &config.server.public_base_url,
            Some("SETTER_SERVER_PUBLIC_BASE_URL"),
        ),
        setting(
            "telephony.account_sid",
            &config.telephony.account_sid,
            Some("SETTER_TELEPHONY_ACCOUNT_SID"),
        ),
        setting(
            "telephony.auth_token",
            redact_token(config.telephony.auth_token.expose_secret()),
            Some("SETTER_TELEPHONY_AUTH_TOKEN"),
        ),
        setting(
            "telephony.from_number",
            &config.telephony.from_number,
            Some("SETTER_TELEPHONY_FROM_NUMBER"),
        ),
        setting(
            "telephony.webhook_secret",
            redact_optional(config.telephony.webhook_secret.as_ref()),
            Some("SETTER_TELEPHONY_WEBHOOK_SECRET"),
        ),
        setting("crm.enabled", config.crm.enabled, Some("SETTER_CRM_ENABLED")),
        setting(
            "crm.api_key",
            redact_optional(config.crm.api_key.as_ref()),
            Some("SETTER_CRM_API_KEY"),
        ),
        setting("crm.poll_interval_secs", config.crm.poll_interval_secs, None),
        setting("scheduling.enabled", config.scheduling.enabled, None),
        setting(
            "scheduling.api_key",
            redact_optional(config.scheduling.api_key.as_ref()),
            Some("SETTER_SCHEDULING_API_KEY"),
        ),
        setting(
            "dialer.max_concurrent_calls",
            dialer.max_concurrent_calls,
            Some("SETTER_DIALER_MAX_CONCURRENT_CALLS"),
        ),
        setting("dialer.retry_ceiling", dialer.retry_ceiling, Some("SETTER_DIALER_RETRY_CEILING")),
        setting("dialer.dial_timeout_secs", dialer.dial_timeout_secs, None),
        setting("dialer.lead_max_age_hours", dialer.lead_max_age_hours, None),
        setting("business_hours.start", &config.business_hours.start, None),
        setting("business_hours.end", &config.business_hours.end, None),
        setting(
            "business_hours.utc_offset_minutes",
            config.business_hours.utc_offset_minutes,
            None,
        ),
        setting("conversation.max_turns", config.conversation.max_turns, None),
        setting(
            "conversation.max_call_duration_secs",
            config.conversation.max_call_duration_secs,
            None,
        ),
        setting("recorder.max_attempts", config.recorder.max_attempts, None),
        setting("logging.level", &config.logging.level, Some("SETTER_LOGGING_LEVEL")),
        setting(
            "logging.format",
            format!("{:?}", config.logging.format),
            Some("SETTER_LOGGING_FORMAT"),
        ),
    ]
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_optional(secret: Option<&SecretString>) -> String {
    match secret {
        Some(secret) => redact_token(secret.expose_secret()),
        None => "<unset>".to_string(),
    }
}

/// Keeps the last four characters of long tokens so operators can tell keys apart.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() >= 12 {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        return format!("***{tail}");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use super::{contains_path, redact_token};

    #[test]
    fn short_tokens_are_fully_redacted() {
        assert_eq!(redact_token("abc"), "<redacted>");
        assert_eq!(redact_token("  "), "<empty>");
    }

    #[test]
    fn long_tokens_keep_only_their_tail() {
        assert_eq!(redact_token("sk-live-0123456789abcd"), "***abcd");
    }

    #[test]
    fn nested_keys_are_found_in_the_file() {
        let doc: toml::Value = "[telephony]\naccount_sid = \"AC1\"\n".parse().expect("toml");
        assert!(contains_path(&doc, "telephony.account_sid"));
        assert!(!contains_path(&doc, "telephony.auth_token"));
    }
}
