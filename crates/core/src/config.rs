use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::RetryBackoff;
use crate::business_hours::{parse_clock, BusinessHours};
use crate::lead_queue::LeadQueuePolicy;
use crate::orchestrator::OrchestratorConfig;

pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["setter.toml", "config/setter.toml"];

/// Upper bound for any configured timeout, backoff or retention window.
const MAX_WINDOW_SECS: u64 = 7 * 24 * 3_600;
const MAX_LEAD_AGE_HOURS: u64 = 24 * 365;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub telephony: TelephonyConfig,
    pub crm: CrmConfig,
    pub scheduling: SchedulingConfig,
    pub dialer: DialerConfig,
    pub business_hours: BusinessHoursConfig,
    pub conversation: ConversationConfig,
    pub recorder: RecorderConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Externally reachable base URL the telephony provider calls back on.
    pub public_base_url: String,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct TelephonyConfig {
    pub api_base_url: String,
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
    /// Shared secret expected in the `x-setter-webhook-secret` header.
    pub webhook_secret: Option<SecretString>,
    pub machine_detection: bool,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub location_id: Option<String>,
    pub poll_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SchedulingConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub meeting_duration_minutes: u32,
    pub max_retries: u32,
    pub retry_base_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialerConfig {
    pub max_concurrent_calls: usize,
    pub max_queued_attempts: usize,
    pub retry_ceiling: u32,
    pub dial_timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_multiplier: u32,
    pub backoff_cap_secs: u64,
    pub lead_max_age_hours: u64,
    pub tick_interval_secs: u64,
    pub stale_after_secs: u64,
    pub wind_down_grace_secs: u64,
    pub finished_retention_secs: u64,
    pub cancel_outside_hours: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusinessHoursConfig {
    /// `HH:MM`, inclusive.
    pub start: String,
    /// `HH:MM`, exclusive. Earlier than `start` wraps midnight.
    pub end: String,
    pub utc_offset_minutes: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationConfig {
    pub max_turns: u32,
    pub max_call_duration_secs: u64,
    pub turn_timeout_secs: u64,
    pub qualification_threshold: i32,
    pub history_window: usize,
    pub agent_name: String,
    pub company_name: String,
    pub contact_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecorderConfig {
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub channel_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub telephony_auth_token: Option<String>,
    pub max_concurrent_calls: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://setter.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 8,
                max_retries: 1,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                public_base_url: "http://127.0.0.1:8080".to_string(),
                graceful_shutdown_secs: 15,
            },
            telephony: TelephonyConfig {
                api_base_url: "https://api.twilio.com/2010-04-01".to_string(),
                account_sid: String::new(),
                auth_token: String::new().into(),
                from_number: String::new(),
                webhook_secret: None,
                machine_detection: true,
            },
            crm: CrmConfig {
                enabled: false,
                base_url: "https://rest.gohighlevel.com/v1".to_string(),
                api_key: None,
                location_id: None,
                poll_interval_secs: 600,
            },
            scheduling: SchedulingConfig {
                enabled: false,
                base_url: None,
                api_key: None,
                meeting_duration_minutes: 30,
                max_retries: 5,
                retry_base_secs: 60,
            },
            dialer: DialerConfig {
                max_concurrent_calls: 2,
                max_queued_attempts: 20,
                retry_ceiling: 3,
                dial_timeout_secs: 30,
                backoff_base_secs: 900,
                backoff_multiplier: 2,
                backoff_cap_secs: 14_400,
                lead_max_age_hours: 24,
                tick_interval_secs: 5,
                stale_after_secs: 60,
                wind_down_grace_secs: 30,
                finished_retention_secs: 3_600,
                cancel_outside_hours: false,
            },
            business_hours: BusinessHoursConfig {
                start: "09:00".to_string(),
                end: "18:00".to_string(),
                utc_offset_minutes: 0,
            },
            conversation: ConversationConfig {
                max_turns: 20,
                max_call_duration_secs: 300,
                turn_timeout_secs: 8,
                qualification_threshold: 2,
                history_window: 6,
                agent_name: "Maayaa".to_string(),
                company_name: "LoanCater".to_string(),
                contact_name: "Ryan".to_string(),
            },
            recorder: RecorderConfig { max_attempts: 5, retry_base_ms: 200, channel_capacity: 256 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_CANDIDATES[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Scheduler settings derived from the `dialer`, `business_hours`,
    /// `conversation` and `scheduling` sections.
    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig, ConfigError> {
        let dialer = &self.dialer;
        Ok(OrchestratorConfig {
            max_concurrent_calls: dialer.max_concurrent_calls,
            max_queued_attempts: dialer.max_queued_attempts,
            dial_timeout: seconds(dialer.dial_timeout_secs),
            max_call_duration: seconds(self.conversation.max_call_duration_secs),
            wind_down_grace: seconds(dialer.wind_down_grace_secs),
            stale_after: seconds(dialer.stale_after_secs),
            cancel_outside_hours: dialer.cancel_outside_hours,
            business_hours: self.business_hours.window()?,
            max_meeting_retries: self.scheduling.max_retries,
            meeting_retry_base: seconds(self.scheduling.retry_base_secs),
            finished_retention: seconds(dialer.finished_retention_secs),
            queue: LeadQueuePolicy {
                max_age: seconds(dialer.lead_max_age_hours.saturating_mul(3_600)),
                retry_ceiling: dialer.retry_ceiling,
                backoff: RetryBackoff {
                    base_seconds: dialer.backoff_base_secs,
                    multiplier: dialer.backoff_multiplier,
                    cap_seconds: dialer.backoff_cap_secs,
                },
            },
        })
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            set(&mut self.database.url, database.url);
            set(&mut self.database.max_connections, database.max_connections);
            set(&mut self.database.timeout_secs, database.timeout_secs);
        }

        if let Some(llm) = patch.llm {
            set(&mut self.llm.provider, llm.provider);
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            set(&mut self.llm.model, llm.model);
            set(&mut self.llm.timeout_secs, llm.timeout_secs);
            set(&mut self.llm.max_retries, llm.max_retries);
        }

        if let Some(server) = patch.server {
            set(&mut self.server.bind_address, server.bind_address);
            set(&mut self.server.port, server.port);
            set(&mut self.server.public_base_url, server.public_base_url);
            set(&mut self.server.graceful_shutdown_secs, server.graceful_shutdown_secs);
        }

        if let Some(telephony) = patch.telephony {
            set(&mut self.telephony.api_base_url, telephony.api_base_url);
            set(&mut self.telephony.account_sid, telephony.account_sid);
            if let Some(auth_token) = telephony.auth_token {
                self.telephony.auth_token = secret_value(auth_token);
            }
            set(&mut self.telephony.from_number, telephony.from_number);
            if let Some(webhook_secret) = telephony.webhook_secret {
                self.telephony.webhook_secret = Some(secret_value(webhook_secret));
            }
            set(&mut self.telephony.machine_detection, telephony.machine_detection);
        }

        if let Some(crm) = patch.crm {
            set(&mut self.crm.enabled, crm.enabled);
            set(&mut self.crm.base_url, crm.base_url);
            if let Some(api_key) = crm.api_key {
                self.crm.api_key = Some(secret_value(api_key));
            }
            if let Some(location_id) = crm.location_id {
                self.crm.location_id = Some(location_id);
            }
            set(&mut self.crm.poll_interval_secs, crm.poll_interval_secs);
        }

        if let Some(scheduling) = patch.scheduling {
            set(&mut self.scheduling.enabled, scheduling.enabled);
            if let Some(base_url) = scheduling.base_url {
                self.scheduling.base_url = Some(base_url);
            }
            if let Some(api_key) = scheduling.api_key {
                self.scheduling.api_key = Some(secret_value(api_key));
            }
            set(&mut self.scheduling.meeting_duration_minutes, scheduling.meeting_duration_minutes);
            set(&mut self.scheduling.max_retries, scheduling.max_retries);
            set(&mut self.scheduling.retry_base_secs, scheduling.retry_base_secs);
        }

        if let Some(dialer) = patch.dialer {
            let target = &mut self.dialer;
            set(&mut target.max_concurrent_calls, dialer.max_concurrent_calls);
            set(&mut target.max_queued_attempts, dialer.max_queued_attempts);
            set(&mut target.retry_ceiling, dialer.retry_ceiling);
            set(&mut target.dial_timeout_secs, dialer.dial_timeout_secs);
            set(&mut target.backoff_base_secs, dialer.backoff_base_secs);
            set(&mut target.backoff_multiplier, dialer.backoff_multiplier);
            set(&mut target.backoff_cap_secs, dialer.backoff_cap_secs);
            set(&mut target.lead_max_age_hours, dialer.lead_max_age_hours);
            set(&mut target.tick_interval_secs, dialer.tick_interval_secs);
            set(&mut target.stale_after_secs, dialer.stale_after_secs);
            set(&mut target.wind_down_grace_secs, dialer.wind_down_grace_secs);
            set(&mut target.finished_retention_secs, dialer.finished_retention_secs);
            set(&mut target.cancel_outside_hours, dialer.cancel_outside_hours);
        }

        if let Some(hours) = patch.business_hours {
            set(&mut self.business_hours.start, hours.start);
            set(&mut self.business_hours.end, hours.end);
            set(&mut self.business_hours.utc_offset_minutes, hours.utc_offset_minutes);
        }

        if let Some(conversation) = patch.conversation {
            let target = &mut self.conversation;
            set(&mut target.max_turns, conversation.max_turns);
            set(&mut target.max_call_duration_secs, conversation.max_call_duration_secs);
            set(&mut target.turn_timeout_secs, conversation.turn_timeout_secs);
            set(&mut target.qualification_threshold, conversation.qualification_threshold);
            set(&mut target.history_window, conversation.history_window);
            set(&mut target.agent_name, conversation.agent_name);
            set(&mut target.company_name, conversation.company_name);
            set(&mut target.contact_name, conversation.contact_name);
        }

        if let Some(recorder) = patch.recorder {
            set(&mut self.recorder.max_attempts, recorder.max_attempts);
            set(&mut self.recorder.retry_base_ms, recorder.retry_base_ms);
            set(&mut self.recorder.channel_capacity, recorder.channel_capacity);
        }

        if let Some(logging) = patch.logging {
            set(&mut self.logging.level, logging.level);
            set(&mut self.logging.format, logging.format);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("SETTER_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("SETTER_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("SETTER_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("SETTER_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("SETTER_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("SETTER_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("SETTER_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("SETTER_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("SETTER_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("SETTER_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env("SETTER_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("SETTER_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("SETTER_SERVER_PORT") {
            self.server.port = parse_env("SETTER_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("SETTER_SERVER_PUBLIC_BASE_URL") {
            self.server.public_base_url = value;
        }

        if let Some(value) = read_env("SETTER_TELEPHONY_ACCOUNT_SID") {
            self.telephony.account_sid = value;
        }
        if let Some(value) = read_env("SETTER_TELEPHONY_AUTH_TOKEN") {
            self.telephony.auth_token = secret_value(value);
        }
        if let Some(value) = read_env("SETTER_TELEPHONY_FROM_NUMBER") {
            self.telephony.from_number = value;
        }
        if let Some(value) = read_env("SETTER_TELEPHONY_WEBHOOK_SECRET") {
            self.telephony.webhook_secret = Some(secret_value(value));
        }

        if let Some(value) = read_env("SETTER_CRM_ENABLED") {
            self.crm.enabled = parse_env("SETTER_CRM_ENABLED", &value)?;
        }
        if let Some(value) = read_env("SETTER_CRM_API_KEY") {
            self.crm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("SETTER_CRM_LOCATION_ID") {
            self.crm.location_id = Some(value);
        }

        if let Some(value) = read_env("SETTER_SCHEDULING_API_KEY") {
            self.scheduling.api_key = Some(secret_value(value));
        }

        if let Some(value) = read_env("SETTER_DIALER_MAX_CONCURRENT_CALLS") {
            self.dialer.max_concurrent_calls =
                parse_env("SETTER_DIALER_MAX_CONCURRENT_CALLS", &value)?;
        }
        if let Some(value) = read_env("SETTER_DIALER_RETRY_CEILING") {
            self.dialer.retry_ceiling = parse_env("SETTER_DIALER_RETRY_CEILING", &value)?;
        }

        let log_level = read_env("SETTER_LOGGING_LEVEL").or_else(|| read_env("SETTER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("SETTER_LOGGING_FORMAT").or_else(|| read_env("SETTER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        set(&mut self.database.url, overrides.database_url);
        set(&mut self.logging.level, overrides.log_level);
        set(&mut self.llm.provider, overrides.llm_provider);
        set(&mut self.llm.model, overrides.llm_model);
        if let Some(auth_token) = overrides.telephony_auth_token {
            self.telephony.auth_token = secret_value(auth_token);
        }
        set(&mut self.dialer.max_concurrent_calls, overrides.max_concurrent_calls);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_telephony(&self.telephony)?;
        validate_crm(&self.crm)?;
        validate_scheduling(&self.scheduling)?;
        validate_dialer(&self.dialer)?;
        self.business_hours.window()?;
        validate_conversation(&self.conversation)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

impl BusinessHoursConfig {
    pub fn window(&self) -> Result<BusinessHours, ConfigError> {
        let start = parse_clock(&self.start).ok_or_else(|| {
            ConfigError::Validation(format!(
                "business_hours.start `{}` must be HH:MM",
                self.start
            ))
        })?;
        let end = parse_clock(&self.end).ok_or_else(|| {
            ConfigError::Validation(format!("business_hours.end `{}` must be HH:MM", self.end))
        })?;
        if !(-14 * 60..=14 * 60).contains(&self.utc_offset_minutes) {
            return Err(ConfigError::Validation(
                "business_hours.utc_offset_minutes must be in range -840..=840".to_string(),
            ));
        }
        Ok(BusinessHours { start, end, utc_offset_minutes: self.utc_offset_minutes })
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn seconds(value: u64) -> Duration {
    i64::try_from(value).ok().and_then(Duration::try_seconds).unwrap_or(Duration::MAX)
}

/// First existing config file, explicit path first.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    CONFIG_FILE_CANDIDATES.into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 60 {
        return Err(ConfigError::Validation("llm.timeout_secs must be in range 1..=60".to_string()));
    }
    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model is required".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for the ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }
    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }
    validate_http_url("server.public_base_url", &server.public_base_url)
}

fn validate_telephony(telephony: &TelephonyConfig) -> Result<(), ConfigError> {
    validate_http_url("telephony.api_base_url", &telephony.api_base_url)?;

    if telephony.account_sid.trim().is_empty() {
        return Err(ConfigError::Validation(
            "telephony.account_sid is required. Find it on the provider console dashboard"
                .to_string(),
        ));
    }
    if telephony.auth_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "telephony.auth_token is required (SETTER_TELEPHONY_AUTH_TOKEN)".to_string(),
        ));
    }
    if !telephony.from_number.trim().starts_with('+') {
        return Err(ConfigError::Validation(
            "telephony.from_number must be in E.164 format, e.g. `+15550100000`".to_string(),
        ));
    }

    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    validate_http_url("crm.base_url", &crm.base_url)?;
    if crm.poll_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "crm.poll_interval_secs must be greater than zero".to_string(),
        ));
    }
    if crm.enabled {
        let missing = crm
            .api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing {
            return Err(ConfigError::Validation(
                "crm.enabled is true but crm.api_key is not configured".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_scheduling(scheduling: &SchedulingConfig) -> Result<(), ConfigError> {
    if scheduling.meeting_duration_minutes == 0 {
        return Err(ConfigError::Validation(
            "scheduling.meeting_duration_minutes must be greater than zero".to_string(),
        ));
    }
    if scheduling.retry_base_secs > MAX_WINDOW_SECS {
        return Err(ConfigError::Validation(format!(
            "scheduling.retry_base_secs must not exceed {MAX_WINDOW_SECS} seconds"
        )));
    }
    if scheduling.enabled {
        match &scheduling.base_url {
            Some(url) => validate_http_url("scheduling.base_url", url)?,
            None => {
                return Err(ConfigError::Validation(
                    "scheduling.enabled is true but scheduling.base_url is not configured"
                        .to_string(),
                ))
            }
        }
    }
    Ok(())
}

fn validate_dialer(dialer: &DialerConfig) -> Result<(), ConfigError> {
    if dialer.max_concurrent_calls == 0 {
        return Err(ConfigError::Validation(
            "dialer.max_concurrent_calls must be greater than zero".to_string(),
        ));
    }
    if dialer.retry_ceiling == 0 {
        return Err(ConfigError::Validation(
            "dialer.retry_ceiling must be greater than zero".to_string(),
        ));
    }
    if dialer.dial_timeout_secs == 0 || dialer.tick_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "dialer.dial_timeout_secs and dialer.tick_interval_secs must be greater than zero"
                .to_string(),
        ));
    }
    if dialer.backoff_multiplier == 0 || dialer.backoff_cap_secs < dialer.backoff_base_secs {
        return Err(ConfigError::Validation(
            "dialer backoff needs multiplier >= 1 and cap >= base".to_string(),
        ));
    }
    if dialer.lead_max_age_hours == 0 || dialer.lead_max_age_hours > MAX_LEAD_AGE_HOURS {
        return Err(ConfigError::Validation(format!(
            "dialer.lead_max_age_hours must be in range 1..={MAX_LEAD_AGE_HOURS}"
        )));
    }
    let windows = [
        ("dialer.dial_timeout_secs", dialer.dial_timeout_secs),
        ("dialer.backoff_cap_secs", dialer.backoff_cap_secs),
        ("dialer.stale_after_secs", dialer.stale_after_secs),
        ("dialer.wind_down_grace_secs", dialer.wind_down_grace_secs),
        ("dialer.finished_retention_secs", dialer.finished_retention_secs),
    ];
    if let Some((key, _)) = windows.iter().find(|(_, value)| *value > MAX_WINDOW_SECS) {
        return Err(ConfigError::Validation(format!(
            "{key} must not exceed {MAX_WINDOW_SECS} seconds"
        )));
    }
    Ok(())
}

fn validate_conversation(conversation: &ConversationConfig) -> Result<(), ConfigError> {
    if conversation.max_turns < 2 {
        return Err(ConfigError::Validation(
            "conversation.max_turns must be at least 2".to_string(),
        ));
    }
    if conversation.max_call_duration_secs == 0 || conversation.turn_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "conversation durations must be greater than zero".to_string(),
        ));
    }
    if conversation.max_call_duration_secs > MAX_WINDOW_SECS {
        return Err(ConfigError::Validation(format!(
            "conversation.max_call_duration_secs must not exceed {MAX_WINDOW_SECS} seconds"
        )));
    }
    if conversation.turn_timeout_secs >= conversation.max_call_duration_secs {
        return Err(ConfigError::Validation(
            "conversation.turn_timeout_secs must be shorter than max_call_duration_secs"
                .to_string(),
        ));
    }
    if conversation.qualification_threshold <= 0 {
        return Err(ConfigError::Validation(
            "conversation.qualification_threshold must be positive".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_http_url(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{key} must start with http:// or https://")))
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    telephony: Option<TelephonyPatch>,
    crm: Option<CrmPatch>,
    scheduling: Option<SchedulingPatch>,
    dialer: Option<DialerPatch>,
    business_hours: Option<BusinessHoursPatch>,
    conversation: Option<ConversationPatch>,
    recorder: Option<RecorderPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    public_base_url: Option<String>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TelephonyPatch {
    api_base_url: Option<String>,
    account_sid: Option<String>,
    auth_token: Option<String>,
    from_number: Option<String>,
    webhook_secret: Option<String>,
    machine_detection: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    enabled: Option<bool>,
    base_url: Option<String>,
    api_key: Option<String>,
    location_id: Option<String>,
    poll_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulingPatch {
    enabled: Option<bool>,
    base_url: Option<String>,
    api_key: Option<String>,
    meeting_duration_minutes: Option<u32>,
    max_retries: Option<u32>,
    retry_base_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DialerPatch {
    max_concurrent_calls: Option<usize>,
    max_queued_attempts: Option<usize>,
    retry_ceiling: Option<u32>,
    dial_timeout_secs: Option<u64>,
    backoff_base_secs: Option<u64>,
    backoff_multiplier: Option<u32>,
    backoff_cap_secs: Option<u64>,
    lead_max_age_hours: Option<u64>,
    tick_interval_secs: Option<u64>,
    stale_after_secs: Option<u64>,
    wind_down_grace_secs: Option<u64>,
    finished_retention_secs: Option<u64>,
    cancel_outside_hours: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct BusinessHoursPatch {
    start: Option<String>,
    end: Option<String>,
    utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct ConversationPatch {
    max_turns: Option<u32>,
    max_call_duration_secs: Option<u64>,
    turn_timeout_secs: Option<u64>,
    qualification_threshold: Option<i32>,
    history_window: Option<usize>,
    agent_name: Option<String>,
    company_name: Option<String>,
    contact_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RecorderPatch {
    max_attempts: Option<u32>,
    retry_base_ms: Option<u64>,
    channel_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
