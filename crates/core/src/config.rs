use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::conversation::requirement_fields;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    pub delegation: DelegationConfig,
    pub server: ServerConfig,
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
}

/// Write-back cache tuning: periodic flush cadence, idle eviction, and the
/// backoff bounds used while the store is failing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub flush_interval_secs: u64,
    pub idle_eviction_secs: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DelegationConfig {
    pub send_timeout_secs: u64,
    pub required_fields: Vec<String>,
    pub max_tasks: usize,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
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
    Anthropic,
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
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub flush_interval_secs: Option<u64>,
    pub send_timeout_secs: Option<u64>,
    pub required_fields: Option<Vec<String>>,
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

pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["eventcrew.toml", "config/eventcrew.toml"];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://eventcrew.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: None,
                model: "llama3.1".to_string(),
                timeout_secs: 30,
            },
            cache: CacheConfig::default(),
            delegation: DelegationConfig::default(),
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 30,
            idle_eviction_secs: 1_800,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
        }
    }
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 45,
            required_fields: vec![
                requirement_fields::EVENT_TYPE.to_string(),
                requirement_fields::ATTENDEES.to_string(),
                requirement_fields::BUDGET.to_string(),
                requirement_fields::TIMELINE.to_string(),
            ],
            max_tasks: 8,
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
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
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

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(flush_interval_secs) = cache.flush_interval_secs {
                self.cache.flush_interval_secs = flush_interval_secs;
            }
            if let Some(idle_eviction_secs) = cache.idle_eviction_secs {
                self.cache.idle_eviction_secs = idle_eviction_secs;
            }
            if let Some(retry_base_ms) = cache.retry_base_ms {
                self.cache.retry_base_ms = retry_base_ms;
            }
            if let Some(retry_max_ms) = cache.retry_max_ms {
                self.cache.retry_max_ms = retry_max_ms;
            }
        }

        if let Some(delegation) = patch.delegation {
            if let Some(send_timeout_secs) = delegation.send_timeout_secs {
                self.delegation.send_timeout_secs = send_timeout_secs;
            }
            if let Some(required_fields) = delegation.required_fields {
                self.delegation.required_fields = required_fields;
            }
            if let Some(max_tasks) = delegation.max_tasks {
                self.delegation.max_tasks = max_tasks;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("EVENTCREW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("EVENTCREW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("EVENTCREW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("EVENTCREW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("EVENTCREW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("EVENTCREW_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("EVENTCREW_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("EVENTCREW_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("EVENTCREW_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("EVENTCREW_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("EVENTCREW_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("EVENTCREW_CACHE_FLUSH_INTERVAL_SECS") {
            self.cache.flush_interval_secs =
                parse_u64("EVENTCREW_CACHE_FLUSH_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("EVENTCREW_CACHE_IDLE_EVICTION_SECS") {
            self.cache.idle_eviction_secs =
                parse_u64("EVENTCREW_CACHE_IDLE_EVICTION_SECS", &value)?;
        }
        if let Some(value) = read_env("EVENTCREW_CACHE_RETRY_BASE_MS") {
            self.cache.retry_base_ms = parse_u64("EVENTCREW_CACHE_RETRY_BASE_MS", &value)?;
        }
        if let Some(value) = read_env("EVENTCREW_CACHE_RETRY_MAX_MS") {
            self.cache.retry_max_ms = parse_u64("EVENTCREW_CACHE_RETRY_MAX_MS", &value)?;
        }

        if let Some(value) = read_env("EVENTCREW_DELEGATION_SEND_TIMEOUT_SECS") {
            self.delegation.send_timeout_secs =
                parse_u64("EVENTCREW_DELEGATION_SEND_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("EVENTCREW_DELEGATION_REQUIRED_FIELDS") {
            self.delegation.required_fields = parse_list(&value);
        }
        if let Some(value) = read_env("EVENTCREW_DELEGATION_MAX_TASKS") {
            self.delegation.max_tasks =
                parse_u32("EVENTCREW_DELEGATION_MAX_TASKS", &value)? as usize;
        }

        if let Some(value) = read_env("EVENTCREW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("EVENTCREW_SERVER_PORT") {
            self.server.port = parse_u16("EVENTCREW_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("EVENTCREW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("EVENTCREW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("EVENTCREW_LOGGING_LEVEL").or_else(|| read_env("EVENTCREW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("EVENTCREW_LOGGING_FORMAT").or_else(|| read_env("EVENTCREW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = Some(llm_base_url);
        }
        if let Some(flush_interval_secs) = overrides.flush_interval_secs {
            self.cache.flush_interval_secs = flush_interval_secs;
        }
        if let Some(send_timeout_secs) = overrides.send_timeout_secs {
            self.delegation.send_timeout_secs = send_timeout_secs;
        }
        if let Some(required_fields) = overrides.required_fields {
            self.delegation.required_fields = required_fields;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_cache(&self.cache)?;
        validate_delegation(&self.delegation)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

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
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {}
    }

    // Unset means the provider's public endpoint (or a local Ollama).
    if llm.base_url.as_ref().is_some_and(|value| value.trim().is_empty()) {
        return Err(ConfigError::Validation("llm.base_url must not be empty when set".to_string()));
    }

    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if cache.flush_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "cache.flush_interval_secs must be greater than zero".to_string(),
        ));
    }

    if cache.idle_eviction_secs < cache.flush_interval_secs {
        return Err(ConfigError::Validation(
            "cache.idle_eviction_secs must be at least cache.flush_interval_secs".to_string(),
        ));
    }

    if cache.retry_base_ms == 0 || cache.retry_base_ms > cache.retry_max_ms {
        return Err(ConfigError::Validation(
            "cache.retry_base_ms must be in range 1..=cache.retry_max_ms".to_string(),
        ));
    }

    Ok(())
}

fn validate_delegation(delegation: &DelegationConfig) -> Result<(), ConfigError> {
    if delegation.send_timeout_secs == 0 || delegation.send_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "delegation.send_timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if delegation.required_fields.is_empty() {
        return Err(ConfigError::Validation(
            "delegation.required_fields must name at least one requirement field".to_string(),
        ));
    }

    if let Some(unknown) =
        delegation.required_fields.iter().find(|field| !requirement_fields::is_known(field))
    {
        return Err(ConfigError::Validation(format!(
            "delegation.required_fields contains unknown field `{unknown}` (expected any of {})",
            requirement_fields::ALL.join("|")
        )));
    }

    if delegation.max_tasks == 0 {
        return Err(ConfigError::Validation(
            "delegation.max_tasks must be greater than zero".to_string(),
        ));
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

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    cache: Option<CachePatch>,
    delegation: Option<DelegationPatch>,
    server: Option<ServerPatch>,
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
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    flush_interval_secs: Option<u64>,
    idle_eviction_secs: Option<u64>,
    retry_base_ms: Option<u64>,
    retry_max_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DelegationPatch {
    send_timeout_secs: Option<u64>,
    required_fields: Option<Vec<String>>,
    max_tasks: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
