use std::env;
use std::fs;
use std::path::Path;

use eventcrew_core::config::{resolve_config_path, AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct Field {
    key: &'static str,
    env_key: &'static str,
    value: String,
}

impl Field {
    fn new(key: &'static str, env_key: &'static str, value: impl Into<String>) -> Self {
        Self { key, env_key, value: value.into() }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in effective_fields(&config) {
        let source = field_source(
            field.key,
            field.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn effective_fields(config: &AppConfig) -> Vec<Field> {
    let llm_api_key = match &config.llm.api_key {
        Some(secret) => redact_secret(secret.expose_secret()),
        None => "<unset>".to_string(),
    };

    vec![
        Field::new("database.url", "EVENTCREW_DATABASE_URL", &config.database.url),
        Field::new(
            "database.max_connections",
            "EVENTCREW_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections.to_string(),
        ),
        Field::new(
            "database.timeout_secs",
            "EVENTCREW_DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs.to_string(),
        ),
        Field::new("llm.provider", "EVENTCREW_LLM_PROVIDER", format!("{:?}", config.llm.provider)),
        Field::new("llm.model", "EVENTCREW_LLM_MODEL", &config.llm.model),
        Field::new(
            "llm.base_url",
            "EVENTCREW_LLM_BASE_URL",
            config.llm.base_url.as_deref().unwrap_or("<unset>"),
        ),
        Field::new("llm.api_key", "EVENTCREW_LLM_API_KEY", llm_api_key),
        Field::new(
            "llm.timeout_secs",
            "EVENTCREW_LLM_TIMEOUT_SECS",
            config.llm.timeout_secs.to_string(),
        ),
        Field::new(
            "cache.flush_interval_secs",
            "EVENTCREW_CACHE_FLUSH_INTERVAL_SECS",
            config.cache.flush_interval_secs.to_string(),
        ),
        Field::new(
            "cache.idle_eviction_secs",
            "EVENTCREW_CACHE_IDLE_EVICTION_SECS",
            config.cache.idle_eviction_secs.to_string(),
        ),
        Field::new(
            "cache.retry_base_ms",
            "EVENTCREW_CACHE_RETRY_BASE_MS",
            config.cache.retry_base_ms.to_string(),
        ),
        Field::new(
            "cache.retry_max_ms",
            "EVENTCREW_CACHE_RETRY_MAX_MS",
            config.cache.retry_max_ms.to_string(),
        ),
        Field::new(
            "delegation.send_timeout_secs",
            "EVENTCREW_DELEGATION_SEND_TIMEOUT_SECS",
            config.delegation.send_timeout_secs.to_string(),
        ),
        Field::new(
            "delegation.required_fields",
            "EVENTCREW_DELEGATION_REQUIRED_FIELDS",
            config.delegation.required_fields.join(","),
        ),
        Field::new(
            "delegation.max_tasks",
            "EVENTCREW_DELEGATION_MAX_TASKS",
            config.delegation.max_tasks.to_string(),
        ),
        Field::new(
            "server.bind_address",
            "EVENTCREW_SERVER_BIND_ADDRESS",
            &config.server.bind_address,
        ),
        Field::new("server.port", "EVENTCREW_SERVER_PORT", config.server.port.to_string()),
        Field::new(
            "server.graceful_shutdown_secs",
            "EVENTCREW_SERVER_GRACEFUL_SHUTDOWN_SECS",
            config.server.graceful_shutdown_secs.to_string(),
        ),
        Field::new("logging.level", "EVENTCREW_LOGGING_LEVEL", &config.logging.level),
        Field::new(
            "logging.format",
            "EVENTCREW_LOGGING_FORMAT",
            format!("{:?}", config.logging.format),
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
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var(env_key).map(|value| !value.trim().is_empty()).unwrap_or(false) {
        return format!("env ({env_key})");
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

/// Keeps a short vendor prefix such as `sk-` so operators can tell keys apart.
fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    match trimmed.split_once('-') {
        Some((prefix, _)) if prefix.len() <= 4 => format!("{prefix}-***"),
        _ => "<redacted>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, redact_secret};

    #[test]
    fn secrets_keep_only_a_short_prefix() {
        assert_eq!(redact_secret("sk-abcdef123"), "sk-***");
        assert_eq!(redact_secret("plainsecretvalue"), "<redacted>");
        assert_eq!(redact_secret("longprefix-secret"), "<redacted>");
        assert_eq!(redact_secret("  "), "<empty>");
    }

    #[test]
    fn dotted_paths_resolve_into_tables() {
        let doc: Value = "[llm]\nmodel = \"llama3.1\"\n".parse().expect("toml");
        assert!(contains_path(&doc, "llm.model"));
        assert!(!contains_path(&doc, "llm.api_key"));
        assert!(!contains_path(&doc, "server.port"));
    }
}
