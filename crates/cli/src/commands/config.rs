use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use leaveflow_core::config::{AppConfig, LoadOptions, LogFormat};
use serde::Serialize;
use toml::Value;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct ConfigEntry {
    key: &'static str,
    value: String,
    source: String,
}

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key: &'static str, env_key: &'static str| {
        field_source(key, env_key, config_file_doc.as_ref(), config_file_path.as_deref())
    };
    let entry = |key: &'static str, env_key: &'static str, value: String| ConfigEntry {
        key,
        value,
        source: source(key, env_key),
    };

    let entries = vec![
        entry("database.url", "LEAVEFLOW_DATABASE_URL", redact_url(&config.database.url)),
        entry(
            "database.max_connections",
            "LEAVEFLOW_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections.to_string(),
        ),
        entry(
            "database.timeout_secs",
            "LEAVEFLOW_DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs.to_string(),
        ),
        entry(
            "approvals.fan_out",
            "LEAVEFLOW_APPROVALS_FAN_OUT",
            config.approvals.fan_out.as_str().to_string(),
        ),
        entry(
            "approvals.admin_override",
            "LEAVEFLOW_APPROVALS_ADMIN_OVERRIDE",
            config.approvals.admin_override.to_string(),
        ),
        entry(
            "approvals.escalation_contacts",
            "LEAVEFLOW_APPROVALS_ESCALATION_CONTACTS",
            config.approvals.escalation_contacts.join(","),
        ),
        entry(
            "notifications.enabled",
            "LEAVEFLOW_NOTIFICATIONS_ENABLED",
            config.notifications.enabled.to_string(),
        ),
        entry(
            "notifications.watchers_enabled",
            "LEAVEFLOW_NOTIFICATIONS_WATCHERS_ENABLED",
            config.notifications.watchers_enabled.to_string(),
        ),
        entry("logging.level", "LEAVEFLOW_LOGGING_LEVEL", config.logging.level.clone()),
        entry(
            "logging.format",
            "LEAVEFLOW_LOGGING_FORMAT",
            log_format_name(config.logging.format).to_string(),
        ),
    ];

    CommandResult::success_with_data(
        "config",
        "effective config (source precedence: env > file > default)",
        &entries,
    )
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    let root = PathBuf::from("leaveflow.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/leaveflow.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
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
    if env::var_os(env_key).is_some() {
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

fn log_format_name(format: LogFormat) -> &'static str {
    match format {
        LogFormat::Compact => "compact",
        LogFormat::Pretty => "pretty",
        LogFormat::Json => "json",
    }
}

/// Hides credentials embedded in a connection url.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{contains_path, redact_url};

    #[test]
    fn sqlite_urls_are_shown_verbatim() {
        assert_eq!(redact_url("sqlite://leaveflow.db"), "sqlite://leaveflow.db");
        assert_eq!(redact_url("sqlite::memory:"), "sqlite::memory:");
    }

    #[test]
    fn credentials_are_redacted() {
        assert_eq!(redact_url("postgres://svc:hunter2@db:5432/leave"), "postgres://***@db:5432/leave");
    }

    #[test]
    fn nested_keys_are_found() {
        let doc: toml::Value = "[approvals]\nfan_out = \"all\"\n".parse().expect("toml");
        assert!(contains_path(&doc, "approvals.fan_out"));
        assert!(!contains_path(&doc, "approvals.admin_override"));
    }
}
