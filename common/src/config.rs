//! Configuration – an optional `KEY=VALUE` file overlaid by the process
//! environment.
//!
//! The file format matches the shell-style `.conf` files the agent is
//! usually deployed with; every key can also be set (or overridden) as an
//! environment variable, which is how container deployments configure it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use tracing::info;

use crate::error::ConfigError;

/// Device address and login.  Immutable for the process lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Base URL, e.g. `http://192.168.1.108`, without a trailing slash.
    pub host: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Upper bound for the hour-valued settings (one leap year).
pub const MAX_WINDOW_HOURS: i64 = 24 * 366;

/// Fully resolved agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── device ───────────────────────────────────────────────────────
    pub credentials: Credentials,
    /// Name used as the prefix of alarm messages.
    pub device_name: String,
    /// Zone the device clock is synchronised to and searches are expressed in.
    pub timezone: Tz,

    // ── notifications ────────────────────────────────────────────────
    pub telegram_bot_key: String,
    pub telegram_chat_id: String,

    // ── ledger ───────────────────────────────────────────────────────
    pub db_path: PathBuf,
    pub ledger_retention_hours: i64,

    // ── recordings ───────────────────────────────────────────────────
    pub recording_channel: i64,
    pub recording_dir: String,
    pub download_dir: PathBuf,
    pub search_half_window_hours: i64,

    // ── alarms ───────────────────────────────────────────────────────
    pub alarm_codes: Vec<String>,

    // ── timing ───────────────────────────────────────────────────────
    pub keepalive_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub alarm_backoff_secs: u64,
    pub http_timeout_secs: u64,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/nvr-agent/agent.conf"
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn alarm_backoff(&self) -> Duration {
        Duration::from_secs(self.alarm_backoff_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn search_half_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.search_half_window_hours)
    }

    pub fn ledger_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ledger_retention_hours)
    }
}

/// Load the configuration.
///
/// `path` is an explicitly requested file and must be readable.  Without
/// one, the default path is used if it exists.  Environment variables
/// override file values in both cases.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let file_map = match path {
        Some(p) => read_conf(p)?,
        None => {
            let default = Path::new(Config::default_path());
            if default.exists() {
                read_conf(default)?
            } else {
                HashMap::new()
            }
        }
    };

    resolve(&file_map, &|key| std::env::var(key).ok())
}

fn read_conf(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    info!("Loaded config from {}", path.display());
    Ok(parse_conf(&text))
}

/// Build a [`Config`] from file values and an environment lookup.  Empty
/// values count as unset.
fn resolve(
    file: &HashMap<String, String>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let get = |key: &str| -> Option<String> {
        env(key)
            .or_else(|| file.get(key).cloned())
            .filter(|v| !v.trim().is_empty())
    };
    let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
    let number = |key: &'static str, default: i64| -> Result<i64, ConfigError> {
        match get(key) {
            Some(v) => {
                let parsed: Result<i64, _> = v.trim().parse();
                parsed.map_err(|_| ConfigError::Invalid { key, value: v })
            }
            None => Ok(default),
        }
    };
    let seconds = |key: &'static str, default: i64| -> Result<u64, ConfigError> {
        let n = number(key, default)?;
        if n <= 0 {
            return Err(ConfigError::Invalid {
                key,
                value: n.to_string(),
            });
        }
        Ok(n as u64)
    };

    let hours = |key: &'static str, default: i64| -> Result<i64, ConfigError> {
        let n = seconds(key, default)? as i64;
        if n > MAX_WINDOW_HOURS {
            return Err(ConfigError::Invalid {
                key,
                value: n.to_string(),
            });
        }
        Ok(n)
    };

    let host = required("AMCREST_BASEURL")?.trim_end_matches('/').to_string();
    let timezone_name = get("AMCREST_TIMEZONE").unwrap_or_else(|| "UTC".into());
    let timezone: Tz = timezone_name.parse().map_err(|_| ConfigError::Invalid {
        key: "AMCREST_TIMEZONE",
        value: timezone_name.clone(),
    })?;

    let alarm_codes: Vec<String> = get("ALARM_CODES")
        .unwrap_or_else(|| "VideoMotion".into())
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    Ok(Config {
        credentials: Credentials {
            host,
            username: get("AMCREST_USER").unwrap_or_else(|| "admin".into()),
            password: required("AMCREST_PASSWORD")?,
        },
        device_name: get("AMCREST_NAME").unwrap_or_else(|| "Camera".into()),
        timezone,

        telegram_bot_key: required("TELEGRAM_BOT_KEY")?,
        telegram_chat_id: required("TELEGRAM_CHAT_ID")?,

        db_path: PathBuf::from(required("AMCREST_DB_PATH")?),
        ledger_retention_hours: hours("LEDGER_RETENTION_HOURS", 24)?,

        recording_channel: number("RECORDING_CHANNEL", 0)?,
        recording_dir: get("RECORDING_DIR").unwrap_or_else(|| "/mnt/sd".into()),
        download_dir: get("DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir),
        search_half_window_hours: hours("SEARCH_HALF_WINDOW_HOURS", 12)?,

        alarm_codes,

        keepalive_interval_secs: seconds("KEEPALIVE_INTERVAL_SECS", 55)?,
        poll_interval_secs: seconds("POLL_INTERVAL_SECS", 60)?,
        alarm_backoff_secs: seconds("ALARM_BACKOFF_SECS", 5)?,
        http_timeout_secs: seconds("HTTP_TIMEOUT_SECS", 30)?,
    })
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> HashMap<String, String> {
        parse_conf(
            r#"
AMCREST_BASEURL=http://192.168.1.108/
AMCREST_PASSWORD="hunter2"
AMCREST_DB_PATH=/data/processed.db
TELEGRAM_BOT_KEY=bot123:abc
TELEGRAM_CHAT_ID=-10042
"#,
        )
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_conf() {
        let text = r#"
# comment
AMCREST_NAME="Front door"
AMCREST_TIMEZONE=Europe/Stockholm
"#;
        let map = parse_conf(text);
        assert_eq!(map["AMCREST_NAME"], "Front door");
        assert_eq!(map["AMCREST_TIMEZONE"], "Europe/Stockholm");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_defaults() {
        let config = resolve(&minimal(), &no_env).unwrap();
        assert_eq!(config.credentials.host, "http://192.168.1.108");
        assert_eq!(config.credentials.username, "admin");
        assert_eq!(config.device_name, "Camera");
        assert_eq!(config.timezone, chrono_tz::UTC);
        assert_eq!(config.keepalive_interval_secs, 55);
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.alarm_codes, vec!["VideoMotion".to_string()]);
        assert_eq!(config.ledger_retention(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_env_overrides_file() {
        let env = |key: &str| match key {
            "AMCREST_USER" => Some("viewer".to_string()),
            "AMCREST_TIMEZONE" => Some("America/New_York".to_string()),
            _ => None,
        };
        let config = resolve(&minimal(), &env).unwrap();
        assert_eq!(config.credentials.username, "viewer");
        assert_eq!(config.timezone, chrono_tz::America::New_York);
    }

    #[test]
    fn test_missing_required_key() {
        let mut map = minimal();
        map.remove("AMCREST_PASSWORD");
        let err = resolve(&map, &no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("AMCREST_PASSWORD")));
    }

    #[test]
    fn test_invalid_values() {
        let mut map = minimal();
        map.insert("AMCREST_TIMEZONE".into(), "Mars/Olympus".into());
        assert!(matches!(
            resolve(&map, &no_env),
            Err(ConfigError::Invalid { key: "AMCREST_TIMEZONE", .. })
        ));

        let mut map = minimal();
        map.insert("POLL_INTERVAL_SECS".into(), "0".into());
        assert!(resolve(&map, &no_env).is_err());
    }

    #[test]
    fn test_hour_settings_are_bounded() {
        let mut map = minimal();
        map.insert("SEARCH_HALF_WINDOW_HOURS".into(), "9223372036854775807".into());
        assert!(matches!(
            resolve(&map, &no_env),
            Err(ConfigError::Invalid { key: "SEARCH_HALF_WINDOW_HOURS", .. })
        ));

        let mut map = minimal();
        map.insert("LEDGER_RETENTION_HOURS".into(), (MAX_WINDOW_HOURS + 1).to_string());
        assert!(matches!(
            resolve(&map, &no_env),
            Err(ConfigError::Invalid { key: "LEDGER_RETENTION_HOURS", .. })
        ));

        let mut map = minimal();
        map.insert("LEDGER_RETENTION_HOURS".into(), MAX_WINDOW_HOURS.to_string());
        let config = resolve(&map, &no_env).unwrap();
        assert_eq!(config.ledger_retention(), chrono::Duration::hours(MAX_WINDOW_HOURS));
    }

    #[test]
    fn test_password_is_redacted() {
        let config = resolve(&minimal(), &no_env).unwrap();
        let dbg = format!("{:?}", config.credentials);
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn test_unreadable_explicit_path() {
        let err = load(Some(Path::new("/nonexistent/agent.conf"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
