use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub rest_base_url: String,
    pub hub_base_url: String,
    pub chat_hub_path: String,
    pub notification_hub_path: String,
    /// Ambient session credential, forwarded as a `Cookie` header.
    pub session_cookie: Option<String>,
    pub directory_refresh: Duration,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub server_timeout: Duration,
    pub reconnect_delays: Vec<Duration>,
    pub max_reconnect_attempts: Option<u32>,
    pub alert_ttl: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            rest_base_url: "http://127.0.0.1:5000/api".into(),
            hub_base_url: "http://127.0.0.1:5000".into(),
            chat_hub_path: "/chatHub".into(),
            notification_hub_path: "/notificationHub".into(),
            session_cookie: None,
            directory_refresh: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            send_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            reconnect_delays: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            max_reconnect_attempts: None,
            alert_ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    rest_base_url: Option<String>,
    hub_base_url: Option<String>,
    chat_hub_path: Option<String>,
    notification_hub_path: Option<String>,
    session_cookie: Option<String>,
    directory_refresh_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    send_timeout_secs: Option<u64>,
    keep_alive_secs: Option<u64>,
    server_timeout_secs: Option<u64>,
    reconnect_delays_ms: Option<Vec<u64>>,
    max_reconnect_attempts: Option<u32>,
    alert_ttl_secs: Option<u64>,
}

/// Defaults, overlaid by `client.toml` in the working directory, overlaid by
/// `APP__*` environment variables.
pub fn load_settings() -> anyhow::Result<ClientSettings> {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE))
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?;
    }

    apply_env(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

fn apply_file(settings: &mut ClientSettings, raw: &str) -> anyhow::Result<()> {
    let file: FileSettings = toml::from_str(raw)?;

    if let Some(v) = file.rest_base_url {
        settings.rest_base_url = v;
    }
    if let Some(v) = file.hub_base_url {
        settings.hub_base_url = v;
    }
    if let Some(v) = file.chat_hub_path {
        settings.chat_hub_path = v;
    }
    if let Some(v) = file.notification_hub_path {
        settings.notification_hub_path = v;
    }
    if file.session_cookie.is_some() {
        settings.session_cookie = file.session_cookie;
    }
    if let Some(v) = file.directory_refresh_secs {
        settings.directory_refresh = Duration::from_secs(v);
    }
    if let Some(v) = file.connect_timeout_secs {
        settings.connect_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file.send_timeout_secs {
        settings.send_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file.keep_alive_secs {
        settings.keep_alive_interval = Duration::from_secs(v);
    }
    if let Some(v) = file.server_timeout_secs {
        settings.server_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file.reconnect_delays_ms {
        settings.reconnect_delays = v.into_iter().map(Duration::from_millis).collect();
    }
    if file.max_reconnect_attempts.is_some() {
        settings.max_reconnect_attempts = file.max_reconnect_attempts;
    }
    if let Some(v) = file.alert_ttl_secs {
        settings.alert_ttl = Duration::from_secs(v);
    }

    Ok(())
}

fn apply_env(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = lookup("APP__REST_BASE_URL") {
        settings.rest_base_url = v;
    }
    if let Some(v) = lookup("APP__HUB_BASE_URL") {
        settings.hub_base_url = v;
    }
    if let Some(v) = lookup("APP__CHAT_HUB_PATH") {
        settings.chat_hub_path = v;
    }
    if let Some(v) = lookup("APP__NOTIFICATION_HUB_PATH") {
        settings.notification_hub_path = v;
    }
    if let Some(v) = lookup("APP__SESSION_COOKIE") {
        settings.session_cookie = Some(v);
    }
    if let Some(v) = lookup("APP__DIRECTORY_REFRESH_SECS") {
        settings.directory_refresh = Duration::from_secs(parse_number(&v, "APP__DIRECTORY_REFRESH_SECS")?);
    }
    if let Some(v) = lookup("APP__CONNECT_TIMEOUT_SECS") {
        settings.connect_timeout = Duration::from_secs(parse_number(&v, "APP__CONNECT_TIMEOUT_SECS")?);
    }
    if let Some(v) = lookup("APP__SEND_TIMEOUT_SECS") {
        settings.send_timeout = Duration::from_secs(parse_number(&v, "APP__SEND_TIMEOUT_SECS")?);
    }
    if let Some(v) = lookup("APP__KEEP_ALIVE_SECS") {
        settings.keep_alive_interval = Duration::from_secs(parse_number(&v, "APP__KEEP_ALIVE_SECS")?);
    }
    if let Some(v) = lookup("APP__SERVER_TIMEOUT_SECS") {
        settings.server_timeout = Duration::from_secs(parse_number(&v, "APP__SERVER_TIMEOUT_SECS")?);
    }
    if let Some(v) = lookup("APP__RECONNECT_DELAYS_MS") {
        // Comma separated, e.g. "0,2000,10000".
        settings.reconnect_delays = v
            .split(',')
            .map(|delay| parse_number(delay, "APP__RECONNECT_DELAYS_MS").map(Duration::from_millis))
            .collect::<anyhow::Result<_>>()?;
    }
    if let Some(v) = lookup("APP__ALERT_TTL_SECS") {
        settings.alert_ttl = Duration::from_secs(parse_number(&v, "APP__ALERT_TTL_SECS")?);
    }
    if let Some(v) = lookup("APP__MAX_RECONNECT_ATTEMPTS") {
        settings.max_reconnect_attempts = Some(parse_number(&v, "APP__MAX_RECONNECT_ATTEMPTS")?);
    }

    Ok(())
}

fn parse_number<T>(raw: &str, key: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{key} must be a non-negative integer in range, got '{raw}'"))
}

impl ClientSettings {
    pub fn chat_hub_url(&self) -> anyhow::Result<Url> {
        hub_url(&self.hub_base_url, &self.chat_hub_path)
    }

    pub fn notification_hub_url(&self) -> anyhow::Result<Url> {
        hub_url(&self.hub_base_url, &self.notification_hub_path)
    }

    pub fn rest_url(&self, path: &str) -> String {
        join_path(&self.rest_base_url, path)
    }
}

fn join_path(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Maps the http(s) hub base onto its websocket scheme and appends the hub path.
pub fn hub_url(base: &str, path: &str) -> anyhow::Result<Url> {
    let base = base.trim();
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(anyhow!(
            "hub base url must start with http://, https://, ws:// or wss://, got '{base}'"
        ));
    };

    Url::parse(&join_path(&ws_base, path))
        .with_context(|| format!("invalid hub url for base '{base}' and path '{path}'"))
}
