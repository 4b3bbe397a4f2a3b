use std::path::PathBuf;
use std::time::Duration;

use crate::reconcile::DEFAULT_SYNC_WINDOW_DAYS;

/// Microsoft Graph application credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendGridSettings {
    pub api_key: String,
    pub from_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub sync_interval: Duration,
    pub sync_window_days: u32,
    /// Compact the WAL after this many appends.
    pub compact_threshold: u64,
    pub internal_domains: Vec<String>,
    /// Account promoted to administrator at startup.
    pub admin_email: Option<String>,
    /// `None` runs without a calendar provider.
    pub graph: Option<GraphCredentials>,
    /// `None` logs notifications instead of mailing them.
    pub sendgrid: Option<SendGridSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    /// Only some of a group of variables that must be set together.
    Incomplete { group: &'static str, missing: &'static str },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid {var}: {value:?}"),
            ConfigError::Incomplete { group, missing } => {
                write!(f, "{group} configuration incomplete: {missing} is not set")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let sync_interval_secs: u64 = parse(&get, "ROOMSYNC_SYNC_INTERVAL_SECS")?.unwrap_or(300);
        if sync_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "ROOMSYNC_SYNC_INTERVAL_SECS",
                value: "0".into(),
            });
        }

        Ok(Config {
            data_dir: get("ROOMSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            metrics_port: parse(&get, "ROOMSYNC_METRICS_PORT")?,
            sync_interval: Duration::from_secs(sync_interval_secs),
            sync_window_days: parse(&get, "ROOMSYNC_SYNC_WINDOW_DAYS")?
                .unwrap_or(DEFAULT_SYNC_WINDOW_DAYS),
            compact_threshold: parse(&get, "ROOMSYNC_COMPACT_THRESHOLD")?.unwrap_or(1000),
            internal_domains: get("ROOMSYNC_INTERNAL_DOMAINS")
                .map(|v| {
                    v.split(',')
                        .map(|d| d.trim().to_ascii_lowercase())
                        .filter(|d| !d.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            admin_email: get("ROOMSYNC_ADMIN_EMAIL"),
            graph: graph_credentials(&get)?,
            sendgrid: sendgrid_settings(&get)?,
        })
    }
}

fn parse<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn graph_credentials(
    get: &impl Fn(&str) -> Option<String>,
) -> Result<Option<GraphCredentials>, ConfigError> {
    let tenant_id = get("AZURE_TENANT_ID");
    let client_id = get("AZURE_CLIENT_ID");
    let client_secret = get("AZURE_CLIENT_SECRET");
    match (tenant_id, client_id, client_secret) {
        (None, None, None) => Ok(None),
        (Some(tenant_id), Some(client_id), Some(client_secret)) => Ok(Some(GraphCredentials {
            tenant_id,
            client_id,
            client_secret,
        })),
        (tenant_id, client_id, _) => Err(ConfigError::Incomplete {
            group: "Azure",
            missing: if tenant_id.is_none() {
                "AZURE_TENANT_ID"
            } else if client_id.is_none() {
                "AZURE_CLIENT_ID"
            } else {
                "AZURE_CLIENT_SECRET"
            },
        }),
    }
}

fn sendgrid_settings(
    get: &impl Fn(&str) -> Option<String>,
) -> Result<Option<SendGridSettings>, ConfigError> {
    let Some(api_key) = get("SENDGRID_API_KEY") else {
        return Ok(None);
    };
    let from_email = get("SENDGRID_FROM_EMAIL").ok_or(ConfigError::Incomplete {
        group: "SendGrid",
        missing: "SENDGRID_FROM_EMAIL",
    })?;
    Ok(Some(SendGridSettings { api_key, from_email }))
}
