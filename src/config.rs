use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "/config/stormon.yaml";

/// Operator slider bounds for the trailing window.
pub const MIN_DAYS_BACK: u32 = 7;
pub const MAX_DAYS_BACK: u32 = 90;

/// Top-level configuration for the stormon service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub dashboard: DashboardOptions,
    #[serde(default)]
    pub sections: Sections,
    #[serde(default)]
    pub sample_intervals: SampleIntervals,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub timeouts: StatementTimeouts,
}

/// Connection settings for the warehouse SQL API.
#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub warehouse: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "WarehouseConfig::default_database")]
    pub database: String,
    #[serde(default = "WarehouseConfig::default_schema")]
    pub schema: String,
    /// Overrides `https://{account}.snowflakecomputing.com` (private link, proxies).
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token_type: TokenType,
    /// Populated from SNOWFLAKE_TOKEN only.
    #[serde(default)]
    pub token: SecretToken,
}

impl WarehouseConfig {
    fn default_database() -> String {
        "SNOWFLAKE".to_string()
    }

    fn default_schema() -> String {
        "ACCOUNT_USAGE".to_string()
    }

    pub fn endpoint(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "https://{}.snowflakecomputing.com",
                self.account.to_ascii_lowercase().replace('_', "-")
            ),
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            warehouse: None,
            role: None,
            user: None,
            database: Self::default_database(),
            schema: Self::default_schema(),
            base_url: None,
            token_type: TokenType::default(),
            token: SecretToken::default(),
        }
    }
}

/// How the bearer token was issued; sent as X-Snowflake-Authorization-Token-Type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    #[default]
    ProgrammaticAccessToken,
    Oauth,
    KeypairJwt,
}

impl TokenType {
    pub fn header_value(self) -> &'static str {
        match self {
            TokenType::ProgrammaticAccessToken => "PROGRAMMATIC_ACCESS_TOKEN",
            TokenType::Oauth => "OAUTH",
            TokenType::KeypairJwt => "KEYPAIR_JWT",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "programmatic_access_token" | "pat" => Some(TokenType::ProgrammaticAccessToken),
            "oauth" => Some(TokenType::Oauth),
            "keypair_jwt" | "jwt" => Some(TokenType::KeypairJwt),
            _ => None,
        }
    }
}

/// Access token with a redacted Debug representation.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("SecretToken(<unset>)")
        } else {
            f.write_str("SecretToken(<redacted>)")
        }
    }
}

/// What the dashboard renders: window, ranking depth and managed-function inputs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DashboardOptions {
    #[serde(default = "DashboardOptions::default_days_back")]
    pub days_back: u32,
    #[serde(default = "DashboardOptions::default_top_n")]
    pub top_n: usize,
    #[serde(default = "DashboardOptions::default_forecast_horizon_days")]
    pub forecast_horizon_days: u32,
    #[serde(default = "DashboardOptions::default_summary_window_days")]
    pub summary_window_days: u32,
    #[serde(default = "DashboardOptions::default_summary_model")]
    pub summary_model: String,
}

impl DashboardOptions {
    const fn default_days_back() -> u32 {
        30
    }

    const fn default_top_n() -> usize {
        5
    }

    const fn default_forecast_horizon_days() -> u32 {
        7
    }

    const fn default_summary_window_days() -> u32 {
        7
    }

    fn default_summary_model() -> String {
        "mistral-large2".to_string()
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_DAYS_BACK..=MAX_DAYS_BACK).contains(&self.days_back) {
            bail!(
                "dashboard.days_back must be between {MIN_DAYS_BACK} and {MAX_DAYS_BACK} (got {})",
                self.days_back
            );
        }
        if self.top_n == 0 {
            bail!("dashboard.top_n must be at least 1");
        }
        if self.forecast_horizon_days == 0 {
            bail!("dashboard.forecast_horizon_days must be at least 1");
        }
        if self.summary_window_days == 0 {
            bail!("dashboard.summary_window_days must be at least 1");
        }
        if self.summary_model.trim().is_empty() {
            bail!("dashboard.summary_model must not be empty");
        }
        Ok(())
    }
}

impl Default for DashboardOptions {
    fn default() -> Self {
        Self {
            days_back: Self::default_days_back(),
            top_n: Self::default_top_n(),
            forecast_horizon_days: Self::default_forecast_horizon_days(),
            summary_window_days: Self::default_summary_window_days(),
            summary_model: Self::default_summary_model(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Optional dashboard stages, each gated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Sections {
    #[serde(default = "default_true")]
    pub anomaly_detection: bool,
    #[serde(default = "default_true")]
    pub forecast: bool,
    #[serde(default = "default_true")]
    pub summary: bool,
}

impl Sections {
    pub const NONE: Sections = Sections {
        anomaly_detection: false,
        forecast: false,
        summary: false,
    };
}

impl Default for Sections {
    fn default() -> Self {
        Self {
            anomaly_detection: true,
            forecast: true,
            summary: true,
        }
    }
}

/// Loop schedule configuration (with friendly duration parsing).
#[derive(Debug, Clone, Deserialize)]
pub struct SampleIntervals {
    /// Background dashboard refresh.
    #[serde(default = "SampleIntervals::default_refresh", with = "humantime_serde")]
    pub refresh: Duration,
}

impl SampleIntervals {
    const fn default_refresh() -> Duration {
        Duration::from_secs(900)
    }
}

impl Default for SampleIntervals {
    fn default() -> Self {
        Self {
            refresh: Self::default_refresh(),
        }
    }
}

/// HTTP listener configuration (bind address).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
    #[serde(default = "HttpConfig::default_static_dir")]
    pub static_dir: String,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0:8282".to_string()
    }

    fn default_static_dir() -> String {
        "frontend/dist".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
            static_dir: Self::default_static_dir(),
        }
    }
}

/// Statement execution and HTTP timeouts for the SQL API.
#[derive(Debug, Clone, Deserialize)]
pub struct StatementTimeouts {
    #[serde(
        default = "StatementTimeouts::default_statement_timeout",
        with = "humantime_serde"
    )]
    pub statement_timeout: Duration,
    #[serde(
        default = "StatementTimeouts::default_request_timeout",
        with = "humantime_serde"
    )]
    pub request_timeout: Duration,
    #[serde(
        default = "StatementTimeouts::default_poll_interval",
        with = "humantime_serde"
    )]
    pub poll_interval: Duration,
    #[serde(
        default = "StatementTimeouts::default_max_poll_wait",
        with = "humantime_serde"
    )]
    pub max_poll_wait: Duration,
}

impl StatementTimeouts {
    const fn default_statement_timeout() -> Duration {
        Duration::from_secs(60)
    }

    const fn default_request_timeout() -> Duration {
        Duration::from_secs(30)
    }

    const fn default_poll_interval() -> Duration {
        Duration::from_millis(500)
    }

    const fn default_max_poll_wait() -> Duration {
        Duration::from_secs(300)
    }
}

impl Default for StatementTimeouts {
    fn default() -> Self {
        Self {
            statement_timeout: Self::default_statement_timeout(),
            request_timeout: Self::default_request_timeout(),
            poll_interval: Self::default_poll_interval(),
            max_poll_wait: Self::default_max_poll_wait(),
        }
    }
}

/// Load configuration from YAML disk file, falling back to defaults + env overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("STORMON_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config, |key| env::var(key).ok())?;
    ensure_required_secrets(&config)?;
    config.dashboard.validate()?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => parse_yaml(&raw)
            .with_context(|| format!("failed to parse YAML config at {}", path.display()))
            .map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

pub fn parse_yaml(raw: &str) -> Result<AppConfig> {
    Ok(serde_yaml::from_str(raw)?)
}

pub fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    if !config.warehouse.token.is_empty() {
        bail!(
            "Remove `warehouse.token` from stormon YAML config; set the access token via the SNOWFLAKE_TOKEN environment variable (see .env.sample)."
        );
    }
    Ok(())
}

/// Apply SNOWFLAKE_* overrides; `lookup` abstracts the environment for tests.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(account) = non_empty("SNOWFLAKE_ACCOUNT") {
        config.warehouse.account = account;
    }
    if let Some(warehouse) = non_empty("SNOWFLAKE_WAREHOUSE") {
        config.warehouse.warehouse = Some(warehouse);
    }
    if let Some(role) = non_empty("SNOWFLAKE_ROLE") {
        config.warehouse.role = Some(role);
    }
    if let Some(user) = non_empty("SNOWFLAKE_USER") {
        config.warehouse.user = Some(user);
    }
    if let Some(raw) = non_empty("SNOWFLAKE_TOKEN_TYPE") {
        config.warehouse.token_type = TokenType::parse(&raw).with_context(|| {
            format!(
                "unsupported SNOWFLAKE_TOKEN_TYPE {raw:?}; expected programmatic_access_token, oauth or keypair_jwt"
            )
        })?;
    }

    if let Some(token) = lookup("SNOWFLAKE_TOKEN") {
        if token.trim().is_empty() {
            bail!(
                "Environment variable SNOWFLAKE_TOKEN is set but empty; populate it in your .env file."
            );
        }
        config.warehouse.token = SecretToken::new(token.trim());
    }

    Ok(())
}

pub fn ensure_required_secrets(config: &AppConfig) -> Result<()> {
    if config.warehouse.account.trim().is_empty() {
        bail!(
            "Missing warehouse account. Set SNOWFLAKE_ACCOUNT or `warehouse.account` in the YAML config."
        );
    }
    if config.warehouse.token.is_empty() {
        bail!(
            "Missing access token. Set the SNOWFLAKE_TOKEN environment variable (see .env.sample). Secrets must not be stored in YAML."
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_operator_dashboard() {
        let cfg = parse_yaml("{}").expect("parse");
        assert_eq!(cfg.dashboard.days_back, 30);
        assert_eq!(cfg.dashboard.top_n, 5);
        assert_eq!(cfg.dashboard.forecast_horizon_days, 7);
        assert_eq!(cfg.sections, Sections::default());
        assert!(cfg.sections.anomaly_detection && cfg.sections.forecast && cfg.sections.summary);
        assert_eq!(cfg.warehouse.database, "SNOWFLAKE");
        assert_eq!(cfg.warehouse.schema, "ACCOUNT_USAGE");
        assert_eq!(cfg.sample_intervals.refresh, Duration::from_secs(900));
    }

    #[test]
    fn yaml_sections_and_durations_parse() {
        let cfg = parse_yaml(
            r#"
warehouse:
  account: xy12345.eu-west-1
  warehouse: COMPUTE_WH
dashboard:
  days_back: 14
  top_n: 3
sections:
  forecast: false
sample_intervals:
  refresh: 5m
timeouts:
  poll_interval: 250ms
"#,
        )
        .expect("parse");
        assert_eq!(cfg.warehouse.account, "xy12345.eu-west-1");
        assert_eq!(cfg.dashboard.days_back, 14);
        assert!(!cfg.sections.forecast);
        assert!(cfg.sections.summary);
        assert_eq!(cfg.sample_intervals.refresh, Duration::from_secs(300));
        assert_eq!(cfg.timeouts.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn token_in_yaml_is_refused() {
        let cfg = parse_yaml("warehouse:\n  token: abc\n").expect("parse");
        assert!(enforce_yaml_policy(&cfg).is_err());
    }

    #[test]
    fn env_overrides_fill_connection_and_secret() {
        let mut cfg = AppConfig::default();
        apply_env_overrides(
            &mut cfg,
            env_of(&[
                ("SNOWFLAKE_ACCOUNT", "my_org-acct"),
                ("SNOWFLAKE_WAREHOUSE", "WH"),
                ("SNOWFLAKE_TOKEN", "secret"),
                ("SNOWFLAKE_TOKEN_TYPE", "oauth"),
            ]),
        )
        .expect("overrides");
        assert_eq!(cfg.warehouse.warehouse.as_deref(), Some("WH"));
        assert_eq!(cfg.warehouse.token.expose(), "secret");
        assert_eq!(cfg.warehouse.token_type, TokenType::Oauth);
        assert_eq!(
            cfg.warehouse.endpoint(),
            "https://my-org-acct.snowflakecomputing.com"
        );
        ensure_required_secrets(&cfg).expect("secrets present");
        assert!(!format!("{:?}", cfg.warehouse).contains("secret\""));
    }

    #[test]
    fn empty_token_env_is_an_error() {
        let mut cfg = AppConfig::default();
        let err = apply_env_overrides(&mut cfg, env_of(&[("SNOWFLAKE_TOKEN", "  ")]));
        assert!(err.is_err());
    }

    #[test]
    fn missing_secrets_fail() {
        let cfg = AppConfig::default();
        assert!(ensure_required_secrets(&cfg).is_err());
    }

    #[test]
    fn days_back_outside_slider_range_is_rejected() {
        let mut options = DashboardOptions::default();
        options.days_back = 6;
        assert!(options.validate().is_err());
        options.days_back = 91;
        assert!(options.validate().is_err());
        options.days_back = 90;
        assert!(options.validate().is_ok());
        options.top_n = 0;
        assert!(options.validate().is_err());
    }
}
