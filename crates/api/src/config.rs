use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use domain::models::CodeBounds;
use domain::services::EngineConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    pub invitations: InvitationsConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl From<&DatabaseConfig> for persistence::db::DatabaseConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            url: config.url.clone(),
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            connect_timeout_secs: config.connect_timeout_secs,
            idle_timeout_secs: config.idle_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Redemption requests allowed per client per minute. 0 disables limiting.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

/// Redemption engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct InvitationsConfig {
    #[serde(default = "default_min_code_length")]
    pub min_code_length: usize,

    #[serde(default = "default_max_code_length")]
    pub max_code_length: usize,

    /// Lifetime of the session between the two phases of a hybrid redemption.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Upper bound on a single backend provisioning call.
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_secs: u64,

    /// How often expired hybrid sessions are purged.
    #[serde(default = "default_session_cleanup_interval")]
    pub session_cleanup_interval_secs: u64,

    /// How long a redemption waits for another redemption of the same code.
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,
}

impl InvitationsConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            code_bounds: CodeBounds {
                min: self.min_code_length,
                max: self.max_code_length,
            },
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            provision_timeout: Duration::from_secs(self.provision_timeout_secs),
        }
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }
}

/// Settings shared by the media server HTTP clients.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendsConfig {
    #[serde(default = "default_backend_http_timeout")]
    pub http_timeout_secs: u64,

    /// Product name reported to delegated-token providers.
    #[serde(default = "default_client_product")]
    pub client_product: String,

    /// Stable client identifier reported to delegated-token providers.
    #[serde(default = "default_client_identifier")]
    pub client_identifier: String,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_backend_http_timeout(),
            client_product: default_client_product(),
            client_identifier: default_client_identifier(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    120
}
fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    2
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_rate_limit() -> u32 {
    30
}
fn default_min_code_length() -> usize {
    6
}
fn default_max_code_length() -> usize {
    10
}
fn default_session_ttl() -> u64 {
    600
}
fn default_provision_timeout() -> u64 {
    30
}
fn default_session_cleanup_interval() -> u64 {
    300
}
fn default_lock_wait() -> u64 {
    60
}
fn default_backend_http_timeout() -> u64 {
    20
}
fn default_client_product() -> String {
    "Invitation Service".to_string()
}
fn default_client_identifier() -> String {
    "invitation-service".to_string()
}

/// Configuration validation error
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Loading order (later sources override earlier):
    /// 1. config/default.toml - base configuration with defaults
    /// 2. config/local.toml - local overrides (optional, not in git)
    /// 3. Environment variables with INV__ prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("INV")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("security.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Self = config.try_deserialize()?;
        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    /// Build a configuration from embedded defaults plus overrides, without
    /// touching the file system. Validation is skipped.
    pub fn load_for_test(overrides: &[(&str, &str)]) -> Result<Self, config::ConfigError> {
        let defaults = r#"
            [server]
            host = "127.0.0.1"
            port = 8080
            request_timeout_secs = 120

            [database]
            url = ""
            max_connections = 20
            min_connections = 2
            connect_timeout_secs = 10
            idle_timeout_secs = 600

            [logging]
            level = "info"
            format = "json"

            [security]
            cors_origins = []
            rate_limit_per_minute = 30

            [invitations]
            min_code_length = 6
            max_code_length = 10
            session_ttl_secs = 600
            provision_timeout_secs = 30
            session_cleanup_interval_secs = 300
            lock_wait_secs = 60

            [backends]
            http_timeout_secs = 20
        "#;

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(defaults, config::FileFormat::Toml));

        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "INV__DATABASE__URL environment variable must be set".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "Server port cannot be 0".to_string(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigValidationError::InvalidValue(
                "min_connections cannot exceed max_connections".to_string(),
            ));
        }

        let invitations = &self.invitations;
        if invitations.min_code_length == 0
            || invitations.min_code_length > invitations.max_code_length
        {
            return Err(ConfigValidationError::InvalidValue(
                "min_code_length must be between 1 and max_code_length".to_string(),
            ));
        }

        if invitations.session_ttl_secs == 0 || invitations.provision_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "session_ttl_secs and provision_timeout_secs must be positive".to_string(),
            ));
        }

        if invitations.lock_wait_secs == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "lock_wait_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigValidationError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| ConfigValidationError::InvalidValue(format!("server address: {}", e)))
    }
}
