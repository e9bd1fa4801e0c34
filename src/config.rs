use clap::{Args, Parser, Subcommand};

use crate::error::{ConfigError, FieldError};

// ============================================
// Environment variable name constants
// Shared between argument parsing and validation messages
// ============================================
pub mod env {
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const HEALTH_PORT: &str = "HEALTH_PORT";

    pub const PUBSUB_PROJECT_ID: &str = "PUBSUB_PROJECT_ID";
    pub const PUBSUB_TOPIC_ID: &str = "PUBSUB_TOPIC_ID";
    pub const PUBSUB_SUBSCRIPTION_ID: &str = "PUBSUB_SUBSCRIPTION_ID";
    pub const PUBSUB_EMULATOR_HOST: &str = "PUBSUB_EMULATOR_HOST";
    pub const PUBSUB_ENDPOINT: &str = "PUBSUB_ENDPOINT";
    pub const PUBSUB_ACCESS_TOKEN: &str = "PUBSUB_ACCESS_TOKEN";
    pub const PUBSUB_MAX_MESSAGES: &str = "PUBSUB_MAX_MESSAGES";
    pub const PUBSUB_MAX_OUTSTANDING: &str = "PUBSUB_MAX_OUTSTANDING";

    pub const DATABASE_TYPE: &str = "DATABASE_TYPE";
    pub const DATABASE_HOST: &str = "DATABASE_HOST";
    pub const DATABASE_USER: &str = "DATABASE_USER";
    pub const DATABASE_PASSWORD: &str = "DATABASE_PASSWORD";
    pub const DATABASE_PORT: &str = "DATABASE_PORT";
    pub const DATABASE_NAME: &str = "DATABASE_NAME";
    pub const DATABASE_MAX_CONNECTIONS: &str = "DATABASE_MAX_CONNECTIONS";
}

pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show version information
    Version,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "scan-processor",
    version,
    about = "Persist network scan results from a Pub/Sub subscription",
    long_about = "Consumes versioned scan messages from a Pub/Sub subscription and upserts them into a storage backend, keeping only the most recent scan per ip/port/service."
)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Log format: json or pretty
    #[arg(long, env = env::LOG_FORMAT, default_value = "json")]
    pub log_format: String,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = env::LOG_LEVEL, default_value = "info")]
    pub log_level: String,

    /// Health check server port (0 to disable)
    #[arg(long, env = env::HEALTH_PORT, default_value = "8080")]
    pub health_port: u16,

    #[command(flatten)]
    pub pubsub: PubsubConfig,

    #[command(flatten)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn from_args() -> Self {
        Config::parse()
    }
}

/// Broker identifiers and receive settings.
#[derive(Args, Debug, Clone)]
pub struct PubsubConfig {
    /// Google Cloud project that owns the topic and subscription
    #[arg(long, env = env::PUBSUB_PROJECT_ID)]
    pub project_id: Option<String>,

    /// Topic the scanners publish to
    #[arg(long, env = env::PUBSUB_TOPIC_ID)]
    pub topic_id: Option<String>,

    /// Subscription to consume
    #[arg(long, env = env::PUBSUB_SUBSCRIPTION_ID)]
    pub subscription_id: Option<String>,

    /// Pub/Sub emulator address (host:port); plain HTTP without authentication
    #[arg(long, env = env::PUBSUB_EMULATOR_HOST)]
    pub emulator_host: Option<String>,

    /// Pub/Sub API base URL, ignored when the emulator host is set
    #[arg(long, env = env::PUBSUB_ENDPOINT, default_value = DEFAULT_PUBSUB_ENDPOINT)]
    pub endpoint: String,

    /// OAuth2 bearer token for the Pub/Sub API
    #[arg(long, env = env::PUBSUB_ACCESS_TOKEN, hide_env_values = true)]
    pub access_token: Option<String>,

    /// Maximum messages requested per pull
    #[arg(long, env = env::PUBSUB_MAX_MESSAGES, default_value = "100")]
    pub max_messages: u32,

    /// Maximum messages being handled at once
    #[arg(long, env = env::PUBSUB_MAX_OUTSTANDING, default_value = "64")]
    pub max_outstanding: usize,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            topic_id: None,
            subscription_id: None,
            emulator_host: None,
            endpoint: DEFAULT_PUBSUB_ENDPOINT.to_string(),
            access_token: None,
            max_messages: 100,
            max_outstanding: 64,
        }
    }
}

impl PubsubConfig {
    /// Validate that every identifier is present, reporting all missing fields at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        require(&mut errors, env::PUBSUB_PROJECT_ID, &self.project_id);
        require(&mut errors, env::PUBSUB_TOPIC_ID, &self.topic_id);
        require(&mut errors, env::PUBSUB_SUBSCRIPTION_ID, &self.subscription_id);
        if self.max_messages == 0 {
            errors.push(FieldError::invalid(
                env::PUBSUB_MAX_MESSAGES,
                "must be greater than 0",
            ));
        }
        if self.max_outstanding == 0 {
            errors.push(FieldError::invalid(
                env::PUBSUB_MAX_OUTSTANDING,
                "must be greater than 0",
            ));
        }
        finish(errors)
    }

    /// Base URL of the Pub/Sub REST API.
    pub fn base_url(&self) -> String {
        match self.emulator_host.as_deref().filter(|h| !h.is_empty()) {
            Some(host) if host.starts_with("http://") || host.starts_with("https://") => {
                host.trim_end_matches('/').to_string()
            }
            Some(host) => format!("http://{}", host.trim_end_matches('/')),
            None => self.endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub fn project_id(&self) -> &str {
        self.project_id.as_deref().unwrap_or_default()
    }

    pub fn topic_id(&self) -> &str {
        self.topic_id.as_deref().unwrap_or_default()
    }

    pub fn subscription_id(&self) -> &str {
        self.subscription_id.as_deref().unwrap_or_default()
    }
}

/// Storage backend selector and connection parameters.
#[derive(Args, Debug, Clone)]
pub struct StorageConfig {
    /// Storage backend identifier (postgres, noop)
    #[arg(long = "database-type", env = env::DATABASE_TYPE)]
    pub db_type: Option<String>,

    /// Database host
    #[arg(long = "database-host", env = env::DATABASE_HOST)]
    pub host: Option<String>,

    /// Database user
    #[arg(long = "database-user", env = env::DATABASE_USER)]
    pub user: Option<String>,

    /// Database password
    #[arg(long = "database-password", env = env::DATABASE_PASSWORD, hide_env_values = true)]
    pub password: Option<String>,

    /// Database port
    #[arg(long = "database-port", env = env::DATABASE_PORT)]
    pub port: Option<u16>,

    /// Database name
    #[arg(long = "database-name", env = env::DATABASE_NAME)]
    pub name: Option<String>,

    /// Connection pool size
    #[arg(long = "database-max-connections", env = env::DATABASE_MAX_CONNECTIONS, default_value = "10")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_type: None,
            host: None,
            user: None,
            password: None,
            port: None,
            name: None,
            max_connections: 10,
        }
    }
}

impl StorageConfig {
    /// Validate every connection field, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        require(&mut errors, env::DATABASE_TYPE, &self.db_type);
        require(&mut errors, env::DATABASE_HOST, &self.host);
        require(&mut errors, env::DATABASE_USER, &self.user);
        require(&mut errors, env::DATABASE_PASSWORD, &self.password);
        match self.port {
            None => errors.push(FieldError::missing(env::DATABASE_PORT)),
            Some(0) => errors.push(FieldError::invalid(
                env::DATABASE_PORT,
                "must be between 1 and 65535",
            )),
            Some(_) => {}
        }
        require(&mut errors, env::DATABASE_NAME, &self.name);
        if self.max_connections == 0 {
            errors.push(FieldError::invalid(
                env::DATABASE_MAX_CONNECTIONS,
                "must be greater than 0",
            ));
        }
        finish(errors)
    }

    pub fn db_type(&self) -> &str {
        self.db_type.as_deref().unwrap_or_default()
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or_default()
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or_default()
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    /// Connection URL with the password masked, for logging.
    pub fn redacted_url(&self) -> String {
        format!(
            "{}://{}:***@{}:{}/{}",
            self.db_type(),
            self.user(),
            self.host(),
            self.port(),
            self.name()
        )
    }
}

fn require(errors: &mut Vec<FieldError>, field: &'static str, value: &Option<String>) {
    if value.as_deref().is_none_or(str::is_empty) {
        errors.push(FieldError::missing(field));
    }
}

fn finish(errors: Vec<FieldError>) -> Result<(), ConfigError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError(errors))
    }
}
