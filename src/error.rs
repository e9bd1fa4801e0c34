//! Error types for scan-processor.

use std::fmt;

use thiserror::Error;

use crate::scanning::DataVersion;

/// A single configuration field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Environment variable name of the field
    pub field: &'static str,
    pub problem: FieldProblem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldProblem {
    Missing,
    Invalid(String),
}

impl FieldError {
    pub fn missing(field: &'static str) -> Self {
        Self {
            field,
            problem: FieldProblem::Missing,
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            problem: FieldProblem::Invalid(reason.into()),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.problem {
            FieldProblem::Missing => write!(f, "{} is required", self.field),
            FieldProblem::Invalid(reason) => write!(f, "{} is invalid: {}", self.field, reason),
        }
    }
}

/// Every field problem found while validating a configuration object.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", join_fields(.0))]
pub struct ConfigError(pub Vec<FieldError>);

impl ConfigError {
    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }

    /// Returns true if `field` is reported as missing.
    pub fn is_missing(&self, field: &str) -> bool {
        self.0
            .iter()
            .any(|e| e.field == field && e.problem == FieldProblem::Missing)
    }
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by storage backends and the backend registry.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid database configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("unknown database type: {0}")]
    UnknownBackend(String),

    #[error("failed to connect to {backend} database: {source}")]
    Connection {
        backend: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// A scan entry field that does not satisfy the entry contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("ip is required")]
    MissingIp,

    #[error("ip {0:?} is not a valid IP address")]
    InvalidIp(String),

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u32),

    #[error("service is required")]
    MissingService,

    #[error("timestamp is required")]
    MissingTimestamp,

    #[error("response is required")]
    MissingResponse,
}

/// Terminal failures while turning a message body into a scan entry.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed scan message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown data version: {0}")]
    UnknownVersion(String),

    #[error("malformed {version} payload: {reason}")]
    Payload { version: DataVersion, reason: String },

    #[error("scan entry failed validation: {0}")]
    Validation(#[from] ValidationError),
}

/// Errors talking to the message broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to build pubsub client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("pubsub request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("pubsub returned status {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("pubsub message {id} has undecodable data: {reason}")]
    InvalidMessage { id: String, reason: String },

    #[error("subscription {0} closed")]
    Closed(String),
}

/// Errors constructing or running the processor.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("subscription does not exist: {0}")]
    SubscriptionNotFound(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("processor cannot start from state {0}")]
    AlreadyStarted(crate::processor::State),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_lists_every_field() {
        let err = ConfigError(vec![
            FieldError::missing("DATABASE_HOST"),
            FieldError::invalid("DATABASE_PORT", "must be between 1 and 65535"),
        ]);
        assert_eq!(
            err.to_string(),
            "DATABASE_HOST is required; DATABASE_PORT is invalid: must be between 1 and 65535"
        );
        assert!(err.is_missing("DATABASE_HOST"));
        assert!(!err.is_missing("DATABASE_PORT"));
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::UnknownBackend("unknown_db".to_string());
        assert_eq!(err.to_string(), "unknown database type: unknown_db");

        let err = StorageError::from(ConfigError(vec![FieldError::missing("DATABASE_HOST")]));
        assert_eq!(
            err.to_string(),
            "invalid database configuration: DATABASE_HOST is required"
        );
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::UnknownVersion("3".to_string());
        assert_eq!(err.to_string(), "unknown data version: 3");

        let err = DecodeError::Payload {
            version: DataVersion::V1,
            reason: "invalid utf-8".to_string(),
        };
        assert_eq!(err.to_string(), "malformed v1 payload: invalid utf-8");

        let err = DecodeError::from(ValidationError::InvalidPort(70000));
        assert_eq!(
            err.to_string(),
            "scan entry failed validation: port must be between 1 and 65535, got 70000"
        );
    }

    #[test]
    fn test_processor_error_display() {
        let err = ProcessorError::SubscriptionNotFound("projects/p/subscriptions/s".to_string());
        assert_eq!(
            err.to_string(),
            "subscription does not exist: projects/p/subscriptions/s"
        );
    }
}
