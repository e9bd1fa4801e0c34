//! Normalized scan entry persisted by storage backends

use std::net::IpAddr;

use crate::error::ValidationError;

/// One scan result, keyed by `(ip, port, service)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanEntry {
    pub ip: String,
    pub port: u16,
    pub service: String,
    /// Scan time; a higher value is a more recent scan of the same key
    pub scan_timestamp: i64,
    pub response: String,
}

impl ScanEntry {
    /// Check every mandatory field. The first violation is returned.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.ip.is_empty() {
            return Err(ValidationError::MissingIp);
        }
        if self.ip.parse::<IpAddr>().is_err() {
            return Err(ValidationError::InvalidIp(self.ip.clone()));
        }
        if self.port == 0 {
            return Err(ValidationError::InvalidPort(0));
        }
        if self.service.is_empty() {
            return Err(ValidationError::MissingService);
        }
        if self.scan_timestamp == 0 {
            return Err(ValidationError::MissingTimestamp);
        }
        if self.response.is_empty() {
            return Err(ValidationError::MissingResponse);
        }
        Ok(())
    }
}
