//! Wire format of scan messages published by the scanners
//!
//! A message carries a `data_version` tag that decides the shape of its
//! `data` field, so decoding happens in two passes: the tag is read first,
//! then the body is parsed again with the matching payload type.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{DecodeError, ValidationError};
use crate::models::ScanEntry;

/// Known payload schema versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataVersion {
    /// Response carried as base64-encoded UTF-8 bytes in `response_bytes_utf8`
    V1,
    /// Response carried as plain text in `response_str`
    V2,
}

impl DataVersion {
    /// Resolve a raw `data_version` value. Accepts `1`/`2` and `"v1"`/`"v2"`.
    pub fn from_tag(tag: &serde_json::Value) -> Result<Self, DecodeError> {
        let version = match tag {
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(1) => Some(Self::V1),
                Some(2) => Some(Self::V2),
                _ => None,
            },
            serde_json::Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "1" | "v1" => Some(Self::V1),
                "2" | "v2" => Some(Self::V2),
                _ => None,
            },
            _ => None,
        };
        version.ok_or_else(|| DecodeError::UnknownVersion(tag.to_string()))
    }
}

impl fmt::Display for DataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

/// A scan message with a version-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Scan<D> {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub data: D,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct V1Data {
    #[serde(default, with = "base64_bytes")]
    pub response_bytes_utf8: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct V2Data {
    #[serde(default)]
    pub response_str: String,
}

/// A fully parsed message, tagged by schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanMessage {
    V1(Scan<V1Data>),
    V2(Scan<V2Data>),
}

impl ScanMessage {
    pub fn version(&self) -> DataVersion {
        match self {
            Self::V1(_) => DataVersion::V1,
            Self::V2(_) => DataVersion::V2,
        }
    }
}

impl TryFrom<ScanMessage> for ScanEntry {
    type Error = DecodeError;

    fn try_from(message: ScanMessage) -> Result<Self, Self::Error> {
        match message {
            ScanMessage::V1(scan) => {
                let response = String::from_utf8(scan.data.response_bytes_utf8).map_err(|e| {
                    DecodeError::Payload {
                        version: DataVersion::V1,
                        reason: format!("response_bytes_utf8 is not valid UTF-8: {e}"),
                    }
                })?;
                project(scan.ip, scan.port, scan.service, scan.timestamp, response)
            }
            ScanMessage::V2(scan) => project(
                scan.ip,
                scan.port,
                scan.service,
                scan.timestamp,
                scan.data.response_str,
            ),
        }
    }
}

fn project(
    ip: String,
    port: u32,
    service: String,
    timestamp: i64,
    response: String,
) -> Result<ScanEntry, DecodeError> {
    let port = u16::try_from(port).map_err(|_| ValidationError::InvalidPort(port))?;
    Ok(ScanEntry {
        ip,
        port,
        service,
        scan_timestamp: timestamp,
        response,
    })
}

#[derive(Deserialize)]
struct VersionTag {
    data_version: serde_json::Value,
}

/// Parse a message body into its version-tagged representation.
pub fn parse(body: &[u8]) -> Result<ScanMessage, DecodeError> {
    let tag: VersionTag = serde_json::from_slice(body).map_err(DecodeError::Malformed)?;
    match DataVersion::from_tag(&tag.data_version)? {
        DataVersion::V1 => parse_payload(body, DataVersion::V1).map(ScanMessage::V1),
        DataVersion::V2 => parse_payload(body, DataVersion::V2).map(ScanMessage::V2),
    }
}

fn parse_payload<D: DeserializeOwned + Default>(
    body: &[u8],
    version: DataVersion,
) -> Result<Scan<D>, DecodeError> {
    serde_json::from_slice(body).map_err(|e| DecodeError::Payload {
        version,
        reason: e.to_string(),
    })
}

/// Decode and validate a message body into a scan entry.
pub fn decode(body: &[u8]) -> Result<ScanEntry, DecodeError> {
    let entry = ScanEntry::try_from(parse(body)?)?;
    entry.validate()?;
    Ok(entry)
}

mod base64_bytes {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
