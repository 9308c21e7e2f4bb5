//! Core types for LogLens

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lowest status code accepted as a real HTTP status
pub const MIN_STATUS: u16 = 100;

/// Highest status code accepted as a real HTTP status
pub const MAX_STATUS: u16 = 599;

/// Name of the partition that collects out-of-range status codes
pub const DEFAULT_PARTITION: &str = "__default__";

/// One parsed access-log record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogEntry {
    /// IPv4 or IPv6 literal of the client
    pub client_address: String,
    /// Timestamp kept as text so it stays lexically sortable
    pub timestamp: String,
    /// Request path
    pub url: String,
    /// HTTP status code
    pub status_code: u16,
    /// User agent, may contain the field delimiter
    pub user_agent: String,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(
        client_address: impl Into<String>,
        timestamp: impl Into<String>,
        url: impl Into<String>,
        status_code: u16,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            client_address: client_address.into(),
            timestamp: timestamp.into(),
            url: url.into(),
            status_code,
            user_agent: user_agent.into(),
        }
    }

    /// The partition this entry belongs to
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::for_status(self.status_code)
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        self.client_address.len() + self.timestamp.len() + self.url.len() + 2 + self.user_agent.len()
    }
}

/// Directory prefix shared by every partition in the store
pub const PARTITION_DIR_PREFIX: &str = "status_code=";

/// Partition identifier derived from the status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PartitionKey {
    /// Status code in 100..=599
    Status(u16),
    /// Anything outside the expected range
    Default,
}

impl PartitionKey {
    /// Route a status code to its partition
    pub fn for_status(status: u16) -> Self {
        if (MIN_STATUS..=MAX_STATUS).contains(&status) {
            PartitionKey::Status(status)
        } else {
            PartitionKey::Default
        }
    }

    /// Status code of this partition, if it is not the default bucket
    pub fn status(&self) -> Option<u16> {
        match self {
            PartitionKey::Status(s) => Some(*s),
            PartitionKey::Default => None,
        }
    }

    /// Directory name used by the store (`status_code=<key>`)
    pub fn dir_name(&self) -> String {
        format!("{}{}", PARTITION_DIR_PREFIX, self)
    }

    /// Inverse of [`PartitionKey::dir_name`]
    pub fn from_dir_name(name: &str) -> Option<Self> {
        name.strip_prefix(PARTITION_DIR_PREFIX)
            .and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Status(s) => write!(f, "{}", s),
            PartitionKey::Default => f.write_str(DEFAULT_PARTITION),
        }
    }
}

impl FromStr for PartitionKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == DEFAULT_PARTITION {
            return Ok(PartitionKey::Default);
        }
        let status: u16 = s
            .parse()
            .map_err(|_| format!("invalid partition key: {}", s))?;
        match PartitionKey::for_status(status) {
            PartitionKey::Default => Err(format!("status {} routes to {}", s, DEFAULT_PARTITION)),
            key => Ok(key),
        }
    }
}

impl From<PartitionKey> for String {
    fn from(key: PartitionKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for PartitionKey {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Why a raw line was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Empty line, wrong field count or inconsistent field shape
    MalformedDelimiters,
    /// Status is not a base-10 integer in 100..=599
    InvalidStatus,
    /// Fewer than five fields, or a required field is empty
    MissingField,
}

impl FailureReason {
    /// Stable code used in reports and the reject quarantine
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::MalformedDelimiters => "MALFORMED_DELIMITERS",
            FailureReason::InvalidStatus => "INVALID_STATUS",
            FailureReason::MissingField => "MISSING_FIELD",
        }
    }

    /// Inverse of [`FailureReason::code`]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "MALFORMED_DELIMITERS" => Some(FailureReason::MalformedDelimiters),
            "INVALID_STATUS" => Some(FailureReason::InvalidStatus),
            "MISSING_FIELD" => Some(FailureReason::MissingField),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A raw line that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseFailure {
    /// The line as received, without its line terminator
    pub raw: String,
    /// Why it was rejected
    pub reason: FailureReason,
    /// 1-based position in the input stream (0 when unknown)
    pub line_no: u64,
}

impl ParseFailure {
    pub fn new(raw: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            raw: raw.into(),
            reason,
            line_no: 0,
        }
    }

    pub fn at_line(mut self, line_no: u64) -> Self {
        self.line_no = line_no;
        self
    }
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {} ({:?})", self.line_no, self.reason, self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_routing() {
        assert_eq!(PartitionKey::for_status(200), PartitionKey::Status(200));
        assert_eq!(PartitionKey::for_status(100), PartitionKey::Status(100));
        assert_eq!(PartitionKey::for_status(599), PartitionKey::Status(599));
        assert_eq!(PartitionKey::for_status(99), PartitionKey::Default);
        assert_eq!(PartitionKey::for_status(600), PartitionKey::Default);
    }

    #[test]
    fn test_partition_key_names() {
        assert_eq!(PartitionKey::Status(404).dir_name(), "status_code=404");
        assert_eq!(PartitionKey::Default.dir_name(), "status_code=__default__");
        assert_eq!(
            PartitionKey::from_dir_name("status_code=500"),
            Some(PartitionKey::Status(500))
        );
        assert_eq!(
            PartitionKey::from_dir_name("status_code=__default__"),
            Some(PartitionKey::Default)
        );
        assert_eq!(PartitionKey::from_dir_name("_rejected"), None);
        assert!("700".parse::<PartitionKey>().is_err());
    }

    #[test]
    fn test_default_partition_sorts_last() {
        let mut keys = vec![
            PartitionKey::Default,
            PartitionKey::Status(500),
            PartitionKey::Status(200),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                PartitionKey::Status(200),
                PartitionKey::Status(500),
                PartitionKey::Default
            ]
        );
    }

    #[test]
    fn test_failure_reason_codes() {
        for reason in [
            FailureReason::MalformedDelimiters,
            FailureReason::InvalidStatus,
            FailureReason::MissingField,
        ] {
            assert_eq!(FailureReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(
            serde_json::to_string(&FailureReason::MissingField).unwrap(),
            "\"MISSING_FIELD\""
        );
    }
}
