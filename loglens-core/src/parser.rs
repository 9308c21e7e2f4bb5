//! Access-log record parser
//!
//! Turns one delimited line (`client,timestamp,url,status,user_agent`) into a
//! [`LogEntry`] or a [`ParseFailure`]. There is no quoting support: the
//! delimiter only separates fields.

use crate::{FailureReason, LogEntry, ParseFailure, MAX_STATUS, MIN_STATUS};
use serde::{Deserialize, Serialize};

/// Number of fields in a well-formed record
pub const FIELD_COUNT: usize = 5;

/// How to treat delimiters beyond the fourth one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCountPolicy {
    /// Everything after the fourth delimiter belongs to the user agent
    #[default]
    TrailingUserAgent,
    /// A sixth field is a structural error
    Exact,
}

/// Parser configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Field delimiter
    pub delimiter: char,
    /// Handling of extra delimiters
    pub field_count: FieldCountPolicy,
    /// Required timestamp width in characters; `None` accepts any width
    pub timestamp_width: Option<usize>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            delimiter: crate::config::DEFAULT_DELIMITER,
            field_count: FieldCountPolicy::default(),
            timestamp_width: Some(crate::config::DEFAULT_TIMESTAMP_WIDTH),
        }
    }
}

/// Record parser
#[derive(Debug, Clone, Default)]
pub struct RecordParser {
    config: ParserConfig,
}

impl RecordParser {
    /// Create a new parser
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Parse a single raw line
    pub fn parse(&self, raw_line: &str) -> Result<LogEntry, ParseFailure> {
        let line = raw_line.trim_end_matches(['\r', '\n']);
        let fail = |reason| Err(ParseFailure::new(line, reason));

        if line.trim().is_empty() {
            return fail(FailureReason::MalformedDelimiters);
        }

        let limit = match self.config.field_count {
            FieldCountPolicy::TrailingUserAgent => FIELD_COUNT,
            FieldCountPolicy::Exact => FIELD_COUNT + 1,
        };
        let fields: Vec<&str> = line.splitn(limit, self.config.delimiter).collect();

        if fields.len() < FIELD_COUNT {
            return fail(FailureReason::MissingField);
        }
        if fields.len() > FIELD_COUNT {
            return fail(FailureReason::MalformedDelimiters);
        }

        let client_address = fields[0].trim();
        let timestamp = fields[1].trim();
        let url = fields[2].trim();
        let status = fields[3].trim();
        let user_agent = fields[4].trim();

        // A bad status wins over an empty sibling field
        let status_code = match parse_status(status) {
            Some(code) => code,
            None => return fail(FailureReason::InvalidStatus),
        };

        if [client_address, timestamp, url, user_agent]
            .iter()
            .any(|f| f.is_empty())
        {
            return fail(FailureReason::MissingField);
        }

        if let Some(width) = self.config.timestamp_width {
            if timestamp.chars().count() != width {
                return fail(FailureReason::MalformedDelimiters);
            }
        }

        Ok(LogEntry::new(
            client_address,
            timestamp,
            url,
            status_code,
            user_agent,
        ))
    }
}

/// Base-10 digits only, within 100..=599
fn parse_status(field: &str) -> Option<u16> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Long digit strings overflow u16 and are rejected by parse
    let code: u16 = field.parse().ok()?;
    (MIN_STATUS..=MAX_STATUS).contains(&code).then_some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> RecordParser {
        RecordParser::default()
    }

    fn reason(line: &str) -> FailureReason {
        parser().parse(line).unwrap_err().reason
    }

    #[test]
    fn test_parse_valid_line() {
        let entry = parser()
            .parse("192.168.0.1,2025-02-25 13:00:15,/index,200,Firefox/98.0")
            .unwrap();
        assert_eq!(entry.client_address, "192.168.0.1");
        assert_eq!(entry.timestamp, "2025-02-25 13:00:15");
        assert_eq!(entry.url, "/index");
        assert_eq!(entry.status_code, 200);
        assert_eq!(entry.user_agent, "Firefox/98.0");
    }

    #[test]
    fn test_parse_ipv6_and_line_terminator() {
        let entry = parser()
            .parse("2001:db8::1,2025-02-25 13:00:15,/blog,301,curl/8.0\r\n")
            .unwrap();
        assert_eq!(entry.client_address, "2001:db8::1");
        assert_eq!(entry.user_agent, "curl/8.0");
    }

    #[test]
    fn test_user_agent_keeps_delimiters() {
        let entry = parser()
            .parse("10.0.0.1,2025-02-25 13:00:15,/,200,Mozilla/5.0 (KHTML, like Gecko)")
            .unwrap();
        assert_eq!(entry.user_agent, "Mozilla/5.0 (KHTML, like Gecko)");
    }

    #[test]
    fn test_exact_policy_rejects_extra_fields() {
        let parser = RecordParser::new(ParserConfig {
            field_count: FieldCountPolicy::Exact,
            ..Default::default()
        });
        let err = parser
            .parse("10.0.0.1,2025-02-25 13:00:15,/,200,Mozilla,extra")
            .unwrap_err();
        assert_eq!(err.reason, FailureReason::MalformedDelimiters);
    }

    #[test]
    fn test_fewer_than_five_fields_is_missing_field() {
        for line in [
            "192.168.0.1",
            "192.168.0.1,2025-02-25 13:00:15",
            "192.168.0.1,2025-02-25 13:00:15,/index",
            "192.168.0.1,2025-02-25 13:00:15,/index,200",
            ",,,",
        ] {
            assert_eq!(reason(line), FailureReason::MissingField, "{}", line);
        }
    }

    #[test]
    fn test_empty_field_is_missing_field() {
        assert_eq!(
            reason(",2025-02-25 13:00:15,/index,200,Firefox"),
            FailureReason::MissingField
        );
        assert_eq!(
            reason("10.0.0.1,2025-02-25 13:00:15,/index,200,"),
            FailureReason::MissingField
        );
    }

    #[test]
    fn test_invalid_status() {
        for status in ["99", "600", "0", "abc", "20O", "-200", "+200", "2.5", "", "99999999"] {
            let line = format!("10.0.0.1,2025-02-25 13:00:15,/index,{},Firefox", status);
            assert_eq!(reason(&line), FailureReason::InvalidStatus, "{}", status);
        }
    }

    #[test]
    fn test_invalid_status_takes_precedence_over_empty_field() {
        assert_eq!(
            reason("10.0.0.1,2025-02-25 13:00:15,,abc,Firefox"),
            FailureReason::InvalidStatus
        );
        assert_eq!(reason(",,,700,"), FailureReason::InvalidStatus);
        assert_eq!(
            reason("10.0.0.1,2025-02-25 13:00:15,,404,Firefox"),
            FailureReason::MissingField
        );
    }

    #[test]
    fn test_status_boundaries_accepted() {
        for status in [100u16, 599] {
            let line = format!("10.0.0.1,2025-02-25 13:00:15,/index,{},Firefox", status);
            assert_eq!(parser().parse(&line).unwrap().status_code, status);
        }
    }

    #[test]
    fn test_empty_line_is_malformed() {
        assert_eq!(reason(""), FailureReason::MalformedDelimiters);
        assert_eq!(reason("   \r\n"), FailureReason::MalformedDelimiters);
    }

    #[test]
    fn test_inconsistent_timestamp_width_is_malformed() {
        assert_eq!(
            reason("10.0.0.1,2025-2-25 13:00:15,/index,200,Firefox"),
            FailureReason::MalformedDelimiters
        );

        let lenient = RecordParser::new(ParserConfig {
            timestamp_width: None,
            ..Default::default()
        });
        assert!(lenient.parse("10.0.0.1,2025-2-25 13:00,/index,200,Firefox").is_ok());
    }

    #[test]
    fn test_custom_delimiter() {
        let parser = RecordParser::new(ParserConfig {
            delimiter: '\t',
            ..Default::default()
        });
        let entry = parser
            .parse("10.0.0.1\t2025-02-25 13:00:15\t/index\t404\tbot, v2")
            .unwrap();
        assert_eq!(entry.status_code, 404);
        assert_eq!(entry.user_agent, "bot, v2");
    }

    #[test]
    fn test_failure_keeps_raw_line() {
        let err = parser().parse("a,b,c\n").unwrap_err();
        assert_eq!(err.raw, "a,b,c");
    }
}
